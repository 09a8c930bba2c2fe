use std::num::ParseIntError;
use std::str::FromStr;

use crate::error::ProbeError;
use crate::platform::MemoryPlatform;

/// Parses an address. Hex is the default; `0x` and `_` separators are
/// accepted, and `0n` forces decimal.
pub fn parse_address(text: &str) -> Result<usize, ParseIntError> {
    let text = text.trim().replace('_', "");
    if let Some(decimal) = text.strip_prefix("0n") {
        return decimal.parse::<usize>();
    }
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(&text);
    usize::from_str_radix(digits, 16)
}

/// What to probe: a raw address or an exported symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Address(usize),
    /// `module!symbol`; an empty module searches every loaded module.
    Symbol { module: String, symbol: String },
}

impl Target {
    pub fn resolve<P: MemoryPlatform + ?Sized>(&self, platform: &P) -> Result<usize, ProbeError> {
        match self {
            Self::Address(address) => Ok(*address),
            Self::Symbol { module, symbol } => platform.resolve_symbol(module, symbol),
        }
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((module, symbol)) = s.split_once('!') {
            if symbol.is_empty() {
                return Err(format!("missing symbol name in {:?}", s));
            }
            return Ok(Self::Symbol {
                module: module.to_string(),
                symbol: symbol.to_string(),
            });
        }
        parse_address(s)
            .map(Self::Address)
            .map_err(|e| format!("invalid address {:?}: {}", s, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::simulated::{SIMULATED_MODULE_BASE, SimulatedPlatform};

    #[test]
    fn addresses_default_to_hex() {
        assert_eq!(parse_address("7ff6_1000").unwrap(), 0x7ff6_1000);
        assert_eq!(parse_address("0x7FF61000").unwrap(), 0x7ff6_1000);
        assert_eq!(parse_address(" 0X10 ").unwrap(), 0x10);
        assert_eq!(parse_address("0n4096").unwrap(), 4096);
        assert!(parse_address("0xzz").is_err());
        assert!(parse_address("").is_err());
    }

    #[test]
    fn targets_parse_symbols_and_addresses() {
        assert_eq!("1000".parse::<Target>().unwrap(), Target::Address(0x1000));
        assert_eq!(
            "kernel32.dll!GetTickCount".parse::<Target>().unwrap(),
            Target::Symbol {
                module: "kernel32.dll".into(),
                symbol: "GetTickCount".into(),
            }
        );
        assert!("kernel32.dll!".parse::<Target>().is_err());
        assert!("nothex".parse::<Target>().is_err());
    }

    #[test]
    fn symbols_resolve_through_the_platform() {
        let platform = SimulatedPlatform::shared_module();
        let target: Target = "shared.dll!probe_target".parse().unwrap();
        let address = target.resolve(&platform).unwrap();
        assert_eq!(address, SIMULATED_MODULE_BASE + 0x1010);

        let missing: Target = "!nope".parse().unwrap();
        assert!(matches!(
            missing.resolve(&platform),
            Err(ProbeError::SymbolNotFound { .. })
        ));
    }
}
