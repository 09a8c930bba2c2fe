use std::fmt;

use crate::memory::{Protection, RegionState};

/// A diagnostic code reported by the host (`GetLastError` or `errno`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsError {
    pub code: u32,
}

impl OsError {
    pub const fn new(code: u32) -> Self {
        Self { code }
    }

    pub fn last() -> Self {
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::new(code as u32)
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", std::io::Error::from_raw_os_error(self.code as i32))
    }
}

impl std::error::Error for OsError {}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("query of {address:#x} failed: {source}")]
    QueryFailed {
        address: usize,
        #[source]
        source: OsError,
    },
    #[error("protecting {size:#x} bytes at {address:#x} as {requested} failed: {source}")]
    ProtectFailed {
        address: usize,
        size: usize,
        requested: Protection,
        #[source]
        source: OsError,
    },
    #[error("{address:#x} is not committed (state {state}, protection code {protection_code:#x})")]
    UnmappedAddress {
        address: usize,
        state: RegionState,
        protection_code: u32,
    },
    #[error("symbol {symbol} not found in {module}: {reason}")]
    SymbolNotFound {
        module: String,
        symbol: String,
        reason: String,
    },
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl ProbeError {
    /// The platform diagnostic code carried by the error, if any.
    pub fn os_code(&self) -> Option<u32> {
        match self {
            Self::QueryFailed { source, .. } | Self::ProtectFailed { source, .. } => {
                Some(source.code)
            }
            _ => None,
        }
    }
}
