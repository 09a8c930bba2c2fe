use std::fmt;

use bitflags::bitflags;

// Windows PAGE_* numbering, used as the wire encoding on every host.
pub const PAGE_NOACCESS: u32 = 0x01;
pub const PAGE_READONLY: u32 = 0x02;
pub const PAGE_READWRITE: u32 = 0x04;
pub const PAGE_WRITECOPY: u32 = 0x08;
pub const PAGE_EXECUTE: u32 = 0x10;
pub const PAGE_EXECUTE_READ: u32 = 0x20;
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
pub const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;

pub const MEM_COMMIT: u32 = 0x1000;
pub const MEM_RESERVE: u32 = 0x2000;
pub const MEM_FREE: u32 = 0x10000;

pub const MEM_PRIVATE: u32 = 0x20000;
pub const MEM_MAPPED: u32 = 0x40000;
pub const MEM_IMAGE: u32 = 0x1000000;

/// User space max for 64-bit processes.
pub const USER_SPACE_MAX: usize = 0x7FFF_FFFF_FFFF;

const ACCESS_MASK: u32 = 0xFF;

/// The access class of a page, without modifier bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    NoAccess,
    ReadOnly,
    ReadWrite,
    WriteCopy,
    Execute,
    ExecuteRead,
    ExecuteReadWrite,
    ExecuteWriteCopy,
    /// Any low byte that is not exactly one documented access bit.
    Unknown(u32),
}

impl Access {
    pub fn from_code(code: u32) -> Self {
        match code & ACCESS_MASK {
            PAGE_NOACCESS => Self::NoAccess,
            PAGE_READONLY => Self::ReadOnly,
            PAGE_READWRITE => Self::ReadWrite,
            PAGE_WRITECOPY => Self::WriteCopy,
            PAGE_EXECUTE => Self::Execute,
            PAGE_EXECUTE_READ => Self::ExecuteRead,
            PAGE_EXECUTE_READWRITE => Self::ExecuteReadWrite,
            PAGE_EXECUTE_WRITECOPY => Self::ExecuteWriteCopy,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::NoAccess => PAGE_NOACCESS,
            Self::ReadOnly => PAGE_READONLY,
            Self::ReadWrite => PAGE_READWRITE,
            Self::WriteCopy => PAGE_WRITECOPY,
            Self::Execute => PAGE_EXECUTE,
            Self::ExecuteRead => PAGE_EXECUTE_READ,
            Self::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
            Self::ExecuteWriteCopy => PAGE_EXECUTE_WRITECOPY,
            Self::Unknown(code) => code & ACCESS_MASK,
        }
    }

    pub fn is_readable(self) -> bool {
        !matches!(self, Self::NoAccess | Self::Execute | Self::Unknown(_))
    }

    pub fn is_writable(self) -> bool {
        matches!(
            self,
            Self::ReadWrite | Self::WriteCopy | Self::ExecuteReadWrite | Self::ExecuteWriteCopy
        )
    }

    pub fn is_executable(self) -> bool {
        matches!(
            self,
            Self::Execute | Self::ExecuteRead | Self::ExecuteReadWrite | Self::ExecuteWriteCopy
        )
    }

    pub fn is_copy_on_write(self) -> bool {
        matches!(self, Self::WriteCopy | Self::ExecuteWriteCopy)
    }

    /// The plain writable class that keeps the read/execute semantics of
    /// `self`. `None` for codes we cannot classify.
    pub fn writable(self) -> Option<Self> {
        match self {
            Self::Unknown(_) => None,
            access if access.is_executable() => Some(Self::ExecuteReadWrite),
            _ => Some(Self::ReadWrite),
        }
    }

    /// How a writable class is reported while its page is still backed by a
    /// shared frame.
    pub fn copy_on_write(self) -> Self {
        match self {
            Self::ReadWrite => Self::WriteCopy,
            Self::ExecuteReadWrite => Self::ExecuteWriteCopy,
            other => other,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NoAccess => "PAGE_NOACCESS",
            Self::ReadOnly => "PAGE_READONLY",
            Self::ReadWrite => "PAGE_READWRITE",
            Self::WriteCopy => "PAGE_WRITECOPY",
            Self::Execute => "PAGE_EXECUTE",
            Self::ExecuteRead => "PAGE_EXECUTE_READ",
            Self::ExecuteReadWrite => "PAGE_EXECUTE_READWRITE",
            Self::ExecuteWriteCopy => "PAGE_EXECUTE_WRITECOPY",
            Self::Unknown(_) => "PAGE_UNKNOWN",
        }
    }
}

bitflags! {
    /// Modifier bits that may accompany an access class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Modifiers: u32 {
        const GUARD = 0x100;
        const NO_CACHE = 0x200;
        const WRITE_COMBINE = 0x400;
    }
}

/// A page protection value: an access class plus modifier bits.
///
/// Bits the crate does not know about are retained in `modifiers`, so
/// `Protection::from_code(c).code() == c` for every `c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Protection {
    pub access: Access,
    pub modifiers: Modifiers,
}

impl Protection {
    pub const fn new(access: Access) -> Self {
        Self {
            access,
            modifiers: Modifiers::empty(),
        }
    }

    pub fn from_code(code: u32) -> Self {
        Self {
            access: Access::from_code(code),
            modifiers: Modifiers::from_bits_retain(code & !ACCESS_MASK),
        }
    }

    pub fn code(self) -> u32 {
        self.access.code() | self.modifiers.bits()
    }

    /// See [`Access::writable`]; modifiers are kept.
    pub fn writable(self) -> Option<Self> {
        self.access.writable().map(|access| Self {
            access,
            modifiers: self.modifiers,
        })
    }

    pub fn copy_on_write(self) -> Self {
        Self {
            access: self.access.copy_on_write(),
            modifiers: self.modifiers,
        }
    }

    pub fn is_writable(self) -> bool {
        self.access.is_writable()
    }

    pub fn is_copy_on_write(self) -> bool {
        self.access.is_copy_on_write()
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.access.name())?;
        for (name, _) in self.modifiers.iter_names() {
            write!(f, "|{}", name)?;
        }
        let unnamed = self.modifiers.bits() & !Modifiers::all().bits();
        if unnamed != 0 {
            write!(f, "|{:#x}", unnamed)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionState {
    Free,
    Reserved,
    Committed,
}

impl RegionState {
    /// `None` when the code is not one of the three documented states.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            MEM_FREE => Some(Self::Free),
            MEM_RESERVE => Some(Self::Reserved),
            MEM_COMMIT => Some(Self::Committed),
            _ => None,
        }
    }
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::Reserved => "reserved",
            Self::Committed => "committed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Image,
    Mapped,
    Private,
}

impl RegionKind {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            MEM_IMAGE => Some(Self::Image),
            MEM_MAPPED => Some(Self::Mapped),
            MEM_PRIVATE => Some(Self::Private),
            _ => None,
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Image => "image",
            Self::Mapped => "mapped",
            Self::Private => "private",
        };
        f.write_str(name)
    }
}

/// What the platform reports for one query, in raw codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionInfo {
    pub base_address: usize,
    pub allocation_base: usize,
    pub region_size: usize,
    pub state: u32,
    pub protect: u32,
    pub kind: u32,
}

/// Snapshot of the region containing a queried address.
///
/// A descriptor is never updated; query again to observe a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegionDescriptor {
    pub base_address: usize,
    pub allocation_base: usize,
    pub region_size: usize,
    pub state: RegionState,
    /// Only `Some` for committed regions.
    pub protection: Option<Protection>,
    /// The platform's protection code, whatever the state.
    pub protection_code: u32,
    pub kind: Option<RegionKind>,
}

impl MemoryRegionDescriptor {
    pub fn end_address(&self) -> usize {
        self.base_address.saturating_add(self.region_size)
    }

    pub fn contains(&self, address: usize) -> bool {
        self.base_address <= address && address < self.end_address()
    }

    pub fn is_committed(&self) -> bool {
        self.state == RegionState::Committed
    }
}

impl fmt::Display for MemoryRegionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (base, end) = (self.base_address, self.end_address());
        let (state, code) = (self.state, self.protection_code);
        write!(f, "{base:#014x}-{end:#014x} {state:>9} {code:#06x}")?;
        match self.protection {
            Some(protection) => write!(f, " {}", protection)?,
            None => write!(f, " -")?,
        }
        if let Some(kind) = self.kind {
            write!(f, " {}", kind)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub base_address: usize,
    pub size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_codes_map_to_named_classes() {
        assert_eq!(Access::from_code(0x20), Access::ExecuteRead);
        assert_eq!(Access::from_code(0x80), Access::ExecuteWriteCopy);
        assert_eq!(Access::from_code(0x40), Access::ExecuteReadWrite);
        assert_eq!(Access::from_code(0x08), Access::WriteCopy);
    }

    #[test]
    fn unknown_bits_survive_a_round_trip() {
        let code = PAGE_EXECUTE_READ | 0x4000_0000;
        let protection = Protection::from_code(code);
        assert_eq!(protection.access, Access::ExecuteRead);
        assert_eq!(protection.code(), code);

        let odd = Protection::from_code(0x06);
        assert_eq!(odd.access, Access::Unknown(0x06));
        assert_eq!(odd.code(), 0x06);
    }

    #[test]
    fn writable_keeps_execute_and_modifiers() {
        let guarded = Protection::from_code(PAGE_EXECUTE_READ | Modifiers::GUARD.bits());
        let widened = guarded.writable().unwrap();
        assert_eq!(widened.access, Access::ExecuteReadWrite);
        assert!(widened.modifiers.contains(Modifiers::GUARD));

        assert_eq!(Access::ReadOnly.writable(), Some(Access::ReadWrite));
        assert_eq!(
            Access::ExecuteWriteCopy.writable(),
            Some(Access::ExecuteReadWrite)
        );
        assert_eq!(Access::Unknown(0x06).writable(), None);
    }

    #[test]
    fn copy_on_write_only_touches_plain_writable_classes() {
        assert_eq!(
            Access::ExecuteReadWrite.copy_on_write(),
            Access::ExecuteWriteCopy
        );
        assert_eq!(Access::ReadWrite.copy_on_write(), Access::WriteCopy);
        assert_eq!(Access::ExecuteRead.copy_on_write(), Access::ExecuteRead);
    }

    #[test]
    fn display_lists_modifiers() {
        let protection = Protection::from_code(PAGE_READWRITE | Modifiers::NO_CACHE.bits());
        assert_eq!(protection.to_string(), "PAGE_READWRITE|NO_CACHE");
    }
}
