//! The host's process-memory services.
//!
//! Everything above this module is a stateless wrapper: it asks the platform
//! again every time instead of remembering what it saw, because page tables
//! change underneath us.

use crate::error::{OsError, ProbeError};
use crate::memory::{ModuleInfo, RegionInfo};

pub mod simulated;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
pub use linux::LinuxPlatform as HostPlatform;
#[cfg(windows)]
pub use windows::WindowsPlatform as HostPlatform;

/// Returns the memory services of the running process.
#[cfg(any(windows, target_os = "linux"))]
pub fn host() -> HostPlatform {
    HostPlatform::new()
}

pub trait MemoryPlatform {
    fn page_size(&self) -> usize;

    /// Describes the region containing `address`. Codes use the Windows
    /// `MEM_*` / `PAGE_*` numbering.
    fn query_region(&self, address: usize) -> Result<RegionInfo, OsError>;

    /// Changes the protection of every page touched by `[base, base + size)`
    /// and returns the protection code the first page had before.
    fn set_protection(&self, base: usize, size: usize, protection: u32) -> Result<u32, OsError>;

    /// # Safety
    ///
    /// `address` must be committed and readable in this address space.
    unsafe fn read_byte(&self, address: usize) -> u8;

    /// # Safety
    ///
    /// `address` must be committed and writable, and no other thread may be
    /// reading or executing the byte while it is changed.
    unsafe fn write_byte(&self, address: usize, value: u8);

    fn modules(&self) -> Result<Vec<ModuleInfo>, ProbeError> {
        Err(ProbeError::Unsupported("module enumeration"))
    }

    fn resolve_symbol(&self, module: &str, symbol: &str) -> Result<usize, ProbeError> {
        let _ = (module, symbol);
        Err(ProbeError::Unsupported("symbol resolution"))
    }
}

impl<P: MemoryPlatform + ?Sized> MemoryPlatform for &P {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn query_region(&self, address: usize) -> Result<RegionInfo, OsError> {
        (**self).query_region(address)
    }

    fn set_protection(&self, base: usize, size: usize, protection: u32) -> Result<u32, OsError> {
        (**self).set_protection(base, size, protection)
    }

    unsafe fn read_byte(&self, address: usize) -> u8 {
        unsafe { (**self).read_byte(address) }
    }

    unsafe fn write_byte(&self, address: usize, value: u8) {
        unsafe { (**self).write_byte(address, value) }
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>, ProbeError> {
        (**self).modules()
    }

    fn resolve_symbol(&self, module: &str, symbol: &str) -> Result<usize, ProbeError> {
        (**self).resolve_symbol(module, symbol)
    }
}

pub(crate) fn align_down(address: usize, page_size: usize) -> usize {
    address & !(page_size - 1)
}

pub(crate) fn align_up(address: usize, page_size: usize) -> usize {
    address.saturating_add(page_size - 1) & !(page_size - 1)
}
