use std::ffi::{CString, c_void};
use std::mem::{size_of, zeroed};

use log::debug;
use windows_sys::Win32::{
    Foundation::{GetLastError, HMODULE},
    System::{
        Diagnostics::Debug::FlushInstructionCache,
        LibraryLoader::{GetModuleHandleA, GetProcAddress},
        Memory::{MEMORY_BASIC_INFORMATION, VirtualProtect, VirtualQuery},
        ProcessStatus::{EnumProcessModules, GetModuleFileNameExA, GetModuleInformation, MODULEINFO},
        SystemInformation::{GetSystemInfo, SYSTEM_INFO},
        Threading::GetCurrentProcess,
    },
};

use crate::error::{OsError, ProbeError};
use crate::memory::{ModuleInfo, RegionInfo};
use crate::platform::MemoryPlatform;

/// `VirtualQuery` / `VirtualProtect` on the current process.
#[derive(Debug, Clone, Copy)]
pub struct WindowsPlatform {
    page_size: usize,
}

impl WindowsPlatform {
    pub fn new() -> Self {
        let page_size = unsafe {
            let mut info = zeroed::<SYSTEM_INFO>();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        };
        Self { page_size }
    }
}

impl Default for WindowsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn last_error() -> OsError {
    OsError::new(unsafe { GetLastError() })
}

impl MemoryPlatform for WindowsPlatform {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn query_region(&self, address: usize) -> Result<RegionInfo, OsError> {
        unsafe {
            let mut mbi = zeroed::<MEMORY_BASIC_INFORMATION>();
            let written = VirtualQuery(
                address as *const c_void,
                &mut mbi,
                size_of::<MEMORY_BASIC_INFORMATION>(),
            );
            if written == 0 {
                let err = last_error();
                debug!(
                    "VirtualQuery failed at address {:X}, error {}",
                    address, err.code
                );
                return Err(err);
            }
            Ok(RegionInfo {
                base_address: mbi.BaseAddress as usize,
                allocation_base: mbi.AllocationBase as usize,
                region_size: mbi.RegionSize,
                state: mbi.State,
                protect: mbi.Protect,
                kind: mbi.Type,
            })
        }
    }

    fn set_protection(&self, base: usize, size: usize, protection: u32) -> Result<u32, OsError> {
        let mut previous = 0u32;
        let address = base as *const c_void;
        let result = unsafe { VirtualProtect(address, size, protection, &mut previous) };
        if result == 0 {
            let err = last_error();
            debug!(
                "VirtualProtect({:X}, {:X}, {:#x}) failed, GetLastError: {}",
                base, size, protection, err.code
            );
            return Err(err);
        }
        debug!(
            "VirtualProtect({:X}, {:X}, {:#x}) succeeded, previous {:#x}",
            base, size, protection, previous
        );
        Ok(previous)
    }

    unsafe fn read_byte(&self, address: usize) -> u8 {
        unsafe { std::ptr::read_volatile(address as *const u8) }
    }

    unsafe fn write_byte(&self, address: usize, value: u8) {
        unsafe {
            std::ptr::write_volatile(address as *mut u8, value);
            // The byte may be code.
            FlushInstructionCache(GetCurrentProcess(), address as *const c_void, 1);
        }
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>, ProbeError> {
        unsafe {
            let process = GetCurrentProcess();
            let mut handles: Vec<HMODULE> = vec![std::ptr::null_mut(); 256];
            loop {
                let capacity = (handles.len() * size_of::<HMODULE>()) as u32;
                let mut needed = 0u32;
                let buffer = handles.as_mut_ptr();
                let listed = EnumProcessModules(process, buffer, capacity, &mut needed);
                if listed == 0 {
                    return Err(ProbeError::QueryFailed {
                        address: 0,
                        source: last_error(),
                    });
                }
                let count = needed as usize / size_of::<HMODULE>();
                if needed <= capacity {
                    handles.truncate(count);
                    break;
                }
                handles.resize(count, std::ptr::null_mut());
            }

            let mut modules = Vec::with_capacity(handles.len());
            let mut name = [0u8; 260];
            let name_capacity = name.len() as u32;
            let info_size = size_of::<MODULEINFO>() as u32;
            for handle in handles {
                let mut info = zeroed::<MODULEINFO>();
                if GetModuleInformation(process, handle, &mut info, info_size) == 0 {
                    debug!("GetModuleInformation failed for {:p}", handle);
                    continue;
                }
                let len = GetModuleFileNameExA(process, handle, name.as_mut_ptr(), name_capacity);
                modules.push(ModuleInfo {
                    name: String::from_utf8_lossy(&name[..len as usize]).into_owned(),
                    base_address: info.lpBaseOfDll as usize,
                    size: info.SizeOfImage as usize,
                });
            }
            Ok(modules)
        }
    }

    fn resolve_symbol(&self, module: &str, symbol: &str) -> Result<usize, ProbeError> {
        let not_found = |reason: String| ProbeError::SymbolNotFound {
            module: module.to_string(),
            symbol: symbol.to_string(),
            reason,
        };
        let module_name = CString::new(module).map_err(|e| not_found(e.to_string()))?;
        let symbol_name = CString::new(symbol).map_err(|e| not_found(e.to_string()))?;
        unsafe {
            let handle = GetModuleHandleA(module_name.as_ptr() as *const u8);
            if handle.is_null() {
                return Err(not_found(format!("module not loaded ({})", last_error())));
            }
            match GetProcAddress(handle, symbol_name.as_ptr() as *const u8) {
                Some(proc) => Ok(proc as usize),
                None => Err(not_found(format!("no such export ({})", last_error()))),
            }
        }
    }
}
