//! Linux has no single call answering "what is the region around this
//! address", so the answer is assembled from `/proc/self/maps` and, for
//! private file-backed writable mappings, `/proc/self/pagemap`. Those pages
//! are reported as write-copy until the pagemap shows them as anonymous,
//! i.e. until the kernel has made the private copy.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString, c_void};
use std::fs::{self, File};
use std::os::unix::fs::FileExt;

use log::{debug, warn};

use crate::error::{OsError, ProbeError};
use crate::memory::{
    Access, MEM_COMMIT, MEM_FREE, MEM_IMAGE, MEM_MAPPED, MEM_PRIVATE, MEM_RESERVE, ModuleInfo,
    PAGE_NOACCESS, RegionInfo, USER_SPACE_MAX,
};
use crate::platform::{MemoryPlatform, align_down, align_up};

const PAGEMAP_PRESENT: u64 = 1 << 63;
const PAGEMAP_SWAPPED: u64 = 1 << 62;
const PAGEMAP_FILE_SHARED: u64 = 1 << 61;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Mapping {
    start: usize,
    end: usize,
    read: bool,
    write: bool,
    execute: bool,
    shared: bool,
    inode: u64,
    path: Option<String>,
}

impl Mapping {
    fn access(&self) -> Access {
        match (self.read, self.write, self.execute) {
            (false, false, false) => Access::NoAccess,
            (_, false, false) => Access::ReadOnly,
            (_, true, false) => Access::ReadWrite,
            (false, false, true) => Access::Execute,
            (true, false, true) => Access::ExecuteRead,
            (_, true, true) => Access::ExecuteReadWrite,
        }
    }

    fn file_backed(&self) -> bool {
        self.inode != 0
    }

    fn kind(&self) -> u32 {
        match (self.file_backed(), self.shared) {
            (true, false) => MEM_IMAGE,
            (_, true) => MEM_MAPPED,
            (false, false) => MEM_PRIVATE,
        }
    }

    /// `PROT_NONE` anonymous mappings are how address space gets reserved.
    fn is_reservation(&self) -> bool {
        self.access() == Access::NoAccess && !self.file_backed() && !self.shared
    }

    fn tracks_copy_on_write(&self) -> bool {
        self.write && !self.shared && self.file_backed()
    }
}

fn parse_maps_line(line: &str) -> Option<Mapping> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?.as_bytes();
    let _offset = fields.next()?;
    let _device = fields.next()?;
    let inode = fields.next()?.parse().ok()?;
    let path = fields.collect::<Vec<_>>().join(" ");
    if perms.len() < 4 {
        return None;
    }
    Some(Mapping {
        start: usize::from_str_radix(start, 16).ok()?,
        end: usize::from_str_radix(end, 16).ok()?,
        read: perms[0] == b'r',
        write: perms[1] == b'w',
        execute: perms[2] == b'x',
        shared: perms[3] == b's',
        inode,
        path: (!path.is_empty()).then_some(path),
    })
}

fn io_error(err: std::io::Error) -> OsError {
    OsError::new(err.raw_os_error().unwrap_or(libc::EIO) as u32)
}

fn read_maps() -> Result<Vec<Mapping>, OsError> {
    let maps = fs::read_to_string("/proc/self/maps").map_err(io_error)?;
    Ok(maps.lines().filter_map(parse_maps_line).collect())
}

/// `/proc/self/maps` and `mprotect` on the current process.
#[derive(Debug, Clone, Copy)]
pub struct LinuxPlatform {
    page_size: usize,
}

impl LinuxPlatform {
    pub fn new() -> Self {
        let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            size if size > 0 => size as usize,
            _ => 4096,
        };
        Self { page_size }
    }

    /// Whether each page of `mapping` has been privately copied. Pages the
    /// pagemap cannot tell us about count as not copied.
    fn copied_pages(&self, mapping: &Mapping) -> Vec<bool> {
        let pages = (mapping.end - mapping.start) / self.page_size;
        let mut buffer = vec![0u8; pages * 8];
        let offset = (mapping.start / self.page_size * 8) as u64;
        let read = File::open("/proc/self/pagemap")
            .and_then(|pagemap| pagemap.read_exact_at(&mut buffer, offset));
        if let Err(e) = read {
            warn!(
                "pagemap unavailable for {:X}-{:X} ({}), assuming no private copies",
                mapping.start, mapping.end, e
            );
            return vec![false; pages];
        }
        buffer
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                let entry = u64::from_ne_bytes(raw);
                let resident = entry & (PAGEMAP_PRESENT | PAGEMAP_SWAPPED) != 0;
                resident && entry & PAGEMAP_FILE_SHARED == 0
            })
            .collect()
    }

    fn describe_mapping(&self, mapping: &Mapping, address: usize) -> RegionInfo {
        let mut info = RegionInfo {
            base_address: mapping.start,
            allocation_base: mapping.start,
            region_size: mapping.end - mapping.start,
            state: MEM_COMMIT,
            protect: mapping.access().code(),
            kind: mapping.kind(),
        };
        if mapping.is_reservation() {
            info.state = MEM_RESERVE;
            info.protect = 0;
            return info;
        }
        if !mapping.tracks_copy_on_write() {
            return info;
        }

        let copied = self.copied_pages(mapping);
        let index = (address - mapping.start) / self.page_size;
        let (first, last) = page_run(&copied, index);
        info.base_address = mapping.start + first * self.page_size;
        info.region_size = (last - first) * self.page_size;
        if !copied[index] {
            info.protect = mapping.access().copy_on_write().code();
        }
        info
    }
}

/// The half-open page range around `index` whose copy status matches it.
fn page_run(copied: &[bool], index: usize) -> (usize, usize) {
    let status = copied[index];
    let first = copied[..index]
        .iter()
        .rposition(|&c| c != status)
        .map_or(0, |i| i + 1);
    let last = copied[index..]
        .iter()
        .position(|&c| c != status)
        .map_or(copied.len(), |i| index + i);
    (first, last)
}

/// Bounds of the unmapped gap holding `address`, capped at the user-space
/// ceiling so kernel-provided mappings such as `[vsyscall]` do not stretch it.
fn free_gap(maps: &[Mapping], address: usize) -> (usize, usize) {
    let base = maps
        .iter()
        .map(|m| m.end)
        .filter(|&end| end <= address)
        .max()
        .unwrap_or(0);
    let end = maps
        .iter()
        .map(|m| m.start)
        .filter(|&start| start > address)
        .min()
        .unwrap_or(usize::MAX)
        .min(USER_SPACE_MAX + 1);
    (base, end)
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPlatform for LinuxPlatform {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn query_region(&self, address: usize) -> Result<RegionInfo, OsError> {
        if address > USER_SPACE_MAX {
            return Err(OsError::new(libc::EINVAL as u32));
        }
        let maps = read_maps()?;
        if let Some(mapping) = maps.iter().find(|m| m.start <= address && address < m.end) {
            return Ok(self.describe_mapping(mapping, address));
        }

        let (base, end) = free_gap(&maps, address);
        Ok(RegionInfo {
            base_address: base,
            allocation_base: 0,
            region_size: end - base,
            state: MEM_FREE,
            protect: PAGE_NOACCESS,
            kind: 0,
        })
    }

    fn set_protection(&self, base: usize, size: usize, protection: u32) -> Result<u32, OsError> {
        let previous = self.query_region(base)?.protect;
        let prot = match Access::from_code(protection) {
            Access::NoAccess => libc::PROT_NONE,
            Access::ReadOnly => libc::PROT_READ,
            Access::ReadWrite | Access::WriteCopy => libc::PROT_READ | libc::PROT_WRITE,
            Access::Execute => libc::PROT_EXEC,
            Access::ExecuteRead => libc::PROT_READ | libc::PROT_EXEC,
            Access::ExecuteReadWrite | Access::ExecuteWriteCopy => {
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
            }
            Access::Unknown(_) => return Err(OsError::new(libc::EINVAL as u32)),
        };
        if protection & !0xFF != 0 {
            debug!("ignoring modifier bits {:#x}", protection & !0xFF);
        }

        let start = align_down(base, self.page_size);
        let len = align_up(base + size, self.page_size) - start;
        if unsafe { libc::mprotect(start as *mut c_void, len, prot) } != 0 {
            let err = OsError::last();
            debug!(
                "mprotect({:X}, {:X}, {:#x}) failed, errno {}",
                start, len, prot, err.code
            );
            return Err(err);
        }
        debug!(
            "mprotect({:X}, {:X}, {:#x}) succeeded, previous {:#x}",
            start, len, prot, previous
        );
        Ok(previous)
    }

    unsafe fn read_byte(&self, address: usize) -> u8 {
        unsafe { std::ptr::read_volatile(address as *const u8) }
    }

    unsafe fn write_byte(&self, address: usize, value: u8) {
        unsafe { std::ptr::write_volatile(address as *mut u8, value) }
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>, ProbeError> {
        let maps = read_maps()
            .map_err(|source| ProbeError::QueryFailed { address: 0, source })?;
        let mut by_path: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for mapping in maps {
            let Some(path) = mapping.path.filter(|p| p.starts_with('/')) else {
                continue;
            };
            let span = by_path.entry(path).or_insert((mapping.start, mapping.end));
            span.0 = span.0.min(mapping.start);
            span.1 = span.1.max(mapping.end);
        }
        let mut modules: Vec<ModuleInfo> = by_path
            .into_iter()
            .map(|(name, (start, end))| ModuleInfo {
                name,
                base_address: start,
                size: end - start,
            })
            .collect();
        modules.sort_by_key(|m| m.base_address);
        Ok(modules)
    }

    fn resolve_symbol(&self, module: &str, symbol: &str) -> Result<usize, ProbeError> {
        let not_found = |reason: String| ProbeError::SymbolNotFound {
            module: module.to_string(),
            symbol: symbol.to_string(),
            reason,
        };
        let symbol_name = CString::new(symbol).map_err(|e| not_found(e.to_string()))?;
        unsafe {
            let handle = if module.is_empty() {
                libc::RTLD_DEFAULT
            } else {
                let module_name = CString::new(module).map_err(|e| not_found(e.to_string()))?;
                let flags = libc::RTLD_LAZY | libc::RTLD_NOLOAD;
                let handle = libc::dlopen(module_name.as_ptr(), flags);
                if handle.is_null() {
                    return Err(not_found(dl_error()));
                }
                handle
            };
            let address = libc::dlsym(handle, symbol_name.as_ptr());
            let reason = address.is_null().then(dl_error);
            if !module.is_empty() {
                libc::dlclose(handle);
            }
            match reason {
                Some(reason) => Err(not_found(reason)),
                None => Ok(address as usize),
            }
        }
    }
}

fn dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        "not loaded".to_string()
    } else {
        let message = unsafe { CStr::from_ptr(message) };
        message.to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_backed_text_mapping() {
        let line = "55d4c0a00000-55d4c0a42000 r-xp 00002000 08:01 1835023    /usr/bin/cat";
        let mapping = parse_maps_line(line).unwrap();
        assert_eq!(mapping.start, 0x55d4_c0a0_0000);
        assert_eq!(mapping.end, 0x55d4_c0a4_2000);
        assert_eq!(mapping.access(), Access::ExecuteRead);
        assert_eq!(mapping.kind(), MEM_IMAGE);
        assert_eq!(mapping.path.as_deref(), Some("/usr/bin/cat"));
        assert!(!mapping.tracks_copy_on_write());
    }

    #[test]
    fn anonymous_prot_none_is_a_reservation() {
        let line = "7f0000000000-7f0000200000 ---p 00000000 00:00 0 ";
        let mapping = parse_maps_line(line).unwrap();
        assert!(mapping.is_reservation());
        assert_eq!(mapping.kind(), MEM_PRIVATE);
        assert_eq!(mapping.path, None);
    }

    #[test]
    fn private_writable_file_mapping_tracks_copies() {
        let line = "7f1200001000-7f1200003000 rw-p 00001000 08:01 42 /usr/lib/libfoo.so";
        let mapping = parse_maps_line(line).unwrap();
        assert!(mapping.tracks_copy_on_write());
        assert_eq!(mapping.access().copy_on_write(), Access::WriteCopy);
    }

    #[test]
    fn page_run_splits_copied_from_shared_pages() {
        let copied = [false, false, true, true, false, true];
        assert_eq!(page_run(&copied, 0), (0, 2));
        assert_eq!(page_run(&copied, 1), (0, 2));
        assert_eq!(page_run(&copied, 2), (2, 4));
        assert_eq!(page_run(&copied, 3), (2, 4));
        assert_eq!(page_run(&copied, 4), (4, 5));
        assert_eq!(page_run(&copied, 5), (5, 6));
        assert_eq!(page_run(&[false; 4], 2), (0, 4));
    }

    #[test]
    fn free_gap_stops_at_the_user_space_ceiling() {
        let maps: Vec<Mapping> = [
            "555555554000-555555556000 r-xp 00000000 08:01 7 /usr/bin/true",
            "7ffffa406000-7ffffa427000 rw-p 00000000 00:00 0 [stack]",
            "ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0 [vsyscall]",
        ]
        .iter()
        .filter_map(|line| parse_maps_line(line))
        .collect();

        assert_eq!(
            free_gap(&maps, 0x7fff_ffff_0000),
            (0x7fff_fa42_7000, USER_SPACE_MAX + 1)
        );
        assert_eq!(
            free_gap(&maps, 0x6000_0000_0000),
            (0x5555_5555_6000, 0x7fff_fa40_6000)
        );
        assert_eq!(free_gap(&maps, 0x1000), (0, 0x5555_5555_4000));
    }

    #[test]
    fn truncated_lines_are_skipped() {
        assert_eq!(parse_maps_line("55d4c0a00000-55d4c0a42000 r-xp"), None);
        assert_eq!(parse_maps_line(""), None);
    }
}
