//! An address space that lives entirely in this process.
//!
//! Pages of a shared image start out backed by one frame every process
//! sees. Asking for a writable class on such a page is granted, but the page
//! is reported with the write-copy class until the first write gives this
//! process its own copy; from then on it reports the plain writable class.
//! Adjacent pages with identical attributes are merged into one region, the
//! way `VirtualQuery` reports them.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use crate::error::{OsError, ProbeError};
use crate::memory::{
    Access, MEM_COMMIT, MEM_FREE, MEM_IMAGE, MEM_PRIVATE, MEM_RESERVE, ModuleInfo, PAGE_NOACCESS,
    Protection, RegionInfo, USER_SPACE_MAX,
};
use crate::platform::{MemoryPlatform, align_down};

pub const ERROR_ACCESS_DENIED: u32 = 5;
pub const ERROR_INVALID_PARAMETER: u32 = 87;
pub const ERROR_INVALID_ADDRESS: u32 = 487;

/// Where `SimulatedPlatform::shared_module` places its code.
pub const SIMULATED_MODULE_BASE: usize = 0x7FF8_1000_0000;
pub const SIMULATED_MODULE_NAME: &str = "shared.dll";

#[derive(Debug, Clone)]
struct Page {
    allocation_base: usize,
    committed: bool,
    kind: u32,
    protection: Protection,
    /// Still backed by the frame other processes map.
    shared: bool,
    locked: bool,
    bytes: Vec<u8>,
}

impl Page {
    fn reported_protect(&self) -> u32 {
        if !self.committed {
            return 0;
        }
        if self.shared && self.protection.is_writable() {
            self.protection.copy_on_write().code()
        } else {
            self.protection.code()
        }
    }

    fn same_region_as(&self, other: &Page) -> bool {
        self.allocation_base == other.allocation_base
            && self.committed == other.committed
            && self.kind == other.kind
            && self.reported_protect() == other.reported_protect()
    }
}

#[derive(Debug)]
pub struct SimulatedPlatform {
    page_size: usize,
    pages: RefCell<BTreeMap<usize, Page>>,
    exports: RefCell<Vec<(String, String, usize)>>,
    modules: RefCell<Vec<ModuleInfo>>,
    protect_calls: Cell<usize>,
}

impl SimulatedPlatform {
    pub fn new(page_size: usize) -> Self {
        assert!(
            page_size.is_power_of_two(),
            "page size must be a power of two"
        );
        Self {
            page_size,
            pages: RefCell::new(BTreeMap::new()),
            exports: RefCell::new(Vec::new()),
            modules: RefCell::new(Vec::new()),
            protect_calls: Cell::new(0),
        }
    }

    /// A process with one shared module: a read-only header page, three
    /// execute-read code pages exporting `probe_target`, and one data page.
    pub fn shared_module() -> Self {
        let platform = Self::new(0x1000);
        let base = SIMULATED_MODULE_BASE;
        platform.map_image(base, 1, Access::ReadOnly);
        platform.map_image(base + 0x1000, 3, Access::ExecuteRead);
        platform.map_image(base + 0x4000, 1, Access::WriteCopy);
        platform.add_module(SIMULATED_MODULE_NAME, base, 5 * 0x1000);
        platform.add_export(SIMULATED_MODULE_NAME, "probe_target", base + 0x1010);
        platform.map_private(0x0000_0200_0000, 4, Access::ReadWrite);
        platform.reserve(0x0000_0200_4000, 12);
        platform
    }

    /// Maps `pages` pages of a shared image starting at `base`.
    pub fn map_image(&self, base: usize, pages: usize, access: Access) {
        self.insert(base, pages, true, MEM_IMAGE, access, true);
    }

    /// Commits `pages` pages of private memory starting at `base`.
    pub fn map_private(&self, base: usize, pages: usize, access: Access) {
        self.insert(base, pages, true, MEM_PRIVATE, access, false);
    }

    /// Reserves address space without committing it.
    pub fn reserve(&self, base: usize, pages: usize) {
        self.insert(base, pages, false, MEM_PRIVATE, Access::NoAccess, false);
    }

    pub fn add_module(&self, name: &str, base_address: usize, size: usize) {
        self.modules.borrow_mut().push(ModuleInfo {
            name: name.to_string(),
            base_address,
            size,
        });
    }

    pub fn add_export(&self, module: &str, symbol: &str, address: usize) {
        self.exports
            .borrow_mut()
            .push((module.to_string(), symbol.to_string(), address));
    }

    /// Makes protection changes on `pages` pages from `base` fail as if the
    /// process lacked the rights.
    pub fn deny_protection_changes(&self, base: usize, pages: usize) {
        let mut map = self.pages.borrow_mut();
        for i in 0..pages {
            if let Some(page) = map.get_mut(&(base + i * self.page_size)) {
                page.locked = true;
            }
        }
    }

    /// Number of `set_protection` calls made so far, successful or not.
    pub fn protect_calls(&self) -> usize {
        self.protect_calls.get()
    }

    /// Whether the page holding `address` still shares its frame.
    pub fn is_shared(&self, address: usize) -> bool {
        let page = align_down(address, self.page_size);
        self.pages.borrow().get(&page).is_some_and(|p| p.shared)
    }

    fn insert(
        &self,
        base: usize,
        pages: usize,
        committed: bool,
        kind: u32,
        access: Access,
        shared: bool,
    ) {
        assert_eq!(base % self.page_size, 0, "unaligned mapping");
        let mut map = self.pages.borrow_mut();
        for i in 0..pages {
            let address = base + i * self.page_size;
            // Deterministic, non-zero content so flips are visible.
            let bytes = (0..self.page_size)
                .map(|offset| ((address + offset) as u8).wrapping_mul(31) | 1)
                .collect();
            map.insert(
                address,
                Page {
                    allocation_base: base,
                    committed,
                    kind,
                    protection: Protection::new(access),
                    shared,
                    locked: false,
                    bytes,
                },
            );
        }
    }

    fn free_region(&self, map: &BTreeMap<usize, Page>, address: usize) -> RegionInfo {
        let base = map
            .range(..address)
            .next_back()
            .map_or(0, |(&start, _)| start + self.page_size);
        let end = map
            .range(address..)
            .next()
            .map_or(USER_SPACE_MAX + 1, |(&start, _)| start);
        RegionInfo {
            base_address: base,
            allocation_base: 0,
            region_size: end - base,
            state: MEM_FREE,
            protect: PAGE_NOACCESS,
            kind: 0,
        }
    }
}

impl MemoryPlatform for SimulatedPlatform {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn query_region(&self, address: usize) -> Result<RegionInfo, OsError> {
        if address > USER_SPACE_MAX {
            return Err(OsError::new(ERROR_INVALID_PARAMETER));
        }
        let map = self.pages.borrow();
        let start = align_down(address, self.page_size);
        let Some(page) = map.get(&start) else {
            return Ok(self.free_region(&map, address));
        };

        let mut first = start;
        while let Some(prev) = first.checked_sub(self.page_size).and_then(|p| map.get(&p)) {
            if !prev.same_region_as(page) {
                break;
            }
            first -= self.page_size;
        }
        let mut end = start + self.page_size;
        while let Some(next) = map.get(&end) {
            if !next.same_region_as(page) {
                break;
            }
            end += self.page_size;
        }

        let state = match page.committed {
            true => MEM_COMMIT,
            false => MEM_RESERVE,
        };
        Ok(RegionInfo {
            base_address: first,
            allocation_base: page.allocation_base,
            region_size: end - first,
            state,
            protect: page.reported_protect(),
            kind: page.kind,
        })
    }

    fn set_protection(&self, base: usize, size: usize, protection: u32) -> Result<u32, OsError> {
        self.protect_calls.set(self.protect_calls.get() + 1);
        let requested = Protection::from_code(protection);
        if matches!(requested.access, Access::Unknown(_)) || size == 0 {
            return Err(OsError::new(ERROR_INVALID_PARAMETER));
        }

        let mut map = self.pages.borrow_mut();
        let first = align_down(base, self.page_size);
        let end = base + size;
        let touched: Vec<usize> = (first..end).step_by(self.page_size).collect();
        if touched
            .iter()
            .any(|page| !map.get(page).is_some_and(|p| p.committed))
        {
            return Err(OsError::new(ERROR_INVALID_ADDRESS));
        }
        if touched.iter().any(|page| map[page].locked) {
            return Err(OsError::new(ERROR_ACCESS_DENIED));
        }

        let previous = map[&first].reported_protect();
        for page in touched {
            if let Some(page) = map.get_mut(&page) {
                page.protection = requested;
            }
        }
        Ok(previous)
    }

    unsafe fn read_byte(&self, address: usize) -> u8 {
        let map = self.pages.borrow();
        let page = map
            .get(&align_down(address, self.page_size))
            .filter(|p| p.committed && p.protection.access.is_readable());
        match page {
            Some(page) => page.bytes[address % self.page_size],
            None => panic!("access violation reading {:#x}", address),
        }
    }

    unsafe fn write_byte(&self, address: usize, value: u8) {
        let mut map = self.pages.borrow_mut();
        let page = map
            .get_mut(&align_down(address, self.page_size))
            .filter(|p| p.committed && p.protection.is_writable());
        match page {
            Some(page) => {
                page.shared = false;
                page.bytes[address % self.page_size] = value;
            }
            None => panic!("access violation writing {:#x}", address),
        }
    }

    fn modules(&self) -> Result<Vec<ModuleInfo>, ProbeError> {
        Ok(self.modules.borrow().clone())
    }

    fn resolve_symbol(&self, module: &str, symbol: &str) -> Result<usize, ProbeError> {
        let in_module = |m: &str| module.is_empty() || m.eq_ignore_ascii_case(module);
        self.exports
            .borrow()
            .iter()
            .find(|(m, s, _)| in_module(m) && s == symbol)
            .map(|&(_, _, address)| address)
            .ok_or_else(|| ProbeError::SymbolNotFound {
                module: module.to_string(),
                symbol: symbol.to_string(),
                reason: "no such export".to_string(),
            })
    }
}
