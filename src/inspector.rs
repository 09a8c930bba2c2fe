use log::{debug, warn};

use crate::error::{OsError, ProbeError};
use crate::memory::{
    MemoryRegionDescriptor, Protection, RegionInfo, RegionKind, RegionState, USER_SPACE_MAX,
};
use crate::platform::MemoryPlatform;

const ERROR_INVALID_DATA: u32 = 13;

/// Describes the region containing `address`. Purely observational.
pub fn inspect<P: MemoryPlatform + ?Sized>(
    platform: &P,
    address: usize,
) -> Result<MemoryRegionDescriptor, ProbeError> {
    let info = platform
        .query_region(address)
        .map_err(|source| ProbeError::QueryFailed { address, source })?;
    let descriptor = translate(address, &info)?;
    debug!("{:#x}: {}", address, descriptor);
    Ok(descriptor)
}

fn translate(address: usize, info: &RegionInfo) -> Result<MemoryRegionDescriptor, ProbeError> {
    let Some(state) = RegionState::from_code(info.state) else {
        warn!("{:#x}: unrecognised state {:#x}", address, info.state);
        return Err(ProbeError::QueryFailed {
            address,
            source: OsError::new(ERROR_INVALID_DATA),
        });
    };
    let protection = match state {
        RegionState::Committed => Some(Protection::from_code(info.protect)),
        _ => None,
    };
    Ok(MemoryRegionDescriptor {
        base_address: info.base_address,
        allocation_base: info.allocation_base,
        region_size: info.region_size,
        state,
        protection,
        protection_code: info.protect,
        kind: RegionKind::from_code(info.kind),
    })
}

/// Walks the address space from zero up to the user-space ceiling.
///
/// Stops quietly at the first failed query or empty region, the way the
/// platform signals the end of the address space.
pub fn regions<P: MemoryPlatform + ?Sized>(platform: &P) -> Vec<MemoryRegionDescriptor> {
    let mut regions = Vec::new();
    let mut address = 0usize;
    loop {
        let region = match inspect(platform, address) {
            Ok(region) => region,
            Err(e) => {
                debug!("stopping region walk at {:#x}: {}", address, e);
                break;
            }
        };
        if region.region_size == 0 {
            debug!("empty region at {:#x}, stopping walk", address);
            break;
        }
        address = region.end_address();
        regions.push(region);
        if address >= USER_SPACE_MAX {
            break;
        }
    }
    regions
}
