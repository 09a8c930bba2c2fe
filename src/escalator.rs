use log::{debug, info};

use crate::error::ProbeError;
use crate::memory::{Access, MemoryRegionDescriptor, Protection};
use crate::platform::{MemoryPlatform, align_up};

/// Asks for the writable variant of the region's access class and returns
/// the protection the region had before.
///
/// The whole region is changed, rounded up to whole pages. For pages backed
/// by a shared image the platform grants the request but keeps reporting a
/// write-copy class until the first write; callers should look at what the
/// next inspection reports, not at what was requested here.
pub fn widen_to_writable<P: MemoryPlatform + ?Sized>(
    platform: &P,
    descriptor: &MemoryRegionDescriptor,
) -> Result<Protection, ProbeError> {
    let current = Protection::from_code(descriptor.protection_code);
    let requested = match descriptor.protection.and_then(Protection::writable) {
        Some(requested) => requested,
        // Nothing sensible to widen to; the platform decides.
        None => Protection {
            access: Access::ExecuteReadWrite,
            modifiers: current.modifiers,
        },
    };
    let size = align_up(descriptor.region_size.max(1), platform.page_size());

    debug!(
        "widening {:#x}+{:#x} from {} to {}",
        descriptor.base_address, size, current, requested
    );
    let previous = platform
        .set_protection(descriptor.base_address, size, requested.code())
        .map_err(|source| ProbeError::ProtectFailed {
            address: descriptor.base_address,
            size,
            requested,
            source,
        })?;
    let previous = Protection::from_code(previous);
    info!(
        "{:#x}: protection {} -> requested {}",
        descriptor.base_address, previous, requested
    );
    Ok(previous)
}
