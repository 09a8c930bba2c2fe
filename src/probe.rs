//! The inspect, widen, write, re-inspect sequence.
//!
//! Running it detaches the page holding the probed address from the frame it
//! shares with other processes. Restoring the byte afterwards restores the
//! content only: the page stays private, with the plain writable class, for
//! the rest of the process's life, and nothing here can share it again.
//!
//! Probing the same address from two threads at once is not supported; the
//! observations could not be attributed to either caller.

use std::fmt;

use log::info;

use crate::error::ProbeError;
use crate::escalator::widen_to_writable;
use crate::inspector::inspect;
use crate::memory::MemoryRegionDescriptor;
use crate::platform::MemoryPlatform;

/// The observation points of a demonstration, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Before anything was changed.
    Initial,
    /// After the protection was widened.
    Widened,
    /// After the first write to the page.
    Written,
}

impl Step {
    pub const ALL: [Step; 3] = [Step::Initial, Step::Widened, Step::Written];
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial inspection",
            Self::Widened => "protection change",
            Self::Written => "write",
        };
        f.write_str(name)
    }
}

pub struct CowProbe<P> {
    platform: P,
}

impl<P: MemoryPlatform> CowProbe<P> {
    pub fn new(platform: P) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Runs the demonstration on `address` and returns the three observed
    /// descriptors.
    ///
    /// # Safety
    ///
    /// The byte at `address` is flipped and flipped back. Nothing else may
    /// read, write or execute it in the meantime, and no other probe may run
    /// against the same page concurrently.
    pub unsafe fn demonstrate(
        &self,
        address: usize,
    ) -> Result<[MemoryRegionDescriptor; 3], ProbeError> {
        let mut observed = Vec::with_capacity(3);
        let record = |_: Step, descriptor: &MemoryRegionDescriptor| observed.push(*descriptor);
        unsafe { self.demonstrate_with(address, record)? };
        Ok([observed[0], observed[1], observed[2]])
    }

    /// Like [`CowProbe::demonstrate`], but hands every descriptor to
    /// `observer` as soon as it is taken, so output from earlier steps
    /// survives a failure in a later one.
    ///
    /// # Safety
    ///
    /// See [`CowProbe::demonstrate`].
    pub unsafe fn demonstrate_with<F>(
        &self,
        address: usize,
        mut observer: F,
    ) -> Result<(), ProbeError>
    where
        F: FnMut(Step, &MemoryRegionDescriptor),
    {
        let initial = inspect(&self.platform, address)?;
        self.observe(Step::Initial, &initial, &mut observer);
        if !initial.is_committed() {
            return Err(ProbeError::UnmappedAddress {
                address,
                state: initial.state,
                protection_code: initial.protection_code,
            });
        }

        widen_to_writable(&self.platform, &initial)?;
        let widened = inspect(&self.platform, address)?;
        self.observe(Step::Widened, &widened, &mut observer);

        let original = unsafe { self.platform.read_byte(address) };
        unsafe { self.platform.write_byte(address, original ^ 1) };
        let written = inspect(&self.platform, address);
        // The page is private now; put the content back whatever happened.
        unsafe { self.platform.write_byte(address, original) };
        let written = written?;
        self.observe(Step::Written, &written, &mut observer);
        Ok(())
    }

    fn observe<F>(&self, step: Step, descriptor: &MemoryRegionDescriptor, observer: &mut F)
    where
        F: FnMut(Step, &MemoryRegionDescriptor),
    {
        info!("{}: {}", step, descriptor);
        observer(step, descriptor);
    }
}

/// A function that exists only to be probed.
#[inline(never)]
pub extern "C" fn probe_target(seed: u32) -> u32 {
    seed.wrapping_mul(0x9E37_79B9).rotate_left(5) ^ 0xA5A5_A5A5
}

/// Address of [`probe_target`] in this process.
pub fn probe_target_address() -> usize {
    probe_target as *const () as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        Access, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, RegionState,
    };
    use crate::platform::simulated::{ERROR_ACCESS_DENIED, SIMULATED_MODULE_BASE, SimulatedPlatform};

    const TARGET: usize = SIMULATED_MODULE_BASE + 0x1010;

    #[test]
    fn shared_code_goes_through_execute_read_write_copy_read_write() {
        let probe = CowProbe::new(SimulatedPlatform::shared_module());
        let observed = unsafe { probe.demonstrate(TARGET) }.unwrap();
        let codes: Vec<u32> = observed.iter().map(|d| d.protection_code).collect();
        assert_eq!(
            codes,
            [
                PAGE_EXECUTE_READ,
                PAGE_EXECUTE_WRITECOPY,
                PAGE_EXECUTE_READWRITE,
            ]
        );
        for descriptor in &observed {
            assert!(descriptor.contains(TARGET));
        }
    }

    #[test]
    fn content_is_restored_but_protection_is_not() {
        let platform = SimulatedPlatform::shared_module();
        let before = unsafe { platform.read_byte(TARGET) };
        let probe = CowProbe::new(&platform);
        unsafe { probe.demonstrate(TARGET) }.unwrap();

        assert_eq!(unsafe { platform.read_byte(TARGET) }, before);
        assert!(!platform.is_shared(TARGET));
        let now = inspect(&platform, TARGET).unwrap();
        assert_eq!(now.protection.unwrap().access, Access::ExecuteReadWrite);
    }

    #[test]
    fn private_class_is_stable_under_further_writes() {
        let platform = SimulatedPlatform::shared_module();
        let probe = CowProbe::new(&platform);
        let [_, _, written] = unsafe { probe.demonstrate(TARGET) }.unwrap();

        let byte = unsafe { platform.read_byte(TARGET) };
        unsafe {
            platform.write_byte(TARGET, byte ^ 1);
            platform.write_byte(TARGET, byte);
        }
        assert_eq!(inspect(&platform, TARGET).unwrap(), written);
    }

    #[test]
    fn only_the_written_page_collapses() {
        let platform = SimulatedPlatform::shared_module();
        let probe = CowProbe::new(&platform);
        unsafe { probe.demonstrate(TARGET) }.unwrap();
        let neighbour = inspect(&platform, TARGET + 0x1000).unwrap();
        assert_eq!(neighbour.protection_code, PAGE_EXECUTE_WRITECOPY);
    }

    #[test]
    fn free_address_fails_before_any_protection_change() {
        let platform = SimulatedPlatform::shared_module();
        let probe = CowProbe::new(&platform);
        let mut seen = Vec::new();
        let record = |step, d: &MemoryRegionDescriptor| seen.push((step, d.state));
        let result = unsafe { probe.demonstrate_with(0x1000, record) };
        let err = result.unwrap_err();

        match err {
            ProbeError::UnmappedAddress { address, state, .. } => {
                assert_eq!(address, 0x1000);
                assert_eq!(state, RegionState::Free);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(platform.protect_calls(), 0);
        assert_eq!(seen, [(Step::Initial, RegionState::Free)]);
    }

    #[test]
    fn protect_failure_propagates_after_initial_observation() {
        let platform = SimulatedPlatform::new(0x1000);
        platform.map_image(0x40_0000, 1, Access::ExecuteRead);
        platform.deny_protection_changes(0x40_0000, 1);
        let probe = CowProbe::new(&platform);
        let mut steps = Vec::new();
        let record = |step, _: &MemoryRegionDescriptor| steps.push(step);
        let result = unsafe { probe.demonstrate_with(0x40_0010, record) };
        let err = result.unwrap_err();
        assert!(matches!(err, ProbeError::ProtectFailed { .. }));
        assert_eq!(err.os_code(), Some(ERROR_ACCESS_DENIED));
        assert_eq!(steps, [Step::Initial]);
    }

    #[test]
    fn query_failure_propagates_unchanged() {
        let probe = CowProbe::new(SimulatedPlatform::shared_module());
        let err = unsafe { probe.demonstrate(usize::MAX) }.unwrap_err();
        match err {
            ProbeError::QueryFailed { address, .. } => assert_eq!(address, usize::MAX),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn probe_target_is_callable() {
        assert_ne!(probe_target(1), probe_target(2));
        assert_ne!(probe_target_address(), 0);
    }
}
