//! Runs the demonstration on a function of this test binary. This detaches
//! one code page for good, so it gets a process of its own.
#![cfg(any(windows, target_os = "linux"))]

use cow_probe::memory::{Access, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY};
use cow_probe::platform::host;
use cow_probe::probe::{probe_target, probe_target_address};
use cow_probe::{CowProbe, MemoryPlatform, ProbeError, inspect};

#[test]
fn own_code_collapses_write_copy_into_a_private_page() {
    let platform = host();
    let address = probe_target_address();
    let expected = probe_target(0xC0FFEE);
    let before = unsafe { platform.read_byte(address) };

    let result = unsafe { CowProbe::new(&platform).demonstrate(address) };
    let observed = match result {
        Ok(observed) => observed,
        Err(ProbeError::ProtectFailed { source, .. })
            if cfg!(target_os = "linux") && matches!(source.code, 1 | 13) =>
        {
            eprintln!("writable code is not permitted ({source}), skipping");
            return;
        }
        Err(e) => panic!("demonstration failed: {e}"),
    };
    let codes: Vec<u32> = observed.iter().map(|d| d.protection_code).collect();
    for descriptor in &observed {
        assert!(descriptor.contains(address));
    }

    assert_eq!(
        codes,
        [
            PAGE_EXECUTE_READ,
            PAGE_EXECUTE_WRITECOPY,
            PAGE_EXECUTE_READWRITE,
        ]
    );
    assert_eq!(
        observed[2].protection.unwrap().access,
        Access::ExecuteReadWrite
    );
    // The private copy is one page; its neighbours still share their frame.
    assert_eq!(observed[2].region_size, platform.page_size());

    // Content comes back, the shared frame does not.
    assert_eq!(unsafe { platform.read_byte(address) }, before);
    assert_eq!(probe_target(0xC0FFEE), expected);
    let after = inspect(&platform, address).unwrap();
    assert_ne!(after.protection_code, PAGE_EXECUTE_READ);
    assert_eq!(after.protection_code, observed[2].protection_code);

    // A second write no longer changes anything.
    unsafe {
        platform.write_byte(address, before ^ 1);
        platform.write_byte(address, before);
    }
    assert_eq!(
        inspect(&platform, address).unwrap().protection_code,
        observed[2].protection_code
    );
}
