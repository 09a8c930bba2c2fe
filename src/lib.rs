//! Observe how the host shares a module's pages between processes and how a
//! single write turns one of them into a private copy.

pub mod error;
pub mod escalator;
pub mod inspector;
pub mod memory;
pub mod platform;
pub mod probe;
pub mod utils;

pub use error::{OsError, ProbeError};
pub use escalator::widen_to_writable;
pub use inspector::{inspect, regions};
pub use memory::{Access, MemoryRegionDescriptor, Modifiers, Protection, RegionKind, RegionState};
pub use platform::MemoryPlatform;
pub use probe::{CowProbe, Step};
