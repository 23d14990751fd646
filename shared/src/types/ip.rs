//! Normalized instruction pointers
//!
//! A raw GPU program counter is meaningless across runs (and across
//! contexts within a run) because code is loaded at arbitrary addresses.
//! The profiler therefore keys everything by (load module, offset).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Load-module id assigned by the module registry
pub type LoadModuleId = u16;

/// Location-independent code address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct IpNormalized {
    pub lm_id: LoadModuleId,
    pub offset: u64,
}

impl IpNormalized {
    /// The null address (module 0, offset 0)
    pub const NULL: IpNormalized = IpNormalized { lm_id: 0, offset: 0 };

    pub fn new(lm_id: LoadModuleId, offset: u64) -> Self {
        Self { lm_id, offset }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Same module, displaced by `delta` bytes
    pub fn displaced(&self, delta: u64) -> Self {
        Self {
            lm_id: self.lm_id,
            offset: self.offset.wrapping_add(delta),
        }
    }
}

impl fmt::Display for IpNormalized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lm{}+{:#x}", self.lm_id, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_module_then_offset() {
        let a = IpNormalized::new(1, 0x900);
        let b = IpNormalized::new(2, 0x10);
        let c = IpNormalized::new(2, 0x20);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_displaced_keeps_module() {
        let ip = IpNormalized::new(3, 0x100);
        let moved = ip.displaced(0x20);
        assert_eq!(moved.lm_id, 3);
        assert_eq!(moved.offset, 0x120);
        assert_eq!(moved.to_string(), "lm3+0x120");
        assert!(IpNormalized::NULL.is_null());
    }
}
