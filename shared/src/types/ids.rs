//! Identifier type definitions
//!
//! These newtypes name the handles that the range engine, the activity
//! processor and the backends pass between each other. They are plain
//! integers underneath; the wrappers only keep them from being mixed up.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Host-side correlation id, one per GPU operation submission.
///
/// Allocated by an atomic fetch-and-increment at submission time and never
/// reused. Zero is reserved: the range engine's lead slot holds it when no
/// thread is lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    /// Reserved "no operation" value
    pub const NONE: CorrelationId = CorrelationId(0);

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id assigned by the vendor runtime to its own records
pub type NativeCorrelationId = u64;

/// A run of kernel launches sampled together
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RangeId(pub u32);

impl RangeId {
    /// Sentinel for "no range opened yet"
    pub const DEFAULT: RangeId = RangeId(0);

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_default(self) -> bool {
        self == Self::DEFAULT
    }
}

impl Default for RangeId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalized GPU context id (the vendor handle is mapped to this once)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContextId(pub u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Opaque vendor context handle (`CUcontext`, `cl_context`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContextHandle(pub u64);

/// Handle to a node of the calling-context tree.
///
/// The tree itself belongs to the CCT collaborator; this crate only carries
/// the handle around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CctNodeId(pub u64);

impl fmt::Display for CctNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_values() {
        assert!(CorrelationId::NONE.is_none());
        assert!(!CorrelationId(7).is_none());
        assert!(RangeId::default().is_default());
        assert_eq!(RangeId::DEFAULT.get(), 0);
    }

    #[test]
    fn test_ids_serialize_transparently_ordered() {
        let ids = vec![CorrelationId(3), CorrelationId(1), CorrelationId(2)];
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(sorted, vec![CorrelationId(1), CorrelationId(2), CorrelationId(3)]);

        let json = serde_json::to_string(&RangeId(42)).unwrap();
        let back: RangeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RangeId(42));
    }
}
