//! Error types used by this crate.

use thiserror::Error;

/// GPU correlation engine error kinds
#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum GpuError {
    /// The range mode string is not one of the known modes.
    #[error("unknown range mode: {0}")]
    UnknownRangeMode(String),
    /// A configuration value is out of range or inconsistent.
    #[error("config: {0}")]
    Config(String),
    /// A vendor API call returned a non-success result code.
    #[error("{backend} {op} failed with result code {code}")]
    Vendor {
        backend: &'static str,
        op: &'static str,
        code: u32,
    },
    /// The backend does not implement this capability (e.g. PC sampling on OpenCL).
    #[error("{backend} does not support {what}")]
    NotSupported {
        backend: &'static str,
        what: &'static str,
    },
    /// A context handle was used before the context was registered.
    #[error("unknown GPU context {0:#x}")]
    UnknownContext(u64),
    /// `range_enter` was called while the thread was already inside a bracket.
    #[error("range bracket already open on this thread (correlation {0})")]
    NestedRange(u64),
    /// A worker thread could not be started.
    #[error("cannot spawn {0} thread")]
    Spawn(&'static str),
    /// The backend runtime thread has gone away.
    #[error("backend runtime disconnected")]
    Disconnected,
    /// A completion callback panicked; the panic was contained.
    #[error("completion handler panicked: {0}")]
    CallbackPanicked(String),
}

impl GpuError {
    /// Convenience constructor for vendor result codes
    pub fn vendor(backend: &'static str, op: &'static str, code: u32) -> Self {
        GpuError::Vendor { backend, op, code }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = GpuError::vendor("cupti", "pc_sampling_start", 17);
        assert_eq!(e.to_string(), "cupti pc_sampling_start failed with result code 17");
        assert_eq!(
            GpuError::UnknownRangeMode("bogus".into()).to_string(),
            "unknown range mode: bogus"
        );
        assert_eq!(GpuError::UnknownContext(0xab).to_string(), "unknown GPU context 0xab");
    }
}
