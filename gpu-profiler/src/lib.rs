//! GPU operation correlation and range profiling
//!
//! Host threads submit kernels, copies and allocations through
//! [`GpuOperations`]. Each op gets a host correlation id and a set of
//! calling-context placeholder nodes before it reaches the vendor backend.
//! Completion records come back on backend threads; the
//! [`ActivityProcessor`] resolves them to the submitting thread's channel,
//! and the [`Multiplexer`] drains every channel into an
//! [`AttributionSink`].
//!
//! Kernel launches are additionally bracketed by the [`RangeCoordinator`],
//! which groups launches into ranges and drives PC sampling according to
//! the configured [`RangeMode`].

pub mod activity;
pub mod backend;
pub mod cct;
pub mod channel;
pub mod config;
pub mod context_map;
pub mod correlation;
pub mod error;
pub mod freelist;
pub mod ip_norm_map;
pub mod latch;
pub mod metrics;
pub mod multiplexer;
pub mod operation;
pub mod process;
pub mod range;
pub mod session;
pub mod splay;
pub mod telemetry;
pub mod trie;

pub use activity::{ActivityDetails, ActivityKind, GpuActivity};
pub use backend::GpuBackend;
pub use cct::{CallingContextTree, InMemoryCct};
pub use config::{RangeConfig, RangeMode, VendorFailurePolicy};
pub use error::GpuError;
pub use metrics::{AttributionSink, MetricStore, NodeMetrics};
pub use multiplexer::Multiplexer;
pub use operation::{AllocSpec, CopySpec, GpuOperations, KernelSpec, LaunchOutcome};
pub use process::{ActivityProcessor, CompletionHandler};
pub use range::{RangeCoordinator, RangeThread};
pub use session::{GpuSession, SessionSummary};
