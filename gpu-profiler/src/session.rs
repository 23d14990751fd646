//! A standalone profiling session
//!
//! [`GpuSession`] assembles the engine around one backend: context and
//! correlation maps, the calling-context tree, the range coordinator with
//! its mode policy, and a running multiplexer feeding a [`MetricStore`].
//! Shutdown follows the order the pieces depend on: close the last range,
//! drain the backend, flush every thread's channel, then stop the
//! multiplexer.

use crate::backend::GpuBackend;
use crate::cct::InMemoryCct;
use crate::channel::ChannelRegistry;
use crate::config::{RangeConfig, RangeMode};
use crate::context_map::ContextMap;
use crate::correlation::HostCorrelationMap;
use crate::error::GpuError;
use crate::metrics::MetricStore;
use crate::multiplexer::{Multiplexer, MultiplexerHandle};
use crate::operation::GpuOperations;
use crate::process::{ActivityProcessor, CompletionHandler};
use crate::range::policy::{self, PcSamplingDriver};
use crate::range::{RangeCoordinator, RangeThread};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Totals reported when a session ends
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub backend: String,
    pub mode: String,
    pub correlation_ids: u64,
    pub ranges_opened: u64,
    pub kernels: u64,
    pub copies: u64,
    pub copy_bytes: u64,
    pub allocs: u64,
    pub alloc_bytes: u64,
    pub pc_samples: u64,
    pub gpu_time_ns: u64,
    pub attributed: u64,
    pub vendor_failures: u64,
    pub cct_nodes: usize,
    /// Host ops still waiting for completions
    pub unretired: usize,
}

pub struct GpuSession<B: GpuBackend + 'static> {
    backend: Arc<B>,
    coordinator: Arc<RangeCoordinator>,
    driver: Arc<PcSamplingDriver>,
    operations: GpuOperations,
    host: Arc<HostCorrelationMap>,
    cct: Arc<InMemoryCct>,
    metrics: Arc<MetricStore>,
    multiplexer: MultiplexerHandle,
}

impl<B: GpuBackend + 'static> GpuSession<B> {
    /// Start a session. `build` creates the backend around the context map
    /// and the completion handler it must deliver to.
    pub fn start(
        config: RangeConfig,
        sample_period: u64,
        build: impl FnOnce(Arc<ContextMap>, Arc<dyn CompletionHandler>) -> Result<B, GpuError>,
    ) -> Result<Self, GpuError> {
        config.validate()?;
        let contexts = Arc::new(ContextMap::new());
        let host = Arc::new(HostCorrelationMap::new());
        let cct = Arc::new(InMemoryCct::new());
        let processor: Arc<dyn CompletionHandler> = Arc::new(ActivityProcessor::new(host.clone(), cct.clone()));
        let backend = Arc::new(build(contexts.clone(), processor)?);

        let mode = config.resolve(backend.supports_pc_sampling());
        let channels = Arc::new(ChannelRegistry::new());
        let coordinator = RangeCoordinator::new(config, mode, channels.clone());
        let driver = policy::install(&coordinator, backend.clone(), contexts.clone());

        let metrics = Arc::new(MetricStore::with_sample_period(sample_period));
        let multiplexer = Multiplexer::new(channels, metrics.clone()).spawn()?;
        let operations = GpuOperations::new(
            coordinator.clone(),
            backend.clone(),
            contexts,
            host.clone(),
            cct.clone(),
        );
        info!("session started: backend={} mode={}", backend.name(), mode);

        Ok(Self {
            backend,
            coordinator,
            driver,
            operations,
            host,
            cct,
            metrics,
            multiplexer,
        })
    }

    pub fn mode(&self) -> RangeMode {
        self.coordinator.mode()
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn coordinator(&self) -> &Arc<RangeCoordinator> {
        &self.coordinator
    }

    pub fn operations(&self) -> &GpuOperations {
        &self.operations
    }

    pub fn cct(&self) -> &Arc<InMemoryCct> {
        &self.cct
    }

    pub fn metrics(&self) -> &Arc<MetricStore> {
        &self.metrics
    }

    /// Register the calling thread
    pub fn register_thread(&self) -> RangeThread {
        self.coordinator.register_thread()
    }

    /// End the session. `threads` are the threads still registered; they
    /// are finished here after the backend has drained.
    pub fn finish(self, threads: Vec<RangeThread>) -> Result<SessionSummary, GpuError> {
        self.coordinator.last();
        self.backend.flush()?;
        for thread in threads {
            thread.finish();
        }
        self.coordinator.shutdown();
        let attributed = self.multiplexer.stop()?;

        let mut summary = SessionSummary {
            backend: self.backend.name().to_string(),
            mode: self.coordinator.mode().to_string(),
            correlation_ids: self.coordinator.correlation_ids_issued(),
            ranges_opened: self.coordinator.ranges_opened(),
            attributed,
            vendor_failures: self.driver.failures(),
            cct_nodes: self.cct.len(),
            unretired: self.host.len(),
            ..SessionSummary::default()
        };
        for (_, node) in self.metrics.snapshot() {
            summary.kernels += node.kernel_count;
            summary.copies += node.copy_count;
            summary.copy_bytes += node.copy_bytes_total();
            summary.allocs += node.alloc_count;
            summary.alloc_bytes += node.alloc_bytes;
            summary.pc_samples += node.pc_samples;
            summary.gpu_time_ns += node.gpu_time_ns();
        }
        info!(
            "session finished: {} records attributed, {} ranges",
            summary.attributed, summary.ranges_opened
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sim::{SimConfig, SimulatedBackend};
    use crate::operation::KernelSpec;
    use stride_shared::{CctNodeId, ContextHandle, IpNormalized};

    fn session(mode: RangeMode) -> GpuSession<SimulatedBackend> {
        let mut config = RangeConfig::with_mode(mode);
        config.seed = Some(3);
        GpuSession::start(config, 5, |contexts, handler| {
            SimulatedBackend::new(SimConfig::default(), contexts, handler)
        })
        .unwrap()
    }

    #[test]
    fn test_serial_session_retires_everything() {
        let session = session(RangeMode::Serial);
        let mut thread = session.register_thread();
        let spec = KernelSpec::new(ContextHandle(7), IpNormalized::new(3, 0x100));
        for _ in 0..4 {
            session
                .operations()
                .launch_kernel(&mut thread, CctNodeId(0), &spec)
                .unwrap();
        }
        let summary = session.finish(vec![thread]).unwrap();
        assert_eq!(summary.mode, "serial");
        assert_eq!(summary.kernels, 4);
        assert_eq!(summary.ranges_opened, 4);
        assert!(summary.pc_samples > 0);
        assert_eq!(summary.pc_samples % 5, 0);
        assert_eq!(summary.unretired, 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = RangeConfig::with_mode(RangeMode::Even);
        config.interval = 0;
        let result = GpuSession::start(config, 1, |contexts, handler| {
            SimulatedBackend::new(SimConfig::default(), contexts, handler)
        });
        assert!(matches!(result, Err(GpuError::Config(_))));
    }
}
