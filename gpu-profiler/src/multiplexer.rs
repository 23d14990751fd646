//! Operation multiplexer
//!
//! Drains every registered channel round-robin and hands each record to the
//! attribution sink. Flush records are answered here: by the time the
//! multiplexer sees one, everything its channel carried before it has been
//! attributed, so the flush token can be completed.

use crate::activity::{ActivityDetails, GpuActivity};
use crate::channel::{ActivityChannel, ChannelRegistry};
use crate::error::GpuError;
use crate::metrics::AttributionSink;
use crate::telemetry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Sleep between drains that found nothing
const IDLE_BACKOFF: Duration = Duration::from_micros(50);

pub struct Multiplexer {
    registry: Arc<ChannelRegistry>,
    sink: Arc<dyn AttributionSink>,
    scratch: Vec<Arc<ActivityChannel>>,
    attributed: u64,
}

impl Multiplexer {
    pub fn new(registry: Arc<ChannelRegistry>, sink: Arc<dyn AttributionSink>) -> Self {
        Self {
            registry,
            sink,
            scratch: Vec::new(),
            attributed: 0,
        }
    }

    /// One pass over all channels. Returns the number of records handled.
    pub fn drain_once(&mut self) -> usize {
        self.registry.snapshot_into(&mut self.scratch);
        let mut handled = 0;
        for channel in &self.scratch {
            let sink = &self.sink;
            let attributed = &mut self.attributed;
            handled += channel.consume(|record| {
                if dispatch(sink.as_ref(), record) {
                    *attributed += 1;
                }
            });
        }
        self.scratch.clear();
        handled
    }

    /// Records handed to the sink so far (flush records excluded)
    pub fn attributed(&self) -> u64 {
        self.attributed
    }

    /// Run on a dedicated thread until [`MultiplexerHandle::stop`]
    pub fn spawn(mut self) -> Result<MultiplexerHandle, GpuError> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("stride-mux".to_string())
                .spawn(move || {
                    info!("multiplexer started");
                    while !stop.load(Ordering::Acquire) {
                        if self.drain_once() == 0 {
                            std::thread::sleep(IDLE_BACKOFF);
                        }
                    }
                    // records pushed before stop was raised
                    while self.drain_once() > 0 {}
                    info!("multiplexer stopped after {} records", self.attributed);
                    self.attributed
                })
                .map_err(|_| GpuError::Spawn("multiplexer"))?
        };
        Ok(MultiplexerHandle {
            stop,
            thread: Some(thread),
        })
    }
}

/// Returns true if the record went to the sink
fn dispatch(sink: &dyn AttributionSink, record: GpuActivity) -> bool {
    match &record.details {
        ActivityDetails::Flush(token) => {
            trace!("multiplexer: flush");
            token.complete();
            telemetry::FLUSHES_COMPLETED.inc();
            false
        }
        ActivityDetails::Kernel(_)
        | ActivityDetails::Memcpy(_)
        | ActivityDetails::MemoryAlloc(_)
        | ActivityDetails::PcSample(_)
        | ActivityDetails::PcSamplingInfo(_)
        | ActivityDetails::ExternalCorrelation(_) => {
            let kind = record.kind();
            trace!("multiplexer: attribute {} {}", kind.as_str(), record.correlation_id);
            sink.attribute(&record);
            telemetry::ACTIVITIES_ATTRIBUTED
                .with_label_values(&[kind.as_str()])
                .inc();
            true
        }
    }
}

/// Owner of a running multiplexer thread
pub struct MultiplexerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<u64>>,
}

impl MultiplexerHandle {
    /// Stop after a final drain; returns the number of attributed records
    pub fn stop(mut self) -> Result<u64, GpuError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<u64, GpuError> {
        self.stop.store(true, Ordering::Release);
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| GpuError::CallbackPanicked("multiplexer thread".to_string())),
            None => Ok(0),
        }
    }
}

impl Drop for MultiplexerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            debug!("multiplexer handle dropped; stopping");
            let _ = self.shutdown();
        }
    }
}
