//! Simulated GPU runtime
//!
//! Completes submissions on its own runtime thread, the way a vendor runtime
//! delivers activity buffers from a thread it owns. Every operation is
//! reported as an external-correlation record followed by its completion
//! record. Kernels launched while PC sampling runs on their context are held
//! back together with their synthesized samples until the next collect,
//! so their samples always precede the kernel completion.
//!
//! With a reorder window above one, completions are buffered and released in
//! shuffled order (seeded), to exercise out-of-order delivery.

use super::{AllocRequest, CopyRequest, GpuBackend, KernelLaunch};
use crate::activity::{
    ActivityDetails, GpuActivity, Interval, KernelActivity, MemcpyActivity, MemoryAllocActivity,
    PcSampleActivity, PcSamplingInfoActivity,
};
use crate::context_map::{ContextMap, StallReason};
use crate::error::GpuError;
use crate::process::CompletionHandler;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use stride_shared::{ContextHandle, ContextId, NativeCorrelationId};
use tracing::{debug, error, trace, warn};

const BACKEND: &str = "sim";

/// Stall reasons reported by every simulated context
pub const STALL_REASONS: [&str; 6] = [
    "none",
    "inst_fetch",
    "exec_dependency",
    "memory_dependency",
    "synchronization",
    "memory_throttle",
];

#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Nominal kernel duration; actual durations jitter by up to 25%
    pub kernel_ns: u64,
    pub copy_bytes_per_ns: u64,
    /// Completions buffered before release; 0 or 1 keeps submission order
    pub reorder_window: usize,
    pub seed: u64,
    pub pc_sampling: bool,
    /// Distinct PCs sampled per kernel
    pub pcs_per_kernel: u32,
    pub sample_period: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            kernel_ns: 20_000,
            copy_bytes_per_ns: 8,
            reorder_window: 0,
            seed: 0,
            pc_sampling: true,
            pcs_per_kernel: 4,
            sample_period: 5,
        }
    }
}

/// Calls that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SimFault {
    Submit,
    Enable,
    Start,
    Stop,
    Collect,
}

enum Command {
    Kernel {
        launch: KernelLaunch,
        context: ContextId,
        sampled: bool,
    },
    Copy {
        copy: CopyRequest,
        context: ContextId,
    },
    Alloc {
        alloc: AllocRequest,
        context: ContextId,
    },
    Collect {
        context: ContextHandle,
        reply: mpsc::Sender<usize>,
    },
    Flush {
        reply: mpsc::Sender<()>,
    },
}

#[derive(Debug, Default, Clone, Copy)]
struct SamplingState {
    enabled: bool,
    active: bool,
}

pub struct SimulatedBackend {
    config: SimConfig,
    contexts: Arc<ContextMap>,
    sender: spin::Mutex<Option<mpsc::Sender<Command>>>,
    worker: spin::Mutex<Option<JoinHandle<()>>>,
    sampling: spin::Mutex<BTreeMap<ContextHandle, SamplingState>>,
    faults: spin::Mutex<BTreeMap<SimFault, u32>>,
    submitted: AtomicU64,
}

impl SimulatedBackend {
    /// Start the runtime thread; completions go to `handler`
    pub fn new(
        config: SimConfig,
        contexts: Arc<ContextMap>,
        handler: Arc<dyn CompletionHandler>,
    ) -> Result<Self, GpuError> {
        let (sender, receiver) = mpsc::channel();
        let runtime = Runtime {
            handler,
            rng: StdRng::seed_from_u64(config.seed),
            config: config.clone(),
            clock: 1_000,
            next_native: 1,
            ready: Vec::new(),
            withheld: BTreeMap::new(),
        };
        let worker = std::thread::Builder::new()
            .name("stride-sim".to_string())
            .spawn(move || runtime.run(receiver))
            .map_err(|_| GpuError::Spawn("simulated runtime"))?;
        debug!("simulated GPU runtime started");
        Ok(Self {
            config,
            contexts,
            sender: spin::Mutex::new(Some(sender)),
            worker: spin::Mutex::new(Some(worker)),
            sampling: spin::Mutex::new(BTreeMap::new()),
            faults: spin::Mutex::new(BTreeMap::new()),
            submitted: AtomicU64::new(0),
        })
    }

    /// Make every later call of kind `fault` fail with `code`
    pub fn inject_failure(&self, fault: SimFault, code: u32) {
        self.faults.lock().insert(fault, code);
    }

    pub fn clear_failures(&self) {
        self.faults.lock().clear();
    }

    pub fn is_sampling(&self, context: ContextHandle) -> bool {
        self.sampling
            .lock()
            .get(&context)
            .is_some_and(|state| state.active)
    }

    /// Operations accepted so far
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Stop the runtime thread after it has delivered everything queued,
    /// held-back kernels included.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("simulated runtime thread panicked");
            }
        }
    }

    fn fault(&self, fault: SimFault, op: &'static str) -> Result<(), GpuError> {
        match self.faults.lock().get(&fault) {
            Some(code) => Err(GpuError::vendor(BACKEND, op, *code)),
            None => Ok(()),
        }
    }

    fn send(&self, command: Command) -> Result<(), GpuError> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(GpuError::Disconnected)?;
        sender.send(command).map_err(|_| GpuError::Disconnected)
    }
}

impl GpuBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn submit_kernel(&self, launch: &KernelLaunch) -> Result<(), GpuError> {
        self.fault(SimFault::Submit, "launch_kernel")?;
        let context = self.contexts.init(launch.context);
        // Held across the send so a concurrent stop cannot slip in between
        let sampling = self.sampling.lock();
        let sampled = sampling
            .get(&launch.context)
            .is_some_and(|state| state.active);
        self.send(Command::Kernel {
            launch: launch.clone(),
            context,
            sampled,
        })?;
        drop(sampling);
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn submit_copy(&self, copy: &CopyRequest) -> Result<(), GpuError> {
        self.fault(SimFault::Submit, "memcpy")?;
        let context = self.contexts.init(copy.context);
        self.send(Command::Copy {
            copy: copy.clone(),
            context,
        })?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn submit_alloc(&self, alloc: &AllocRequest) -> Result<(), GpuError> {
        self.fault(SimFault::Submit, "mem_alloc")?;
        let context = self.contexts.init(alloc.context);
        self.send(Command::Alloc {
            alloc: alloc.clone(),
            context,
        })?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn supports_pc_sampling(&self) -> bool {
        self.config.pc_sampling
    }

    fn pc_sampling_enable(&self, context: ContextHandle) -> Result<(), GpuError> {
        if !self.config.pc_sampling {
            return Err(GpuError::NotSupported {
                backend: BACKEND,
                what: "pc sampling",
            });
        }
        self.fault(SimFault::Enable, "pc_sampling_enable")?;
        self.contexts.init(context);
        let reasons = STALL_REASONS
            .iter()
            .enumerate()
            .map(|(index, name)| StallReason {
                index: index as u32,
                name: (*name).to_string(),
            })
            .collect();
        self.contexts.stall_reasons_update(context, reasons);
        self.contexts
            .buffer_update(context, 4096, self.config.sample_period);
        self.sampling.lock().entry(context).or_default().enabled = true;
        Ok(())
    }

    fn pc_sampling_start(&self, context: ContextHandle) -> Result<(), GpuError> {
        self.fault(SimFault::Start, "pc_sampling_start")?;
        let mut sampling = self.sampling.lock();
        match sampling.get_mut(&context) {
            Some(state) if state.enabled => {
                state.active = true;
                trace!("sim: sampling started on {:#x}", context.0);
                Ok(())
            }
            _ => Err(GpuError::UnknownContext(context.0)),
        }
    }

    fn pc_sampling_stop(&self, context: ContextHandle) -> Result<(), GpuError> {
        self.fault(SimFault::Stop, "pc_sampling_stop")?;
        if let Some(state) = self.sampling.lock().get_mut(&context) {
            state.active = false;
        }
        Ok(())
    }

    fn pc_sampling_collect(&self, context: ContextHandle) -> Result<usize, GpuError> {
        self.fault(SimFault::Collect, "pc_sampling_collect")?;
        let (reply, delivered) = mpsc::channel();
        self.send(Command::Collect { context, reply })?;
        delivered.recv().map_err(|_| GpuError::Disconnected)
    }

    fn flush(&self) -> Result<(), GpuError> {
        let (reply, done) = mpsc::channel();
        self.send(Command::Flush { reply })?;
        done.recv().map_err(|_| GpuError::Disconnected)
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Runtime {
    handler: Arc<dyn CompletionHandler>,
    config: SimConfig,
    rng: StdRng,
    /// Device clock, ns
    clock: u64,
    next_native: NativeCorrelationId,
    /// Completed batches not yet released
    ready: Vec<Vec<GpuActivity>>,
    /// Sampled kernels waiting for a collect on their context
    withheld: BTreeMap<ContextHandle, Vec<Vec<GpuActivity>>>,
}

impl Runtime {
    fn run(mut self, commands: mpsc::Receiver<Command>) {
        while let Ok(command) = commands.recv() {
            self.handle(command);
        }
        self.release();
        let withheld = std::mem::take(&mut self.withheld);
        for batch in withheld.into_values().flatten() {
            self.deliver_batch(batch);
        }
        debug!("simulated GPU runtime stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Kernel {
                launch,
                context,
                sampled,
            } => {
                let native = self.native();
                let jitter = self.rng.gen_range(0..=self.config.kernel_ns / 4);
                let interval = self.elapse(self.config.kernel_ns + jitter);
                let mut batch = vec![GpuActivity::external_correlation(native, launch.correlation_id)];
                if sampled {
                    self.synthesize_samples(&launch, native, context, &mut batch);
                }
                batch.push(GpuActivity::new(
                    native,
                    context,
                    ActivityDetails::Kernel(KernelActivity {
                        device_id: 0,
                        stream_id: launch.stream,
                        interval,
                        grid: launch.grid,
                        block: launch.block,
                        static_shared_memory: launch.shared_memory,
                        dynamic_shared_memory: 0,
                        local_memory_total: 0,
                        registers_per_thread: 32,
                    }),
                ));
                if sampled {
                    self.withheld.entry(launch.context).or_default().push(batch);
                } else {
                    self.complete(batch);
                }
            }
            Command::Copy { copy, context } => {
                let native = self.native();
                let interval = self.elapse(copy.bytes / self.config.copy_bytes_per_ns.max(1) + 1);
                let batch = vec![
                    GpuActivity::external_correlation(native, copy.correlation_id),
                    GpuActivity::new(
                        native,
                        context,
                        ActivityDetails::Memcpy(MemcpyActivity {
                            kind: copy.kind,
                            bytes: copy.bytes,
                            device_id: 0,
                            stream_id: copy.stream,
                            interval,
                        }),
                    ),
                ];
                self.complete(batch);
            }
            Command::Alloc { alloc, context } => {
                let native = self.native();
                let interval = self.elapse(1_000);
                let batch = vec![
                    GpuActivity::external_correlation(native, alloc.correlation_id),
                    GpuActivity::new(
                        native,
                        context,
                        ActivityDetails::MemoryAlloc(MemoryAllocActivity {
                            kind: alloc.kind,
                            bytes: alloc.bytes,
                            device_id: 0,
                            interval,
                        }),
                    ),
                ];
                self.complete(batch);
            }
            Command::Collect { context, reply } => {
                self.release();
                let batches = self.withheld.remove(&context).unwrap_or_default();
                let samples = batches
                    .iter()
                    .flatten()
                    .filter(|record| matches!(record.details, ActivityDetails::PcSample(_)))
                    .count();
                for batch in batches {
                    self.deliver_batch(batch);
                }
                trace!("sim: collected {} sample records on {:#x}", samples, context.0);
                let _ = reply.send(samples);
            }
            Command::Flush { reply } => {
                self.release();
                let _ = reply.send(());
            }
        }
    }

    fn native(&mut self) -> NativeCorrelationId {
        let id = self.next_native;
        self.next_native += 1;
        id
    }

    fn elapse(&mut self, duration: u64) -> Interval {
        let start = self.clock;
        self.clock += duration;
        Interval::new(start, self.clock)
    }

    fn synthesize_samples(
        &mut self,
        launch: &KernelLaunch,
        native: NativeCorrelationId,
        context: ContextId,
        batch: &mut Vec<GpuActivity>,
    ) {
        let mut total = 0u64;
        for i in 0..self.config.pcs_per_kernel {
            let samples = self.rng.gen_range(1..=8u32);
            let latency_samples = self.rng.gen_range(0..=samples);
            let stall_reason = self.rng.gen_range(0..STALL_REASONS.len() as u32);
            total += u64::from(samples);
            batch.push(GpuActivity::new(
                native,
                context,
                ActivityDetails::PcSample(PcSampleActivity {
                    pc: launch.function.displaced(u64::from(i) * 0x10),
                    stall_reason: Some(stall_reason),
                    samples,
                    latency_samples,
                }),
            ));
        }
        batch.push(GpuActivity::new(
            native,
            context,
            ActivityDetails::PcSamplingInfo(PcSamplingInfoActivity {
                total_samples: total,
                dropped_samples: 0,
                full_sm_samples: 0,
                sample_period: self.config.sample_period,
            }),
        ));
    }

    fn complete(&mut self, batch: Vec<GpuActivity>) {
        self.ready.push(batch);
        if self.ready.len() >= self.config.reorder_window.max(1) {
            self.release();
        }
    }

    fn release(&mut self) {
        let mut batches = std::mem::take(&mut self.ready);
        if self.config.reorder_window > 1 {
            batches.shuffle(&mut self.rng);
        }
        for batch in batches {
            self.deliver_batch(batch);
        }
    }

    /// Hand records to the handler; a panicking handler loses that record only
    fn deliver_batch(&self, batch: Vec<GpuActivity>) {
        for record in batch {
            let kind = record.kind();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.handler.on_activity(record))) {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(
                    "{} record dropped: {}",
                    kind.as_str(),
                    GpuError::CallbackPanicked(message)
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityKind, CopyKind, MemoryKind};
    use std::sync::atomic::AtomicBool;
    use stride_shared::{CorrelationId, IpNormalized};

    #[derive(Default)]
    struct Recorder {
        records: spin::Mutex<Vec<GpuActivity>>,
        panic_once: AtomicBool,
    }

    impl CompletionHandler for Recorder {
        fn on_activity(&self, activity: GpuActivity) {
            if self.panic_once.swap(false, Ordering::SeqCst) {
                panic!("handler failure");
            }
            self.records.lock().push(activity);
        }
    }

    impl Recorder {
        fn kinds(&self) -> Vec<ActivityKind> {
            self.records.lock().iter().map(|r| r.kind()).collect()
        }
    }

    const CTX: ContextHandle = ContextHandle(0xa0);

    fn launch(id: u64) -> KernelLaunch {
        KernelLaunch {
            correlation_id: CorrelationId(id),
            context: CTX,
            stream: 1,
            function: IpNormalized::new(1, 0x400),
            grid: (4, 1, 1),
            block: (128, 1, 1),
            shared_memory: 0,
        }
    }

    fn backend(config: SimConfig) -> (SimulatedBackend, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let backend = SimulatedBackend::new(config, Arc::new(ContextMap::new()), recorder.clone()).unwrap();
        (backend, recorder)
    }

    #[test]
    fn test_completion_follows_external_correlation() {
        let (backend, recorder) = backend(SimConfig::default());
        backend.submit_kernel(&launch(1)).unwrap();
        backend
            .submit_copy(&CopyRequest {
                correlation_id: CorrelationId(2),
                context: CTX,
                stream: 1,
                kind: CopyKind::HostToDevice,
                bytes: 4096,
            })
            .unwrap();
        backend
            .submit_alloc(&AllocRequest {
                correlation_id: CorrelationId(3),
                context: CTX,
                kind: MemoryKind::Device,
                bytes: 1 << 20,
            })
            .unwrap();
        backend.flush().unwrap();
        assert_eq!(
            recorder.kinds(),
            vec![
                ActivityKind::ExternalCorrelation,
                ActivityKind::Kernel,
                ActivityKind::ExternalCorrelation,
                ActivityKind::Memcpy,
                ActivityKind::ExternalCorrelation,
                ActivityKind::MemoryAlloc,
            ]
        );
        assert_eq!(backend.submitted(), 3);
    }

    #[test]
    fn test_sampled_kernel_held_until_collect() {
        let (backend, recorder) = backend(SimConfig::default());
        backend.pc_sampling_enable(CTX).unwrap();
        backend.pc_sampling_start(CTX).unwrap();
        assert!(backend.is_sampling(CTX));
        backend.submit_kernel(&launch(1)).unwrap();
        backend.pc_sampling_stop(CTX).unwrap();
        backend.flush().unwrap();
        assert!(recorder.kinds().is_empty());

        assert_eq!(backend.pc_sampling_collect(CTX).unwrap(), 4);
        let kinds = recorder.kinds();
        assert_eq!(kinds.first(), Some(&ActivityKind::ExternalCorrelation));
        assert_eq!(kinds.last(), Some(&ActivityKind::Kernel));
        assert_eq!(kinds[kinds.len() - 2], ActivityKind::PcSamplingInfo);
        assert_eq!(kinds.len(), 1 + 4 + 1 + 1);
        assert_eq!(backend.pc_sampling_collect(CTX).unwrap(), 0);
    }

    #[test]
    fn test_start_requires_enable() {
        let (backend, _recorder) = backend(SimConfig::default());
        assert_eq!(backend.pc_sampling_start(CTX), Err(GpuError::UnknownContext(0xa0)));
    }

    #[test]
    fn test_injected_failures() {
        let (backend, _recorder) = backend(SimConfig::default());
        backend.inject_failure(SimFault::Submit, 2);
        assert_eq!(
            backend.submit_kernel(&launch(1)),
            Err(GpuError::vendor("sim", "launch_kernel", 2))
        );
        backend.clear_failures();
        assert!(backend.submit_kernel(&launch(2)).is_ok());

        let (unsupported, _recorder) = backend_without_sampling();
        assert!(matches!(
            unsupported.pc_sampling_enable(CTX),
            Err(GpuError::NotSupported { .. })
        ));
    }

    fn backend_without_sampling() -> (SimulatedBackend, Arc<Recorder>) {
        backend(SimConfig {
            pc_sampling: false,
            ..SimConfig::default()
        })
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let (backend, recorder) = backend(SimConfig::default());
        recorder.panic_once.store(true, Ordering::SeqCst);
        backend.submit_kernel(&launch(1)).unwrap();
        backend.flush().unwrap();
        assert_eq!(recorder.kinds(), vec![ActivityKind::Kernel]);
    }

    #[test]
    fn test_reordering_keeps_batches_whole() {
        let (backend, recorder) = backend(SimConfig {
            reorder_window: 8,
            seed: 3,
            ..SimConfig::default()
        });
        for id in 1..=20 {
            backend.submit_kernel(&launch(id)).unwrap();
        }
        backend.flush().unwrap();
        let records = recorder.records.lock();
        assert_eq!(records.len(), 40);
        for pair in records.chunks(2) {
            assert_eq!(pair[0].kind(), ActivityKind::ExternalCorrelation);
            assert_eq!(pair[1].kind(), ActivityKind::Kernel);
            assert_eq!(pair[0].native_correlation_id, pair[1].native_correlation_id);
        }
    }

    #[test]
    fn test_shutdown_releases_withheld() {
        let (backend, recorder) = backend(SimConfig::default());
        backend.pc_sampling_enable(CTX).unwrap();
        backend.pc_sampling_start(CTX).unwrap();
        backend.submit_kernel(&launch(1)).unwrap();
        backend.shutdown();
        assert_eq!(recorder.kinds().last(), Some(&ActivityKind::Kernel));
        assert_eq!(backend.flush(), Err(GpuError::Disconnected));
    }
}
