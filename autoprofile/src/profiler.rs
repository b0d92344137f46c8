use std::sync::Arc;

use futures::future::join_all;
use log::{debug, error, info};
use parking_lot::Mutex;
use tokio::task;

use crate::allocation::{AllocationSampler, FrameFilter, HeapSnapshotSource};
use crate::config::{AgentConfig, SamplerConfig, MAX_INTERVAL};
use crate::error::{ProfilerError, Result};
use crate::flag::{CaptureGuard, Flag};
use crate::process::{LocalPid, PidResolver};
use crate::recorder::{BufferedRecorder, ProfileSink, Recorder};
use crate::sampler::Sampler;
use crate::scheduler::{JitterSource, RandomJitter, SamplerScheduler};
use crate::timer::Timer;

/// Entry point of the profiling agent: owns the process capture guard, the
/// profile queue, and one scheduler per registered sampler.
pub struct AutoProfiler {
    config: AgentConfig,
    guard: CaptureGuard,
    recorder: Arc<BufferedRecorder>,
    pid_resolver: Arc<dyn PidResolver>,
    jitter: Arc<dyn JitterSource>,
    schedulers: Vec<SamplerScheduler>,
    flush_timer: Mutex<Option<Timer>>,
    started: Flag,
}

impl AutoProfiler {
    pub fn new(config: AgentConfig, sink: impl ProfileSink + 'static) -> Result<Self> {
        if config.flush_interval.is_zero() || config.flush_interval > MAX_INTERVAL {
            return Err(ProfilerError::Config(format!(
                "flush interval {:?} must be positive and at most {MAX_INTERVAL:?}",
                config.flush_interval
            )));
        }

        let recorder = Arc::new(BufferedRecorder::new(config.max_buffered_profiles, sink));
        Ok(AutoProfiler {
            config,
            guard: CaptureGuard::new(),
            recorder,
            pid_resolver: Arc::new(LocalPid),
            jitter: Arc::new(RandomJitter),
            schedulers: Vec::new(),
            flush_timer: Mutex::new(None),
            started: Flag::new(),
        })
    }

    /// Applies to samplers added afterwards.
    pub fn with_pid_resolver(mut self, resolver: Arc<dyn PidResolver>) -> Self {
        self.pid_resolver = resolver;
        self
    }

    /// Applies to samplers added afterwards.
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn recorder(&self) -> &Arc<BufferedRecorder> {
        &self.recorder
    }

    pub fn schedulers(&self) -> &[SamplerScheduler] {
        &self.schedulers
    }

    pub fn is_started(&self) -> bool {
        self.started.is_set()
    }

    pub fn add_sampler(&mut self, sampler: Box<dyn Sampler>, config: SamplerConfig) -> Result<()> {
        if self.started.is_set() {
            return Err(ProfilerError::Config(
                "samplers can't be added while profiling is running".to_string(),
            ));
        }

        let recorder: Arc<dyn Recorder> = self.recorder.clone();
        let scheduler = SamplerScheduler::builder(
            sampler,
            config,
            recorder,
            self.guard.for_scope(self.config.exclusion),
        )
        .with_pid_resolver(Arc::clone(&self.pid_resolver))
        .with_jitter(Arc::clone(&self.jitter))
        .build()?;

        debug!("{} registered", scheduler.config().log_prefix);
        self.schedulers.push(scheduler);
        Ok(())
    }

    pub fn enable_allocation_profiling(
        &mut self,
        source: impl HeapSnapshotSource + 'static,
    ) -> Result<()> {
        let filter = FrameFilter::default().with_agent_frames(self.config.include_agent_frames);
        let sampler = AllocationSampler::new(source).with_filter(filter);
        self.add_sampler(Box::new(sampler), self.config.allocation.clone())
    }

    /// Starts every scheduler and the periodic flush. No-op when running.
    pub async fn start(&self) {
        if !self.started.set_if_unset() {
            return;
        }

        join_all(self.schedulers.iter().map(|scheduler| scheduler.start())).await;

        let recorder = Arc::clone(&self.recorder);
        let interval = self.config.flush_interval;
        *self.flush_timer.lock() = Some(Timer::new(interval, interval, move || {
            flush_off_runtime(Arc::clone(&recorder))
        }));

        info!("profiling started with {} samplers", self.schedulers.len());
    }

    /// Stops scheduling and flushes what is queued. No-op when not running.
    pub async fn stop(&self) {
        if !self.started.unset_if_set() {
            return;
        }

        join_all(self.schedulers.iter().map(|scheduler| scheduler.stop())).await;

        if let Some(timer) = self.flush_timer.lock().take() {
            timer.stop();
        }
        flush_off_runtime(Arc::clone(&self.recorder)).await;

        info!("profiling stopped");
    }
}

/// Sinks may write files or sockets, so flushing runs on the blocking pool.
async fn flush_off_runtime(recorder: Arc<BufferedRecorder>) {
    if let Err(err) = task::spawn_blocking(move || recorder.flush()).await {
        error!("profile flush task failed: {err}");
    }
}
