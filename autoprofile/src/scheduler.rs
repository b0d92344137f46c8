use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error};
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};

use crate::config::SamplerConfig;
use crate::error::Result;
use crate::flag::{CaptureGuard, Flag};
use crate::process::{resolve_process_id, LocalPid, PidResolver};
use crate::recorder::Recorder;
use crate::sampler::Sampler;
use crate::timer::Timer;

/// Delay drawn before every attempt to open a capture window, spreading the
/// windows of many processes apart.
pub trait JitterSource: Send + Sync {
    /// A delay in `[0, bound)`; zero for a zero bound.
    fn jitter(&self, bound: Duration) -> Duration;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn jitter(&self, bound: Duration) -> Duration {
        let bound_ms = bound.as_millis() as u64;
        if bound_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..bound_ms))
    }
}

/// Always the same delay, capped at the bound.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub Duration);

impl JitterSource for FixedJitter {
    fn jitter(&self, bound: Duration) -> Duration {
        self.0.min(bound)
    }
}

/// State of the current report window. Only touched under the scheduler lock.
struct Window {
    sampler: Box<dyn Sampler>,
    sampler_timer: Option<Timer>,
    report_timer: Option<Timer>,
    sampler_timeout: Option<Timer>,
    profile_start: Instant,
    sampling_duration: Duration,
    /// Set while a capture window is open
    sampler_start: Option<Instant>,
}

impl Window {
    fn reset(&mut self) {
        self.sampler.reset();
        self.profile_start = Instant::now();
        self.sampling_duration = Duration::ZERO;
    }
}

struct Inner {
    config: SamplerConfig,
    recorder: Arc<dyn Recorder>,
    pid_resolver: Arc<dyn PidResolver>,
    jitter: Arc<dyn JitterSource>,
    guard: CaptureGuard,
    started: Flag,
    window: Mutex<Window>,
}

/// Drives one [`Sampler`]: opens bounded capture windows on a jittered
/// schedule, and periodically turns what was captured into a profile for the
/// [`Recorder`].
///
/// Cloning yields another handle to the same scheduler. Timer tasks only hold
/// weak references, so dropping the last handle winds everything down.
#[derive(Clone)]
pub struct SamplerScheduler {
    inner: Arc<Inner>,
}

pub struct SchedulerBuilder {
    sampler: Box<dyn Sampler>,
    config: SamplerConfig,
    recorder: Arc<dyn Recorder>,
    guard: CaptureGuard,
    pid_resolver: Arc<dyn PidResolver>,
    jitter: Arc<dyn JitterSource>,
}

impl SchedulerBuilder {
    pub fn with_pid_resolver(mut self, resolver: Arc<dyn PidResolver>) -> Self {
        self.pid_resolver = resolver;
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn build(self) -> Result<SamplerScheduler> {
        self.config.validate()?;

        Ok(SamplerScheduler {
            inner: Arc::new(Inner {
                config: self.config,
                recorder: self.recorder,
                pid_resolver: self.pid_resolver,
                jitter: self.jitter,
                guard: self.guard,
                started: Flag::new(),
                window: Mutex::new(Window {
                    sampler: self.sampler,
                    sampler_timer: None,
                    report_timer: None,
                    sampler_timeout: None,
                    profile_start: Instant::now(),
                    sampling_duration: Duration::ZERO,
                    sampler_start: None,
                }),
            }),
        })
    }
}

impl SamplerScheduler {
    /// `guard` is the exclusion token shared by every scheduler whose capture
    /// windows must not overlap.
    pub fn builder(
        sampler: Box<dyn Sampler>,
        config: SamplerConfig,
        recorder: Arc<dyn Recorder>,
        guard: CaptureGuard,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            sampler,
            config,
            recorder,
            guard,
            pid_resolver: Arc::new(LocalPid),
            jitter: Arc::new(RandomJitter),
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.inner.config
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.is_set()
    }

    /// Arms the sampling and report timers. No-op when already started.
    pub async fn start(&self) {
        self.inner.start().await
    }

    /// Cancels both timers. A capture window that is open keeps running until
    /// its timeout closes it. No-op when not started.
    pub async fn stop(&self) {
        self.inner.stop().await
    }

    /// Tries to open a capture window; `false` when stopped, over budget, or
    /// when another window holds the guard.
    pub async fn start_profiling(&self) -> bool {
        self.inner.start_profiling().await
    }

    /// Closes the open capture window, if any, and accounts its duration.
    pub async fn stop_sampler(&self) {
        self.inner.stop_sampler().await
    }

    /// Builds and records the profile of the current window, then starts a new one.
    pub async fn report(&self) {
        self.inner.report().await
    }
}

impl Inner {
    async fn start(self: &Arc<Self>) {
        if !self.started.set_if_unset() {
            return;
        }

        let mut window = self.window.lock().await;
        // stop() may have won the race for the lock
        if !self.started.is_set() {
            return;
        }

        window.reset();

        if !self.config.report_only {
            let weak = Arc::downgrade(self);
            let bound = self.config.jitter_bound();
            window.sampler_timer = Some(Timer::new(
                Duration::ZERO,
                self.config.sampling_interval,
                move || {
                    let weak = weak.clone();
                    async move {
                        let Some(jitter) = weak.upgrade().map(|inner| inner.jitter.jitter(bound))
                        else {
                            return;
                        };
                        time::sleep(jitter).await;
                        if let Some(inner) = weak.upgrade() {
                            inner.start_profiling().await;
                        }
                    }
                },
            ));
        }

        let weak: Weak<Inner> = Arc::downgrade(self);
        window.report_timer = Some(Timer::new(
            Duration::ZERO,
            self.config.report_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.report().await;
                    }
                }
            },
        ));

        debug!("{} started", self.config.log_prefix);
    }

    async fn stop(&self) {
        if !self.started.unset_if_set() {
            return;
        }

        let mut window = self.window.lock().await;
        if let Some(timer) = window.sampler_timer.take() {
            timer.stop();
        }
        if let Some(timer) = window.report_timer.take() {
            timer.stop();
        }

        debug!("{} stopped scheduling", self.config.log_prefix);
    }

    async fn start_profiling(self: &Arc<Self>) -> bool {
        if !self.started.is_set() {
            return false;
        }

        let mut window = self.window.lock().await;
        if !self.started.is_set() {
            return false;
        }

        if window.sampling_duration > self.config.max_profile_duration {
            debug!("{} max sampling duration reached", self.config.log_prefix);
            return false;
        }

        if !self.guard.try_acquire() {
            return false;
        }

        debug!("{} starting", self.config.log_prefix);

        if let Err(err) = window.sampler.start() {
            self.guard.release();
            error!("{} failed to start: {err}", self.config.log_prefix);
            return false;
        }
        window.sampler_start = Some(Instant::now());

        let weak = Arc::downgrade(self);
        window.sampler_timeout = Some(Timer::once(self.config.max_span_duration, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.stop_sampler().await;
                }
            }
        }));

        true
    }

    async fn stop_sampler(&self) {
        let mut window = self.window.lock().await;

        if let Some(timeout) = window.sampler_timeout.take() {
            timeout.stop();
        }

        let Some(sampler_start) = window.sampler_start.take() else {
            return;
        };

        let stopped = window.sampler.stop();
        self.guard.release();
        if let Err(err) = stopped {
            error!("{} failed to stop: {err}", self.config.log_prefix);
            return;
        }

        debug!("{} stopped", self.config.log_prefix);
        window.sampling_duration += sampler_start.elapsed();
    }

    async fn report(&self) {
        if !self.started.is_set() {
            return;
        }

        let mut window = self.window.lock().await;
        let timespan = window.profile_start.elapsed();

        if self.config.report_only || !window.sampling_duration.is_zero() {
            self.record_profile(&mut window, timespan);
        }

        window.reset();
    }

    fn record_profile(&self, window: &mut Window, timespan: Duration) {
        debug!("{} recording profile", self.config.log_prefix);

        let profile = match window
            .sampler
            .build_profile(window.sampling_duration, timespan)
        {
            Ok(profile) => profile,
            Err(err) => {
                error!("{} failed to build profile: {err}", self.config.log_prefix);
                return;
            }
        };

        if profile.is_empty() {
            debug!("{} not recording empty profile", self.config.log_prefix);
            return;
        }

        let process_id = resolve_process_id(self.pid_resolver.as_ref());
        let profile = profile.with_process_id(process_id);
        self.recorder.record(profile.to_json());

        debug!("{} recorded profile", self.config.log_prefix);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let window = self.window.get_mut();
        if window.sampler_start.take().is_some() {
            if let Err(err) = window.sampler.stop() {
                error!("{} failed to stop: {err}", self.config.log_prefix);
            }
            self.guard.release();
        }
    }
}
