use std::future::Future;
use std::time::Duration;

use tokio::{
    select,
    sync::watch,
    task,
    time::{self, Instant, MissedTickBehavior},
};

/// Stand-in for delays and periods too long to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .unwrap_or_else(|| from + FAR_FUTURE)
}

/// Cancellable delayed/periodic callback.
///
/// Every firing runs `callback` on its own tokio task, so a slow firing never
/// delays the next one and never blocks whoever armed the timer. [`Timer::stop`]
/// prevents future firings only; a firing that already started runs to the end.
/// Dropping the timer stops it as well.
#[derive(Debug)]
pub struct Timer {
    cancel: watch::Sender<bool>,
}

impl Timer {
    /// Fires after `delay`, then every `interval`. A zero interval makes it one-shot.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F, Fut>(delay: Duration, interval: Duration, callback: F) -> Timer
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel, mut cancelled) = watch::channel(false);
        let first = deadline(Instant::now(), delay);
        let interval = interval.min(FAR_FUTURE);

        task::spawn(async move {
            select! {
                biased;
                _ = cancelled.changed() => return,
                _ = time::sleep_until(first) => {}
            }
            task::spawn(callback());

            if interval.is_zero() {
                return;
            }

            let mut ticker = time::interval_at(deadline(first, interval), interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                select! {
                    biased;
                    // Err means the Timer was dropped, which also ends it.
                    _ = cancelled.changed() => break,
                    _ = ticker.tick() => {
                        task::spawn(callback());
                    }
                }
            }
        });

        Timer { cancel }
    }

    pub fn once<F, Fut>(delay: Duration, callback: F) -> Timer
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Timer::new(delay, Duration::ZERO, callback)
    }

    /// Idempotent; safe after a one-shot timer already fired.
    pub fn stop(&self) {
        self.cancel.send_replace(true);
    }
}
