use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Future returned by a timer callback.
pub type TimerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Callback run on every firing. It receives the generation of the arming
/// that fired so the owner can drop firings that lost a race with a restart.
pub type TimerCallback = Arc<dyn Fn(u64) -> TimerFuture + Send + Sync>;

/// Generates a random election timeout within the configured range
pub fn random_election_timeout<R: Rng + ?Sized>(rng: &mut R, min_ms: u64, max_ms: u64) -> Duration {
    let timeout_ms = rng.gen_range(min_ms..=max_ms.max(min_ms));
    Duration::from_millis(timeout_ms)
}

/// A periodic alarm that can be cancelled and restarted.
///
/// Every `start` cancels the previous arming and begins a new phase: the next
/// firing is one full `interval` after the call. Callbacks run on a spawned
/// tokio task, one at a time; the next period starts once the callback
/// returns.
pub struct RepeatingTimer {
    name: &'static str,
    interval: Duration,
    callback: TimerCallback,
    generation: u64,
    armed: Option<CancellationToken>,
}

impl RepeatingTimer {
    pub fn new(name: &'static str, interval: Duration, callback: TimerCallback) -> Self {
        Self {
            name,
            interval,
            callback,
            generation: 0,
            armed: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Takes effect at the next `start`.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// True if a firing tagged `generation` belongs to the live arming.
    pub fn is_current(&self, generation: u64) -> bool {
        self.is_armed() && self.generation == generation
    }

    /// Arm the timer. Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        self.cancel();
        self.generation += 1;

        let token = CancellationToken::new();
        self.armed = Some(token.clone());

        tracing::trace!(
            timer = self.name,
            generation = self.generation,
            interval_ms = self.interval.as_millis() as u64,
            "Timer armed"
        );
        tokio::spawn(run(
            self.interval,
            token,
            self.generation,
            self.callback.clone(),
        ));
    }

    /// Idempotent.
    pub fn cancel(&mut self) {
        if let Some(token) = self.armed.take() {
            token.cancel();
        }
    }

    pub fn restart(&mut self) {
        self.start();
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for RepeatingTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatingTimer")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("generation", &self.generation)
            .field("armed", &self.is_armed())
            .finish()
    }
}

async fn run(interval: Duration, token: CancellationToken, generation: u64, callback: TimerCallback) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if token.is_cancelled() {
            return;
        }
        callback(generation).await;
    }
}
