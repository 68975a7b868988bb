//! Retry timer with pluggable backoff.
//!
//! A [`Timer`] has at most one pending firing. Scheduling again replaces the
//! pending firing, and the attempt counter only advances when the timer
//! actually fires, so repeated failures walk up the backoff schedule while
//! repeated scheduling does not.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

/// Maps an attempt number (starting at 1) to a retry delay.
pub type Backoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Reconnect and rejoin delays for the first attempts, in milliseconds.
pub const DEFAULT_BACKOFF_STEPS_MS: [u64; 9] = [10, 50, 100, 150, 200, 250, 500, 1000, 2000];

/// Delay used once the stepped schedule is exhausted, in milliseconds.
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 5000;

/// Build a stepped backoff: attempt `n` waits `steps[n - 1]`, attempts past
/// the end of `steps` wait `fallback`.
#[must_use]
pub fn stepped(steps: Vec<Duration>, fallback: Duration) -> Backoff {
    Arc::new(move |tries: u32| {
        let index = tries.saturating_sub(1) as usize;
        steps.get(index).copied().unwrap_or(fallback)
    })
}

/// The default reconnect/rejoin schedule.
#[must_use]
pub fn default_backoff() -> Backoff {
    stepped(
        DEFAULT_BACKOFF_STEPS_MS
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect(),
        Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
    )
}

struct Pending {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    pending: Option<Pending>,
    generation: u64,
}

/// A single-pending-retry scheduler.
pub struct Timer {
    callback: Arc<dyn Fn() + Send + Sync>,
    backoff: Backoff,
    tries: Arc<AtomicU32>,
    slot: Arc<Mutex<Slot>>,
    handle: Handle,
}

impl Timer {
    /// Create a timer that runs `callback` on `handle` when it fires.
    pub fn new(handle: Handle, backoff: Backoff, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            callback: Arc::new(callback),
            backoff,
            tries: Arc::new(AtomicU32::new(0)),
            slot: Arc::new(Mutex::new(Slot::default())),
            handle,
        }
    }

    /// Cancel any pending firing and schedule the next attempt.
    pub fn schedule_timeout(&self) {
        let delay = (self.backoff)(self.tries.load(Ordering::Acquire).saturating_add(1));

        let mut slot = self.slot.lock();
        if let Some(previous) = slot.pending.take() {
            previous.task.abort();
        }
        slot.generation += 1;
        let generation = slot.generation;

        let callback = Arc::clone(&self.callback);
        let tries = Arc::clone(&self.tries);
        let owner = Arc::clone(&self.slot);
        trace!(delay_ms = delay.as_millis() as u64, "Timer scheduled");

        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = owner.lock();
                // Superseded between wake-up and here
                if slot.pending.as_ref().map(|p| p.generation) != Some(generation) {
                    return;
                }
                slot.pending = None;
            }
            tries.fetch_add(1, Ordering::AcqRel);
            callback();
        });
        slot.pending = Some(Pending { generation, task });
    }

    /// Cancel any pending firing and zero the attempt counter.
    pub fn reset(&self) {
        self.tries.store(0, Ordering::Release);
        self.cancel();
    }

    /// Number of times the timer has fired since the last reset.
    #[must_use]
    pub fn tries(&self) -> u32 {
        self.tries.load(Ordering::Acquire)
    }

    /// Whether a firing is pending.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.slot.lock().pending.is_some()
    }

    fn cancel(&self) {
        if let Some(pending) = self.slot.lock().pending.take() {
            pending.task.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("tries", &self.tries())
            .field("pending", &self.is_pending())
            .finish()
    }
}
