//! ---
//! ems_section: "09-integration-interoperability"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Grid view reconciliation of topology and live telemetry."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Fixed-interval single-flight poller.
//!
//! The action runs immediately and then on every tick. A tick that fires while the
//! previous invocation is still running is dropped, never queued.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

type SkipHook = Arc<dyn Fn() + Send + Sync>;

/// Shortest period a poller runs at; shorter requests are raised to it.
pub const MIN_POLL_PERIOD: Duration = Duration::from_millis(1);

/// Counters describing a poller's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PollerStats {
    pub invocations: u64,
    pub skipped: u64,
}

/// Builder for a polling loop.
pub struct Poller {
    label: String,
    period: Duration,
    on_skip: Option<SkipHook>,
}

impl Poller {
    pub fn new(label: impl Into<String>, period: Duration) -> Self {
        let label = label.into();
        if period < MIN_POLL_PERIOD {
            warn!(poller = %label, requested = ?period, "poll period below minimum; clamping");
        }
        Self {
            label,
            period: period.max(MIN_POLL_PERIOD),
            on_skip: None,
        }
    }

    /// Called each time a tick is dropped because an invocation is in flight.
    pub fn on_skip<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_skip = Some(Arc::new(hook));
        self
    }

    /// Start polling on the current runtime.
    pub fn spawn<F, Fut>(self, action: F) -> PollerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_on(&Handle::current(), action)
    }

    pub fn spawn_on<F, Fut>(self, runtime: &Handle, mut action: F) -> PollerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shared = Arc::new(PollerShared::default());
        let loop_shared = Arc::clone(&shared);
        let Poller {
            label,
            period,
            on_skip,
        } = self;
        let spawner = runtime.clone();
        let loop_label = label.clone();

        let task = runtime.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let mut gate = loop_shared.gate.lock();
                if gate.stopped {
                    break;
                }
                if gate.in_flight.as_ref().is_some_and(|task| !task.is_finished()) {
                    loop_shared.skipped.fetch_add(1, Ordering::Relaxed);
                    trace!(poller = %loop_label, "tick skipped; previous invocation still running");
                    if let Some(hook) = &on_skip {
                        hook();
                    }
                    continue;
                }
                loop_shared.invocations.fetch_add(1, Ordering::Relaxed);
                gate.in_flight = Some(spawner.spawn(action()));
            }
            debug!(poller = %loop_label, "poll loop exited");
        });

        debug!(poller = %label, period_ms = period.as_millis() as u64, "poller started");
        PollerHandle {
            label,
            shared,
            task: Mutex::new(Some(task)),
        }
    }
}

#[derive(Default)]
struct Gate {
    stopped: bool,
    in_flight: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PollerShared {
    gate: Mutex<Gate>,
    invocations: AtomicU64,
    skipped: AtomicU64,
}

/// Handle to a running poller. Dropping it stops the loop.
pub struct PollerHandle {
    label: String,
    shared: Arc<PollerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollerHandle {
    /// Stop the loop. No invocation starts after this returns; one already running
    /// is left to finish.
    pub fn stop(&self) {
        {
            let mut gate = self.shared.gate.lock();
            if gate.stopped {
                return;
            }
            gate.stopped = true;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        debug!(poller = %self.label, stats = ?self.stats(), "poller stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.gate.lock().stopped
    }

    /// Whether an invocation is currently running.
    pub fn in_flight(&self) -> bool {
        self.shared
            .gate
            .lock()
            .in_flight
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn stats(&self) -> PollerStats {
        PollerStats {
            invocations: self.shared.invocations.load(Ordering::Relaxed),
            skipped: self.shared.skipped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PollerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerHandle")
            .field("label", &self.label)
            .field("stats", &self.stats())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn invokes_immediately_then_every_period() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = Poller::new("test", Duration::from_millis(100)).spawn(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(handle.stats().skipped, 0);
        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn slow_action_never_overlaps() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let skips = Arc::new(AtomicUsize::new(0));
        let (r, p, s) = (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&skips));

        let handle = Poller::new("slow", Duration::from_millis(100))
            .on_skip(move || {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .spawn(move || {
                let running = Arc::clone(&r);
                let peak = Arc::clone(&p);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            });

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        handle.stop();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let stats = handle.stats();
        assert!(stats.invocations >= 2);
        assert!(stats.skipped >= 2);
        assert_eq!(stats.skipped, skips.load(Ordering::SeqCst) as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_starts_after_stop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = Poller::new("stop", Duration::from_millis(50)).spawn(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.stop();
        assert!(handle.is_stopped());
        let seen = calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
        assert_eq!(handle.stats().invocations, seen as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_is_clamped_and_keeps_polling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = Poller::new("zero", Duration::ZERO).spawn(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_stopped());
        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert!(handle.stats().invocations >= 2);
        handle.stop();
    }
}
