//! Background task plumbing.
//!
//! Every recurring job (heartbeat, integrity scan, random verification,
//! anti-debug sweep) runs as a [`PeriodicTask`] on the ambient tokio
//! runtime. Each task owns a [`StopSignal`] that closes exactly once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::security::random;

/// Close-once stop flag observable from async tasks.
#[derive(Debug)]
pub struct StopSignal {
    stopped: AtomicBool,
    tx: watch::Sender<bool>,
}

impl StopSignal {
    /// Create an open signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            stopped: AtomicBool::new(false),
            tx,
        }
    }

    /// Close the signal. Returns `true` only for the call that closed it.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.tx.send_replace(true);
        true
    }

    /// Whether the signal has been closed.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Receiver that observes the close.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Delay between two runs of a [`PeriodicTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    /// Constant delay.
    Fixed(Duration),
    /// Delay drawn from the OS CSPRNG in `[min, max]` before every run.
    Random {
        /// Lower bound.
        min: Duration,
        /// Upper bound.
        max: Duration,
    },
}

impl Interval {
    fn next_delay(&self) -> Duration {
        match *self {
            Self::Fixed(d) => d,
            Self::Random { min, max } => random::duration_between(min, max),
        }
    }
}

struct Running {
    stop: Arc<StopSignal>,
    handle: JoinHandle<()>,
}

/// A named job that runs `tick` after every interval until stopped.
pub struct PeriodicTask {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl PeriodicTask {
    /// Create an idle task.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    /// Spawn the loop on the current tokio runtime.
    ///
    /// Returns `false` if the task is already running or no runtime is
    /// available.
    pub fn start<F, Fut>(&self, interval: Interval, tick: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(mut running) = self.running.lock() else {
            return false;
        };
        if running
            .as_ref()
            .is_some_and(|r| !r.stop.is_stopped() && !r.handle.is_finished())
        {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(task = self.name, "Scheduler: no runtime, task not started");
            return false;
        };

        let stop = Arc::new(StopSignal::new());
        let mut rx = stop.subscribe();
        let name = self.name;
        let handle = runtime.spawn(async move {
            loop {
                let delay = interval.next_delay();
                tokio::select! {
                    _ = rx.changed() => break,
                    () = tokio::time::sleep(delay) => {},
                }
                if *rx.borrow() {
                    break;
                }
                tick().await;
            }
            debug!(task = name, "Scheduler: task exited");
        });

        *running = Some(Running { stop, handle });
        debug!(task = self.name, "Scheduler: task started");
        true
    }

    /// Signal the loop to exit. Safe to call repeatedly.
    pub fn stop(&self) {
        let Ok(mut running) = self.running.lock() else {
            return;
        };
        if let Some(r) = running.take() {
            r.stop.stop();
        }
    }

    /// Whether the loop is live.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_ok_and(|r| {
            r.as_ref()
                .is_some_and(|r| !r.stop.is_stopped() && !r.handle.is_finished())
        })
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}
