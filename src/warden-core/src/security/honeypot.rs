//! Honeypot traps and call-pattern monitoring.
//!
//! Decoy entry points call [`HoneypotDetector::trigger_honeypot`]. Real
//! entry points call [`HoneypotDetector::record_call`], which tracks an
//! exponential moving average of the interval between calls and counts
//! bursts that look scripted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use super::DetectionHandler;

/// Weight of the newest interval in the moving average.
pub const EMA_ALPHA: f64 = 0.1;

/// Calls closer together than this count as suspicious.
pub const SUSPICIOUS_INTERVAL: Duration = Duration::from_millis(10);

/// Suspicious calls tolerated before the session is flagged.
pub const SUSPICIOUS_LIMIT: u32 = 10;

#[derive(Debug, Clone, Copy)]
struct CallStats {
    count: u64,
    last_call: Instant,
    avg_interval_ns: f64,
}

/// Detects decoy usage and abnormal call patterns.
#[derive(Default)]
pub struct HoneypotDetector {
    calls: Mutex<HashMap<String, CallStats>>,
    triggered: AtomicBool,
    suspicious: AtomicU32,
    on_detection: RwLock<Option<DetectionHandler>>,
}

impl HoneypotDetector {
    /// Fresh detector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call to `name` now.
    pub fn record_call(&self, name: &str) {
        self.record_call_at(name, Instant::now());
    }

    /// Record a call to `name` at `now`.
    pub fn record_call_at(&self, name: &str, now: Instant) {
        let Ok(mut calls) = self.calls.lock() else {
            return;
        };
        let mut crossed = false;
        match calls.get_mut(name) {
            None => {
                calls.insert(
                    name.to_string(),
                    CallStats {
                        count: 1,
                        last_call: now,
                        avg_interval_ns: 0.0,
                    },
                );
            },
            Some(stats) => {
                let interval = now.saturating_duration_since(stats.last_call);
                let interval_ns = interval.as_nanos() as f64;
                stats.avg_interval_ns = if stats.avg_interval_ns == 0.0 {
                    interval_ns
                } else {
                    stats.avg_interval_ns * (1.0 - EMA_ALPHA) + interval_ns * EMA_ALPHA
                };
                if interval < SUSPICIOUS_INTERVAL {
                    crossed = self.suspicious.fetch_add(1, Ordering::AcqRel) == SUSPICIOUS_LIMIT;
                }
                stats.count += 1;
                stats.last_call = now;
            },
        }
        drop(calls);
        if crossed {
            debug!(category = "burst", "Honeypot: suspicious call burst");
            self.notify("burst");
        }
    }

    /// Number of recorded calls to `name`.
    pub fn call_count(&self, name: &str) -> u64 {
        self.calls
            .lock()
            .ok()
            .and_then(|c| c.get(name).map(|s| s.count))
            .unwrap_or(0)
    }

    /// Number of suspiciously fast repeat calls seen.
    pub fn suspicious_count(&self) -> u32 {
        self.suspicious.load(Ordering::Acquire)
    }

    /// Mark the session compromised and notify the handler.
    pub fn trigger_honeypot(&self) {
        self.triggered.store(true, Ordering::Release);
        debug!(category = "honeypot", "Honeypot: triggered");
        self.notify("honeypot");
    }

    /// Forget decoy hits, bursts and call history.
    pub fn reset(&self) {
        self.triggered.store(false, Ordering::Release);
        self.suspicious.store(0, Ordering::Release);
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    fn notify(&self, category: &str) {
        let handler = self.on_detection.read().ok().and_then(|h| h.clone());
        if let Some(handler) = handler {
            handler(category);
        }
    }

    /// Whether a decoy was touched or too many suspicious calls were seen.
    pub fn is_compromised(&self) -> bool {
        self.triggered.load(Ordering::Acquire) || self.suspicious_count() > SUSPICIOUS_LIMIT
    }

    /// Install the handler called when a decoy fires or a burst crosses
    /// [`SUSPICIOUS_LIMIT`].
    pub fn set_detection_handler(&self, handler: DetectionHandler) {
        if let Ok(mut slot) = self.on_detection.write() {
            *slot = Some(handler);
        }
    }

    /// `false` if the average call rate of `name` exceeds `max_per_sec`.
    ///
    /// Unknown names and names with a single call pass.
    pub fn check_call_frequency(&self, name: &str, max_per_sec: f64) -> bool {
        let Ok(calls) = self.calls.lock() else {
            return true;
        };
        match calls.get(name) {
            Some(stats) if stats.avg_interval_ns > 0.0 => {
                let per_sec = 1e9 / stats.avg_interval_ns;
                per_sec <= max_per_sec
            },
            _ => true,
        }
    }
}

impl std::fmt::Debug for HoneypotDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HoneypotDetector")
            .field("compromised", &self.is_compromised())
            .finish_non_exhaustive()
    }
}
