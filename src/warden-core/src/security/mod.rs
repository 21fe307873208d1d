//! Tamper detection suite.
//!
//! These checks raise the cost of patching the license decision; they are
//! not a guarantee against an attacker with full control of the host.
//!
//! - [`anti_debug`]: multi-signal debugger detection
//! - [`runtime_integrity`]: hashes of registered function entries
//! - [`obfuscated`] / [`distributed`]: verdicts that are not plain `bool`s
//! - [`honeypot`]: decoy entry points and call-rate monitoring
//! - [`challenge`]: server challenge-response
//! - [`call_stack`]: caller allow/block lists
//! - [`time_check`]: clock rollback across runs
//! - [`environment`]: VM heuristics
//! - [`protected`], [`opaque`], [`key_protector`]: obscurity helpers
//!
//! ## Opacity
//!
//! Detections are reported to handlers as a coarse category string
//! (`"debugger"`, `"honeypot"`, `"hook_detected"`, ...) and logged at
//! `debug` only. Nothing here returns an error describing which check
//! fired.

pub mod anti_debug;
pub mod call_stack;
pub mod challenge;
pub mod distributed;
pub mod environment;
pub mod honeypot;
pub mod key_protector;
pub mod obfuscated;
pub mod opaque;
pub mod protected;
pub mod random;
pub mod runtime_integrity;
pub mod time_check;

use std::sync::Arc;

use sha2::{Digest, Sha256};

pub use anti_debug::AntiDebug;
pub use call_stack::CallStackChecker;
pub use challenge::{Challenge, ChallengeAnswer, ChallengeSolver};
pub use distributed::{DistributedResult, DistributedValidator};
pub use environment::{check_environment, is_virtual_machine};
pub use honeypot::HoneypotDetector;
pub use key_protector::PublicKeyProtector;
pub use obfuscated::{ObfuscatedResult, ObfuscatedValidator, ValidationToken};
pub use opaque::OpaquePredicates;
pub use protected::ProtectedBool;
pub use runtime_integrity::{
    CodeIntrospector, NativeIntrospector, NoopIntrospector, RuntimeIntegrityChecker,
};
pub use time_check::TimeChecker;

/// Callback receiving the opaque category of a detection.
pub type DetectionHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Digest of the executable captured at startup.
#[derive(Debug, Clone)]
pub struct ExecutableIntegrity {
    digest: Option<[u8; 32]>,
}

impl ExecutableIntegrity {
    /// Hash the running executable now.
    pub fn new() -> Self {
        Self {
            digest: compute_self_hash(),
        }
    }

    /// Whether the executable on disk still matches the startup digest.
    ///
    /// Passes when the executable could not be read at startup.
    pub fn verify(&self) -> bool {
        match (&self.digest, compute_self_hash()) {
            (None, _) => true,
            (Some(expected), Some(actual)) => warden_crypto::constant_time_eq(expected, &actual),
            (Some(_), None) => false,
        }
    }

    /// Short digest of the startup hash; empty if unavailable.
    pub fn checksum(&self) -> String {
        self.digest
            .map(|d| hex::encode(Sha256::digest(hex::encode(d).as_bytes()))[..16].to_string())
            .unwrap_or_default()
    }
}

impl Default for ExecutableIntegrity {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 of the current executable, or `None` if it cannot be read.
fn compute_self_hash() -> Option<[u8; 32]> {
    let exe_path = std::env::current_exe().ok()?;
    let binary_data = std::fs::read(exe_path).ok()?;
    Some(Sha256::digest(&binary_data).into())
}

/// Current time in Unix nanoseconds.
pub(crate) fn unix_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_integrity_stable() {
        let integrity = ExecutableIntegrity::new();
        assert!(integrity.verify());
        let checksum = integrity.checksum();
        assert!(checksum.is_empty() || checksum.len() == 16);
    }

    #[test]
    fn test_unix_nanos_monotonic_enough() {
        let a = unix_nanos();
        let b = unix_nanos();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000_000_000);
    }
}
