//! Runtime self-integrity of registered functions.
//!
//! At registration the first [`SNAPSHOT_LEN`] bytes of a function's entry
//! are hashed. A later scan recomputes the hash and, on x86, looks for
//! the usual inline-hook prefixes:
//!
//! | bytes   | meaning                  |
//! |---------|--------------------------|
//! | `E9`    | near `jmp`               |
//! | `EB`    | short `jmp`              |
//! | `48 B8` | `mov rax, imm64` trampoline |
//! | `CC`    | `int3` breakpoint        |
//!
//! Raw code reads go through [`CodeIntrospector`]. Targets without a
//! native implementation get a no-op reader and every check passes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::debug;

use super::DetectionHandler;
use crate::scheduler::{Interval, PeriodicTask};

/// Bytes hashed at each function entry.
pub const SNAPSHOT_LEN: usize = 64;

/// Default scan cadence.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Read access to the process's own machine code.
pub trait CodeIntrospector: Send + Sync {
    /// Read `len` bytes starting at `entry`, or `None` if unsupported.
    fn read_code(&self, entry: usize, len: usize) -> Option<Vec<u8>>;
}

/// Reads code directly from the mapped text segment.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeIntrospector;

#[cfg(all(
    any(target_os = "linux", target_os = "macos", target_os = "windows"),
    any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")
))]
impl CodeIntrospector for NativeIntrospector {
    fn read_code(&self, entry: usize, len: usize) -> Option<Vec<u8>> {
        if entry == 0 {
            return None;
        }
        let base = entry as *const u8;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            // SAFETY: `entry` is the address of a function in this process's
            // text segment, which stays mapped readable for the process
            // lifetime. Reads stay within the function's leading bytes.
            out.push(unsafe { std::ptr::read_volatile(base.add(i)) });
        }
        Some(out)
    }
}

#[cfg(not(all(
    any(target_os = "linux", target_os = "macos", target_os = "windows"),
    any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")
)))]
impl CodeIntrospector for NativeIntrospector {
    fn read_code(&self, _entry: usize, _len: usize) -> Option<Vec<u8>> {
        None
    }
}

/// Introspector that never reads anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIntrospector;

impl CodeIntrospector for NoopIntrospector {
    fn read_code(&self, _entry: usize, _len: usize) -> Option<Vec<u8>> {
        None
    }
}

/// Whether `code` opens with an inline-hook or breakpoint prefix.
///
/// Always `false` off x86.
pub fn has_hook_prefix(code: &[u8]) -> bool {
    if !cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
        return false;
    }
    matches!(code, [0xE9, ..] | [0xEB, ..] | [0x48, 0xB8, ..] | [0xCC, ..])
}

fn fingerprint_code(code: &[u8]) -> u64 {
    let digest = Sha256::digest(code);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    entry: usize,
    hash: u64,
    hooked_at_registration: bool,
}

/// Watches registered function entries for modification.
pub struct RuntimeIntegrityChecker {
    introspector: Arc<dyn CodeIntrospector>,
    functions: RwLock<BTreeMap<String, Snapshot>>,
    enabled: AtomicBool,
    last_result: AtomicBool,
    on_violation: RwLock<Option<DetectionHandler>>,
    task: PeriodicTask,
}

impl RuntimeIntegrityChecker {
    /// Checker over the native introspector.
    pub fn new() -> Self {
        Self::with_introspector(Arc::new(NativeIntrospector))
    }

    /// Checker over a custom introspector.
    pub fn with_introspector(introspector: Arc<dyn CodeIntrospector>) -> Self {
        Self {
            introspector,
            functions: RwLock::new(BTreeMap::new()),
            enabled: AtomicBool::new(true),
            last_result: AtomicBool::new(true),
            on_violation: RwLock::new(None),
            task: PeriodicTask::new("runtime-integrity"),
        }
    }

    /// Snapshot the entry of a function, e.g. `register_function("open", SealedBox::open as usize)`.
    ///
    /// Unreadable entries are skipped.
    pub fn register_function(&self, name: &str, entry: usize) {
        let Some(code) = self.introspector.read_code(entry, SNAPSHOT_LEN) else {
            return;
        };
        let snapshot = Snapshot {
            entry,
            hash: fingerprint_code(&code),
            hooked_at_registration: has_hook_prefix(&code),
        };
        if let Ok(mut map) = self.functions.write() {
            map.insert(name.to_string(), snapshot);
        }
    }

    /// Number of functions being watched.
    pub fn registered(&self) -> usize {
        self.functions.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Enable or disable scanning. A disabled checker always passes.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Install the handler called with an opaque category on violation.
    pub fn set_violation_handler(&self, handler: DetectionHandler) {
        if let Ok(mut slot) = self.on_violation.write() {
            *slot = Some(handler);
        }
    }

    /// Recompute every snapshot. Returns `false` on the first mismatch.
    pub fn check_integrity(&self) -> bool {
        if !self.enabled.load(Ordering::Acquire) {
            return true;
        }
        let snapshots: Vec<Snapshot> = match self.functions.read() {
            Ok(map) => map.values().copied().collect(),
            Err(_) => return self.fail("runtime_integrity"),
        };
        for snapshot in snapshots {
            let Some(code) = self.introspector.read_code(snapshot.entry, SNAPSHOT_LEN) else {
                continue;
            };
            if !snapshot.hooked_at_registration && has_hook_prefix(&code) {
                return self.fail("hook_detected");
            }
            if fingerprint_code(&code) != snapshot.hash {
                return self.fail("function_modified");
            }
        }
        self.last_result.store(true, Ordering::Release);
        true
    }

    /// Result of the most recent scan.
    pub fn last_result(&self) -> bool {
        self.last_result.load(Ordering::Acquire)
    }

    /// Scan on a fixed cadence until [`stop`](Self::stop).
    pub fn start_periodic_check(self: &Arc<Self>, interval: Duration) -> bool {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.task.start(Interval::Fixed(interval), move || {
            let weak = weak.clone();
            async move {
                if let Some(checker) = weak.upgrade() {
                    checker.check_integrity();
                }
            }
        })
    }

    /// Stop the periodic scan.
    pub fn stop(&self) {
        self.task.stop();
    }

    fn fail(&self, category: &'static str) -> bool {
        self.last_result.store(false, Ordering::Release);
        debug!(category, "Integrity: violation");
        let handler = self.on_violation.read().ok().and_then(|h| h.clone());
        if let Some(handler) = handler {
            handler(category);
        }
        false
    }
}

impl Default for RuntimeIntegrityChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeCode {
        memory: Mutex<HashMap<usize, Vec<u8>>>,
    }

    impl FakeCode {
        fn write(&self, entry: usize, code: &[u8]) {
            self.memory.lock().unwrap().insert(entry, code.to_vec());
        }
    }

    impl CodeIntrospector for FakeCode {
        fn read_code(&self, entry: usize, len: usize) -> Option<Vec<u8>> {
            let memory = self.memory.lock().unwrap();
            memory.get(&entry).map(|c| c.iter().copied().take(len).collect())
        }
    }

    fn prologue() -> Vec<u8> {
        let mut code = vec![0x55, 0x48, 0x89, 0xE5];
        code.resize(SNAPSHOT_LEN, 0x90);
        code
    }

    #[test]
    fn test_unchanged_code_passes() {
        let fake = Arc::new(FakeCode::default());
        fake.write(0x1000, &prologue());
        let checker = RuntimeIntegrityChecker::with_introspector(fake);
        checker.register_function("verify", 0x1000);
        assert_eq!(checker.registered(), 1);
        assert!(checker.check_integrity());
    }

    #[test]
    fn test_patched_code_fails_and_notifies() {
        let fake = Arc::new(FakeCode::default());
        fake.write(0x1000, &prologue());
        let checker = RuntimeIntegrityChecker::with_introspector(fake.clone());
        checker.register_function("verify", 0x1000);

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        checker.set_violation_handler(Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        let mut patched = prologue();
        patched[10] = 0x00;
        fake.write(0x1000, &patched);
        assert!(!checker.check_integrity());
        assert!(!checker.last_result());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        checker.set_enabled(false);
        assert!(checker.check_integrity());
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[test]
    fn test_hook_prefix_detected() {
        assert!(has_hook_prefix(&[0xE9, 0, 0, 0, 0]));
        assert!(has_hook_prefix(&[0x48, 0xB8, 1]));
        assert!(has_hook_prefix(&[0xCC]));
        assert!(!has_hook_prefix(&[0x55, 0x48]));
        assert!(!has_hook_prefix(&[]));
    }

    #[test]
    fn test_noop_introspector_passes() {
        let checker = RuntimeIntegrityChecker::with_introspector(Arc::new(NoopIntrospector));
        checker.register_function("anything", 0x1234);
        assert_eq!(checker.registered(), 0);
        assert!(checker.check_integrity());
    }

    #[test]
    fn test_native_snapshot_is_stable() {
        let checker = RuntimeIntegrityChecker::new();
        checker.register_function("fingerprint_code", fingerprint_code as usize);
        assert!(checker.check_integrity());
    }
}
