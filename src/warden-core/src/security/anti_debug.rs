//! Debugger detection.
//!
//! Five independent signals are sampled. A debugger is reported only when
//! at least [`DETECTION_THRESHOLD`] of them fire.
//!
//! 1. timing: a tight loop running far slower than it should
//! 2. a known debugger or analysis tool in the process list
//! 3. the OS debug flag (`TracerPid`, `P_TRACED`, `IsDebuggerPresent`)
//! 4. an `int3` at the entry of a watched function (x86 only)
//! 5. a debugger as the parent process

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use tracing::debug;

use super::runtime_integrity::{CodeIntrospector, NativeIntrospector};
use super::DetectionHandler;
use crate::scheduler::{Interval, PeriodicTask};

/// Signals needed before a debugger is reported.
pub const DETECTION_THRESHOLD: usize = 2;

/// Default cadence of the continuous check.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

const TIMING_ITERATIONS: u64 = 1_000_000;
const TIMING_LIMIT: Duration = Duration::from_millis(20);

/// Byte offset of `p_flag` in Darwin's `kinfo_proc`: it follows the
/// two-pointer `p_un` union, `p_vmspace` and `p_sigacts`.
#[cfg_attr(not(any(target_os = "macos", target_os = "ios")), allow(dead_code))]
const DARWIN_P_FLAG_OFFSET: usize = 4 * std::mem::size_of::<usize>();

/// Process names treated as debuggers or analysis tools.
pub const DEBUGGER_PROCESSES: &[&str] = &[
    "ollydbg",
    "x64dbg",
    "x32dbg",
    "windbg",
    "ida",
    "ida64",
    "immunitydebugger",
    "cheatengine",
    "processhacker",
    "dnspy",
    "ghidra",
    "devenv",
    "gdb",
    "lldb",
    "frida",
    "radare2",
];

/// A single detection signal.
pub type Probe = Box<dyn Fn() -> bool + Send + Sync>;

/// Multi-signal debugger detector.
pub struct AntiDebug {
    probes: Vec<Probe>,
    detected: AtomicBool,
    on_detected: RwLock<Option<DetectionHandler>>,
    task: PeriodicTask,
}

impl AntiDebug {
    /// Detector over the five native signals.
    pub fn new() -> Self {
        let probes: Vec<Probe> = vec![
            Box::new(check_timing_anomaly),
            Box::new(check_debugger_process),
            Box::new(check_debug_flags),
            Box::new(check_breakpoints),
            Box::new(check_parent_process),
        ];
        Self::with_probes(probes)
    }

    /// Detector over caller-supplied signals.
    pub fn with_probes(probes: Vec<Probe>) -> Self {
        Self {
            probes,
            detected: AtomicBool::new(false),
            on_detected: RwLock::new(None),
            task: PeriodicTask::new("anti-debug"),
        }
    }

    /// Sample every signal and apply the threshold.
    ///
    /// All signals are sampled even after the threshold is reached.
    pub fn is_debugger_present(&self) -> bool {
        let fired = self.probes.iter().filter(|probe| probe()).count();
        fired >= DETECTION_THRESHOLD
    }

    /// Sample now and latch the result. Returns whether a debugger was seen.
    pub fn check(&self) -> bool {
        if !self.is_debugger_present() {
            return false;
        }
        self.detected.store(true, Ordering::Release);
        debug!(category = "debugger", "AntiDebug: detection");
        let handler = self.on_detected.read().ok().and_then(|h| h.clone());
        if let Some(handler) = handler {
            handler("debugger");
        }
        true
    }

    /// Sample every `interval`, calling `on_detected` on each detection.
    pub fn start_continuous_check(
        self: &Arc<Self>,
        interval: Duration,
        on_detected: DetectionHandler,
    ) -> bool {
        if let Ok(mut slot) = self.on_detected.write() {
            *slot = Some(on_detected);
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        self.task.start(Interval::Fixed(interval), move || {
            let weak = weak.clone();
            async move {
                if let Some(detector) = weak.upgrade() {
                    detector.check();
                }
            }
        })
    }

    /// Stop the continuous check.
    pub fn stop(&self) {
        self.task.stop();
    }

    /// Whether any check so far has latched a detection.
    pub fn was_detected(&self) -> bool {
        self.detected.load(Ordering::Acquire)
    }
}

impl Default for AntiDebug {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether 1M wrapping additions take longer than 20 ms.
pub fn check_timing_anomaly() -> bool {
    let start = Instant::now();
    let mut sum = 0u64;
    for i in 0..TIMING_ITERATIONS {
        sum = sum.wrapping_add(std::hint::black_box(i));
    }
    std::hint::black_box(sum);
    start.elapsed() > TIMING_LIMIT
}

/// Whether `name` looks like a debugger executable.
pub fn is_debugger_name(name: &str) -> bool {
    let name = name.to_lowercase();
    let stem = name.strip_suffix(".exe").unwrap_or(&name);
    DEBUGGER_PROCESSES.iter().any(|d| stem == *d) || stem.starts_with("frida")
}

/// Whether a known debugger appears in the process list.
pub fn check_debugger_process() -> bool {
    use sysinfo::{ProcessesToUpdate, System};

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .processes()
        .values()
        .any(|p| is_debugger_name(&p.name().to_string_lossy()))
}

/// Whether the parent process is a known debugger.
pub fn check_parent_process() -> bool {
    use sysinfo::{ProcessesToUpdate, System};

    let Ok(pid) = sysinfo::get_current_pid() else {
        return false;
    };
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .process(pid)
        .and_then(|p| p.parent())
        .and_then(|ppid| system.process(ppid))
        .is_some_and(|parent| is_debugger_name(&parent.name().to_string_lossy()))
}

/// Whether the OS reports this process as traced.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn check_debug_flags() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .map(|status| tracer_pid(&status).is_some_and(|pid| pid != 0))
        .unwrap_or(false)
}

/// `TracerPid` from a `/proc/<pid>/status` body.
pub fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|rest| rest.trim().parse().ok())
}

/// Whether the OS reports this process as traced.
///
/// Reads `p_flag` out of `kinfo_proc` via `sysctl` without reproducing
/// the full struct.
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn check_debug_flags() -> bool {
    const P_TRACED: i32 = 0x0000_0800;
    const KINFO_PROC_SIZE: usize = 648;

    let mut buf = [0u8; KINFO_PROC_SIZE];
    let mut size: libc::size_t = KINFO_PROC_SIZE;
    // SAFETY: getpid has no preconditions.
    let pid = unsafe { libc::getpid() };
    let mut mib: [libc::c_int; 4] = [libc::CTL_KERN, libc::KERN_PROC, libc::KERN_PROC_PID, pid];

    // SAFETY: `mib` names a valid sysctl, `buf` is `size` bytes long and
    // `size` is updated by the kernel to the bytes written.
    let result = unsafe {
        libc::sysctl(
            mib.as_mut_ptr(),
            4,
            buf.as_mut_ptr().cast::<libc::c_void>(),
            &mut size,
            std::ptr::null_mut(),
            0,
        )
    };
    if result != 0 || size < DARWIN_P_FLAG_OFFSET + 4 {
        return false;
    }
    let mut flag = [0u8; 4];
    flag.copy_from_slice(&buf[DARWIN_P_FLAG_OFFSET..DARWIN_P_FLAG_OFFSET + 4]);
    i32::from_ne_bytes(flag) & P_TRACED != 0
}

/// Whether the OS reports this process as traced.
#[cfg(target_os = "windows")]
pub fn check_debug_flags() -> bool {
    use windows_sys::Win32::System::Diagnostics::Debug::{
        CheckRemoteDebuggerPresent, IsDebuggerPresent,
    };
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    // SAFETY: both calls only query the current process.
    unsafe {
        if IsDebuggerPresent() != 0 {
            return true;
        }
        let mut remote: i32 = 0;
        CheckRemoteDebuggerPresent(GetCurrentProcess(), &mut remote) != 0 && remote != 0
    }
}

/// Whether the OS reports this process as traced.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "windows"
)))]
pub fn check_debug_flags() -> bool {
    false
}

/// Whether a software breakpoint sits on a watched entry point.
pub fn check_breakpoints() -> bool {
    if !cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
        return false;
    }
    let watched = [
        AntiDebug::is_debugger_present as usize,
        check_debug_flags as usize,
        crate::security::obfuscated::ObfuscatedValidator::verify_result as usize,
    ];
    watched.iter().any(|&entry| {
        NativeIntrospector
            .read_code(entry, 1)
            .is_some_and(|code| code.first() == Some(&0xCC))
    })
}
