//! Caller inspection.
//!
//! Frames come from [`std::backtrace::Backtrace`]. A frame is rejected if
//! it contains a blocked path or if one of its identifiers starts with a
//! suspicious keyword (`hook`, `patch`, `inject`, `bypass`, `crack`,
//! `keygen`). When an allow list is set, some frame must match it.
//!
//! Builds without symbols yield no named frames; those checks pass.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::sync::RwLock;

/// Identifier prefixes that mark a frame as suspicious.
pub const SUSPICIOUS_KEYWORDS: &[&str] = &["hook", "patch", "inject", "bypass", "crack", "keygen"];

const OWN_FRAMES: &[&str] = &["security::call_stack::", "std::backtrace", "backtrace_rs"];

/// Allow/block lists applied to the current call stack.
#[derive(Debug, Default)]
pub struct CallStackChecker {
    allowed: RwLock<Vec<String>>,
    blocked: RwLock<Vec<String>>,
}

impl CallStackChecker {
    /// Checker with empty lists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require some frame to contain `path`.
    pub fn allow(&self, path: impl Into<String>) {
        if let Ok(mut list) = self.allowed.write() {
            list.push(path.into());
        }
    }

    /// Reject any frame containing `path`.
    pub fn block(&self, path: impl Into<String>) {
        if let Ok(mut list) = self.blocked.write() {
            list.push(path.into());
        }
    }

    /// Check the stack above the caller, skipping `skip` further frames.
    #[inline(never)]
    pub fn check_caller(&self, skip: usize) -> bool {
        let Some(frames) = capture(skip) else {
            return true;
        };
        self.check_frames(&frames)
    }

    /// Apply the lists to an explicit frame list.
    pub fn check_frames(&self, frames: &[String]) -> bool {
        let blocked = self.blocked.read().map(|l| l.clone()).unwrap_or_default();
        for frame in frames {
            if blocked.iter().any(|b| frame.contains(b.as_str())) || is_suspicious(frame) {
                return false;
            }
        }
        let allowed = self.allowed.read().map(|l| l.clone()).unwrap_or_default();
        allowed.is_empty()
            || frames
                .iter()
                .any(|frame| allowed.iter().any(|a| frame.contains(a.as_str())))
    }

    /// Frames above the caller as `symbol (file:line)` strings.
    #[inline(never)]
    pub fn call_stack(&self, skip: usize) -> Vec<String> {
        capture(skip).unwrap_or_default()
    }
}

/// Whether a frame has an identifier starting with a suspicious keyword.
pub fn is_suspicious(frame: &str) -> bool {
    let symbol = frame.split(" (").next().unwrap_or(frame);
    symbol
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|ident| !ident.is_empty())
        .map(str::to_ascii_lowercase)
        .any(|ident| SUSPICIOUS_KEYWORDS.iter().any(|k| ident.starts_with(k)))
}

/// Capture the stack, dropping this module's frames and the backtrace
/// machinery, then `skip` more.
fn capture(skip: usize) -> Option<Vec<String>> {
    let backtrace = Backtrace::force_capture();
    if backtrace.status() != BacktraceStatus::Captured {
        return None;
    }
    let frames = parse_frames(&backtrace.to_string());
    let own = frames
        .iter()
        .rposition(|f| OWN_FRAMES.iter().any(|o| f.contains(o)))
        .map_or(0, |i| i + 1);
    Some(frames.into_iter().skip(own + skip).collect())
}

/// Parse the `Display` form of a backtrace into one string per frame.
pub fn parse_frames(rendered: &str) -> Vec<String> {
    let mut frames: Vec<String> = Vec::new();
    for line in rendered.lines() {
        let trimmed = line.trim_start();
        if let Some(location) = trimmed.strip_prefix("at ") {
            if let Some(last) = frames.last_mut() {
                last.push_str(" (");
                last.push_str(location.trim());
                last.push(')');
            }
            continue;
        }
        if let Some((index, symbol)) = trimmed.split_once(": ") {
            if !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) {
                frames.push(symbol.trim().to_string());
            }
        }
    }
    frames
}
