//! Machine fingerprint.
//!
//! A stable per-device identifier: the first 32 hex characters of
//!
//! ```text
//! SHA-256(hostname | os | arch [| mac] [| hardware_id])
//! ```
//!
//! OS and architecture use the server's historical labels (`darwin`,
//! `amd64`, `arm64`) so fingerprints match those of existing installs.

use std::process::Command;

use sha2::{Digest, Sha256};

/// Components that make up a fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintParts {
    /// Host name.
    pub hostname: String,
    /// OS label.
    pub os: String,
    /// Architecture label.
    pub arch: String,
    /// First real MAC address, lowercase colon-separated.
    pub mac: Option<String>,
    /// Platform hardware identifier.
    pub hardware_id: Option<String>,
}

impl FingerprintParts {
    /// Collect the parts from the running machine.
    #[must_use]
    pub fn collect() -> Self {
        Self {
            hostname: hostname(),
            os: os_label().to_string(),
            arch: arch_label().to_string(),
            mac: mac_address(),
            hardware_id: hardware_id(),
        }
    }

    /// Hash the parts into a 32 character fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut parts: Vec<&str> = vec![&self.hostname, &self.os, &self.arch];
        if let Some(mac) = self.mac.as_deref().filter(|m| !m.is_empty()) {
            parts.push(mac);
        }
        if let Some(hw) = self.hardware_id.as_deref().filter(|h| !h.is_empty()) {
            parts.push(hw);
        }
        let digest = Sha256::digest(parts.join("|").as_bytes());
        let mut out = hex::encode(digest);
        out.truncate(32);
        out
    }
}

/// Compute the fingerprint of this machine.
#[must_use]
pub fn machine_fingerprint() -> String {
    FingerprintParts::collect().fingerprint()
}

/// Host name, or an empty string if it cannot be read.
#[must_use]
pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// OS label reported to the server.
#[must_use]
pub fn os_label() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

/// Architecture label reported to the server.
#[must_use]
pub fn arch_label() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

/// A universally administered MAC is one with bit 1 of the first octet clear.
fn is_universal_mac(mac: &str) -> bool {
    let Some(first) = mac.split([':', '-']).next() else {
        return false;
    };
    match u8::from_str_radix(first, 16) {
        Ok(b0) => b0 & 0x02 == 0 && mac != "00:00:00:00:00:00",
        Err(_) => false,
    }
}

fn normalize_mac(mac: &str) -> String {
    mac.trim().replace('-', ":").to_lowercase()
}

/// First interface MAC that is up, not loopback and universally administered.
#[must_use]
pub fn mac_address() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        linux_mac_address()
    }

    #[cfg(target_os = "macos")]
    {
        macos_mac_address()
    }

    #[cfg(target_os = "windows")]
    {
        windows_mac_address()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        None
    }
}

#[cfg(target_os = "linux")]
fn linux_mac_address() -> Option<String> {
    const IFF_UP: u32 = 0x1;
    const IFF_LOOPBACK: u32 = 0x8;

    let read = |path: std::path::PathBuf| std::fs::read_to_string(path).ok();

    let mut ifaces: Vec<(u32, String)> = Vec::new();
    for entry in std::fs::read_dir("/sys/class/net").ok()?.flatten() {
        let dir = entry.path();
        let Some(flags) = read(dir.join("flags"))
            .and_then(|f| u32::from_str_radix(f.trim().trim_start_matches("0x"), 16).ok())
        else {
            continue;
        };
        if flags & IFF_LOOPBACK != 0 || flags & IFF_UP == 0 {
            continue;
        }
        let Some(mac) = read(dir.join("address")).map(|m| normalize_mac(&m)) else {
            continue;
        };
        if mac.is_empty() || !is_universal_mac(&mac) {
            continue;
        }
        let index = read(dir.join("ifindex"))
            .and_then(|i| i.trim().parse().ok())
            .unwrap_or(u32::MAX);
        ifaces.push((index, mac));
    }
    ifaces.sort();
    ifaces.into_iter().next().map(|(_, mac)| mac)
}

#[cfg(target_os = "macos")]
fn macos_mac_address() -> Option<String> {
    let output = Command::new("ifconfig").output().ok()?;
    parse_ifconfig(&String::from_utf8_lossy(&output.stdout))
}

/// Parse BSD `ifconfig` output.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_ifconfig(text: &str) -> Option<String> {
    let mut usable = false;
    for line in text.lines() {
        if !line.starts_with(char::is_whitespace) {
            let flags = line.split_once('<').map(|(_, r)| r).unwrap_or("");
            usable = flags.contains("UP") && !flags.contains("LOOPBACK");
            continue;
        }
        let line = line.trim();
        if let Some(mac) = line.strip_prefix("ether ") {
            let mac = normalize_mac(mac.split_whitespace().next().unwrap_or(""));
            if usable && is_universal_mac(&mac) {
                return Some(mac);
            }
        }
    }
    None
}

#[cfg(target_os = "windows")]
fn windows_mac_address() -> Option<String> {
    let output = Command::new("getmac")
        .args(["/fo", "csv", "/nh"])
        .output()
        .ok()?;
    parse_getmac(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `getmac /fo csv /nh` output. Disconnected adapters report no transport.
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn parse_getmac(text: &str) -> Option<String> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split(',').map(|c| c.trim().trim_matches('"'));
            let mac = cols.next()?;
            let transport = cols.next().unwrap_or("");
            (!transport.is_empty() && !transport.contains("disconnected"))
                .then(|| normalize_mac(mac))
        })
        .find(|mac| is_universal_mac(mac))
}

/// Platform hardware identifier.
#[must_use]
pub fn hardware_id() -> Option<String> {
    let id = if cfg!(target_os = "windows") {
        command_output("wmic", &["diskdrive", "get", "serialnumber"]).and_then(|out| {
            out.lines()
                .map(str::trim)
                .find(|l| !l.is_empty() && *l != "SerialNumber")
                .map(str::to_string)
        })
    } else if cfg!(target_os = "linux") {
        std::fs::read_to_string("/etc/machine-id")
            .ok()
            .map(|s| s.trim().to_string())
    } else if cfg!(target_os = "macos") {
        command_output("system_profiler", &["SPHardwareDataType"]).and_then(|out| {
            out.lines()
                .find(|l| l.contains("Hardware UUID"))
                .and_then(|l| l.split_once(':'))
                .map(|(_, v)| v.trim().to_string())
        })
    } else {
        None
    };
    id.filter(|s| !s.is_empty())
}

pub(crate) fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
}
