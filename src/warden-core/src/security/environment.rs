//! Virtual machine heuristics and the combined environment report.

use std::collections::BTreeMap;

use super::anti_debug::AntiDebug;
use crate::fingerprint::command_output;

/// Indicators needed before a VM is reported.
pub const VM_THRESHOLD: usize = 2;

/// OUI prefixes of common hypervisor NICs.
pub const VM_MAC_PREFIXES: &[&str] = &[
    "00:0c:29", // VMware
    "00:50:56", // VMware
    "08:00:27", // VirtualBox
    "00:1c:42", // Parallels
    "00:16:3e", // Xen
];

const VM_PRODUCT_KEYWORDS: &[&str] = &[
    "vmware",
    "virtualbox",
    "virtual machine",
    "qemu",
    "kvm",
    "xen",
    "hyperv",
    "parallels",
    "innotek",
];

#[cfg(target_os = "windows")]
const VM_DRIVER_FILES: &[&str] = &[
    r"C:\Windows\System32\drivers\vmmouse.sys",
    r"C:\Windows\System32\drivers\vmhgfs.sys",
    r"C:\Windows\System32\drivers\VBoxMouse.sys",
    r"C:\Windows\System32\drivers\VBoxGuest.sys",
];

#[cfg(target_os = "linux")]
const VM_DRIVER_FILES: &[&str] = &[
    "/sys/module/vboxguest",
    "/sys/module/vmw_balloon",
    "/sys/module/vmw_vmci",
    "/proc/xen",
];

#[cfg(target_os = "macos")]
const VM_DRIVER_FILES: &[&str] = &[
    "/Library/Extensions/VBoxGuest.kext",
    "/Library/Application Support/VMware Tools",
];

#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
const VM_DRIVER_FILES: &[&str] = &[];

/// Whether `mac` belongs to a hypervisor vendor.
pub fn is_vm_mac(mac: &str) -> bool {
    let mac = mac.to_lowercase().replace('-', ":");
    VM_MAC_PREFIXES.iter().any(|p| mac.starts_with(p))
}

/// Whether a product or model string names a hypervisor.
pub fn is_vm_product(text: &str) -> bool {
    let text = text.to_lowercase();
    VM_PRODUCT_KEYWORDS.iter().any(|k| text.contains(k))
}

fn check_vm_mac() -> bool {
    crate::fingerprint::mac_address().is_some_and(|mac| is_vm_mac(&mac))
}

fn check_vm_product() -> bool {
    let text = if cfg!(target_os = "linux") {
        ["product_name", "sys_vendor", "board_vendor"]
            .iter()
            .filter_map(|f| std::fs::read_to_string(format!("/sys/class/dmi/id/{f}")).ok())
            .collect::<Vec<_>>()
            .join("\n")
    } else if cfg!(target_os = "windows") {
        command_output("wmic", &["computersystem", "get", "model,manufacturer"]).unwrap_or_default()
    } else if cfg!(target_os = "macos") {
        command_output("sysctl", &["-n", "hw.model"]).unwrap_or_default()
    } else {
        String::new()
    };
    is_vm_product(&text)
}

fn check_vm_files() -> bool {
    VM_DRIVER_FILES
        .iter()
        .any(|p| std::path::Path::new(p).exists())
}

fn check_hypervisor_flag() -> bool {
    if cfg!(target_os = "linux") {
        std::fs::read_to_string("/proc/cpuinfo")
            .is_ok_and(|info| info.lines().any(|l| l.starts_with("flags") && l.contains(" hypervisor")))
    } else if cfg!(target_os = "macos") {
        command_output("sysctl", &["-n", "machdep.cpu.features"]).is_some_and(|f| f.contains("VMM"))
    } else {
        false
    }
}

/// Count the VM indicators present on this machine.
pub fn vm_indicators() -> usize {
    [
        check_vm_mac(),
        check_vm_product(),
        check_vm_files(),
        check_hypervisor_flag(),
    ]
    .into_iter()
    .filter(|hit| *hit)
    .count()
}

/// Whether at least [`VM_THRESHOLD`] VM indicators are present.
pub fn is_virtual_machine() -> bool {
    vm_indicators() >= VM_THRESHOLD
}

/// Environment report with the keys `debugger` and `virtual_machine`.
pub fn check_environment() -> BTreeMap<&'static str, bool> {
    BTreeMap::from([
        ("debugger", AntiDebug::new().is_debugger_present()),
        ("virtual_machine", is_virtual_machine()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_mac_prefixes() {
        assert!(is_vm_mac("00:0C:29:12:34:56"));
        assert!(is_vm_mac("08-00-27-aa-bb-cc"));
        assert!(!is_vm_mac("3c:22:fb:00:11:22"));
    }

    #[test]
    fn test_vm_product_strings() {
        assert!(is_vm_product("VMware Virtual Platform\n"));
        assert!(is_vm_product("innotek GmbH"));
        assert!(is_vm_product("Standard PC (Q35 + ICH9, 2009)\nQEMU"));
        assert!(!is_vm_product("MacBookPro18,3"));
    }

    #[test]
    fn test_environment_report_keys() {
        let report = check_environment();
        assert_eq!(
            report.keys().copied().collect::<Vec<_>>(),
            vec!["debugger", "virtual_machine"]
        );
        assert!(vm_indicators() <= 4);
    }
}
