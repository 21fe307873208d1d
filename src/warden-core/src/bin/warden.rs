//! Warden CLI - diagnostics for the license client.
//!
//! Prints the values a support engineer needs without exposing keys:
//! the machine fingerprint, server certificate fingerprints for pinning,
//! the environment report and the state of a local credential cache.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use warden_core::fingerprint::FingerprintParts;
use warden_core::security::environment::{check_environment, vm_indicators, VM_THRESHOLD};
use warden_core::{
    certificate_fingerprint_from_file, machine_fingerprint, server_certificate_fingerprint,
    CredentialStore, LicenseConfig, SignatureVerifier,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const TARGET: &str = env!("TARGET");

/// Warden - license client diagnostics.
#[derive(Parser)]
#[command(name = "warden")]
#[command(version = VERSION)]
#[command(about = "Diagnostics for the Warden license client")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show this machine's fingerprint and the parts it is derived from
    Fingerprint,

    /// Compute a SHA-256 certificate fingerprint for pinning
    CertFingerprint {
        /// PEM certificate file
        #[arg(long, conflicts_with = "host")]
        file: Option<PathBuf>,

        /// Server host name
        #[arg(long)]
        host: Option<String>,

        /// Server port
        #[arg(long, default_value = "443")]
        port: u16,
    },

    /// Report debugger and virtual machine indicators
    Environment,

    /// Inspect a credential cache without modifying it
    CacheStatus {
        /// Application key the cache belongs to
        #[arg(long)]
        app_key: String,

        /// Cache directory (defaults to ~/.license_cache)
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Inspect the plaintext development cache instead
        #[arg(long)]
        plaintext: bool,
    },

    /// Show version and build information
    Info,
}

fn init_logging(verbose: bool, json: bool) {
    let default = if json {
        "error"
    } else if verbose {
        "debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn show_fingerprint(json: bool) {
    let parts = FingerprintParts::collect();
    let fingerprint = parts.fingerprint();
    if json {
        let output = serde_json::json!({
            "fingerprint": fingerprint,
            "hostname": parts.hostname,
            "os": parts.os,
            "arch": parts.arch,
            "mac": parts.mac.is_some(),
            "hardware_id": parts.hardware_id.is_some(),
        });
        println!("{output}");
        return;
    }
    println!("Machine Fingerprint: {fingerprint}");
    println!("  Hostname:    {}", parts.hostname);
    println!("  OS / Arch:   {} / {}", parts.os, parts.arch);
    println!(
        "  MAC:         {}",
        if parts.mac.is_some() { "present" } else { "not found" }
    );
    println!(
        "  Hardware ID: {}",
        if parts.hardware_id.is_some() {
            "present"
        } else {
            "not found"
        }
    );
}

fn show_cert_fingerprint(
    file: Option<PathBuf>,
    host: Option<String>,
    port: u16,
    json: bool,
) -> Result<()> {
    let (source, fingerprint) = match (file, host) {
        (Some(path), _) => {
            let fp = certificate_fingerprint_from_file(&path)
                .with_context(|| format!("reading certificate {}", path.display()))?;
            (path.display().to_string(), fp)
        },
        (None, Some(host)) => {
            let fp = server_certificate_fingerprint(&host, port)
                .with_context(|| format!("fetching certificate from {host}:{port}"))?;
            (format!("{host}:{port}"), fp)
        },
        (None, None) => bail!("either --file or --host is required"),
    };
    if json {
        println!("{}", serde_json::json!({"source": source, "fingerprint": fingerprint}));
    } else {
        println!("Certificate: {source}");
        println!("  {fingerprint}");
    }
    Ok(())
}

fn show_environment(json: bool) {
    let report = check_environment();
    let indicators = vm_indicators();
    if json {
        let output = serde_json::json!({
            "debugger": report.get("debugger").copied().unwrap_or(false),
            "virtual_machine": report.get("virtual_machine").copied().unwrap_or(false),
            "vm_indicators": indicators,
        });
        println!("{output}");
        return;
    }
    println!("Environment:");
    for (check, hit) in &report {
        let label = if *hit {
            "\x1b[33m[DETECTED]\x1b[0m"
        } else {
            "\x1b[32m[CLEAR]\x1b[0m"
        };
        println!("  {label} {check}");
    }
    println!("  VM indicators: {indicators} (threshold {VM_THRESHOLD})");
}

fn show_cache_status(
    app_key: &str,
    cache_dir: Option<PathBuf>,
    plaintext: bool,
    json: bool,
) -> Result<()> {
    if app_key.trim().is_empty() {
        bail!("--app-key must not be empty");
    }
    let cache_dir = cache_dir.unwrap_or_else(|| LicenseConfig::default().cache_dir);
    let store = CredentialStore::new(&cache_dir, app_key, &machine_fingerprint(), !plaintext);
    let status = store.inspect(&SignatureVerifier::new(None, false, 0));
    if json {
        let output = serde_json::json!({
            "path": store.path().display().to_string(),
            "status": status.to_string(),
        });
        println!("{output}");
    } else {
        println!("Cache: {}", store.path().display());
        println!("  Status: {status}");
    }
    Ok(())
}

fn show_info(json: bool) {
    if json {
        println!("{}", serde_json::json!({"version": VERSION, "target": TARGET}));
        return;
    }
    println!("Warden {VERSION}");
    println!("  Target: {TARGET}");
    println!(
        "  OS / Arch: {} / {}",
        warden_core::fingerprint::os_label(),
        warden_core::fingerprint::arch_label()
    );
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json = cli.format == "json";
    init_logging(cli.verbose, json);

    match cli.command {
        Some(Commands::Fingerprint) => show_fingerprint(json),
        Some(Commands::CertFingerprint { file, host, port }) => {
            show_cert_fingerprint(file, host, port, json)?;
        },
        Some(Commands::Environment) => show_environment(json),
        Some(Commands::CacheStatus {
            app_key,
            cache_dir,
            plaintext,
        }) => show_cache_status(&app_key, cache_dir, plaintext, json)?,
        Some(Commands::Info) | None => show_info(json),
    }
    Ok(())
}
