//! Build script for warden-core.
//!
//! Exposes the target triple to the `warden info` command.

fn main() {
    println!(
        "cargo:rustc-env=TARGET={}",
        std::env::var("TARGET").unwrap_or_else(|_| "unknown".to_string())
    );

    println!("cargo:rerun-if-env-changed=TARGET");
}
