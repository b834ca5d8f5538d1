//! Emits the rustc version as a compile-time env var for the `/healthz`
//! and audit-sidecar `runtime_version` field. Stdlib-only — no build-time
//! dependency — since this is the only thing the build needs to capture.

use std::process::Command;

fn main() {
    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=ARCHIVER_RUSTC_VERSION={version}");
    println!("cargo:rerun-if-changed=build.rs");
}
