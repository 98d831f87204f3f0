//! Stamps the workspace `VERSION` into the `netmon` binary and its probe
//! user agent.

use std::path::PathBuf;

fn main() {
    let manifest_dir = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(error) => panic!("CARGO_MANIFEST_DIR unset: {error}"),
    };
    let version_path = manifest_dir.join("../../VERSION");
    println!("cargo:rerun-if-changed={}", version_path.display());

    let version = match std::fs::read_to_string(&version_path) {
        Ok(raw) => raw.trim().to_string(),
        Err(error) => panic!("cannot read {}: {error}", version_path.display()),
    };
    let numeric_parts = version
        .split('.')
        .filter(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
        .count();
    if numeric_parts != 3 || version.split('.').count() != 3 {
        panic!("VERSION must be MAJOR.MINOR.PATCH, found {version:?}");
    }

    println!("cargo:rustc-env=NETMON_VERSION={version}");
}
