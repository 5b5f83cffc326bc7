//! Build script for kestrel-core
//!
//! Checks the toolchain before compilation:
//! - Minimum Rust version (let-else and `Option::is_some_and`, Rust 1.70.0+)
//! - Target architecture: the Windows backend programs x86 debug registers
//!
//! ## Requirements
//!
//! - **Rust**: 1.70.0 or newer
//! - **Windows**: x86 or x86-64 (debug registers DR0-DR7)

use std::env;

fn main()
{
    match rustc_version::version() {
        Ok(found) => {
            let minimum = rustc_version::Version::new(1, 70, 0);
            if found < minimum {
                panic!("kestrel-core requires Rust {minimum} or newer, found {found}");
            }
        }
        // Some build environments hide rustc; do not fail for that
        Err(_) => println!("cargo:warning=could not verify Rust version"),
    }

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if target_os == "windows" && target_arch != "x86_64" && target_arch != "x86" {
        println!("cargo:warning=kestrel-core: debug registers are only supported on x86/x86-64, found {target_arch}");
    }
}
