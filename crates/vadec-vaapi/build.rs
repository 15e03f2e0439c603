#![allow(missing_docs)]
//! Build script: locate libva and libva-drm.
//!
//! Search order:
//!   1. LIBVA_DIR (directory containing libva.so and libva-drm.so)
//!   2. Standard multiarch and lib64 directories
//!
//! When neither yields both libraries the crate builds in stub mode
//! (`cfg(vadec_vaapi_stub)`), which keeps `MemoryDriver` usable on hosts
//! without a VA-API stack.

use std::env;
use std::path::{Path, PathBuf};

const LIBRARIES: [&str; 2] = ["libva.so", "libva-drm.so"];

fn has_libraries(dir: &Path) -> bool {
    LIBRARIES.iter().all(|lib| dir.join(lib).exists())
}

fn resolve_libva_dir() -> Option<PathBuf> {
    if let Ok(dir) = env::var("LIBVA_DIR") {
        let dir = PathBuf::from(dir);
        if has_libraries(&dir) {
            return Some(dir);
        }
        println!(
            "cargo:warning=LIBVA_DIR={} does not contain libva.so and libva-drm.so",
            dir.display()
        );
    }

    let mut candidates = vec![
        PathBuf::from("/usr/lib/x86_64-linux-gnu"),
        PathBuf::from("/usr/lib/aarch64-linux-gnu"),
        PathBuf::from("/usr/lib64"),
        PathBuf::from("/usr/lib"),
        PathBuf::from("/usr/local/lib"),
    ];
    if let Ok(target) = env::var("TARGET") {
        let multiarch = target.replace("-unknown-", "-");
        candidates.insert(0, PathBuf::from("/usr/lib").join(multiarch));
    }

    candidates.into_iter().find(|dir| has_libraries(dir))
}

fn main() {
    println!("cargo:rustc-check-cfg=cfg(vadec_vaapi_stub)");
    println!("cargo:rerun-if-env-changed=LIBVA_DIR");
    println!("cargo:rerun-if-env-changed=VADEC_VAAPI_FORCE_STUB");
    println!("cargo:rerun-if-changed=build.rs");

    if env::var_os("DOCS_RS").is_some() {
        println!("cargo:warning=DOCS_RS detected; building vadec-vaapi in stub mode");
        println!("cargo:rustc-cfg=vadec_vaapi_stub");
        return;
    }

    if env::var_os("VADEC_VAAPI_FORCE_STUB").is_some() {
        println!("cargo:rustc-cfg=vadec_vaapi_stub");
        return;
    }

    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("linux") {
        println!("cargo:warning=VA-API is Linux-only; building vadec-vaapi in stub mode");
        println!("cargo:rustc-cfg=vadec_vaapi_stub");
        return;
    }

    let Some(libva_dir) = resolve_libva_dir() else {
        println!(
            "cargo:warning=libva not found (LIBVA_DIR unset and no libva.so/libva-drm.so in system lib dirs); building vadec-vaapi in stub mode"
        );
        println!("cargo:rustc-cfg=vadec_vaapi_stub");
        return;
    };

    println!("cargo:rustc-link-search=native={}", libva_dir.display());
    println!("cargo:rustc-link-lib=dylib=va");
    println!("cargo:rustc-link-lib=dylib=va-drm");
}
