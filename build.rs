use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    // Copy the linker fragments into OUT_DIR so the linker can find them
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let memory = if env::var_os("CARGO_FEATURE_CM4").is_some() {
        "memory_cm4.x"
    } else {
        "memory.x"
    };
    fs::copy(memory, out_dir.join("memory.x")).unwrap();
    fs::copy("device.x", out_dir.join("device.x")).unwrap();
    for script in ["memory.x", "memory_cm4.x", "device.x"] {
        println!("cargo:rerun-if-changed={script}");
    }
    println!("cargo:rustc-link-search={}", out_dir.display());
    println!("cargo:rerun-if-changed=build.rs");

    // Hard-float targets stack s16-s31 lazily; the context switch has to
    // save them when the outgoing thread used the FPU.
    println!("cargo::rustc-check-cfg=cfg(has_fpu)");
    let target = env::var("TARGET").unwrap_or_default();
    if target.ends_with("-eabihf") {
        println!("cargo:rustc-cfg=has_fpu");
    }
}
