use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=EDGERUN_KERNEL_DIR");

    // The FFI-backed backend is opt-in; the default build carries only the
    // trait surface and the scripted mock backend.
    if env::var_os("CARGO_FEATURE_NATIVE_KERNEL").is_none() {
        return;
    }

    let kernel_dir = env::var("EDGERUN_KERNEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            panic!(
                "EDGERUN_KERNEL_DIR is not set. The `native-kernel` feature links a prebuilt \
edge kernel; point EDGERUN_KERNEL_DIR at a directory containing libedgekernel."
            )
        });

    let lib_dir = if kernel_dir.join("lib").is_dir() {
        kernel_dir.join("lib")
    } else {
        kernel_dir.clone()
    };

    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    println!("cargo:rustc-link-lib=edgekernel");
}
