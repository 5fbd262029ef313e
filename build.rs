//! Build script for offload-gateway.
//!
//! With the `cuda` feature, compiles `kernels/vector_add.cu` to PTX with
//! `nvcc` and exports the artifact path as `OFFLOAD_KERNEL_PTX`, which
//! becomes the default `kernel.module_path`. Without `nvcc` the build still
//! succeeds and the module path must be configured explicitly.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=kernels/vector_add.cu");

    #[cfg(feature = "cuda")]
    compile_kernel();
}

#[cfg(feature = "cuda")]
fn compile_kernel() {
    use std::path::PathBuf;
    use std::process::Command;

    let out_dir = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR is set by cargo"));
    let ptx = out_dir.join("vector_add.ptx");
    let nvcc = std::env::var("NVCC").unwrap_or_else(|_| "nvcc".to_string());

    let status = Command::new(&nvcc)
        .args(["-ptx", "-O3", "kernels/vector_add.cu", "-o"])
        .arg(&ptx)
        .status();

    match status {
        Ok(s) if s.success() => {
            println!("cargo:rustc-env=OFFLOAD_KERNEL_PTX={}", ptx.display());
        }
        Ok(s) => {
            println!("cargo:warning=nvcc exited with {s}; set kernel.module_path to a prebuilt PTX");
        }
        Err(e) => {
            println!("cargo:warning=nvcc not found ({e}); set kernel.module_path to a prebuilt PTX");
        }
    }
}
