#[cfg(feature = "generate-header")]
use std::env;
#[cfg(feature = "generate-header")]
use std::path::PathBuf;

const HEADER_NAME: &str = "tunnel_bridge.h";

fn main() {
    println!("cargo:rerun-if-changed=src/abi");
    println!("cargo:rerun-if-changed=src/ffi");
    println!("cargo:rerun-if-changed=include/{HEADER_NAME}");

    #[cfg(feature = "generate-header")]
    generate_header();

    #[cfg(not(feature = "generate-header"))]
    println!(
        "cargo:warning=Skipping {HEADER_NAME} regeneration (enable the `generate-header` feature to refresh it)."
    );
}

#[cfg(feature = "generate-header")]
fn generate_header() {
    use std::fs;

    let crate_dir =
        PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR missing"));
    let include_dir = crate_dir.join("include");
    let output = include_dir.join(HEADER_NAME);

    if let Err(error) = fs::create_dir_all(&include_dir) {
        panic!("failed to create include/ directory: {error}");
    }

    match cbindgen::generate(&crate_dir) {
        Ok(generator) => {
            if generator.write_to_file(&output) {
                println!("cargo:warning=Updated {}", output.display());
            } else {
                println!("cargo:warning={HEADER_NAME} unchanged");
            }
        }
        Err(error) => panic!("cbindgen failed: {error}"),
    }
}
