//! Build script for proto compilation.
//!
//! Compiles `proto/provider.proto` into `OUT_DIR`; `src/lib.rs` pulls the
//! result in with `tonic::include_proto!`. A vendored `protoc` is used unless
//! `PROTOC` is already set in the environment.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path().map_err(|e| e.to_string())?;
        std::env::set_var("PROTOC", protoc);
    }

    tonic_prost_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&["proto/provider.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/provider.proto");

    Ok(())
}
