/// Builds the gRPC client and server code for the `pdfrelay.proto` definition
/// using `tonic-prost-build`.
///
/// This code generation step processes the Protocol Buffer definitions located
/// in the `proto` directory and emits Rust modules with gRPC bindings into the
/// crate's `OUT_DIR`, together with an encoded file descriptor set used by the
/// reflection service.
///
/// # Byte Field Optimization
///
/// `Chunk.content` and `TextAndStatus.text` are marked with `.bytes(...)` so
/// they decode as `Bytes` instead of `Vec<u8>`. File fragments are forwarded
/// between tiers and written to disk without an intermediate copy.
///
/// # Output
///
/// ```rust
/// pub mod proto {
///     tonic::include_proto!("pdfrelay");
/// }
/// ```
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("pdfrelay_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();

    config
        .bytes([".pdfrelay.Chunk.content", ".pdfrelay.TextAndStatus.text"])
        .file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/pdfrelay.proto"], &["proto"])
        .unwrap();
}
