//! Generates the event stream types and tonic service from `proto/`.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Builds without a system protoc fall back to the vendored binary.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    println!("cargo:rerun-if-changed=proto/function_rpc.proto");
    tonic_build::compile_protos("proto/function_rpc.proto")?;
    Ok(())
}
