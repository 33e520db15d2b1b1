fn main() -> Result<(), Box<dyn std::error::Error>> {
    use std::env;
    use std::path::PathBuf;

    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    // Descriptor set feeds the reflection service
    tonic_prost_build::configure()
        .file_descriptor_set_path(out_dir.join("descriptor.bin"))
        .compile_protos(&["proto/gateway/v1/gateway.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto");

    Ok(())
}
