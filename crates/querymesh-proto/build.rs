use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    if env::var("PROTOC").is_err() {
        env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let config = tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir(&out_dir);

    config.compile_protos(&["proto/store.proto"], &["proto"])?;

    // Tell cargo to rerun this build script if the proto files change
    println!("cargo:rerun-if-changed=proto/store.proto");

    Ok(())
}
