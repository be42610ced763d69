fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The gateway calls user-service as a client; the server half is only
    // generated so tests can stand up an in-process mock.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    println!("cargo:rerun-if-changed=../../proto/services/user_service.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["../../proto/services/user_service.proto"],
            &["../../proto/services/"],
        )?;

    Ok(())
}
