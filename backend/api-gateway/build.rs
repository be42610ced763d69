fn main() -> Result<(), Box<dyn std::error::Error>> {
    // api-gateway PROVIDES VideoStreamService and ClientInfoService.
    // The client half is generated for integration tests.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    println!("cargo:rerun-if-changed=../proto/services/video_stream_service.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .type_attribute(".", "#[serde(default)]")
        .field_attribute(
            ".gateway.video.v1.VideoFrame.frame_data",
            "#[serde(with = \"crate::proto::base64_bytes\")]",
        )
        .field_attribute(
            ".gateway.video.v1.VideoChunk.data",
            "#[serde(with = \"crate::proto::base64_bytes\")]",
        )
        .compile_protos(
            &["../proto/services/video_stream_service.proto"],
            &["../proto/services/"],
        )?;

    Ok(())
}
