fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    // 编译 xbox 协议（AgentService + ControllerService）
    // 管理 API 会把部分消息直接序列化成 JSON，统一挂上 serde derive
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .compile_protos(&["proto/xbox.proto"], &["proto"])?;
    Ok(())
}
