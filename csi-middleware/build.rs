fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile CSI proto (client and server stubs, both sides are wrapped)
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["../proto/csi.proto"], &["../proto"])?;

    Ok(())
}
