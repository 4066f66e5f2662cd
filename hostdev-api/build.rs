// Code generation for the kubelet device-plugin protobuf definitions

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/v1beta1.proto"], &["proto"])?;
    Ok(())
}
