fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::compile_protos("proto/election.proto")?;
    println!("cargo:rerun-if-changed=proto/election.proto");
    Ok(())
}
