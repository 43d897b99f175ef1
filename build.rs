const VENDORED: &str = "proto/verso.proto";
const UPSTREAM: &str = "../verso-db/proto/verso.proto";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The contract is vendored so the crate builds standalone. During local
    // development the verso-db checkout usually sits next to this one, and a
    // stale vendored copy is worth a warning before it bites at runtime.
    if std::path::Path::new(UPSTREAM).exists() {
        println!("cargo:rerun-if-changed={UPSTREAM}");
        if std::fs::read(VENDORED).unwrap_or_default() != std::fs::read(UPSTREAM).unwrap_or_default() {
            println!("cargo:warning={VENDORED} has drifted from {UPSTREAM}; refresh it with: cp {UPSTREAM} {VENDORED}");
        }
    }

    println!("cargo:rerun-if-changed={VENDORED}");
    tonic_build::compile_protos(VENDORED)?;
    Ok(())
}
