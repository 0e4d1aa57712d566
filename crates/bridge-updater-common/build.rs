//! ---
//! bridge_section: "01-common"
//! bridge_subsection: "build"
//! bridge_type: "source"
//! bridge_scope: "code"
//! bridge_description: "Build metadata emission for version reporting."
//! bridge_version: "v0.1.0"
//! bridge_owner: "tbd"
//! ---
use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Outside a git checkout the git values fall back to vergen placeholders.
    EmitBuilder::builder().all_build().all_cargo().all_git().emit()?;

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
