use embed_manifest::manifest::ExecutionLevel;
use embed_manifest::{embed_manifest, new_manifest};
use std::{env, io};
use winres::WindowsResource;

fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed=build.rs");

    if env::var_os("CARGO_CFG_WINDOWS").is_some() {
        // The service runs as LocalSystem. The client must never ask for
        // elevation just to talk to it; installing does that check itself.
        embed_manifest(
            new_manifest("CreateProcessAsUser").requested_execution_level(ExecutionLevel::AsInvoker),
        )
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

        // No resource script of our own. winres still generates the file
        // version info from the package metadata.
        WindowsResource::new()
            .set("FileDescription", "CreateProcessAsUser service and client")
            .set("ProductName", "CreateProcessAsUser")
            .compile()?;
    }
    Ok(())
}
