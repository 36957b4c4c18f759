use std::{io, path::Path};

// * As a part of the build process, we may need to replace the placeholder
//   provider group GUID in our tracing lib with a real one.
// * This build script will take the value out of the env var
//   CPAU_TRACING_GROUP_GUID, and replace the placeholder GUID in
//   events_template.rs with it.
// * We write that file out to %OUT_DIR%/mangled_events.rs, and lib.rs
//   includes _that mangled file_.
fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed=src/events_template.rs");
    println!("cargo:rerun-if-env-changed=CPAU_TRACING_GROUP_GUID");

    let input = std::fs::read_to_string("src/events_template.rs")?;
    let output = match std::env::var("CPAU_TRACING_GROUP_GUID") {
        Ok(guid) => {
            println!("CPAU_TRACING_GROUP_GUID: {}", guid);
            input.replace("ffffffff-ffff-ffff-ffff-ffffffffffff", &guid)
        }
        Err(_) => input,
    };
    let out_dir = std::env::var("OUT_DIR").map_err(io::Error::other)?;
    let path = Path::new(&out_dir).join("mangled_events.rs");
    std::fs::write(path.as_path(), output)
}
