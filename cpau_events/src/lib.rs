//! TraceLogging provider for the CreateProcessAsUser service.
//!
//! The provider trait lives in `events_template.rs`. `build.rs` stamps the
//! real provider group GUID into it and we include the result here.

include!(concat!(env!("OUT_DIR"), "/mangled_events.rs"));
