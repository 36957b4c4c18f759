use cpau_events::CpauEvents;
use windows::core::Error;

// tl:{5d3c4f1e-9a2b-5c07-8e61-b4a9d2f07c35}
static CPAU_EVENTS: std::sync::OnceLock<CpauEvents> = std::sync::OnceLock::new();

pub fn cpau_events() -> &'static CpauEvents {
    CPAU_EVENTS.get_or_init(CpauEvents::new)
}

pub fn enable_tracing() {
    cpau_events();
}

pub fn trace_log_message(message: &str) {
    cpau_events().message(None, message);
}

pub fn trace_request_received(connection_id: u64, mode: i32) {
    cpau_events().request_received(None, connection_id, mode);
}

pub fn trace_request_completed(connection_id: u64, result_code: i32, process_id: i32) {
    cpau_events().request_completed(None, connection_id, result_code, process_id);
}

pub fn trace_request_dropped(connection_id: u64, reason: &str) {
    cpau_events().request_dropped(None, connection_id, reason);
}

/// Log a failed native call, keyed by the name of the operation that failed.
/// Meant to sit inside an `inspect_err` chain.
pub fn trace_native_failure(operation: &str, err: &Error) {
    cpau_events().native_call_failed(None, operation, err.code().0);
}

pub fn trace_privilege_adjusted(privilege: &str, succeeded: bool) {
    cpau_events().privilege_adjusted(None, privilege, succeeded);
}

pub fn trace_install_account_checked(account: &str, access_mask: u32, trusted: bool) {
    cpau_events().install_account_checked(None, account, access_mask, trusted);
}

pub fn trace_install_check_bypassed(install_dir: &str) {
    cpau_events().install_check_bypassed(None, install_dir);
}
