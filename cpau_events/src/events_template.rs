use win_etw_macros::trace_logging_provider;
// Note: Generate GUID using TlgGuid.exe tool
#[trace_logging_provider(
    name = "CreateProcessAsUser.Service",
    guid = "5d3c4f1e-9a2b-5c07-8e61-b4a9d2f07c35",
    provider_group_guid = "ffffffff-ffff-ffff-ffff-ffffffffffff"
)]
// tl:{5d3c4f1e-9a2b-5c07-8e61-b4a9d2f07c35}

pub trait CpauEvents {
    fn message(message: &str);

    // mode is the raw wire value of the authentication mode (0 = inherit,
    // 1 = credentials).
    fn request_received(connection_id: u64, mode: i32);

    // result_code is the wire value of the result. process_id is -1 unless
    // result_code is 0 (created process).
    fn request_completed(connection_id: u64, result_code: i32, process_id: i32);

    fn request_dropped(connection_id: u64, reason: &str);

    fn native_call_failed(operation: &str, hresult: i32);

    fn privilege_adjusted(privilege: &str, succeeded: bool);

    fn install_account_checked(account: &str, access_mask: u32, trusted: bool);

    // Someone installed the service with `--unsafe`. We want this to stand
    // out, so it gets its own event.
    #[event(level = "warn")]
    fn install_check_bypassed(install_dir: &str);
}
