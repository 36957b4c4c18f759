use crate::messages::{AuthenticationMode, Credentials, ResultCode};
use crate::native::{NativeApi, SessionAccount};
use crate::request_handler::{native_failure, Abort};
use crate::tracing;
use windows::core::Result;

/// Produces the primary token the new process will run under.
///
/// `peer_process_id` is only consulted in `Inherit` mode.
pub fn resolve<A: NativeApi>(
    api: &A,
    mode: AuthenticationMode,
    credentials: &Credentials,
    peer_process_id: impl FnOnce() -> Result<u32>,
) -> std::result::Result<A::Handle, Abort> {
    match mode {
        AuthenticationMode::Inherit => resolve_inherited(api, peer_process_id),
        AuthenticationMode::Credentials => resolve_credentials(api, credentials),
    }
}

fn resolve_inherited<A: NativeApi>(
    api: &A,
    peer_process_id: impl FnOnce() -> Result<u32>,
) -> std::result::Result<A::Handle, Abort> {
    let process_id = peer_process_id().map_err(native_failure(
        "GetNamedPipeClientProcessId",
        ResultCode::FailedToGetCallerPid,
    ))?;

    let process = match api.open_process(process_id) {
        Ok(Some(process)) => process,
        Ok(None) => return Err(Abort::Silent("caller process exited")),
        Err(err) => {
            return Err(native_failure("OpenProcess", ResultCode::FailedToGetCallerPid)(err))
        }
    };
    // The pid can outlive the process for as long as someone holds a handle.
    if api
        .has_exited(&process)
        .map_err(native_failure("GetExitCodeProcess", ResultCode::FailedToGetCallerPid))?
    {
        return Err(Abort::Silent("caller process exited"));
    }

    let token = api
        .open_process_token(&process)
        .map_err(native_failure("OpenProcessToken", ResultCode::FailedToGetToken))?;
    api.duplicate_primary(&token)
        .map_err(native_failure("DuplicateTokenEx", ResultCode::FailedToGetToken))
}

fn resolve_credentials<A: NativeApi>(
    api: &A,
    credentials: &Credentials,
) -> std::result::Result<A::Handle, Abort> {
    // The logon token proves the password and tells us who that password
    // belongs to. It can't be attached to the user's desktop, so all we keep
    // of it is the user SID.
    let user_sid = {
        let logon_token = api
            .logon_interactive(credentials)
            .map_err(native_failure("LogonUserW", ResultCode::InvalidCredentials))?;
        api.token_user_sid(&logon_token)
            .map_err(native_failure("GetTokenInformation", ResultCode::FailedToGetToken))?
    };

    let session_token = locate_session(api, credentials, &user_sid)?;
    api.duplicate_primary(&session_token)
        .map_err(native_failure("DuplicateTokenEx", ResultCode::FailedToGetToken))
}

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// Whether the user logged on to a session looks like the account in
/// `credentials`. No domain (or `.`) means a local account, which sessions
/// report under `local_domain`, the computer name.
///
/// Names only narrow down the candidates. Which session actually belongs to
/// the account is decided by its token's SID.
pub fn account_matches(
    account: &SessionAccount,
    credentials: &Credentials,
    local_domain: &str,
) -> bool {
    if account.username.is_empty() || !eq_ignore_case(&account.username, &credentials.username)
    {
        return false;
    }
    let domain = match credentials.domain.as_str() {
        "" | "." => local_domain,
        domain => domain,
    };
    eq_ignore_case(domain, &account.domain)
}

/// Finds the active session of the account in `credentials` and returns its
/// user token. `user_sid` is the SID the account's logon produced. A session
/// only counts if its token carries that same SID.
///
/// A process started under any other session's token would run, but nobody
/// would ever see it, so no match is a failure.
pub fn locate_session<A: NativeApi>(
    api: &A,
    credentials: &Credentials,
    user_sid: &str,
) -> std::result::Result<A::Handle, Abort> {
    let local_domain = api
        .computer_name()
        .map_err(native_failure("GetComputerNameExW", ResultCode::FailedToGetDesktopSessions))?;

    let sessions = api.enumerate_sessions().unwrap_or_else(|err| {
        tracing::trace_native_failure("WTSEnumerateSessionsW", &err);
        Vec::new()
    });

    let candidates: Vec<u32> = if sessions.is_empty() {
        // Only knows about the console, but it's always there.
        api.active_console_session().into_iter().collect()
    } else {
        sessions
            .iter()
            .filter(|session| session.active)
            .map(|session| session.session_id)
            .collect()
    };

    for session_id in candidates {
        match api.query_session_account(session_id) {
            Ok(account) if account_matches(&account, credentials, &local_domain) => {}
            Ok(_) => continue,
            Err(err) => {
                tracing::trace_native_failure("WTSQuerySessionInformationW", &err);
                continue;
            }
        }

        let session_token = api
            .query_session_token(session_id)
            .map_err(native_failure("WTSQueryUserToken", ResultCode::FailedToGetToken))?;
        let session_sid = api
            .token_user_sid(&session_token)
            .map_err(native_failure("GetTokenInformation", ResultCode::FailedToGetToken))?;
        if session_sid == user_sid {
            return Ok(session_token);
        }
        tracing::trace_log_message(&format!(
            "session {session_id} has the right name but belongs to {session_sid}"
        ));
    }

    tracing::trace_log_message(&format!(
        "no active session for {}",
        credentials.account_name()
    ));
    Err(Abort::Fail(ResultCode::FailedToGetDesktopSessions))
}
