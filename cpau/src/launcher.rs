use crate::messages::ResultCode;
use crate::native::{LaunchSpec, LaunchedProcess, NativeApi};
use crate::request_handler::{native_failure, Abort};
use crate::tracing;

/// Needed to hand a token other than our own to `CreateProcessAsUserW`.
pub const ASSIGN_PRIMARY_TOKEN_PRIVILEGE: &str = "SeAssignPrimaryTokenPrivilege";

/// Builds the environment block for `token` and makes sure we are allowed to
/// assign it as a primary token.
pub fn prepare<A: NativeApi>(api: &A, token: &A::Handle) -> Result<A::Environment, Abort> {
    let environment = api
        .create_environment(token)
        .map_err(native_failure("CreateEnvironmentBlock", ResultCode::FailedToGetEnvironment))?;

    let enabled = api.enable_privilege(ASSIGN_PRIMARY_TOKEN_PRIVILEGE);
    tracing::trace_privilege_adjusted(ASSIGN_PRIMARY_TOKEN_PRIVILEGE, enabled.is_ok());
    enabled.map_err(native_failure(
        "AdjustTokenPrivileges",
        ResultCode::InsufficientPermissions,
    ))?;

    Ok(environment)
}

/// Starts the process on the interactive desktop and returns its id.
///
/// We don't keep track of the process once it's running: its process and
/// thread handles are closed before this returns.
pub fn start<A: NativeApi>(
    api: &A,
    token: &A::Handle,
    environment: &A::Environment,
    spec: &LaunchSpec,
) -> Result<u32, Abort> {
    let LaunchedProcess {
        process,
        thread,
        process_id,
    } = api
        .create_process(token, environment, spec)
        .map_err(native_failure("CreateProcessAsUserW", ResultCode::FailedToCreateProcess))?;
    drop(thread);
    drop(process);
    Ok(process_id)
}
