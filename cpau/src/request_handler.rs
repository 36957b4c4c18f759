use crate::identity;
use crate::launcher;
use crate::messages::*;
use crate::native::{LaunchSpec, NativeApi};
use crate::tracing;
use crate::transport::Connection;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use windows::core::Error;

/// Why a request stopped before it created a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abort {
    /// Answer the caller with this code.
    Fail(ResultCode),
    /// The caller is gone. Nobody is listening for a response, so don't send
    /// one.
    Silent(&'static str),
}

/// Builds a `map_err` adapter that logs a failed native call and turns it
/// into `Abort::Fail(code)`.
pub fn native_failure(operation: &'static str, code: ResultCode) -> impl FnOnce(Error) -> Abort {
    move |err| {
        tracing::trace_native_failure(operation, &err);
        Abort::Fail(code)
    }
}

/// A request that passed validation. Paths are final, blanks resolved to
/// their defaults.
#[derive(Debug, PartialEq, Eq)]
struct ValidatedRequest {
    authentication_mode: AuthenticationMode,
    credentials: Credentials,
    executable_path: PathBuf,
    arguments: Option<String>,
    working_directory: PathBuf,
}

impl ValidatedRequest {
    fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            executable_path: &self.executable_path,
            arguments: self.arguments.as_deref(),
            working_directory: &self.working_directory,
        }
    }
}

fn validate(parameters: Parameters) -> Result<ValidatedRequest, Abort> {
    let Parameters {
        authentication_mode,
        credentials,
        process_information,
        elevated: _,
    } = parameters;

    let executable_path = PathBuf::from(process_information.executable_path.trim());
    if executable_path.as_os_str().is_empty() || !executable_path.is_file() {
        return Err(Abort::Fail(ResultCode::InvalidProcessInformation));
    }

    let arguments = Some(process_information.arguments).filter(|a| !a.trim().is_empty());

    let working_directory = match process_information.working_directory.trim() {
        "" => executable_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or(Abort::Fail(ResultCode::InvalidProcessInformation))?,
        dir => PathBuf::from(dir),
    };

    Ok(ValidatedRequest {
        authentication_mode,
        credentials,
        executable_path,
        arguments,
        working_directory,
    })
}

fn process_request<A: NativeApi, C: Connection>(
    api: &A,
    connection: &C,
    bytes: &[u8],
) -> Result<u32, Abort> {
    let parameters = Message::decode(bytes)
        .inspect_err(|err| tracing::trace_native_failure("decode request", err))
        .ok()
        .and_then(|message| message.parameters)
        .ok_or(Abort::Fail(ResultCode::Unknown))?;

    tracing::trace_request_received(connection.id(), parameters.authentication_mode.into());

    // Nothing privileged happens before the request is known to be sane.
    let request = validate(parameters)?;

    let token = identity::resolve(
        api,
        request.authentication_mode,
        &request.credentials,
        || connection.query_peer_process_id(),
    )?;

    let environment = launcher::prepare(api, &token)?;

    // Don't start anything on behalf of someone who already hung up.
    if !connection.is_connected() {
        return Err(Abort::Silent("client disconnected before process creation"));
    }

    launcher::start(api, &token, &environment, &request.launch_spec())
}

/// Handles one request message from `connection` and sends exactly one
/// response, unless the caller went away in the meantime.
///
/// Every native resource acquired on the way lives in a local of
/// `process_request`, so all of them are released by the time this returns,
/// including when a panic unwinds through it.
pub fn handle_message<A: NativeApi, C: Connection>(api: &A, connection: &C, bytes: &[u8]) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        process_request(api, connection, bytes)
    }))
    .unwrap_or_else(|_| {
        tracing::trace_log_message("request handler panicked");
        Err(Abort::Fail(ResultCode::Unknown))
    });

    let result = match outcome {
        Ok(process_id) => ProcessResult::created(process_id),
        Err(Abort::Fail(code)) => ProcessResult::failed(code),
        Err(Abort::Silent(reason)) => {
            tracing::trace_request_dropped(connection.id(), reason);
            return;
        }
    };

    tracing::trace_request_completed(connection.id(), result.result.into(), result.process_id);

    // A client that disconnected after we did the work isn't an error for us.
    if let Err(err) = Message::response(result)
        .encode()
        .and_then(|bytes| connection.send(&bytes))
    {
        tracing::trace_native_failure("send response", &err);
    }
}
