use crate::helpers::pipe_path;
use crate::messages::*;
use crate::transport::ClientPipe;
use std::sync::mpsc;
use std::time::Duration;
use windows::{core::*, Win32::Foundation::*};

// A response is a small JSON object carrying two integers. This is plenty.
const RESPONSE_BUFFER_SIZE: u32 = 1024;

const CONNECT_RETRIES: u32 = 10;

/// How long to wait before retry number `tries` (counting from 1).
fn retry_delay(tries: u32) -> Duration {
    Duration::from_millis(100 * u64::from(tries))
}

fn connect(pipe_path: &str) -> Result<ClientPipe> {
    // Attempt to connect to the service's pipe, with a backoff: up to 10
    // retries, each waiting 100ms longer than the last (5.5 seconds in all).
    // ERROR_FILE_NOT_FOUND: the service isn't listening (yet).
    // ERROR_PIPE_BUSY: it's between accepting a client and creating the next
    // instance.
    let mut tries = 0;
    loop {
        match ClientPipe::open(pipe_path) {
            Ok(pipe) => return Ok(pipe),
            Err(err)
                if err.code() == ERROR_FILE_NOT_FOUND.to_hresult()
                    || err.code() == ERROR_PIPE_BUSY.to_hresult() =>
            {
                if tries >= CONNECT_RETRIES {
                    return Err(ERROR_TIMEOUT.into());
                }
                tries += 1;
                std::thread::sleep(retry_delay(tries))
            }
            Err(err) => return Err(err),
        }
    }
}

fn round_trip(pipe_path: &str, request: &Message) -> Result<ProcessResult> {
    let request = request.encode()?;
    let pipe = connect(pipe_path)?;
    pipe.send(&request)?;
    let response = Message::decode(&pipe.receive(RESPONSE_BUFFER_SIZE)?)?;
    Ok(response.result.unwrap_or_default())
}

fn result_for_error(err: &Error) -> ProcessResult {
    if err.code() == ERROR_TIMEOUT.to_hresult() {
        ProcessResult::failed(ResultCode::TimedOut)
    } else {
        ProcessResult::default()
    }
}

/// Asks the service listening on `pipe_name` to start a process.
///
/// Gives up with `TIMED_OUT` after `timeout` (`None` waits as long as it
/// takes). Giving up doesn't cancel anything on the service's end: a process
/// may still get started, we just won't hear about it.
pub fn create_process_as_user(
    pipe_name: &str,
    parameters: Parameters,
    timeout: Option<Duration>,
) -> ProcessResult {
    let pipe_path = pipe_path(pipe_name);
    let request = Message::request(parameters);

    let (sender, receiver) = mpsc::channel();
    std::thread::spawn(move || {
        // Nobody may be waiting for this anymore. That's fine.
        _ = sender.send(round_trip(&pipe_path, &request));
    });

    let outcome = match timeout {
        Some(timeout) => receiver.recv_timeout(timeout).map_err(|_| ()),
        None => receiver.recv().map_err(|_| ()),
    };
    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => result_for_error(&err),
        Err(()) => ProcessResult::failed(ResultCode::TimedOut),
    }
}
