use crate::helpers::*;
use crate::tracing;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;
use windows::{
    core::*, Win32::Foundation::*, Win32::Security::Authorization::*, Win32::Security::*,
    Win32::Storage::FileSystem::*, Win32::System::Pipes::*,
};

// Deny network logons outright, SYSTEM gets everything, and local users can
// read and write but not create pipe instances of their own (0x12018b is
// FILE_GENERIC_READ | FILE_GENERIC_WRITE without FILE_CREATE_PIPE_INSTANCE).
const PIPE_SDDL: &str = "D:(D;;GA;;;NU)(A;;GA;;;SY)(A;;0x12018b;;;S-1-2-0)";

const STOP_CONNECT_ATTEMPTS: u32 = 50;

/// How long a stopping server waits for messages that are still being
/// handled.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// One connected client, as seen by the request handler.
pub trait Connection {
    /// Unique for the lifetime of the server.
    fn id(&self) -> u64;
    fn send(&self, bytes: &[u8]) -> Result<()>;
    /// Process id of the client on the other end.
    fn query_peer_process_id(&self) -> Result<u32>;
    fn is_connected(&self) -> bool;
}

pub struct PipeConnection {
    id: u64,
    pipe: Owned<HANDLE>,
}

impl PipeConnection {
    /// Reads the next message. `Ok(None)` once the client hung up.
    fn read_message(&self, max_message_size: u32) -> Result<Option<Vec<u8>>> {
        read_pipe_message(*self.pipe, max_message_size)
    }
}

impl Connection for PipeConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, bytes: &[u8]) -> Result<()> {
        write_pipe_message(*self.pipe, bytes)
    }

    fn query_peer_process_id(&self) -> Result<u32> {
        let mut process_id = 0u32;
        unsafe { GetNamedPipeClientProcessId(*self.pipe, &mut process_id)? };
        Ok(process_id)
    }

    fn is_connected(&self) -> bool {
        // Peeking at a pipe whose other end is gone fails with ERROR_BROKEN_PIPE.
        unsafe { PeekNamedPipe(*self.pipe, None, 0, None, None, None).is_ok() }
    }
}

impl Drop for PipeConnection {
    fn drop(&mut self) {
        unsafe {
            _ = DisconnectNamedPipe(*self.pipe);
        }
    }
}

fn read_pipe_message(pipe: HANDLE, max_message_size: u32) -> Result<Option<Vec<u8>>> {
    let mut buffer = vec![0u8; max_message_size as usize];
    let mut bytes_read = 0u32;
    match unsafe { ReadFile(pipe, Some(&mut buffer), Some(&mut bytes_read), None) } {
        Ok(()) => {
            buffer.truncate(bytes_read as usize);
            Ok(Some(buffer))
        }
        Err(err) if err.code() == ERROR_BROKEN_PIPE.to_hresult() => Ok(None),
        // ERROR_MORE_DATA: the message doesn't fit. We don't read the rest.
        Err(err) => Err(err),
    }
}

fn write_pipe_message(pipe: HANDLE, bytes: &[u8]) -> Result<()> {
    let mut bytes_written = 0u32;
    unsafe { WriteFile(pipe, Some(bytes), Some(&mut bytes_written), None)? };
    if bytes_written as usize != bytes.len() {
        return Err(ERROR_WRITE_FAULT.into());
    }
    Ok(())
}

/// Number of messages being handled right now.
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        InFlightGuard(self.clone())
    }

    /// Returns false if messages were still being handled after `timeout`.
    fn wait_idle(&self, timeout: Duration) -> bool {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, _) = self
            .idle
            .wait_timeout_while(count, timeout, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *count == 0
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// Asks a running `PipeServer` to stop.
#[derive(Clone)]
pub struct StopHandle {
    stopping: Arc<AtomicBool>,
    pipe_path: String,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        // The accept loop is blocked in ConnectNamedPipe. Connecting to it
        // ourselves is the simplest way to get it to look at the flag. Right
        // after it accepted someone else there may be no instance to connect
        // to for a moment.
        for _ in 0..STOP_CONNECT_ATTEMPTS {
            if ClientPipe::open(&self.pipe_path).is_ok() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Listens on `\\.\pipe\<name>` and hands every message it receives to a
/// callback. Each client gets its own thread; messages from a single client
/// are handled one after another. Once stopped, messages that are already
/// being handled get to finish; anything read after that is dropped.
pub struct PipeServer {
    pipe_path: String,
    max_message_size: u32,
    stopping: Arc<AtomicBool>,
    in_flight: Arc<InFlight>,
}

impl PipeServer {
    pub fn new(config: &ServiceConfig) -> Self {
        PipeServer {
            pipe_path: pipe_path(&config.pipe_name),
            max_message_size: config.max_message_size,
            stopping: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::default(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stopping: self.stopping.clone(),
            pipe_path: self.pipe_path.clone(),
        }
    }

    fn create_instance(
        &self,
        security_descriptor: &OwnedLocalAlloc<PSECURITY_DESCRIPTOR>,
        first_instance: bool,
    ) -> Result<Owned<HANDLE>> {
        let security_attributes = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: security_descriptor.0 .0,
            bInheritHandle: false.into(),
        };
        // If anybody else already created a pipe with our name, we want to
        // fail instead of quietly becoming its second instance.
        let open_mode = if first_instance {
            PIPE_ACCESS_DUPLEX | FILE_FLAG_FIRST_PIPE_INSTANCE
        } else {
            PIPE_ACCESS_DUPLEX
        };

        unsafe {
            let pipe = CreateNamedPipeW(
                &HSTRING::from(self.pipe_path.as_str()),
                open_mode,
                PIPE_TYPE_MESSAGE | PIPE_READMODE_MESSAGE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
                PIPE_UNLIMITED_INSTANCES,
                self.max_message_size,
                self.max_message_size,
                0,
                Some(&security_attributes),
            );
            // Unlike most of its friends, this one reports failure with an
            // invalid handle instead of an Err.
            if pipe.is_invalid() {
                return Err(Error::from_win32());
            }
            Ok(Owned::new(pipe))
        }
    }

    /// Runs the accept loop until `StopHandle::stop` is called, then waits
    /// up to `DRAIN_TIMEOUT` for messages that are still being handled.
    ///
    /// Only fails if we can't create the pipe. Trouble with an individual
    /// client ends that client's connection and nothing else.
    pub fn run<F>(&self, on_message: F) -> Result<()>
    where
        F: Fn(&PipeConnection, &[u8]) + Send + Sync + 'static,
    {
        let on_message = Arc::new(on_message);

        let mut security_descriptor = OwnedLocalAlloc::<PSECURITY_DESCRIPTOR>::default();
        unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                &HSTRING::from(PIPE_SDDL),
                SDDL_REVISION_1,
                &mut *security_descriptor,
                None,
            )?;
        }

        let mut next_id = 0u64;
        loop {
            let pipe = self.create_instance(&security_descriptor, next_id == 0)?;

            if let Err(err) = unsafe { ConnectNamedPipe(*pipe, None) } {
                // The client beat us to it. That's still a connection.
                if err.code() != ERROR_PIPE_CONNECTED.to_hresult() {
                    tracing::trace_native_failure("ConnectNamedPipe", &err);
                    continue;
                }
            }

            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            next_id += 1;
            let connection = PipeConnection { id: next_id, pipe };
            let on_message = on_message.clone();
            let max_message_size = self.max_message_size;
            let stopping = self.stopping.clone();
            let in_flight = self.in_flight.clone();
            std::thread::spawn(move || {
                serve(connection, max_message_size, &stopping, &in_flight, &*on_message)
            });
        }

        if !self.in_flight.wait_idle(DRAIN_TIMEOUT) {
            tracing::trace_log_message("pipe server stopped with requests still in flight");
        }
        tracing::trace_log_message("pipe server stopped");
        Ok(())
    }
}

fn serve<F>(
    connection: PipeConnection,
    max_message_size: u32,
    stopping: &AtomicBool,
    in_flight: &Arc<InFlight>,
    on_message: &F,
) where
    F: Fn(&PipeConnection, &[u8]),
{
    loop {
        match connection.read_message(max_message_size) {
            Ok(Some(bytes)) => {
                // Entered before looking at the flag, so a stopping server
                // either waits for this message or we see that it's stopping.
                let _busy = in_flight.enter();
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                on_message(&connection, &bytes)
            }
            Ok(None) => break,
            Err(err) => {
                tracing::trace_native_failure("ReadFile", &err);
                break;
            }
        }
    }
}

/// The client end of the service's pipe.
pub struct ClientPipe {
    pipe: Owned<HANDLE>,
}

impl ClientPipe {
    /// Connects to an existing pipe instance. Fails with `ERROR_PIPE_BUSY`
    /// while all instances are taken, and `ERROR_FILE_NOT_FOUND` if nobody is
    /// listening at all.
    pub fn open(pipe_path: &str) -> Result<Self> {
        unsafe {
            let pipe = Owned::new(CreateFileW(
                &HSTRING::from(pipe_path),
                (GENERIC_READ | GENERIC_WRITE).0,
                FILE_SHARE_NONE,
                None,
                OPEN_EXISTING,
                FILE_FLAGS_AND_ATTRIBUTES(0),
                HANDLE::default(),
            )?);

            let mode = PIPE_READMODE_MESSAGE;
            SetNamedPipeHandleState(*pipe, Some(&mode), None, None)?;

            Ok(ClientPipe { pipe })
        }
    }

    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        write_pipe_message(*self.pipe, bytes)
    }

    /// Blocks until the server answers.
    pub fn receive(&self, max_message_size: u32) -> Result<Vec<u8>> {
        read_pipe_message(*self.pipe, max_message_size)?.ok_or_else(|| ERROR_BROKEN_PIPE.into())
    }
}
