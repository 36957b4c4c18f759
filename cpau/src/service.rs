use crate::helpers::*;
use crate::native::Win32NativeApi;
use crate::request_handler;
use crate::tracing;
use crate::transport::{PipeServer, DRAIN_TIMEOUT};
use std::ffi::OsString;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use windows::{core::*, Win32::Foundation::*, Win32::System::Threading::*};
use windows_service::service::{
    ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceState, ServiceStatus,
    ServiceType,
};
use windows_service::service_control_handler::{
    self, ServiceControlHandlerResult, ServiceStatusHandle,
};
use windows_service::{define_windows_service, service_dispatcher};

define_windows_service!(ffi_service_main, service_main);

/// Hands the main thread over to the service control manager. Only returns
/// once the service has stopped.
pub fn run_dispatcher() -> windows_service::Result<()> {
    service_dispatcher::start(SERVICE_NAME, ffi_service_main)
}

fn service_main(_arguments: Vec<OsString>) {
    tracing::enable_tracing();
    if let Err(err) = run_service() {
        tracing::trace_log_message(&format!("service failed: {err}"));
    }
}

/// Makes sure we're the only instance serving this pipe. The mutex is never
/// released explicitly. It goes away with the process.
fn acquire_singleton(pipe_name: &str) -> Result<Owned<HANDLE>> {
    unsafe {
        let mutex = Owned::new(CreateMutexW(
            None,
            true,
            &HSTRING::from(service_mutex_name(pipe_name)),
        )?);
        if GetLastError() == ERROR_ALREADY_EXISTS {
            return Err(ERROR_ALREADY_EXISTS.into());
        }
        Ok(mutex)
    }
}

fn service_status(current_state: ServiceState, exit_code: ServiceExitCode) -> ServiceStatus {
    let controls_accepted = if current_state == ServiceState::Running {
        ServiceControlAccept::STOP
    } else {
        ServiceControlAccept::empty()
    };
    // Stopping includes letting requests in flight finish.
    let wait_hint = if current_state == ServiceState::StopPending {
        DRAIN_TIMEOUT + Duration::from_secs(5)
    } else {
        Duration::default()
    };
    ServiceStatus {
        service_type: ServiceType::OWN_PROCESS,
        current_state,
        controls_accepted,
        exit_code,
        checkpoint: 0,
        wait_hint,
        process_id: None,
    }
}

fn set_status(
    status_handle: &ServiceStatusHandle,
    current_state: ServiceState,
    exit_code: ServiceExitCode,
) -> windows_service::Result<()> {
    status_handle.set_service_status(service_status(current_state, exit_code))
}

fn run_service() -> windows_service::Result<()> {
    let config = load_config(&RegistryConfigProvider)
        .inspect_err(|err| tracing::trace_native_failure("load configuration", err));

    // A second copy of us must not get anywhere near the pipe.
    let _singleton = match &config {
        Ok(config) => match acquire_singleton(&config.pipe_name) {
            Ok(mutex) => Some(mutex),
            Err(err) => {
                tracing::trace_log_message("another instance of the service is already running");
                std::process::exit(err.code().0);
            }
        },
        Err(_) => None,
    };

    let server = config.as_ref().ok().map(PipeServer::new);
    let stop_handle = server.as_ref().map(PipeServer::stop_handle);

    // The handler has to exist before the status handle does.
    let registered_handle = Arc::new(OnceLock::<ServiceStatusHandle>::new());
    let event_handler = {
        let registered_handle = registered_handle.clone();
        move |control_event: ServiceControl| -> ServiceControlHandlerResult {
            match control_event {
                ServiceControl::Stop => {
                    if let Some(status_handle) = registered_handle.get() {
                        if let Err(err) = set_status(
                            status_handle,
                            ServiceState::StopPending,
                            ServiceExitCode::Win32(0),
                        ) {
                            tracing::trace_log_message(&format!("report stop pending: {err}"));
                        }
                    }
                    if let Some(stop_handle) = &stop_handle {
                        stop_handle.stop();
                    }
                    ServiceControlHandlerResult::NoError
                }
                ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
                _ => ServiceControlHandlerResult::NotImplemented,
            }
        }
    };
    let status_handle = service_control_handler::register(SERVICE_NAME, event_handler)?;
    let _ = registered_handle.set(status_handle);

    let outcome = match server {
        Some(server) => {
            set_status(&status_handle, ServiceState::Running, ServiceExitCode::Win32(0))?;
            tracing::trace_log_message("service running");
            server.run(|connection, bytes| {
                request_handler::handle_message(&Win32NativeApi, connection, bytes)
            })
        }
        None => config.map(|_| ()),
    };

    let exit_code = match outcome {
        Ok(()) => ServiceExitCode::Win32(0),
        Err(err) => {
            tracing::trace_native_failure("run service", &err);
            ServiceExitCode::ServiceSpecific(err.code().0 as u32)
        }
    };
    set_status(&status_handle, ServiceState::Stopped, exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_running_accepts_stop() {
        let running = service_status(ServiceState::Running, ServiceExitCode::Win32(0));
        assert_eq!(running.controls_accepted, ServiceControlAccept::STOP);
        assert_eq!(running.wait_hint, Duration::default());

        let stopped = service_status(ServiceState::Stopped, ServiceExitCode::Win32(0));
        assert!(stopped.controls_accepted.is_empty());
    }

    #[test]
    fn test_stop_pending_covers_the_drain() {
        let stopping = service_status(ServiceState::StopPending, ServiceExitCode::Win32(0));
        assert!(stopping.controls_accepted.is_empty());
        assert!(stopping.wait_hint > DRAIN_TIMEOUT);
    }
}
