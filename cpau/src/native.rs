use crate::helpers::*;
use crate::messages::Credentials;
use std::ffi::c_void;
use std::path::Path;
use windows::{
    core::*, Win32::Foundation::*, Win32::Security::*, Win32::System::Environment::*,
    Win32::System::RemoteDesktop::*, Win32::System::SystemInformation::*,
    Win32::System::Threading::*,
    Win32::UI::WindowsAndMessaging::*,
};

/// The window station and desktop that launched processes are placed on.
pub const INTERACTIVE_DESKTOP: &str = "winsta0\\default";

/// One entry of the host's session list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: u32,
    /// Connect state is `WTSActive`.
    pub active: bool,
}

/// The user logged on to a session, as reported by the session manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionAccount {
    pub domain: String,
    pub username: String,
}

impl std::fmt::Display for SessionAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\\{}", self.domain, self.username)
    }
}

pub struct LaunchSpec<'a> {
    pub executable_path: &'a Path,
    /// Arguments only, without the program name. `None` passes no command
    /// line at all.
    pub arguments: Option<&'a str>,
    pub working_directory: &'a Path,
}

pub struct LaunchedProcess<H> {
    pub process: H,
    pub thread: H,
    pub process_id: u32,
}

/// Typed access to the token, session and process primitives the request
/// handler is built from.
///
/// Every `Handle` and `Environment` handed out is owned by the caller and is
/// released exactly once when dropped.
pub trait NativeApi {
    type Handle;
    type Environment;

    /// Opens a process for querying. `Ok(None)` means there's no process
    /// with that id (anymore).
    fn open_process(&self, process_id: u32) -> Result<Option<Self::Handle>>;
    fn has_exited(&self, process: &Self::Handle) -> Result<bool>;
    fn open_process_token(&self, process: &Self::Handle) -> Result<Self::Handle>;
    /// Duplicates a token into a primary token at impersonation level.
    fn duplicate_primary(&self, token: &Self::Handle) -> Result<Self::Handle>;
    fn logon_interactive(&self, credentials: &Credentials) -> Result<Self::Handle>;
    /// The SID of the user a token belongs to, in `S-1-5-...` form.
    fn token_user_sid(&self, token: &Self::Handle) -> Result<String>;
    /// NetBIOS name of this machine. Local accounts' sessions report it as
    /// their domain.
    fn computer_name(&self) -> Result<String>;

    fn enumerate_sessions(&self) -> Result<Vec<SessionInfo>>;
    fn active_console_session(&self) -> Option<u32>;
    fn query_session_account(&self, session_id: u32) -> Result<SessionAccount>;
    fn query_session_token(&self, session_id: u32) -> Result<Self::Handle>;

    fn create_environment(&self, token: &Self::Handle) -> Result<Self::Environment>;
    /// Enables a privilege on the token of the current process. Not holding
    /// the privilege at all is an error too.
    fn enable_privilege(&self, privilege: &str) -> Result<()>;
    fn create_process(
        &self,
        token: &Self::Handle,
        environment: &Self::Environment,
        spec: &LaunchSpec,
    ) -> Result<LaunchedProcess<Self::Handle>>;
}

/// An environment block from `CreateEnvironmentBlock`.
pub struct OwnedEnvironmentBlock(*mut c_void);

impl Drop for OwnedEnvironmentBlock {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe {
                _ = DestroyEnvironmentBlock(self.0);
            }
        }
    }
}

// Anything the WTS* functions allocate for us has to go back through
// WTSFreeMemory.
struct WtsMemory<T>(*mut T);

impl<T> Default for WtsMemory<T> {
    fn default() -> Self {
        WtsMemory(std::ptr::null_mut())
    }
}

impl<T> Drop for WtsMemory<T> {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { WTSFreeMemory(self.0 as *mut c_void) };
        }
    }
}

#[derive(Default, Clone, Copy)]
pub struct Win32NativeApi;

impl Win32NativeApi {
    fn query_session_string(&self, session_id: u32, info_class: WTS_INFO_CLASS) -> Result<String> {
        unsafe {
            let mut buffer = WtsMemory::<u16>::default();
            let mut bytes_returned = 0u32;
            let mut pwstr = PWSTR::null();
            WTSQuerySessionInformationW(
                WTS_CURRENT_SERVER_HANDLE,
                session_id,
                info_class,
                &mut pwstr,
                &mut bytes_returned,
            )?;
            buffer.0 = pwstr.0;
            if buffer.0.is_null() {
                return Ok(String::new());
            }
            Ok(pwstr.to_hstring()?.to_string_lossy())
        }
    }
}

impl NativeApi for Win32NativeApi {
    type Handle = Owned<HANDLE>;
    type Environment = OwnedEnvironmentBlock;

    fn open_process(&self, process_id: u32) -> Result<Option<Self::Handle>> {
        match unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, process_id) } {
            Ok(handle) => Ok(Some(unsafe { Owned::new(handle) })),
            // This is what OpenProcess says about a pid that doesn't exist.
            Err(err) if err.code() == ERROR_INVALID_PARAMETER.to_hresult() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn has_exited(&self, process: &Self::Handle) -> Result<bool> {
        let mut exit_code = 0u32;
        unsafe { GetExitCodeProcess(**process, &mut exit_code)? };
        Ok(exit_code != STILL_ACTIVE.0 as u32)
    }

    fn open_process_token(&self, process: &Self::Handle) -> Result<Self::Handle> {
        let mut token = Owned::default();
        unsafe {
            OpenProcessToken(
                **process,
                TOKEN_QUERY | TOKEN_DUPLICATE | TOKEN_IMPERSONATE,
                &mut *token,
            )?;
        }
        Ok(token)
    }

    fn duplicate_primary(&self, token: &Self::Handle) -> Result<Self::Handle> {
        let mut primary = Owned::default();
        unsafe {
            DuplicateTokenEx(
                **token,
                TOKEN_ALL_ACCESS,
                None,
                SecurityImpersonation,
                TokenPrimary,
                &mut *primary,
            )?;
        }
        Ok(primary)
    }

    fn logon_interactive(&self, credentials: &Credentials) -> Result<Self::Handle> {
        // "." is the local account database.
        let domain = if credentials.domain.is_empty() {
            HSTRING::from(".")
        } else {
            HSTRING::from(credentials.domain.as_str())
        };
        let username = HSTRING::from(credentials.username.as_str());
        let password = HSTRING::from(credentials.password.as_str());

        let mut token = Owned::default();
        unsafe {
            LogonUserW(
                &username,
                &domain,
                &password,
                LOGON32_LOGON_INTERACTIVE,
                LOGON32_PROVIDER_DEFAULT,
                &mut *token,
            )?;
        }
        Ok(token)
    }

    fn token_user_sid(&self, token: &Self::Handle) -> Result<String> {
        unsafe {
            // The first call only tells us how large the buffer needs to be.
            let mut needed = 0u32;
            _ = GetTokenInformation(**token, TokenUser, None, 0, &mut needed);
            if needed == 0 {
                return Err(Error::from_win32());
            }
            // u64s to get TOKEN_USER's alignment right.
            let mut buffer = vec![0u64; (needed as usize).div_ceil(8)];
            GetTokenInformation(
                **token,
                TokenUser,
                Some(buffer.as_mut_ptr() as *mut c_void),
                needed,
                &mut needed,
            )?;
            let token_user = &*(buffer.as_ptr() as *const TOKEN_USER);
            sid_to_string(token_user.User.Sid)
        }
    }

    fn computer_name(&self) -> Result<String> {
        let mut buffer = [0u16; 256];
        let mut len = buffer.len() as u32;
        unsafe {
            GetComputerNameExW(
                ComputerNameNetBIOS,
                PWSTR(buffer.as_mut_ptr()),
                &mut len,
            )?;
        }
        Ok(String::from_utf16_lossy(&buffer[..len as usize]))
    }

    fn enumerate_sessions(&self) -> Result<Vec<SessionInfo>> {
        unsafe {
            let mut sessions = WtsMemory::<WTS_SESSION_INFOW>::default();
            let mut count = 0u32;
            WTSEnumerateSessionsW(WTS_CURRENT_SERVER_HANDLE, 0, 1, &mut sessions.0, &mut count)?;
            if sessions.0.is_null() {
                return Ok(Vec::new());
            }

            let entries = std::slice::from_raw_parts(sessions.0, count as usize);
            Ok(entries
                .iter()
                .map(|entry| SessionInfo {
                    session_id: entry.SessionId,
                    active: entry.State == WTSActive,
                })
                .collect())
        }
    }

    fn active_console_session(&self) -> Option<u32> {
        // 0xFFFFFFFF while the console is being attached/detached.
        match unsafe { WTSGetActiveConsoleSessionId() } {
            u32::MAX => None,
            session_id => Some(session_id),
        }
    }

    fn query_session_account(&self, session_id: u32) -> Result<SessionAccount> {
        Ok(SessionAccount {
            domain: self.query_session_string(session_id, WTSDomainName)?,
            username: self.query_session_string(session_id, WTSUserName)?,
        })
    }

    fn query_session_token(&self, session_id: u32) -> Result<Self::Handle> {
        let mut token = Owned::default();
        unsafe { WTSQueryUserToken(session_id, &mut *token)? };
        Ok(token)
    }

    fn create_environment(&self, token: &Self::Handle) -> Result<Self::Environment> {
        let mut environment = OwnedEnvironmentBlock(std::ptr::null_mut());
        unsafe { CreateEnvironmentBlock(&mut environment.0, **token, false)? };
        Ok(environment)
    }

    fn enable_privilege(&self, privilege: &str) -> Result<()> {
        let process_token = current_process_token(TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY)?;

        let mut luid = LUID::default();
        unsafe {
            LookupPrivilegeValueW(PCWSTR::null(), &HSTRING::from(privilege), &mut luid)?;
        }

        let token_privileges = TOKEN_PRIVILEGES {
            PrivilegeCount: 1,
            Privileges: [LUID_AND_ATTRIBUTES {
                Luid: luid,
                Attributes: SE_PRIVILEGE_ENABLED,
            }],
        };

        unsafe {
            SetLastError(WIN32_ERROR(0));
            AdjustTokenPrivileges(*process_token, false, Some(&token_privileges), 0, None, None)?;
            // AdjustTokenPrivileges "succeeds" even if we don't hold the privilege.
            if GetLastError() == ERROR_NOT_ALL_ASSIGNED {
                return Err(ERROR_NOT_ALL_ASSIGNED.into());
            }
        }
        Ok(())
    }

    fn create_process(
        &self,
        token: &Self::Handle,
        environment: &Self::Environment,
        spec: &LaunchSpec,
    ) -> Result<LaunchedProcess<Self::Handle>> {
        let application_name = HSTRING::from(spec.executable_path.as_os_str());
        let current_directory = HSTRING::from(spec.working_directory.as_os_str());

        // CreateProcessAsUserW may write into both of these buffers.
        let mut command_line: Option<Vec<u16>> = spec.arguments.map(|arguments| {
            let program = spec.executable_path.to_string_lossy();
            format!("{} {arguments}", join_args(&[program.as_ref()]))
                .encode_utf16()
                .chain(Some(0))
                .collect()
        });
        let mut desktop: Vec<u16> = INTERACTIVE_DESKTOP
            .encode_utf16()
            .chain(Some(0))
            .collect();

        let startup_info = STARTUPINFOW {
            cb: std::mem::size_of::<STARTUPINFOW>() as u32,
            lpDesktop: PWSTR(desktop.as_mut_ptr()),
            dwFlags: STARTF_USESHOWWINDOW,
            wShowWindow: SW_SHOWNORMAL.0 as u16,
            ..Default::default()
        };
        let mut process_info = PROCESS_INFORMATION::default();

        unsafe {
            CreateProcessAsUserW(
                **token,
                &application_name,
                command_line
                    .as_mut()
                    .map_or(PWSTR::null(), |buffer| PWSTR(buffer.as_mut_ptr())),
                None,
                None,
                false,
                CREATE_UNICODE_ENVIRONMENT | CREATE_NEW_CONSOLE,
                Some(environment.0 as *const c_void),
                &current_directory,
                &startup_info,
                &mut process_info,
            )?;

            Ok(LaunchedProcess {
                process: Owned::new(process_info.hProcess),
                thread: Owned::new(process_info.hThread),
                process_id: process_info.dwProcessId,
            })
        }
    }
}
