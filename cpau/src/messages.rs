use serde::{Deserialize, Serialize};
use std::fmt;
use windows::{core::*, Win32::Foundation::*};

/// Process id we report whenever we didn't create a process.
pub const INVALID_PROCESS_ID: i32 = -1;

const MESSAGE_VERSION: u32 = 1;

pub const E_INVALID_MESSAGE: HRESULT = ERROR_INVALID_DATA.to_hresult();

#[derive(PartialEq, Eq, Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum AuthenticationMode {
    /// Run the target under the caller's own token.
    #[default]
    Inherit = 0,
    /// Log on with explicit credentials and use that user's desktop session.
    Credentials = 1,
}

impl TryFrom<i32> for AuthenticationMode {
    type Error = Error;
    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(AuthenticationMode::Inherit),
            1 => Ok(AuthenticationMode::Credentials),
            _ => Err(ERROR_INVALID_PARAMETER.into()),
        }
    }
}

impl From<AuthenticationMode> for i32 {
    fn from(value: AuthenticationMode) -> Self {
        value as i32
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ResultCode {
    #[default]
    Unknown = -1,
    CreatedProcess = 0,
    TimedOut = 1,
    FailedToGetToken = 2,
    FailedToGetEnvironment = 3,
    FailedToCreateProcess = 4,
    InvalidCredentials = 5,
    InvalidProcessInformation = 6,
    InsufficientPermissions = 7,
    FailedToGetCallerPid = 8,
    FailedToGetDesktopSessions = 9,
}

impl TryFrom<i32> for ResultCode {
    type Error = Error;
    fn try_from(value: i32) -> Result<Self> {
        match value {
            -1 => Ok(ResultCode::Unknown),
            0 => Ok(ResultCode::CreatedProcess),
            1 => Ok(ResultCode::TimedOut),
            2 => Ok(ResultCode::FailedToGetToken),
            3 => Ok(ResultCode::FailedToGetEnvironment),
            4 => Ok(ResultCode::FailedToCreateProcess),
            5 => Ok(ResultCode::InvalidCredentials),
            6 => Ok(ResultCode::InvalidProcessInformation),
            7 => Ok(ResultCode::InsufficientPermissions),
            8 => Ok(ResultCode::FailedToGetCallerPid),
            9 => Ok(ResultCode::FailedToGetDesktopSessions),
            _ => Err(ERROR_INVALID_PARAMETER.into()),
        }
    }
}

impl From<ResultCode> for i32 {
    fn from(value: ResultCode) -> Self {
        value as i32
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultCode::Unknown => "UNKNOWN",
            ResultCode::CreatedProcess => "CREATED_PROCESS",
            ResultCode::TimedOut => "TIMED_OUT",
            ResultCode::FailedToGetToken => "FAILED_TO_GET_TOKEN",
            ResultCode::FailedToGetEnvironment => "FAILED_TO_GET_ENVIRONMENT",
            ResultCode::FailedToCreateProcess => "FAILED_TO_CREATE_PROCESS",
            ResultCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ResultCode::InvalidProcessInformation => "INVALID_PROCESS_INFORMATION",
            ResultCode::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            ResultCode::FailedToGetCallerPid => "FAILED_TO_GET_CALLER_PID",
            ResultCode::FailedToGetDesktopSessions => "FAILED_TO_GET_DESKTOP_SESSIONS",
        };
        f.write_str(name)
    }
}

/// Only meaningful in `AuthenticationMode::Credentials`.
#[derive(PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credentials {
    pub domain: String,
    pub username: String,
    pub password: String,
}

// Hand-written so the password can't end up in a log line by accident.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// The account in `domain\username` form. An empty domain gives just the
    /// username.
    pub fn account_name(&self) -> String {
        if self.domain.is_empty() {
            self.username.clone()
        } else {
            format!(r"{}\{}", self.domain, self.username)
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessInformation {
    pub executable_path: String,
    /// Empty means "no command line".
    pub arguments: String,
    /// Empty means "the executable's directory".
    pub working_directory: String,
}

#[derive(PartialEq, Eq, Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Parameters {
    pub authentication_mode: AuthenticationMode,
    pub credentials: Credentials,
    pub process_information: ProcessInformation,
    /// Reserved. Carried on the wire, not acted upon.
    pub elevated: bool,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessResult {
    pub process_id: i32,
    pub result: ResultCode,
}

impl Default for ProcessResult {
    fn default() -> Self {
        ProcessResult {
            process_id: INVALID_PROCESS_ID,
            result: ResultCode::Unknown,
        }
    }
}

impl ProcessResult {
    pub fn created(process_id: u32) -> Self {
        ProcessResult {
            process_id: process_id as i32,
            result: ResultCode::CreatedProcess,
        }
    }

    pub fn failed(result: ResultCode) -> Self {
        ProcessResult {
            process_id: INVALID_PROCESS_ID,
            result,
        }
    }
}

/// The unit we exchange over the pipe. Requests only carry `parameters`,
/// responses only carry `result`.
#[derive(PartialEq, Eq, Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    pub parameters: Option<Parameters>,
    pub result: Option<ProcessResult>,
}

impl Message {
    pub fn request(parameters: Parameters) -> Self {
        Message {
            parameters: Some(parameters),
            result: None,
        }
    }

    pub fn response(result: ProcessResult) -> Self {
        Message {
            parameters: None,
            result: Some(result),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&Envelope {
            version: MESSAGE_VERSION,
            message: self,
        })
        .map_err(|_| E_INVALID_MESSAGE.into())
    }

    /// Anything that isn't exactly a message we'd have written ourselves is
    /// rejected: unknown fields, unknown enum values, trailing bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope<Message> =
            serde_json::from_slice(bytes).map_err(|_| Error::from(E_INVALID_MESSAGE))?;
        if envelope.version != MESSAGE_VERSION {
            return Err(ERROR_UNSUPPORTED_TYPE.into());
        }
        Ok(envelope.message)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope<M> {
    version: u32,
    message: M,
}
