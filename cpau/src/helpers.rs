use std::ffi::OsString;
use std::ops::{Deref, DerefMut};
use std::os::windows::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use windows::Win32::Storage::FileSystem::GetFullPathNameW;
use windows::{
    core::*, Win32::Foundation::*, Win32::Security::Authorization::*, Win32::Security::*,
    Win32::System::Threading::*,
};

pub const E_FILENOTFOUND: HRESULT = ERROR_FILE_NOT_FOUND.to_hresult();

pub const SERVICE_NAME: &str = "CreateProcessAsUser.Service";
pub const SERVICE_DESCRIPTION: &str = "Runs processes in a specified user space.";

const CONFIG_KEY: &str = "SOFTWARE\\CreateProcessAsUser";
const DEFAULT_PIPE_NAME: &str = "create_process_as_user";
const DEFAULT_MAX_MESSAGE_SIZE: u32 = 8192;
const MIN_MAX_MESSAGE_SIZE: u32 = 1024;
const MAX_MAX_MESSAGE_SIZE: u32 = 65536;
const DEFAULT_CLIENT_TIMEOUT_MS: u32 = 5000;

// There can be many different types that need to be LocalFree'd. PWSTR, PCWSTR, PSTR, PCSTR, PSECURITY_DESCRIPTOR
// are all distinct types, but they are compatible with the windows::core::IntoParam<HLOCAL> trait.
// There's also *mut ACL though which is also LocalAlloc'd and that's the problem (probably not the last of its kind).
// Writing a wrapper trait that is implemented for both IntoParam<HLOCAL> (or its friends) and *const/mut T
// doesn't work due to E0119. Implementing our own trait for each concrete type is highly annoying and verbose.
// So now this calls transmute_copy and zeroed. It's ugly and somewhat unsafe, but it's simple and short.
#[repr(transparent)]
pub struct OwnedLocalAlloc<T>(pub T);

impl<T> Default for OwnedLocalAlloc<T> {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

impl<T> Drop for OwnedLocalAlloc<T> {
    fn drop(&mut self) {
        unsafe {
            let ptr: HLOCAL = std::mem::transmute_copy(self);
            if !ptr.0.is_null() {
                LocalFree(ptr);
            }
        }
    }
}

impl<T> Deref for OwnedLocalAlloc<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for OwnedLocalAlloc<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Full path of the pipe the service listens on.
pub fn pipe_path(pipe_name: &str) -> String {
    format!(r"\\.\pipe\{pipe_name}")
}

/// Name of the mutex that keeps a second copy of the service from starting.
/// `Global\` so that it's shared across sessions.
pub fn service_mutex_name(pipe_name: &str) -> String {
    format!(r"Global\service_mutex_{pipe_name}")
}

pub fn is_running_elevated() -> Result<bool> {
    let current_token = current_process_token(TOKEN_QUERY)?;
    let elevation: TOKEN_ELEVATION = get_token_info(*current_token)?;
    Ok(elevation.TokenIsElevated == 1)
}

pub fn current_process_token(access: TOKEN_ACCESS_MASK) -> Result<Owned<HANDLE>> {
    let mut token = Owned::default();
    unsafe {
        OpenProcessToken(GetCurrentProcess(), access, &mut *token)?;
    }
    Ok(token)
}

// helper trait to get the TOKEN_INFORMATION_CLASS for a given type
trait TokenInfo {
    fn info_class() -> TOKEN_INFORMATION_CLASS;
}
impl TokenInfo for TOKEN_ELEVATION {
    fn info_class() -> TOKEN_INFORMATION_CLASS {
        TokenElevation
    }
}

fn get_token_info<T: TokenInfo>(token: HANDLE) -> Result<T> {
    unsafe {
        let mut info: T = std::mem::zeroed();
        let size = std::mem::size_of::<T>() as u32;
        let mut ret_size = size;
        GetTokenInformation(
            token,
            T::info_class(),
            Some(&mut info as *mut _ as _),
            size,
            &mut ret_size,
        )?;
        Ok(info)
    }
}

/// Converts a SID into its `S-1-5-...` string form.
pub fn sid_to_string(sid: PSID) -> Result<String> {
    unsafe {
        let mut str_sid = OwnedLocalAlloc::<PWSTR>::default();
        ConvertSidToStringSidW(sid, &mut *str_sid)?;
        Ok(str_sid.to_hstring()?.to_string_lossy())
    }
}

/// Windows does not actually support distinct command line parameters. They're all just given as a single string.
/// We can't just use `.join(" ")` either, because this breaks arguments with whitespaces. This function handles these details.
pub fn join_args<T: AsRef<str>>(args: &[T]) -> String {
    // We estimate 3*args.len() overhead per arg: 2 quotes and 1 whitespace.
    let expected_len = args
        .iter()
        .map(|s| s.as_ref().len())
        .fold(args.len().saturating_mul(3), usize::saturating_add);

    let mut accumulator = Vec::with_capacity(expected_len);

    for (idx, arg) in args.iter().enumerate() {
        if idx != 0 {
            accumulator.push(b' ');
        }

        let str = arg.as_ref();
        let quote = str.is_empty() || str.contains(' ') || str.contains('\t');
        if quote {
            accumulator.push(b'"');
        }

        let mut backslashes: usize = 0;
        for &x in str.as_bytes() {
            if x == b'\\' {
                backslashes += 1;
            } else {
                if x == b'"' {
                    accumulator.extend((0..=backslashes).map(|_| b'\\'));
                }
                backslashes = 0;
            }
            accumulator.push(x);
        }

        if quote {
            accumulator.extend((0..backslashes).map(|_| b'\\'));
            accumulator.push(b'"');
        }
    }

    // Assuming that our `args` slice was UTF8 the accumulator can't suddenly contain non-UTF8.
    unsafe { String::from_utf8_unchecked(accumulator) }
}

/// Make a Windows path absolute, using GetFullPathNameW to resolve the file on disk.
/// DON'T use std::canonicalize here. That'll give us a UNC path and just
/// about nothing actually accepts those.
pub fn absolute_path(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().as_encoded_bytes().starts_with(br"\\?\") {
        return Ok(path.into());
    }
    let lpfilename = HSTRING::from(path.as_os_str());
    let mut buffer = vec![0u16; MAX_PATH as usize];
    loop {
        // GetFullPathNameW will return the required buffer size if the buffer is too small.
        let res = unsafe { GetFullPathNameW(&lpfilename, Some(buffer.as_mut_slice()), None) };
        match res as usize {
            0 => return Err(Error::from_win32()), // returns GLE
            len if len <= buffer.len() => {
                return Ok(PathBuf::from(OsString::from_wide(&buffer[..len])))
            }
            new_len => buffer.resize(new_len, 0),
        }
    }
}

pub trait ConfigProvider {
    fn get_pipe_name(&self) -> Result<String>;
    fn get_max_message_size(&self) -> Result<u32>;
    fn get_client_timeout_ms(&self) -> Result<u32>;
}

#[derive(Default)]
pub struct RegistryConfigProvider;
impl ConfigProvider for RegistryConfigProvider {
    fn get_pipe_name(&self) -> Result<String> {
        windows_registry::LOCAL_MACHINE
            .open(CONFIG_KEY)
            .and_then(|key| key.get_string("PipeName"))
    }
    fn get_max_message_size(&self) -> Result<u32> {
        windows_registry::LOCAL_MACHINE
            .open(CONFIG_KEY)
            .and_then(|key| key.get_u32("MaxMessageSize"))
    }
    fn get_client_timeout_ms(&self) -> Result<u32> {
        windows_registry::LOCAL_MACHINE
            .open(CONFIG_KEY)
            .and_then(|key| key.get_u32("ClientTimeoutMs"))
    }
}

/// Settings shared by the service and the client. Read once, read-only
/// afterwards.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct ServiceConfig {
    pub pipe_name: String,
    pub max_message_size: u32,
    /// `None` waits forever.
    pub client_timeout: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            pipe_name: DEFAULT_PIPE_NAME.to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            client_timeout: Some(Duration::from_millis(DEFAULT_CLIENT_TIMEOUT_MS.into())),
        }
    }
}

/// A value that isn't there at all means "use the default". Failing to read
/// it for any other reason is an error.
fn value_or_default<T>(value: Result<T>, default: T) -> Result<T> {
    match value {
        Ok(v) => Ok(v),
        Err(e) if e.code() == E_FILENOTFOUND => Ok(default),
        Err(e) => Err(e),
    }
}

pub fn load_config(config: &impl ConfigProvider) -> Result<ServiceConfig> {
    let pipe_name = value_or_default(config.get_pipe_name(), DEFAULT_PIPE_NAME.to_string())?;
    // The pipe name ends up in both the pipe path and the mutex name. Neither
    // can contain a backslash.
    if pipe_name.is_empty() || pipe_name.contains('\\') {
        return Err(ERROR_INVALID_NAME.into());
    }

    let max_message_size =
        value_or_default(config.get_max_message_size(), DEFAULT_MAX_MESSAGE_SIZE)?
            .clamp(MIN_MAX_MESSAGE_SIZE, MAX_MAX_MESSAGE_SIZE);

    let client_timeout = match value_or_default(
        config.get_client_timeout_ms(),
        DEFAULT_CLIENT_TIMEOUT_MS,
    )? {
        0 => None,
        ms => Some(Duration::from_millis(ms.into())),
    };

    Ok(ServiceConfig {
        pipe_name,
        max_message_size,
        client_timeout,
    })
}
