use crate::helpers::*;
use crate::tracing;
use std::ffi::{c_void, OsString};
use std::path::Path;
use windows::{
    core::*, Win32::Foundation::*, Win32::NetworkManagement::NetManagement::*,
    Win32::Security::Authorization::*, Win32::Security::*,
    Win32::System::SystemServices::MAXIMUM_ALLOWED,
    Win32::System::WindowsProgramming::DRIVE_REMOTE,
};
use windows::Win32::Storage::FileSystem::{
    GetDriveTypeW, DELETE, FILE_APPEND_DATA, FILE_DELETE_CHILD, FILE_WRITE_ATTRIBUTES,
    FILE_WRITE_DATA, FILE_WRITE_EA, WRITE_DAC, WRITE_OWNER,
};
use windows_service::service::{
    ServiceAccess, ServiceErrorControl, ServiceInfo, ServiceStartType, ServiceState, ServiceType,
};
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};

/// Principals that can already run arbitrary code as SYSTEM. Them being able
/// to write to the install directory doesn't give anybody anything new.
pub const TRUSTED_SIDS: &[&str] = &[
    // NT AUTHORITY\SYSTEM
    "S-1-5-18",
    // BUILTIN\Administrators
    "S-1-5-32-544",
    // NT SERVICE\TrustedInstaller
    "S-1-5-80-956008885-3418522649-1831038044-1853292631-2271478464",
];

/// Any of these on the install directory is enough to swap out the binary
/// the service runs from.
pub const TAMPERING_ACCESS_MASK: u32 = FILE_WRITE_DATA.0
    | FILE_APPEND_DATA.0
    | FILE_WRITE_EA.0
    | FILE_DELETE_CHILD.0
    | FILE_WRITE_ATTRIBUTES.0
    | DELETE.0
    | WRITE_DAC.0
    | WRITE_OWNER.0;

// NetQueryDisplayInformation hands out users in pages of this size.
const DISPLAY_PAGE_SIZE: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum InstallCheckError {
    #[error(transparent)]
    Native(#[from] Error),
    #[error("the account {account} can modify the install directory (access mask {access_mask:#010x})")]
    InsecureDirectory { account: String, access_mask: u32 },
    #[error("refusing to install from a network path: {0}")]
    NetworkPath(String),
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("this command needs to be run from an elevated prompt")]
    NotElevated,
    #[error("the service is already installed")]
    AlreadyInstalled,
    #[error("the service is not installed")]
    NotInstalled,
    #[error(transparent)]
    Check(#[from] InstallCheckError),
    #[error(transparent)]
    Native(#[from] Error),
    #[error(transparent)]
    Service(#[from] windows_service::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAccount {
    pub name: String,
    pub disabled: bool,
}

/// Read-only view of the local account database and the ACLs on disk.
pub trait AccountDatabase {
    fn local_accounts(&self) -> Result<Vec<LocalAccount>>;
    /// The account's own SID, in string form.
    fn account_sid(&self, account: &str) -> Result<String>;
    /// SIDs of all local groups the account is a member of, directly or not.
    fn local_group_sids(&self, account: &str) -> Result<Vec<String>>;
    /// The access the account is granted on `path`, all groups considered.
    fn effective_access(&self, account: &str, path: &Path) -> Result<u32>;
}

/// UNC paths, with or without the `\\?\` prefix. Mapped drives are
/// `is_on_remote_drive`'s business.
pub fn is_network_path(path: &Path) -> bool {
    let path = path.to_string_lossy();
    match path.strip_prefix(r"\\?\") {
        Some(rest) => rest
            .get(..4)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(r"UNC\")),
        None => path.starts_with(r"\\"),
    }
}

/// `C:\` for anything on drive C, with or without the `\\?\` prefix.
fn drive_root(path: &Path) -> Option<String> {
    let path = path.to_string_lossy();
    let path = path.strip_prefix(r"\\?\").unwrap_or(&path);
    match path.as_bytes() {
        [letter, b':', ..] if letter.is_ascii_alphabetic() => {
            Some(format!(r"{}:\", *letter as char))
        }
        _ => None,
    }
}

/// Whether `path` lives on a drive letter that is mapped to a network share.
pub fn is_on_remote_drive(path: &Path) -> bool {
    match drive_root(path) {
        Some(root) => unsafe { GetDriveTypeW(&HSTRING::from(root)) == DRIVE_REMOTE },
        None => false,
    }
}

fn is_trusted(db: &impl AccountDatabase, account: &str) -> Result<bool> {
    if TRUSTED_SIDS.contains(&db.account_sid(account)?.as_str()) {
        return Ok(true);
    }
    Ok(db
        .local_group_sids(account)?
        .iter()
        .any(|sid| TRUSTED_SIDS.contains(&sid.as_str())))
}

/// Makes sure that nobody but trusted principals can modify `install_dir`.
///
/// Runs against the live account database every time. Nothing about a
/// previous run is remembered.
pub fn verify_install_directory(
    db: &impl AccountDatabase,
    install_dir: &Path,
) -> std::result::Result<(), InstallCheckError> {
    if is_network_path(install_dir) {
        return Err(InstallCheckError::NetworkPath(
            install_dir.display().to_string(),
        ));
    }

    for account in db.local_accounts()? {
        if account.disabled {
            continue;
        }
        if is_trusted(db, &account.name)? {
            tracing::trace_install_account_checked(&account.name, 0, true);
            continue;
        }

        let access_mask = db.effective_access(&account.name, install_dir)?;
        tracing::trace_install_account_checked(&account.name, access_mask, false);
        if access_mask & TAMPERING_ACCESS_MASK != 0 {
            return Err(InstallCheckError::InsecureDirectory {
                account: account.name,
                access_mask,
            });
        }
    }
    Ok(())
}

/// One batch of `NetQueryDisplayInformation` results. `more` is set when
/// the batch ended with `ERROR_MORE_DATA`.
struct DisplayPage<T> {
    entries: Vec<T>,
    more: bool,
}

/// Keeps asking `fetch` for the next page until one comes back without
/// `more`. Each page starts at the `next_index` of the last entry of the
/// previous one.
fn read_all_pages<T>(
    mut fetch: impl FnMut(u32) -> Result<DisplayPage<T>>,
    next_index: impl Fn(&T) -> u32,
) -> Result<Vec<T>> {
    let mut all = Vec::new();
    let mut index = 0;
    loop {
        let page = fetch(index)?;
        let cursor = page.entries.last().map(&next_index);
        all.extend(page.entries);
        match cursor {
            Some(cursor) if page.more => index = cursor,
            _ => break,
        }
    }
    Ok(all)
}

// Buffers handed out by the Net* functions go back through NetApiBufferFree.
struct NetApiBuffer<T>(*mut T);

impl<T> Default for NetApiBuffer<T> {
    fn default() -> Self {
        NetApiBuffer(std::ptr::null_mut())
    }
}

impl<T> Drop for NetApiBuffer<T> {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { NetApiBufferFree(Some(self.0 as *const c_void)) };
        }
    }
}

impl<T> NetApiBuffer<T> {
    unsafe fn entries(&self, count: u32) -> &[T] {
        if self.0.is_null() {
            &[]
        } else {
            std::slice::from_raw_parts(self.0, count as usize)
        }
    }
}

#[derive(Default)]
struct ResourceManager(AUTHZ_RESOURCE_MANAGER_HANDLE);

impl Drop for ResourceManager {
    fn drop(&mut self) {
        if self.0 .0 != 0 {
            unsafe {
                _ = AuthzFreeResourceManager(self.0);
            }
        }
    }
}

#[derive(Default)]
struct ClientContext(AUTHZ_CLIENT_CONTEXT_HANDLE);

impl Drop for ClientContext {
    fn drop(&mut self) {
        if self.0 .0 != 0 {
            unsafe {
                _ = AuthzFreeContext(self.0);
            }
        }
    }
}

/// The accounts on this machine, as far as the OS knows.
#[derive(Default)]
pub struct Win32AccountDatabase;

impl Win32AccountDatabase {
    /// The binary SID of `account`.
    fn lookup_sid(&self, account: &str) -> Result<Vec<u8>> {
        let name = HSTRING::from(account);
        let mut sid_len = 0u32;
        let mut domain_len = 0u32;
        let mut sid_type = SID_NAME_USE::default();
        unsafe {
            // The first call only tells us how large the buffers need to be.
            _ = LookupAccountNameW(
                PCWSTR::null(),
                &name,
                PSID::default(),
                &mut sid_len,
                PWSTR::null(),
                &mut domain_len,
                &mut sid_type,
            );
            if sid_len == 0 {
                return Err(Error::from_win32());
            }

            let mut sid = vec![0u8; sid_len as usize];
            let mut domain = vec![0u16; domain_len as usize];
            LookupAccountNameW(
                PCWSTR::null(),
                &name,
                PSID(sid.as_mut_ptr() as _),
                &mut sid_len,
                PWSTR(domain.as_mut_ptr()),
                &mut domain_len,
                &mut sid_type,
            )?;
            Ok(sid)
        }
    }

    /// Up to a page of local users starting at `index`, each with the index
    /// the user after it is at.
    fn display_page(&self, index: u32) -> Result<DisplayPage<(LocalAccount, u32)>> {
        let mut buffer = NetApiBuffer::<NET_DISPLAY_USER>::default();
        let mut count = 0u32;
        let status = unsafe {
            NetQueryDisplayInformation(
                PCWSTR::null(),
                1,
                index,
                DISPLAY_PAGE_SIZE,
                MAX_PREFERRED_LENGTH,
                &mut count,
                &mut buffer.0 as *mut *mut NET_DISPLAY_USER as *mut *mut c_void,
            )
        };
        if status != ERROR_SUCCESS.0 && status != ERROR_MORE_DATA.0 {
            return Err(WIN32_ERROR(status).into());
        }

        let mut entries = Vec::with_capacity(count as usize);
        for user in unsafe { buffer.entries(count) } {
            let account = LocalAccount {
                name: unsafe { user.usri1_name.to_hstring()? }.to_string_lossy(),
                disabled: user.usri1_flags.contains(UF_ACCOUNTDISABLE),
            };
            entries.push((account, user.usri1_next_index));
        }
        Ok(DisplayPage {
            entries,
            more: status == ERROR_MORE_DATA.0,
        })
    }
}

impl AccountDatabase for Win32AccountDatabase {
    fn local_accounts(&self) -> Result<Vec<LocalAccount>> {
        let accounts = read_all_pages(|index| self.display_page(index), |(_, next)| *next)?;
        Ok(accounts.into_iter().map(|(account, _)| account).collect())
    }

    fn account_sid(&self, account: &str) -> Result<String> {
        let mut sid = self.lookup_sid(account)?;
        sid_to_string(PSID(sid.as_mut_ptr() as _))
    }

    fn local_group_sids(&self, account: &str) -> Result<Vec<String>> {
        let mut buffer = NetApiBuffer::<LOCALGROUP_USERS_INFO_0>::default();
        let mut read = 0u32;
        let mut total = 0u32;
        let status = unsafe {
            NetUserGetLocalGroups(
                PCWSTR::null(),
                &HSTRING::from(account),
                0,
                LG_INCLUDE_INDIRECT,
                &mut buffer.0 as *mut *mut LOCALGROUP_USERS_INFO_0 as *mut *mut u8,
                MAX_PREFERRED_LENGTH,
                &mut read,
                &mut total,
            )
        };
        if status != ERROR_SUCCESS.0 {
            return Err(WIN32_ERROR(status).into());
        }

        unsafe { buffer.entries(read) }
            .iter()
            .map(|group| {
                let name = unsafe { group.lgrui0_name.to_hstring()? }.to_string_lossy();
                self.account_sid(&name)
            })
            .collect()
    }

    fn effective_access(&self, account: &str, path: &Path) -> Result<u32> {
        let mut sid = self.lookup_sid(account)?;
        unsafe {
            // Authz wants owner and group as well, not just the DACL.
            let mut descriptor = OwnedLocalAlloc::<PSECURITY_DESCRIPTOR>::default();
            GetNamedSecurityInfoW(
                &HSTRING::from(path.as_os_str()),
                SE_FILE_OBJECT,
                OWNER_SECURITY_INFORMATION
                    | GROUP_SECURITY_INFORMATION
                    | DACL_SECURITY_INFORMATION,
                None,
                None,
                None,
                None,
                &mut *descriptor,
            )
            .ok()?;

            let mut manager = ResourceManager::default();
            AuthzInitializeResourceManager(
                AUTHZ_RM_FLAG_NO_AUDIT.0,
                None,
                None,
                None,
                PCWSTR::null(),
                &mut manager.0,
            )?;

            let mut context = ClientContext::default();
            AuthzInitializeContextFromSid(
                0,
                PSID(sid.as_mut_ptr() as _),
                manager.0,
                None,
                LUID::default(),
                None,
                &mut context.0,
            )?;

            let request = AUTHZ_ACCESS_REQUEST {
                DesiredAccess: MAXIMUM_ALLOWED,
                ..Default::default()
            };
            let mut granted_access = 0u32;
            let mut error = 0u32;
            let mut reply = AUTHZ_ACCESS_REPLY {
                ResultListLength: 1,
                GrantedAccessMask: &mut granted_access,
                SaclEvaluationResults: std::ptr::null_mut(),
                Error: &mut error,
            };
            AuthzAccessCheck(
                AUTHZ_ACCESS_CHECK_FLAGS(0),
                context.0,
                &request,
                AUTHZ_AUDIT_EVENT_HANDLE::default(),
                *descriptor,
                None,
                &mut reply,
                None,
            )?;
            Ok(granted_access)
        }
    }
}

fn open_manager(access: ServiceManagerAccess) -> std::result::Result<ServiceManager, InstallError> {
    Ok(ServiceManager::local_computer(None::<&str>, access)?)
}

fn is_service_missing(err: &windows_service::Error) -> bool {
    matches!(err, windows_service::Error::Winapi(io_err)
        if io_err.raw_os_error() == Some(ERROR_SERVICE_DOES_NOT_EXIST.0 as i32))
}

/// Where the service gets registered. The SCM in production.
pub trait ServiceRegistry {
    fn is_registered(&self) -> std::result::Result<bool, InstallError>;

    /// Creates the service entry for `executable_path` and starts it.
    fn register(&self, executable_path: &Path) -> std::result::Result<(), InstallError>;
}

pub struct ScmRegistry {
    manager: ServiceManager,
}

impl ScmRegistry {
    pub fn open() -> std::result::Result<Self, InstallError> {
        Ok(Self {
            manager: open_manager(
                ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE,
            )?,
        })
    }
}

impl ServiceRegistry for ScmRegistry {
    fn is_registered(&self) -> std::result::Result<bool, InstallError> {
        match self
            .manager
            .open_service(SERVICE_NAME, ServiceAccess::QUERY_STATUS)
        {
            Ok(_) => Ok(true),
            Err(err) if is_service_missing(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn register(&self, executable_path: &Path) -> std::result::Result<(), InstallError> {
        let service_info = ServiceInfo {
            name: OsString::from(SERVICE_NAME),
            display_name: OsString::from(SERVICE_NAME),
            service_type: ServiceType::OWN_PROCESS,
            start_type: ServiceStartType::AutoStart,
            error_control: ServiceErrorControl::Normal,
            executable_path: executable_path.to_path_buf(),
            launch_arguments: vec![OsString::from("service")],
            dependencies: vec![],
            // LocalSystem
            account_name: None,
            account_password: None,
        };
        let service = self.manager.create_service(
            &service_info,
            ServiceAccess::CHANGE_CONFIG | ServiceAccess::START,
        )?;
        service.set_description(SERVICE_DESCRIPTION)?;
        service.start(&[] as &[&str])?;
        Ok(())
    }
}

/// Everything `install` does once elevation and the executable's location
/// are settled. Nothing reaches `registry` unless the install directory
/// passed verification or `bypass_check` is set.
pub fn install_from(
    db: &impl AccountDatabase,
    registry: &impl ServiceRegistry,
    executable_path: &Path,
    bypass_check: bool,
) -> std::result::Result<(), InstallError> {
    if registry.is_registered()? {
        return Err(InstallError::AlreadyInstalled);
    }
    if is_network_path(executable_path) {
        return Err(InstallCheckError::NetworkPath(executable_path.display().to_string()).into());
    }
    let install_dir = executable_path
        .parent()
        .ok_or_else(|| Error::from(ERROR_PATH_NOT_FOUND))?;

    if bypass_check {
        tracing::trace_install_check_bypassed(&install_dir.to_string_lossy());
    } else {
        verify_install_directory(db, install_dir)?;
    }

    registry.register(executable_path)?;
    tracing::trace_log_message("service installed");
    Ok(())
}

/// Registers this executable as the service and starts it.
///
/// The service will run as LocalSystem, so before that we make sure the
/// directory it lives in can't be tampered with. `bypass_check` skips that.
pub fn install(bypass_check: bool) -> std::result::Result<(), InstallError> {
    if !is_running_elevated()? {
        return Err(InstallError::NotElevated);
    }

    let executable_path = absolute_path(&std::env::current_exe()?)?;
    if is_on_remote_drive(&executable_path) {
        return Err(InstallCheckError::NetworkPath(executable_path.display().to_string()).into());
    }

    install_from(
        &Win32AccountDatabase,
        &ScmRegistry::open()?,
        &executable_path,
        bypass_check,
    )
}

/// Stops the service if it's running and removes its registration.
pub fn uninstall() -> std::result::Result<(), InstallError> {
    if !is_running_elevated()? {
        return Err(InstallError::NotElevated);
    }

    let manager = open_manager(ServiceManagerAccess::CONNECT)?;
    let service = match manager.open_service(
        SERVICE_NAME,
        ServiceAccess::QUERY_STATUS | ServiceAccess::STOP | ServiceAccess::DELETE,
    ) {
        Ok(service) => service,
        Err(err) if is_service_missing(&err) => return Err(InstallError::NotInstalled),
        Err(err) => return Err(err.into()),
    };

    if service.query_status()?.current_state != ServiceState::Stopped {
        service.stop()?;
    }
    // The SCM removes the entry once the last handle to it is closed.
    service.delete()?;

    tracing::trace_log_message("service uninstalled");
    Ok(())
}
