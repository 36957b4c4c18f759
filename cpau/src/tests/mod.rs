#[cfg(test)]
mod tests {
    use crate::messages::*;
    use crate::native::*;
    use crate::request_handler::handle_message;
    use crate::transport::Connection;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use windows::core::{Error, Result};
    use windows::Win32::Foundation::*;

    const CALLER_PID: u32 = 4100;
    const LAUNCHED_PID: u32 = 4242;
    const PASSWORD: &str = "correct horse";

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        OpenProcess,
        HasExited,
        OpenProcessToken,
        DuplicatePrimary,
        LogonInteractive,
        TokenUserSid,
        ComputerName,
        EnumerateSessions,
        QuerySessionAccount,
        QuerySessionToken,
        CreateEnvironment,
        EnablePrivilege,
        CreateProcess,
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Fault {
        Fail,
        Panic,
    }

    const COMPUTER_NAME: &str = "WORKSTATION";

    /// Counts itself in and out of `live`. Tokens know whose they are.
    struct FakeHandle {
        live: Rc<Cell<isize>>,
        sid: String,
    }

    /// A made-up SID that is the same for the same account, whatever case
    /// its name is spelled in.
    fn fake_sid(domain: &str, username: &str) -> String {
        let domain = match domain {
            "" | "." => COMPUTER_NAME,
            domain => domain,
        };
        format!("S-fake-{}-{}", domain.to_lowercase(), username.to_lowercase())
    }

    impl Drop for FakeHandle {
        fn drop(&mut self) {
            self.live.set(self.live.get() - 1);
        }
    }

    struct FakeNativeApi {
        live: Rc<Cell<isize>>,
        acquired: Cell<usize>,
        calls: RefCell<Vec<Call>>,
        fault: Option<(Call, Fault)>,
        caller_gone: bool,
        caller_exited: bool,
        sessions: Vec<(SessionInfo, SessionAccount)>,
        /// Sessions whose token belongs to someone other than the user name
        /// the session reports.
        impostor_sessions: Vec<u32>,
        console_session: Option<u32>,
        live_at_session_token: Cell<Option<isize>>,
    }

    impl Default for FakeNativeApi {
        fn default() -> Self {
            FakeNativeApi {
                live: Rc::new(Cell::new(0)),
                acquired: Cell::new(0),
                calls: RefCell::new(Vec::new()),
                fault: None,
                caller_gone: false,
                caller_exited: false,
                sessions: vec![
                    (
                        SessionInfo {
                            session_id: 0,
                            active: false,
                        },
                        SessionAccount::default(),
                    ),
                    (
                        SessionInfo {
                            session_id: 1,
                            active: true,
                        },
                        session_account("CONTOSO", "alice"),
                    ),
                ],
                impostor_sessions: Vec::new(),
                console_session: Some(1),
                live_at_session_token: Cell::new(None),
            }
        }
    }

    fn session_account(domain: &str, username: &str) -> SessionAccount {
        SessionAccount {
            domain: domain.to_string(),
            username: username.to_string(),
        }
    }

    impl FakeNativeApi {
        fn failing(call: Call) -> Self {
            FakeNativeApi {
                fault: Some((call, Fault::Fail)),
                ..Default::default()
            }
        }

        fn enter(&self, call: Call) -> Result<()> {
            self.calls.borrow_mut().push(call);
            match self.fault {
                Some((faulty, Fault::Fail)) if faulty == call => Err(E_FAIL.into()),
                Some((faulty, Fault::Panic)) if faulty == call => panic!("injected panic"),
                _ => Ok(()),
            }
        }

        fn handle(&self) -> FakeHandle {
            self.token_of(String::new())
        }

        fn token_of(&self, sid: String) -> FakeHandle {
            self.acquired.set(self.acquired.get() + 1);
            self.live.set(self.live.get() + 1);
            FakeHandle {
                live: self.live.clone(),
                sid,
            }
        }

        fn account_in(&self, session_id: u32) -> Result<SessionAccount> {
            self.sessions
                .iter()
                .find(|(info, _)| info.session_id == session_id)
                .map(|(_, account)| account.clone())
                .ok_or_else(|| Error::from(ERROR_INVALID_PARAMETER))
        }

        fn called(&self, call: Call) -> bool {
            self.calls.borrow().contains(&call)
        }
    }

    impl NativeApi for FakeNativeApi {
        type Handle = FakeHandle;
        type Environment = FakeHandle;

        fn open_process(&self, process_id: u32) -> Result<Option<FakeHandle>> {
            self.enter(Call::OpenProcess)?;
            assert_eq!(process_id, CALLER_PID);
            if self.caller_gone {
                return Ok(None);
            }
            Ok(Some(self.handle()))
        }

        fn has_exited(&self, _process: &FakeHandle) -> Result<bool> {
            self.enter(Call::HasExited)?;
            Ok(self.caller_exited)
        }

        fn open_process_token(&self, _process: &FakeHandle) -> Result<FakeHandle> {
            self.enter(Call::OpenProcessToken)?;
            Ok(self.handle())
        }

        fn duplicate_primary(&self, _token: &FakeHandle) -> Result<FakeHandle> {
            self.enter(Call::DuplicatePrimary)?;
            Ok(self.handle())
        }

        fn logon_interactive(&self, credentials: &Credentials) -> Result<FakeHandle> {
            self.enter(Call::LogonInteractive)?;
            if credentials.password != PASSWORD {
                return Err(ERROR_LOGON_FAILURE.into());
            }
            Ok(self.token_of(fake_sid(&credentials.domain, &credentials.username)))
        }

        fn token_user_sid(&self, token: &FakeHandle) -> Result<String> {
            self.enter(Call::TokenUserSid)?;
            Ok(token.sid.clone())
        }

        fn computer_name(&self) -> Result<String> {
            self.enter(Call::ComputerName)?;
            Ok(COMPUTER_NAME.to_string())
        }

        fn enumerate_sessions(&self) -> Result<Vec<SessionInfo>> {
            self.enter(Call::EnumerateSessions)?;
            Ok(self.sessions.iter().map(|(info, _)| *info).collect())
        }

        fn active_console_session(&self) -> Option<u32> {
            self.console_session
        }

        fn query_session_account(&self, session_id: u32) -> Result<SessionAccount> {
            self.enter(Call::QuerySessionAccount)?;
            self.account_in(session_id)
        }

        fn query_session_token(&self, session_id: u32) -> Result<FakeHandle> {
            self.enter(Call::QuerySessionToken)?;
            self.live_at_session_token.set(Some(self.live.get()));
            let account = self.account_in(session_id)?;
            let sid = if self.impostor_sessions.contains(&session_id) {
                fake_sid("FABRIKAM", "mallory")
            } else {
                fake_sid(&account.domain, &account.username)
            };
            Ok(self.token_of(sid))
        }

        fn create_environment(&self, _token: &FakeHandle) -> Result<FakeHandle> {
            self.enter(Call::CreateEnvironment)?;
            Ok(self.handle())
        }

        fn enable_privilege(&self, privilege: &str) -> Result<()> {
            self.enter(Call::EnablePrivilege)?;
            assert_eq!(privilege, "SeAssignPrimaryTokenPrivilege");
            Ok(())
        }

        fn create_process(
            &self,
            _token: &FakeHandle,
            _environment: &FakeHandle,
            spec: &LaunchSpec,
        ) -> Result<LaunchedProcess<FakeHandle>> {
            self.enter(Call::CreateProcess)?;
            assert!(spec.executable_path.is_file());
            Ok(LaunchedProcess {
                process: self.handle(),
                thread: self.handle(),
                process_id: LAUNCHED_PID,
            })
        }
    }

    struct FakeConnection {
        peer: Result<u32>,
        connected: bool,
        send_fails: bool,
        sent: RefCell<Vec<Vec<u8>>>,
    }

    impl Default for FakeConnection {
        fn default() -> Self {
            FakeConnection {
                peer: Ok(CALLER_PID),
                connected: true,
                send_fails: false,
                sent: RefCell::new(Vec::new()),
            }
        }
    }

    impl Connection for FakeConnection {
        fn id(&self) -> u64 {
            7
        }
        fn send(&self, bytes: &[u8]) -> Result<()> {
            if self.send_fails {
                return Err(ERROR_NO_DATA.into());
            }
            self.sent.borrow_mut().push(bytes.to_vec());
            Ok(())
        }
        fn query_peer_process_id(&self) -> Result<u32> {
            self.peer.clone()
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    impl FakeConnection {
        fn responses(&self) -> Vec<ProcessResult> {
            self.sent
                .borrow()
                .iter()
                .map(|bytes| Message::decode(bytes).unwrap().result.unwrap())
                .collect()
        }
    }

    fn existing_executable() -> String {
        std::env::current_exe()
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }

    fn inherit_request() -> Vec<u8> {
        Message::request(Parameters {
            authentication_mode: AuthenticationMode::Inherit,
            process_information: ProcessInformation {
                executable_path: existing_executable(),
                arguments: "--version".to_string(),
                working_directory: String::new(),
            },
            ..Default::default()
        })
        .encode()
        .unwrap()
    }

    fn credentials_request(domain: &str, username: &str, password: &str) -> Vec<u8> {
        Message::request(Parameters {
            authentication_mode: AuthenticationMode::Credentials,
            credentials: Credentials {
                domain: domain.to_string(),
                username: username.to_string(),
                password: password.to_string(),
            },
            process_information: ProcessInformation {
                executable_path: existing_executable(),
                ..Default::default()
            },
            elevated: false,
        })
        .encode()
        .unwrap()
    }

    /// Runs one request. Whatever happened, nothing may leak and at most one
    /// response may go out.
    fn run(api: &FakeNativeApi, connection: &FakeConnection, request: &[u8]) -> Vec<ProcessResult> {
        handle_message(api, connection, request);
        assert_eq!(api.live.get(), 0, "leaked handles after {:?}", api.calls.borrow());
        let responses = connection.responses();
        assert!(responses.len() <= 1);
        responses
    }

    #[test]
    fn test_inherit_creates_process() {
        let api = FakeNativeApi::default();
        let connection = FakeConnection::default();
        let responses = run(&api, &connection, &inherit_request());
        assert_eq!(responses, [ProcessResult::created(LAUNCHED_PID)]);
        assert!(responses[0].process_id > 0);
        // Credentials mode machinery is never touched.
        assert!(!api.called(Call::LogonInteractive));
        assert!(!api.called(Call::EnumerateSessions));
    }

    #[test]
    fn test_missing_executable_acquires_nothing() {
        for executable_path in ["", r"C:\definitely\not\here.exe"] {
            for mode in [AuthenticationMode::Inherit, AuthenticationMode::Credentials] {
                let api = FakeNativeApi::default();
                let connection = FakeConnection::default();
                let request = Message::request(Parameters {
                    authentication_mode: mode,
                    process_information: ProcessInformation {
                        executable_path: executable_path.to_string(),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .encode()
                .unwrap();

                let responses = run(&api, &connection, &request);
                assert_eq!(
                    responses,
                    [ProcessResult::failed(ResultCode::InvalidProcessInformation)]
                );
                assert_eq!(api.acquired.get(), 0);
                assert!(api.calls.borrow().is_empty());
            }
        }
    }

    #[test]
    fn test_malformed_request() {
        let response_only = Message::response(ProcessResult::created(1)).encode().unwrap();
        let requests: [&[u8]; 3] = [b"", b"garbage", &response_only];
        for request in requests {
            let api = FakeNativeApi::default();
            let connection = FakeConnection::default();
            let responses = run(&api, &connection, request);
            assert_eq!(responses, [ProcessResult::default()]);
            assert_eq!(responses[0].process_id, INVALID_PROCESS_ID);
            assert_eq!(api.acquired.get(), 0);
        }
    }

    #[test]
    fn test_inherit_fault_injection() {
        let cases = [
            (Call::OpenProcess, ResultCode::FailedToGetCallerPid),
            (Call::HasExited, ResultCode::FailedToGetCallerPid),
            (Call::OpenProcessToken, ResultCode::FailedToGetToken),
            (Call::DuplicatePrimary, ResultCode::FailedToGetToken),
            (Call::CreateEnvironment, ResultCode::FailedToGetEnvironment),
            (Call::EnablePrivilege, ResultCode::InsufficientPermissions),
            (Call::CreateProcess, ResultCode::FailedToCreateProcess),
        ];
        for (call, expected) in cases {
            let api = FakeNativeApi::failing(call);
            let connection = FakeConnection::default();
            let responses = run(&api, &connection, &inherit_request());
            assert_eq!(responses, [ProcessResult::failed(expected)], "{call:?}");
            assert!(api.acquired.get() > 0 || call == Call::OpenProcess);
        }
    }

    #[test]
    fn test_credentials_fault_injection() {
        let cases = [
            (Call::LogonInteractive, ResultCode::InvalidCredentials),
            (Call::TokenUserSid, ResultCode::FailedToGetToken),
            (Call::ComputerName, ResultCode::FailedToGetDesktopSessions),
            (Call::QuerySessionAccount, ResultCode::FailedToGetDesktopSessions),
            (Call::QuerySessionToken, ResultCode::FailedToGetToken),
            (Call::DuplicatePrimary, ResultCode::FailedToGetToken),
            (Call::CreateEnvironment, ResultCode::FailedToGetEnvironment),
            (Call::EnablePrivilege, ResultCode::InsufficientPermissions),
            (Call::CreateProcess, ResultCode::FailedToCreateProcess),
        ];
        for (call, expected) in cases {
            let api = FakeNativeApi::failing(call);
            let connection = FakeConnection::default();
            let request = credentials_request("CONTOSO", "alice", PASSWORD);
            let responses = run(&api, &connection, &request);
            assert_eq!(responses, [ProcessResult::failed(expected)], "{call:?}");
        }
    }

    #[test]
    fn test_panic_is_contained() {
        for call in [
            Call::OpenProcessToken,
            Call::DuplicatePrimary,
            Call::CreateEnvironment,
            Call::CreateProcess,
        ] {
            let api = FakeNativeApi {
                fault: Some((call, Fault::Panic)),
                ..Default::default()
            };
            let connection = FakeConnection::default();
            let responses = run(&api, &connection, &inherit_request());
            assert_eq!(responses, [ProcessResult::default()], "{call:?}");
        }
    }

    #[test]
    fn test_caller_pid_unavailable() {
        let api = FakeNativeApi::default();
        let connection = FakeConnection {
            peer: Err(ERROR_PIPE_NOT_CONNECTED.into()),
            ..Default::default()
        };
        let responses = run(&api, &connection, &inherit_request());
        assert_eq!(
            responses,
            [ProcessResult::failed(ResultCode::FailedToGetCallerPid)]
        );
        assert_eq!(api.acquired.get(), 0);
    }

    #[test]
    fn test_caller_exited_is_dropped_silently() {
        let gone = FakeNativeApi {
            caller_gone: true,
            ..Default::default()
        };
        let exited = FakeNativeApi {
            caller_exited: true,
            ..Default::default()
        };
        for api in [gone, exited] {
            let connection = FakeConnection::default();
            let responses = run(&api, &connection, &inherit_request());
            assert!(responses.is_empty());
            assert!(!api.called(Call::OpenProcessToken));
        }
    }

    #[test]
    fn test_disconnected_client_gets_no_process() {
        let api = FakeNativeApi::default();
        let connection = FakeConnection {
            connected: false,
            ..Default::default()
        };
        let responses = run(&api, &connection, &inherit_request());
        assert!(responses.is_empty());
        assert!(!api.called(Call::CreateProcess));
    }

    #[test]
    fn test_failed_send_is_not_fatal() {
        let api = FakeNativeApi::default();
        let connection = FakeConnection {
            send_fails: true,
            ..Default::default()
        };
        let responses = run(&api, &connection, &inherit_request());
        assert!(responses.is_empty());
        assert!(api.called(Call::CreateProcess));
    }

    #[test]
    fn test_credentials_create_process() {
        for (domain, username) in [("CONTOSO", "alice"), ("contoso", "ALICE")] {
            let api = FakeNativeApi::default();
            let connection = FakeConnection::default();
            let responses = run(&api, &connection, &credentials_request(domain, username, PASSWORD));
            assert_eq!(responses, [ProcessResult::created(LAUNCHED_PID)]);
            // The logon token was already gone when the session token was
            // fetched.
            assert_eq!(api.live_at_session_token.get(), Some(0));
            // The caller's own identity plays no part.
            assert!(!api.called(Call::OpenProcess));
        }
    }

    #[test]
    fn test_local_account_gets_local_session_only() {
        // A local alice and a domain alice are both logged on.
        let sessions = vec![
            (
                SessionInfo {
                    session_id: 1,
                    active: true,
                },
                session_account("CONTOSO", "alice"),
            ),
            (
                SessionInfo {
                    session_id: 2,
                    active: true,
                },
                session_account(COMPUTER_NAME, "alice"),
            ),
        ];
        for domain in ["", "."] {
            let api = FakeNativeApi {
                sessions: sessions.clone(),
                ..Default::default()
            };
            let connection = FakeConnection::default();
            let responses = run(&api, &connection, &credentials_request(domain, "alice", PASSWORD));
            assert_eq!(responses, [ProcessResult::created(LAUNCHED_PID)]);
            // Only the local session's token was ever taken.
            let session_tokens = api
                .calls
                .borrow()
                .iter()
                .filter(|&&call| call == Call::QuerySessionToken)
                .count();
            assert_eq!(session_tokens, 1);
        }
    }

    #[test]
    fn test_local_password_never_gets_domain_session() {
        // Only the domain alice is logged on. Knowing the local alice's
        // password must not get anybody into her session.
        for domain in ["", "."] {
            let api = FakeNativeApi::default();
            let connection = FakeConnection::default();
            let responses = run(&api, &connection, &credentials_request(domain, "alice", PASSWORD));
            assert_eq!(
                responses,
                [ProcessResult::failed(ResultCode::FailedToGetDesktopSessions)]
            );
            assert!(!api.called(Call::QuerySessionToken));
            assert!(!api.called(Call::CreateProcess));
        }
    }

    #[test]
    fn test_session_token_must_belong_to_the_account() {
        // The session claims to be CONTOSO\alice, but its token says
        // otherwise.
        let api = FakeNativeApi {
            impostor_sessions: vec![1],
            ..Default::default()
        };
        let connection = FakeConnection::default();
        let responses = run(&api, &connection, &credentials_request("CONTOSO", "alice", PASSWORD));
        assert_eq!(
            responses,
            [ProcessResult::failed(ResultCode::FailedToGetDesktopSessions)]
        );
        assert!(api.called(Call::QuerySessionToken));
        assert!(!api.called(Call::CreateProcess));
    }

    #[test]
    fn test_wrong_password() {
        let api = FakeNativeApi::default();
        let connection = FakeConnection::default();
        let responses = run(&api, &connection, &credentials_request("CONTOSO", "alice", "hunter2"));
        assert_eq!(
            responses,
            [ProcessResult::failed(ResultCode::InvalidCredentials)]
        );
        assert!(!api.called(Call::EnumerateSessions));
    }

    #[test]
    fn test_no_matching_session() {
        // Right credentials, but the user isn't logged on anywhere.
        let api = FakeNativeApi::default();
        let connection = FakeConnection::default();
        let responses = run(&api, &connection, &credentials_request("CONTOSO", "bob", PASSWORD));
        assert_eq!(
            responses,
            [ProcessResult::failed(ResultCode::FailedToGetDesktopSessions)]
        );
        assert!(!api.called(Call::QuerySessionToken));

        // Logged on, but in a session that isn't active.
        let api = FakeNativeApi {
            sessions: vec![(
                SessionInfo {
                    session_id: 2,
                    active: false,
                },
                session_account("CONTOSO", "alice"),
            )],
            ..Default::default()
        };
        let connection = FakeConnection::default();
        let responses = run(&api, &connection, &credentials_request("CONTOSO", "alice", PASSWORD));
        assert_eq!(
            responses,
            [ProcessResult::failed(ResultCode::FailedToGetDesktopSessions)]
        );
        assert!(!api.called(Call::QuerySessionAccount));
    }

    #[test]
    fn test_console_session_fallback() {
        // Enumeration fails, but the console session is alice's.
        let api = FakeNativeApi::failing(Call::EnumerateSessions);
        let connection = FakeConnection::default();
        let responses = run(&api, &connection, &credentials_request("CONTOSO", "alice", PASSWORD));
        assert_eq!(responses, [ProcessResult::created(LAUNCHED_PID)]);

        // Enumeration fails, and there's no console session either.
        let api = FakeNativeApi {
            fault: Some((Call::EnumerateSessions, Fault::Fail)),
            console_session: None,
            ..Default::default()
        };
        let connection = FakeConnection::default();
        let responses = run(&api, &connection, &credentials_request("CONTOSO", "alice", PASSWORD));
        assert_eq!(
            responses,
            [ProcessResult::failed(ResultCode::FailedToGetDesktopSessions)]
        );
    }

    #[test]
    fn test_requests_are_independent() {
        // One failed request leaves nothing behind that affects the next.
        let api = FakeNativeApi::default();
        let connection = FakeConnection::default();
        run(&api, &connection, &credentials_request("CONTOSO", "alice", "hunter2"));
        run(&api, &connection, &inherit_request());
        assert_eq!(
            connection.responses(),
            [
                ProcessResult::failed(ResultCode::InvalidCredentials),
                ProcessResult::created(LAUNCHED_PID),
            ]
        );
    }
}
