//! Auth-state transitions and process-wide orchestration.
//!
//! The coordinator is the only component that mutates [`AuthState`]; the
//! dispatcher and monitor read it (and invalidate it when the connection
//! dies) through the shared handle created in `main`.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, JobOutcome, SendProgress};
use crate::domain::{ChallengeId, PeerRef, SendMode, SessionHandle};
use crate::errors::AuthError;
use crate::monitor::{MonitorSummary, ReplyMonitor};
use crate::provider::port::{AuthProvider, CodeOutcome, SessionStore};
use crate::{Error, Result};

/// Process-wide authentication state. One instance lives behind an
/// `Arc<Mutex<_>>` shared by the coordinator, dispatcher and monitor.
#[derive(Debug, Default)]
pub struct AuthState {
    pub code_requested: bool,
    pub is_authenticated: bool,
    /// Set when the provider asked for the account's two-step password.
    pub needs_password: bool,
    pub phone_number: Option<String>,
    pub challenge: Option<ChallengeId>,
    pub session: Option<SessionHandle>,
    /// Session material the monitor loop operates under. Mirrors `session`
    /// today; kept separate so the monitor could carry its own connection.
    pub monitoring_session: Option<SessionHandle>,
}

impl AuthState {
    /// Invalidate everything tied to the live connection. A fresh handshake
    /// is required afterwards; the phone number is kept for convenience.
    pub fn mark_session_lost(&mut self) {
        self.is_authenticated = false;
        self.code_requested = false;
        self.needs_password = false;
        self.challenge = None;
        self.session = None;
        self.monitoring_session = None;
    }

    /// Gate for background work. Names the handshake step still missing
    /// when the account is not signed in.
    pub fn require_authenticated(&self) -> Result<()> {
        if self.is_authenticated {
            Ok(())
        } else if self.needs_password {
            Err(AuthError::NeedsPassword.into())
        } else {
            Err(Error::NotAuthenticated)
        }
    }
}

/// Where the login handshake stands after a code submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginStep {
    Authenticated,
    NeedsPassword,
}

/// Combined view for the status endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub authenticated: bool,
    pub code_requested: bool,
    pub needs_password: bool,
    pub phone_number: Option<String>,
    pub send: SendProgress,
    pub monitor: MonitorSummary,
}

pub struct SessionCoordinator {
    auth_provider: Arc<dyn AuthProvider>,
    store: Arc<dyn SessionStore>,
    auth: Arc<Mutex<AuthState>>,
    dispatcher: Arc<Dispatcher>,
    monitor: ReplyMonitor,
}

impl SessionCoordinator {
    pub fn new(
        auth_provider: Arc<dyn AuthProvider>,
        store: Arc<dyn SessionStore>,
        auth: Arc<Mutex<AuthState>>,
        dispatcher: Arc<Dispatcher>,
        monitor: ReplyMonitor,
    ) -> Self {
        Self {
            auth_provider,
            store,
            auth,
            dispatcher,
            monitor,
        }
    }

    /// Step 1 of the handshake: ask the provider to text a login code.
    pub async fn request_code(&self, phone: &str) -> Result<()> {
        let phone = phone.trim();
        if phone.is_empty() {
            return Err(AuthError::InvalidPhoneNumber.into());
        }

        let challenge = self.auth_provider.request_code(phone).await?;

        let mut auth = self.auth.lock().await;
        auth.code_requested = true;
        auth.phone_number = Some(phone.to_string());
        auth.challenge = Some(challenge);
        info!("login code requested");
        Ok(())
    }

    /// Step 2: submit the code. May complete the login or ask for the
    /// account's two-step password.
    pub async fn submit_code(&self, code: &str) -> Result<LoginStep> {
        let challenge = {
            let auth = self.auth.lock().await;
            auth.challenge.clone().ok_or(Error::NoPendingLogin)?
        };

        match self.auth_provider.submit_code(&challenge, code).await? {
            CodeOutcome::Authenticated(handle) => {
                self.finish_login(handle).await;
                Ok(LoginStep::Authenticated)
            }
            CodeOutcome::NeedsPassword => {
                self.auth.lock().await.needs_password = true;
                info!("two-step password required");
                Ok(LoginStep::NeedsPassword)
            }
        }
    }

    /// Step 3, only for accounts with two-step verification.
    pub async fn submit_password(&self, password: &str) -> Result<()> {
        let handle = self.auth_provider.submit_password(password).await?;
        self.finish_login(handle).await;
        Ok(())
    }

    /// Try to resume from persisted session material at boot. Any failure
    /// here only means the process starts signed out; it is never fatal.
    /// Returns whether a session was restored.
    pub async fn restore(&self) -> bool {
        let handle = match self.store.load() {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                debug!("no saved session");
                return false;
            }
            Err(err) => {
                warn!(error = %err, "could not read stored session, starting signed out");
                return false;
            }
        };

        match self.auth_provider.restore(&handle).await {
            Ok(true) => {}
            Ok(false) => {
                info!("saved session rejected, fresh login required");
                if let Err(err) = self.store.clear() {
                    warn!(error = %err, "failed to drop rejected session");
                }
                return false;
            }
            // A transient failure keeps the stored handle for the next boot.
            Err(err) => {
                warn!(error = %err, "session restore failed, starting signed out");
                return false;
            }
        }

        {
            let mut auth = self.auth.lock().await;
            auth.is_authenticated = true;
            auth.session = Some(handle.clone());
            auth.monitoring_session = Some(handle);
        }
        self.start_monitor().await;
        info!("resumed saved session");
        true
    }

    /// Tear down the signed-in session: cancel any running send job, stop
    /// the monitor, sign out at the provider, and forget all session state.
    pub async fn logout(&self) -> Result<()> {
        self.dispatcher.request_stop().await;
        self.monitor.stop().await;

        if let Err(err) = self.auth_provider.sign_out().await {
            warn!(error = %err, "provider sign-out failed");
        }
        if let Err(err) = self.store.clear() {
            warn!(error = %err, "failed to clear stored session");
        }

        *self.auth.lock().await = AuthState::default();
        info!("logged out");
        Ok(())
    }

    /// Accept a send request and run it in the background. The handle
    /// resolves to the job's outcome; callers that only need the accept or
    /// reject decision can drop it.
    pub async fn start_send(
        &self,
        recipient: &str,
        mode: SendMode,
        rows: Vec<Vec<String>>,
    ) -> Result<JoinHandle<JobOutcome>> {
        let prepared = self.dispatcher.begin(recipient, mode, rows).await?;

        let dispatcher = self.dispatcher.clone();
        let monitor = self.monitor.clone();
        Ok(tokio::spawn(async move {
            let outcome = dispatcher.run_prepared(prepared).await;
            if let JobOutcome::Failed {
                connection_lost: true,
            } = outcome
            {
                // The session is gone; the monitor cannot outlive it.
                monitor.stop().await;
            }
            outcome
        }))
    }

    /// Ask the active job to stop. Returns whether one was running.
    pub async fn stop_send(&self) -> bool {
        self.dispatcher.request_stop().await
    }

    pub async fn set_monitor_target(&self, identifier: &str) -> Result<PeerRef> {
        self.monitor.set_target(identifier).await
    }

    pub async fn status(&self) -> StatusSnapshot {
        let (authenticated, code_requested, needs_password, phone_number) = {
            let auth = self.auth.lock().await;
            (
                auth.is_authenticated,
                auth.code_requested,
                auth.needs_password,
                auth.phone_number.clone(),
            )
        };
        StatusSnapshot {
            authenticated,
            code_requested,
            needs_password,
            phone_number,
            send: self.dispatcher.progress().await,
            monitor: self.monitor.summary().await,
        }
    }

    async fn finish_login(&self, handle: SessionHandle) {
        {
            let mut auth = self.auth.lock().await;
            auth.is_authenticated = true;
            auth.code_requested = false;
            auth.needs_password = false;
            auth.challenge = None;
            auth.session = Some(handle.clone());
            auth.monitoring_session = Some(handle.clone());
        }

        // Persisting is best effort: a full disk should not undo a login.
        if let Err(err) = self.store.save(&handle) {
            warn!(error = %err, "failed to persist session");
        }

        self.start_monitor().await;
        info!("authenticated");
    }

    async fn start_monitor(&self) {
        if let Err(err) = self.monitor.start().await {
            warn!(error = %err, "reply monitor failed to start");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::dispatch::JobState;
    use crate::domain::{IncomingMessage, MessageId, MessageRef, PeerId, PeerKind};
    use crate::errors::ProviderError;
    use crate::monitor::MonitorConfig;
    use crate::provider::gateway::ClientGateway;
    use crate::provider::port::MessagingProvider;

    /// Auth port with scripted behavior: code "bad" and password "bad" are
    /// rejected, `needs_password` forces the two-step branch, `restore_fails`
    /// makes restore validation error out.
    #[derive(Default)]
    struct FakeAuth {
        needs_password: bool,
        restore_ok: bool,
        restore_fails: bool,
        sign_outs: AtomicUsize,
    }

    #[async_trait]
    impl AuthProvider for FakeAuth {
        async fn request_code(&self, phone: &str) -> Result<ChallengeId> {
            Ok(ChallengeId(format!("{phone}-challenge")))
        }

        async fn submit_code(
            &self,
            _challenge: &ChallengeId,
            code: &str,
        ) -> Result<CodeOutcome> {
            if code == "bad" {
                return Err(AuthError::InvalidCode.into());
            }
            if self.needs_password {
                return Ok(CodeOutcome::NeedsPassword);
            }
            Ok(CodeOutcome::Authenticated(SessionHandle("fresh".into())))
        }

        async fn submit_password(&self, password: &str) -> Result<SessionHandle> {
            if password == "bad" {
                return Err(AuthError::InvalidPassword.into());
            }
            Ok(SessionHandle("after-password".into()))
        }

        async fn restore(&self, _handle: &SessionHandle) -> Result<bool> {
            if self.restore_fails {
                return Err(Error::External("mtproto unreachable".into()));
            }
            Ok(self.restore_ok)
        }

        async fn sign_out(&self) -> Result<()> {
            self.sign_outs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// In-memory store; `fail_loads` makes every load error out like an
    /// unreadable session file.
    #[derive(Default)]
    struct MemoryStore {
        saved: StdMutex<Option<SessionHandle>>,
        fail_loads: bool,
    }

    impl SessionStore for MemoryStore {
        fn save(&self, handle: &SessionHandle) -> Result<()> {
            *self.saved.lock().unwrap() = Some(handle.clone());
            Ok(())
        }

        fn load(&self) -> Result<Option<SessionHandle>> {
            if self.fail_loads {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "session file unreadable",
                )
                .into());
            }
            Ok(self.saved.lock().unwrap().clone())
        }

        fn clear(&self) -> Result<()> {
            *self.saved.lock().unwrap() = None;
            Ok(())
        }
    }

    /// Messaging port that accepts everything; `disconnect_sends` makes
    /// every send fail as a dead connection.
    #[derive(Default)]
    struct QuietProvider {
        next_id: AtomicI32,
        sends: StdMutex<Vec<String>>,
        disconnect_sends: bool,
    }

    #[async_trait]
    impl MessagingProvider for QuietProvider {
        async fn resolve_recipient(&self, identifier: &str) -> Result<PeerRef> {
            Ok(PeerRef {
                id: PeerId(1),
                access_hash: 0,
                kind: PeerKind::User,
                name: identifier.to_string(),
            })
        }

        async fn send_message(&self, peer: &PeerRef, text: &str) -> Result<MessageRef> {
            if self.disconnect_sends {
                return Err(ProviderError::Disconnected.into());
            }
            self.sends.lock().unwrap().push(text.to_string());
            Ok(MessageRef {
                peer_id: peer.id,
                message_id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
            })
        }

        async fn send_reply(
            &self,
            peer: &PeerRef,
            _text: &str,
            _reply_to: MessageId,
        ) -> Result<MessageRef> {
            Ok(MessageRef {
                peer_id: peer.id,
                message_id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
            })
        }

        async fn list_groups(&self) -> Result<Vec<PeerRef>> {
            Ok(Vec::new())
        }

        async fn poll_new_messages(
            &self,
            _peer: &PeerRef,
            _since: Option<MessageId>,
        ) -> Result<Vec<IncomingMessage>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        coordinator: SessionCoordinator,
        auth_port: Arc<FakeAuth>,
        store: Arc<MemoryStore>,
        provider: Arc<QuietProvider>,
        auth: Arc<Mutex<AuthState>>,
    }

    fn fixture_full(auth_port: FakeAuth, provider: QuietProvider, store: MemoryStore) -> Fixture {
        let auth_port = Arc::new(auth_port);
        let store = Arc::new(store);
        let provider = Arc::new(provider);
        let auth = Arc::new(Mutex::new(AuthState::default()));
        let gateway = Arc::new(ClientGateway::new(provider.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            gateway.clone(),
            auth.clone(),
            Duration::ZERO,
        ));
        let monitor = ReplyMonitor::new(
            gateway,
            auth.clone(),
            MonitorConfig {
                poll_interval: Duration::from_secs(3600),
                group_scan_limit: 50,
                auto_reply_text: "got it".to_string(),
            },
        );
        let coordinator = SessionCoordinator::new(
            auth_port.clone(),
            store.clone(),
            auth.clone(),
            dispatcher,
            monitor,
        );
        Fixture {
            coordinator,
            auth_port,
            store,
            provider,
            auth,
        }
    }

    fn fixture_with(auth_port: FakeAuth, provider: QuietProvider) -> Fixture {
        fixture_full(auth_port, provider, MemoryStore::default())
    }

    fn fixture() -> Fixture {
        fixture_with(FakeAuth::default(), QuietProvider::default())
    }

    #[tokio::test]
    async fn code_login_authenticates_and_starts_monitoring() {
        let f = fixture();

        f.coordinator.request_code("+15551234567").await.unwrap();
        assert!(f.auth.lock().await.code_requested);

        let step = f.coordinator.submit_code("1234").await.unwrap();
        assert_eq!(step, LoginStep::Authenticated);

        let status = f.coordinator.status().await;
        assert!(status.authenticated);
        assert!(status.monitor.monitoring);
        assert_eq!(
            f.store.saved.lock().unwrap().clone(),
            Some(SessionHandle("fresh".into()))
        );

        f.coordinator.logout().await.unwrap();
        let status = f.coordinator.status().await;
        assert!(!status.authenticated);
        assert!(!status.monitor.monitoring);
        assert!(f.store.saved.lock().unwrap().is_none());
        assert_eq!(f.auth_port.sign_outs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn two_step_login_requires_the_password() {
        let f = fixture_with(
            FakeAuth {
                needs_password: true,
                ..FakeAuth::default()
            },
            QuietProvider::default(),
        );

        f.coordinator.request_code("+15551234567").await.unwrap();
        let step = f.coordinator.submit_code("1234").await.unwrap();
        assert_eq!(step, LoginStep::NeedsPassword);

        let status = f.coordinator.status().await;
        assert!(!status.authenticated);
        assert!(status.needs_password);

        // With the password still owed, background work names the gap.
        let err = f
            .coordinator
            .start_send("@peer", SendMode::Rows, vec![vec!["1".into()]])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::NeedsPassword)));

        f.coordinator.submit_password("hunter2").await.unwrap();
        let status = f.coordinator.status().await;
        assert!(status.authenticated);
        assert!(!status.needs_password);
        assert!(status.monitor.monitoring);
    }

    #[tokio::test]
    async fn wrong_code_keeps_the_handshake_open() {
        let f = fixture();
        f.coordinator.request_code("+15551234567").await.unwrap();

        let err = f.coordinator.submit_code("bad").await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::InvalidCode)));

        let auth = f.auth.lock().await;
        assert!(!auth.is_authenticated);
        assert!(auth.code_requested);
        assert!(auth.challenge.is_some());
    }

    #[tokio::test]
    async fn submitting_a_code_without_a_request_is_rejected() {
        let f = fixture();
        let err = f.coordinator.submit_code("1234").await.unwrap_err();
        assert!(matches!(err, Error::NoPendingLogin));
    }

    #[tokio::test]
    async fn blank_phone_numbers_are_rejected() {
        let f = fixture();
        let err = f.coordinator.request_code("  ").await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::InvalidPhoneNumber)));
    }

    #[tokio::test]
    async fn restore_resumes_an_accepted_session() {
        let f = fixture_with(
            FakeAuth {
                restore_ok: true,
                ..FakeAuth::default()
            },
            QuietProvider::default(),
        );
        f.store
            .save(&SessionHandle("persisted".into()))
            .unwrap();

        assert!(f.coordinator.restore().await);
        let status = f.coordinator.status().await;
        assert!(status.authenticated);
        assert!(status.monitor.monitoring);
    }

    #[tokio::test]
    async fn rejected_restore_clears_the_stored_session() {
        let f = fixture();
        f.store.save(&SessionHandle("stale".into())).unwrap();

        assert!(!f.coordinator.restore().await);
        assert!(!f.coordinator.status().await.authenticated);
        assert!(f.store.saved.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn restore_errors_boot_the_process_signed_out() {
        // An unreadable store is logged and skipped, never fatal.
        let f = fixture_full(
            FakeAuth::default(),
            QuietProvider::default(),
            MemoryStore {
                fail_loads: true,
                ..MemoryStore::default()
            },
        );
        assert!(!f.coordinator.restore().await);
        let status = f.coordinator.status().await;
        assert!(!status.authenticated);
        assert!(!status.monitor.monitoring);

        // A provider failure during validation keeps the stored handle for
        // the next boot and the process stays signed out.
        let f = fixture_with(
            FakeAuth {
                restore_fails: true,
                ..FakeAuth::default()
            },
            QuietProvider::default(),
        );
        f.store.save(&SessionHandle("persisted".into())).unwrap();
        assert!(!f.coordinator.restore().await);
        assert!(!f.coordinator.status().await.authenticated);
        assert!(f.store.saved.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn send_job_runs_to_completion_through_the_coordinator() {
        let f = fixture();
        f.coordinator.request_code("+15551234567").await.unwrap();
        f.coordinator.submit_code("1234").await.unwrap();

        let handle = f
            .coordinator
            .start_send(
                "recipient",
                SendMode::Columns,
                vec![vec!["1".to_string(), "2".to_string()]],
            )
            .await
            .unwrap();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let status = f.coordinator.status().await;
        assert_eq!(status.send.state, JobState::Completed);
        assert_eq!(status.send.success_count, 2);
        assert_eq!(f.provider.sends.lock().unwrap().clone(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn fatal_send_disconnect_stops_monitoring_too() {
        let f = fixture_with(
            FakeAuth::default(),
            QuietProvider {
                disconnect_sends: true,
                ..QuietProvider::default()
            },
        );
        f.coordinator.request_code("+15551234567").await.unwrap();
        f.coordinator.submit_code("1234").await.unwrap();
        assert!(f.coordinator.status().await.monitor.monitoring);

        let handle = f
            .coordinator
            .start_send("recipient", SendMode::Columns, vec![vec!["1".to_string()]])
            .await
            .unwrap();
        let outcome = handle.await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                connection_lost: true
            }
        );

        let status = f.coordinator.status().await;
        assert!(!status.authenticated);
        assert!(!status.monitor.monitoring);
    }

    #[tokio::test]
    async fn send_requires_authentication() {
        let f = fixture();
        let err = f
            .coordinator
            .start_send("recipient", SendMode::Rows, vec![vec!["1".to_string()]])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated));
    }
}
