//! Telegram adapter (grammers, MTProto user account).
//!
//! This crate implements the `volley-core` auth and messaging ports over a
//! real user session, the same account an operator would drive by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use grammers_client::types::{Chat, LoginToken, PasswordToken};
use grammers_client::{Client, Config, InputMessage, InvocationError, SignInError};
use grammers_session::{PackedChat, PackedType, Session};
use tokio::sync::Mutex;
use tracing::info;

use volley_core::domain::{
    ChallengeId, IncomingMessage, MessageId, MessageRef, PeerId, PeerKind, PeerRef, SessionHandle,
};
use volley_core::errors::{AuthError, ProviderError};
use volley_core::provider::port::{AuthProvider, CodeOutcome, MessagingProvider};
use volley_core::{Error, Result};

/// An issued login challenge waiting for its code to come back.
struct PendingLogin {
    challenge: ChallengeId,
    token: LoginToken,
}

pub struct TelegramProvider {
    client: Client,
    /// Session material this client was booted with, if any. `restore` only
    /// accepts that exact handle; anything else needs a reconnect.
    boot_handle: Option<SessionHandle>,
    /// How many messages one poll fetches per dialog. Also the seed window on
    /// the first poll after a cursor reset.
    fetch_limit: usize,
    pending_code: Mutex<Option<PendingLogin>>,
    pending_password: Mutex<Option<PasswordToken>>,
    next_challenge: AtomicU64,
}

impl TelegramProvider {
    /// Connect to Telegram, resuming from `saved` session material when given.
    pub async fn connect(
        api_id: i32,
        api_hash: &str,
        saved: Option<&SessionHandle>,
        fetch_limit: usize,
    ) -> Result<Self> {
        let session = match saved {
            Some(handle) => decode_session(handle)?,
            None => Session::new(),
        };

        let client = Client::connect(Config {
            session,
            api_id,
            api_hash: api_hash.to_string(),
            params: Default::default(),
        })
        .await
        .map_err(|err| Error::External(format!("telegram connect failed: {err}")))?;

        info!("connected to telegram");
        Ok(Self {
            client,
            boot_handle: saved.cloned(),
            fetch_limit,
            pending_code: Mutex::new(None),
            pending_password: Mutex::new(None),
            next_challenge: AtomicU64::new(1),
        })
    }

    /// Export the live session as an opaque handle.
    fn current_handle(&self) -> SessionHandle {
        SessionHandle(hex::encode(self.client.session().save()))
    }

    /// Numeric identifiers carry no access hash, so they can only be matched
    /// against dialogs the account already has open.
    async fn find_dialog(&self, id: i64) -> Result<Option<PeerRef>> {
        let mut dialogs = self.client.iter_dialogs();
        while let Some(dialog) = dialogs.next().await.map_err(map_invocation)? {
            if dialog.chat().id() == id {
                return Ok(Some(peer_ref_from_chat(dialog.chat(), None)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl AuthProvider for TelegramProvider {
    async fn request_code(&self, phone: &str) -> Result<ChallengeId> {
        let token = self
            .client
            .request_login_code(phone)
            .await
            .map_err(map_invocation)?;

        let challenge = ChallengeId(format!(
            "login-{}",
            self.next_challenge.fetch_add(1, Ordering::SeqCst)
        ));
        *self.pending_code.lock().await = Some(PendingLogin {
            challenge: challenge.clone(),
            token,
        });
        self.pending_password.lock().await.take();
        Ok(challenge)
    }

    async fn submit_code(&self, challenge: &ChallengeId, code: &str) -> Result<CodeOutcome> {
        let mut guard = self.pending_code.lock().await;
        let pending = guard.take().ok_or(Error::NoPendingLogin)?;
        if pending.challenge != *challenge {
            return Err(Error::NoPendingLogin);
        }

        match self.client.sign_in(&pending.token, code).await {
            Ok(_) => Ok(CodeOutcome::Authenticated(self.current_handle())),
            Err(SignInError::PasswordRequired(token)) => {
                *self.pending_password.lock().await = Some(token);
                Ok(CodeOutcome::NeedsPassword)
            }
            Err(err) => {
                // A wrong code or a transient failure keeps the login token
                // usable, so put it back for another attempt.
                if matches!(&err, SignInError::InvalidCode | SignInError::Other(_)) {
                    *guard = Some(pending);
                }
                Err(map_sign_in(err))
            }
        }
    }

    async fn submit_password(&self, password: &str) -> Result<SessionHandle> {
        let token = self
            .pending_password
            .lock()
            .await
            .take()
            .ok_or(Error::NoPendingLogin)?;

        match self.client.check_password(token, password).await {
            Ok(_) => {
                self.pending_code.lock().await.take();
                Ok(self.current_handle())
            }
            Err(err) => Err(map_sign_in(err)),
        }
    }

    async fn restore(&self, handle: &SessionHandle) -> Result<bool> {
        // Session material is applied at connect time, so a handle this
        // client was not booted with cannot become authorized after the fact.
        if self.boot_handle.as_ref() != Some(handle) {
            return Ok(false);
        }
        self.client.is_authorized().await.map_err(map_invocation)
    }

    async fn sign_out(&self) -> Result<()> {
        self.client.sign_out().await.map_err(map_invocation)?;
        info!("signed out");
        Ok(())
    }
}

#[async_trait]
impl MessagingProvider for TelegramProvider {
    async fn resolve_recipient(&self, identifier: &str) -> Result<PeerRef> {
        let raw = identifier.trim();
        if raw.is_empty() {
            return Err(ProviderError::InvalidTarget(identifier.to_string()).into());
        }

        if let Ok(id) = raw.parse::<i64>() {
            return match self.find_dialog(id).await? {
                Some(peer) => Ok(peer),
                None => Err(ProviderError::InvalidTarget(raw.to_string()).into()),
            };
        }

        let username = normalize_username(raw);
        match self
            .client
            .resolve_username(username)
            .await
            .map_err(map_invocation)?
        {
            Some(chat) => Ok(peer_ref_from_chat(&chat, Some(raw))),
            None => Err(ProviderError::InvalidTarget(raw.to_string()).into()),
        }
    }

    async fn send_message(&self, peer: &PeerRef, text: &str) -> Result<MessageRef> {
        let sent = self
            .client
            .send_message(packed_peer(peer), text)
            .await
            .map_err(map_invocation)?;
        Ok(MessageRef {
            peer_id: peer.id,
            message_id: MessageId(sent.id()),
        })
    }

    async fn send_reply(
        &self,
        peer: &PeerRef,
        text: &str,
        reply_to: MessageId,
    ) -> Result<MessageRef> {
        let message = InputMessage::text(text).reply_to(Some(reply_to.0));
        let sent = self
            .client
            .send_message(packed_peer(peer), message)
            .await
            .map_err(map_invocation)?;
        Ok(MessageRef {
            peer_id: peer.id,
            message_id: MessageId(sent.id()),
        })
    }

    async fn list_groups(&self) -> Result<Vec<PeerRef>> {
        let mut groups = Vec::new();
        let mut dialogs = self.client.iter_dialogs();
        while let Some(dialog) = dialogs.next().await.map_err(map_invocation)? {
            let peer = peer_ref_from_chat(dialog.chat(), None);
            if peer.kind == PeerKind::Group {
                groups.push(peer);
            }
        }
        Ok(groups)
    }

    async fn poll_new_messages(
        &self,
        peer: &PeerRef,
        since: Option<MessageId>,
    ) -> Result<Vec<IncomingMessage>> {
        let mut iter = self
            .client
            .iter_messages(packed_peer(peer))
            .limit(self.fetch_limit);

        // The server yields newest first. Stop at the cursor, then flip the
        // batch so callers see oldest first.
        let mut batch = Vec::new();
        while let Some(message) = iter.next().await.map_err(map_invocation)? {
            let id = MessageId(message.id());
            if let Some(cursor) = since {
                if id <= cursor {
                    break;
                }
            }
            let sender_id = message
                .sender()
                .map(|sender| sender.id())
                .unwrap_or(peer.id.0);
            batch.push(IncomingMessage {
                peer_id: peer.id,
                msg_id: id,
                sender_id: PeerId(sender_id),
                text: message.text().to_string(),
                access_hash: peer.access_hash,
            });
        }
        batch.reverse();
        Ok(batch)
    }
}

fn decode_session(handle: &SessionHandle) -> Result<Session> {
    let bytes = hex::decode(&handle.0)
        .map_err(|err| Error::External(format!("saved session is not valid hex: {err}")))?;
    Session::load(&bytes).map_err(|err| Error::External(format!("saved session is corrupt: {err}")))
}

fn normalize_username(raw: &str) -> &str {
    raw.trim_start_matches("https://t.me/")
        .trim_start_matches("t.me/")
        .trim_start_matches('@')
}

fn peer_kind(ty: PackedType) -> PeerKind {
    match ty {
        PackedType::User | PackedType::Bot => PeerKind::User,
        PackedType::Chat | PackedType::Megagroup => PeerKind::Group,
        PackedType::Broadcast | PackedType::Gigagroup => PeerKind::Channel,
    }
}

fn peer_ref_from_chat(chat: &Chat, fallback_name: Option<&str>) -> PeerRef {
    let packed = chat.pack();
    let name = chat
        .username()
        .map(|username| format!("@{username}"))
        .or_else(|| fallback_name.map(str::to_string))
        .unwrap_or_else(|| packed.id.to_string());
    PeerRef {
        id: PeerId(packed.id),
        access_hash: packed.access_hash.unwrap_or(0),
        kind: peer_kind(packed.ty),
        name,
    }
}

/// Rebuild the provider-side peer from our stored ids. Basic groups carry no
/// access hash, which is how they are told apart from megagroups here.
fn packed_peer(peer: &PeerRef) -> PackedChat {
    let ty = match peer.kind {
        PeerKind::User => PackedType::User,
        PeerKind::Group if peer.access_hash == 0 => PackedType::Chat,
        PeerKind::Group => PackedType::Megagroup,
        PeerKind::Channel => PackedType::Broadcast,
    };
    PackedChat {
        ty,
        id: peer.id.0,
        access_hash: (peer.access_hash != 0).then_some(peer.access_hash),
    }
}

fn map_invocation(err: InvocationError) -> Error {
    match err {
        InvocationError::Rpc(rpc) => classify_rpc(rpc.code, &rpc.name, rpc.value),
        InvocationError::Dropped => ProviderError::Disconnected.into(),
        other => ProviderError::Unknown(other.to_string()).into(),
    }
}

fn map_sign_in(err: SignInError) -> Error {
    match err {
        SignInError::InvalidCode => AuthError::InvalidCode.into(),
        SignInError::InvalidPassword => AuthError::InvalidPassword.into(),
        SignInError::PasswordRequired(_) => AuthError::NeedsPassword.into(),
        SignInError::SignUpRequired { .. } => {
            ProviderError::Unknown("phone number has no registered account".to_string()).into()
        }
        SignInError::Other(err) => map_invocation(err),
    }
}

/// Translate a raw RPC error into the domain error taxonomy.
fn classify_rpc(code: i32, name: &str, value: Option<u32>) -> Error {
    if name.starts_with("FLOOD") {
        return ProviderError::Flood {
            retry_after: Duration::from_secs(u64::from(value.unwrap_or(60))),
        }
        .into();
    }
    match name {
        "PHONE_NUMBER_INVALID" | "PHONE_NUMBER_BANNED" => AuthError::InvalidPhoneNumber.into(),
        "PHONE_CODE_INVALID" | "PHONE_CODE_EXPIRED" | "PHONE_CODE_EMPTY" => {
            AuthError::InvalidCode.into()
        }
        "PASSWORD_HASH_INVALID" => AuthError::InvalidPassword.into(),
        "SESSION_PASSWORD_NEEDED" => AuthError::NeedsPassword.into(),
        _ if code == 401 => ProviderError::Disconnected.into(),
        _ if name.starts_with("USERNAME") || name.starts_with("PEER") || name.starts_with("CHAT_ID")
        || name.starts_with("CHANNEL") =>
        {
            ProviderError::InvalidTarget(name.to_string()).into()
        }
        _ => ProviderError::Unknown(format!("rpc error {code}: {name}")).into(),
    }
}
