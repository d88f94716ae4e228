//! Contracts the messaging backend has to satisfy (Telegram today).

use async_trait::async_trait;

use crate::domain::{
    ChallengeId, IncomingMessage, MessageId, MessageRef, PeerRef, SessionHandle,
};
use crate::Result;

/// Outcome of submitting a login code.
#[derive(Clone, Debug)]
pub enum CodeOutcome {
    /// Fully signed in; the handle is exported session material.
    Authenticated(SessionHandle),
    /// The account has two-step verification enabled and still needs
    /// `submit_password`.
    NeedsPassword,
}

/// Phone-number login handshake.
///
/// One pending login at a time: `request_code` starts a challenge and the
/// following `submit_code` / `submit_password` calls consume it.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn request_code(&self, phone: &str) -> Result<ChallengeId>;

    async fn submit_code(&self, challenge: &ChallengeId, code: &str) -> Result<CodeOutcome>;

    async fn submit_password(&self, password: &str) -> Result<SessionHandle>;

    /// Re-import previously exported session material. Returns whether the
    /// backend still accepts it as an authorized session.
    async fn restore(&self, handle: &SessionHandle) -> Result<bool>;

    async fn sign_out(&self) -> Result<()>;
}

/// Raw call surface of the connected client.
///
/// Application code never calls this directly; every call goes through the
/// gateway so only one request is in flight at a time.
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    /// Resolve a `@username` or numeric id into a sendable peer.
    async fn resolve_recipient(&self, identifier: &str) -> Result<PeerRef>;

    async fn send_message(&self, peer: &PeerRef, text: &str) -> Result<MessageRef>;

    async fn send_reply(
        &self,
        peer: &PeerRef,
        text: &str,
        reply_to: MessageId,
    ) -> Result<MessageRef>;

    /// Group chats the signed-in account participates in.
    async fn list_groups(&self) -> Result<Vec<PeerRef>>;

    /// Messages in `peer` with an id greater than `since`, oldest first.
    /// `None` returns the most recent window so callers can seed a cursor.
    async fn poll_new_messages(
        &self,
        peer: &PeerRef,
        since: Option<MessageId>,
    ) -> Result<Vec<IncomingMessage>>;
}

/// Persistence for exported session material, so a restart can resume the
/// login without a fresh code.
pub trait SessionStore: Send + Sync {
    fn save(&self, handle: &SessionHandle) -> Result<()>;

    fn load(&self) -> Result<Option<SessionHandle>>;

    fn clear(&self) -> Result<()>;
}
