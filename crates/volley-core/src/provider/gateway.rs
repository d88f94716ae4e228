//! Single-flight gate over the raw provider.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::domain::{IncomingMessage, MessageId, MessageRef, PeerRef};
use crate::provider::port::MessagingProvider;
use crate::Result;

/// Serializes every request to the underlying client.
///
/// The raw client mutates connection state per request and is not safe for
/// unsynchronized concurrent use, so the dispatcher, the reply monitor and
/// ad-hoc web requests all go through this one gate. The gate spans exactly
/// one call: the guard drops on every exit path, success or error, and
/// backoff sleeps always happen outside it.
pub struct ClientGateway {
    inner: Arc<dyn MessagingProvider>,
    gate: Mutex<()>,
}

impl ClientGateway {
    pub fn new(inner: Arc<dyn MessagingProvider>) -> Self {
        Self {
            inner,
            gate: Mutex::new(()),
        }
    }

    pub async fn resolve_recipient(&self, identifier: &str) -> Result<PeerRef> {
        let _gate = self.gate.lock().await;
        self.inner.resolve_recipient(identifier).await
    }

    pub async fn send_message(&self, peer: &PeerRef, text: &str) -> Result<MessageRef> {
        let _gate = self.gate.lock().await;
        self.inner.send_message(peer, text).await
    }

    pub async fn send_reply(
        &self,
        peer: &PeerRef,
        text: &str,
        reply_to: MessageId,
    ) -> Result<MessageRef> {
        let _gate = self.gate.lock().await;
        self.inner.send_reply(peer, text, reply_to).await
    }

    pub async fn list_groups(&self) -> Result<Vec<PeerRef>> {
        let _gate = self.gate.lock().await;
        self.inner.list_groups().await
    }

    pub async fn poll_new_messages(
        &self,
        peer: &PeerRef,
        since: Option<MessageId>,
    ) -> Result<Vec<IncomingMessage>> {
        let _gate = self.gate.lock().await;
        self.inner.poll_new_messages(peer, since).await
    }
}
