//! Reply monitor: scans incoming messages across the account's groups and
//! the configured target, indexes number signatures, and auto-replies when
//! the target repeats a number.
//!
//! The scan loop runs for the whole authenticated session, independent of
//! any send job. Duplicate delivery from overlapping poll windows is
//! expected; the (peer, message id) dedup set downstream makes ingestion
//! idempotent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::AuthState;
use crate::domain::{IncomingMessage, MessageId, PeerId, PeerRef};
use crate::pattern;
use crate::provider::gateway::ClientGateway;
use crate::Result;

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Upper bound on how many groups take part in one scan pass.
    pub group_scan_limit: usize,
    pub auto_reply_text: String,
}

/// Where a signature was seen, enough to reply to that exact message later.
#[derive(Clone, Debug, PartialEq, Eq)]
struct GroupEntry {
    peer_id: PeerId,
    access_hash: i64,
    msg_id: MessageId,
}

/// An auto-reply decided under the state lock, sent after it is released.
struct PendingReply {
    recipient: PeerId,
    signature: String,
    entry: GroupEntry,
}

/// Counts exposed to status polls.
#[derive(Clone, Debug, Serialize)]
pub struct MonitorSummary {
    pub monitoring: bool,
    pub target: Option<String>,
    pub processed_messages: usize,
    pub indexed_signatures: usize,
    pub replies_received: u64,
    pub duplicates_found: usize,
    pub auto_replies_sent: u64,
}

#[derive(Default)]
struct MonitorState {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
    generation: u64,

    target: Option<PeerRef>,
    /// Peer details for every dialog we have scanned, so a matched entry can
    /// be turned back into a sendable peer.
    peers: HashMap<PeerId, PeerRef>,
    cursors: HashMap<PeerId, MessageId>,
    processed: HashSet<(PeerId, MessageId)>,
    group_numbers: HashMap<String, Vec<GroupEntry>>,
    duplicate_counters: HashMap<PeerId, HashMap<String, u32>>,
    /// Fired (recipient, signature) pairs with the counter value last seen.
    /// Presence alone blocks a second auto-reply for the pair.
    found_matches: HashMap<PeerId, HashMap<String, u32>>,
    replies_received: HashMap<PeerId, u64>,
    auto_replies_sent: u64,
}

impl MonitorState {
    /// Fold a batch of polled messages into the index. Returns the
    /// auto-replies to fire once the lock is released.
    fn ingest(&mut self, batch: Vec<IncomingMessage>) -> Vec<PendingReply> {
        let target_id = self.target.as_ref().map(|t| t.id);
        let mut pending = Vec::new();

        for msg in batch {
            let cursor = self.cursors.entry(msg.peer_id).or_insert(MessageId(0));
            if msg.msg_id > *cursor {
                *cursor = msg.msg_id;
            }
            if !self.processed.insert((msg.peer_id, msg.msg_id)) {
                continue;
            }

            let from_target = target_id == Some(msg.sender_id);
            if from_target {
                *self.replies_received.entry(msg.sender_id).or_default() += 1;
            }

            let Some(sig) = pattern::signature(&msg.text) else {
                continue;
            };
            self.group_numbers
                .entry(sig.clone())
                .or_default()
                .push(GroupEntry {
                    peer_id: msg.peer_id,
                    access_hash: msg.access_hash,
                    msg_id: msg.msg_id,
                });

            if !from_target {
                continue;
            }
            let sender = msg.sender_id;
            let counter = self
                .duplicate_counters
                .entry(sender)
                .or_default()
                .entry(sig.clone())
                .or_insert(0);
            *counter += 1;
            let count = *counter;
            if count < 2 {
                continue;
            }

            let already_fired = self
                .found_matches
                .get(&sender)
                .map_or(false, |m| m.contains_key(&sig));
            // The pair is marked before the reply goes out, so a failed send
            // never leads to a second reply later.
            self.found_matches
                .entry(sender)
                .or_default()
                .insert(sig.clone(), count);
            if already_fired {
                continue;
            }

            match self.find_match(&sig) {
                Some(entry) => pending.push(PendingReply {
                    recipient: sender,
                    signature: sig,
                    entry,
                }),
                None => warn!(signature = %sig, "duplicate detected but no indexed entry"),
            }
        }

        pending
    }

    /// Earliest indexed entry whose signature matches `sig`, preferring an
    /// exact signature over containment matches.
    fn find_match(&self, sig: &str) -> Option<GroupEntry> {
        if let Some(entry) = self.group_numbers.get(sig).and_then(|e| e.first()) {
            return Some(entry.clone());
        }
        let mut keys: Vec<&String> = self
            .group_numbers
            .keys()
            .filter(|key| pattern::signatures_match(key, sig))
            .collect();
        keys.sort();
        keys.first()
            .and_then(|key| self.group_numbers[*key].first())
            .cloned()
    }
}

struct MonitorInner {
    gateway: Arc<ClientGateway>,
    auth: Arc<Mutex<AuthState>>,
    config: MonitorConfig,
    state: Mutex<MonitorState>,
}

#[derive(Clone)]
pub struct ReplyMonitor {
    inner: Arc<MonitorInner>,
}

impl ReplyMonitor {
    pub fn new(
        gateway: Arc<ClientGateway>,
        auth: Arc<Mutex<AuthState>>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                gateway,
                auth,
                config,
                state: Mutex::new(MonitorState::default()),
            }),
        }
    }

    /// Spawn the scan loop. A second call while the loop is alive is a
    /// no-op; the accumulated index survives restarts.
    pub async fn start(&self) -> Result<()> {
        self.inner.auth.lock().await.require_authenticated()?;

        let mut state = self.inner.state.lock().await;
        if state.cancel.is_some() {
            debug!("reply monitor already running");
            return Ok(());
        }

        state.generation += 1;
        let generation = state.generation;
        let cancel = CancellationToken::new();
        state.cancel = Some(cancel.clone());
        let monitor = self.clone();
        state.handle = Some(tokio::spawn(async move {
            monitor.poll_loop(cancel, generation).await;
        }));
        info!("reply monitor started");
        Ok(())
    }

    /// Cancel the loop and wait for the iteration in flight to finish.
    pub async fn stop(&self) {
        let (cancel, handle) = {
            let mut state = self.inner.state.lock().await;
            (state.cancel.take(), state.handle.take())
        };
        let Some(cancel) = cancel else {
            return;
        };
        cancel.cancel();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("reply monitor stopped");
    }

    /// Point duplicate detection at a new recipient. Only the new target's
    /// counters reset; everything indexed so far stays queryable.
    pub async fn set_target(&self, identifier: &str) -> Result<PeerRef> {
        self.inner.auth.lock().await.require_authenticated()?;
        let peer = self.inner.gateway.resolve_recipient(identifier).await?;

        let mut state = self.inner.state.lock().await;
        // Counting restarts for the new target, but pairs that already fired
        // stay fired for the whole monitoring session.
        state.duplicate_counters.insert(peer.id, HashMap::new());
        state.peers.insert(peer.id, peer.clone());
        state.target = Some(peer.clone());
        info!(target = %peer.name, "monitor target set");
        Ok(peer)
    }

    pub async fn summary(&self) -> MonitorSummary {
        let state = self.inner.state.lock().await;
        MonitorSummary {
            monitoring: state.cancel.is_some(),
            target: state.target.as_ref().map(|t| t.name.clone()),
            processed_messages: state.processed.len(),
            indexed_signatures: state.group_numbers.len(),
            replies_received: state.replies_received.values().sum(),
            duplicates_found: state.found_matches.values().map(|m| m.len()).sum(),
            auto_replies_sent: state.auto_replies_sent,
        }
    }

    async fn poll_loop(&self, cancel: CancellationToken, generation: u64) {
        loop {
            if !self.inner.auth.lock().await.is_authenticated {
                info!("session no longer authenticated, reply monitor exiting");
                break;
            }

            if let Err(err) = self.scan_once().await {
                if err.is_disconnected() {
                    warn!("connection lost, reply monitor exiting");
                    self.inner.auth.lock().await.mark_session_lost();
                    break;
                }
                warn!(error = %err, "scan pass failed");
            }

            tokio::select! {
              _ = cancel.cancelled() => break,
              _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
            }
        }

        // Clear the running marker unless a newer loop has already been
        // started in our place.
        let mut state = self.inner.state.lock().await;
        if state.generation == generation {
            state.cancel = None;
            state.handle = None;
        }
    }

    /// One scan pass: every group plus the target's own dialog, newest
    /// cursor forward. The state lock is never held across a provider call.
    async fn scan_once(&self) -> Result<()> {
        let mut peers = self.inner.gateway.list_groups().await?;
        if peers.len() > self.inner.config.group_scan_limit {
            peers.truncate(self.inner.config.group_scan_limit);
        }
        {
            let state = self.inner.state.lock().await;
            if let Some(target) = &state.target {
                if !peers.iter().any(|p| p.id == target.id) {
                    peers.push(target.clone());
                }
            }
        }

        let mut pending = Vec::new();
        for peer in peers {
            let since = {
                let state = self.inner.state.lock().await;
                state.cursors.get(&peer.id).copied()
            };
            let batch = match self.inner.gateway.poll_new_messages(&peer, since).await {
                Ok(batch) => batch,
                Err(err) if err.is_disconnected() => return Err(err),
                Err(err) => {
                    warn!(error = %err, chat = %peer.name, "poll failed");
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }

            let mut state = self.inner.state.lock().await;
            state.peers.insert(peer.id, peer.clone());
            pending.extend(state.ingest(batch));
        }

        for reply in pending {
            self.send_auto_reply(reply).await?;
        }
        Ok(())
    }

    async fn send_auto_reply(&self, reply: PendingReply) -> Result<()> {
        let peer = {
            let state = self.inner.state.lock().await;
            state.peers.get(&reply.entry.peer_id).cloned()
        };
        let Some(peer) = peer else {
            warn!(
                peer = reply.entry.peer_id.0,
                "matched entry has no known peer, skipping auto-reply"
            );
            return Ok(());
        };

        match self
            .inner
            .gateway
            .send_reply(&peer, &self.inner.config.auto_reply_text, reply.entry.msg_id)
            .await
        {
            Ok(_) => {
                info!(
                    signature = %reply.signature,
                    recipient = reply.recipient.0,
                    chat = %peer.name,
                    "auto-reply sent"
                );
                self.inner.state.lock().await.auto_replies_sent += 1;
                Ok(())
            }
            Err(err) if err.is_disconnected() => Err(err),
            Err(err) => {
                warn!(error = %err, "auto-reply failed");
                Ok(())
            }
        }
    }
}
