//! Bulk send loop: one job at a time, cooperative stop, per-item accounting.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::coordinator::AuthState;
use crate::domain::{PeerRef, SendMode};
use crate::provider::gateway::ClientGateway;
use crate::{Error, Result};

/// Lifecycle of the single send slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// How a finished run ended, reported to the task that spawned it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Cancelled,
    Failed { connection_lost: bool },
}

/// Snapshot served to status polls. Reading it only takes the state lock for
/// the copy, never for provider calls.
#[derive(Clone, Debug, Serialize)]
pub struct SendProgress {
    pub state: JobState,
    pub recipient: Option<String>,
    pub mode: Option<SendMode>,
    pub current_index: usize,
    pub total: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub current_item: Option<String>,
    pub last_item_sent: Option<String>,
    pub rate_per_minute: f64,
    pub eta_seconds: Option<u64>,
    pub started_at: Option<String>,
}

/// A validated job handed back by [`Dispatcher::begin`]. The caller decides
/// where to run it: spawned in production, awaited directly in tests.
#[derive(Clone, Debug)]
pub struct PreparedJob {
    pub peer: PeerRef,
    pub items: Vec<String>,
}

#[derive(Debug)]
struct JobSlot {
    state: JobState,
    recipient: Option<String>,
    mode: Option<SendMode>,
    current_index: usize,
    total: usize,
    success_count: usize,
    fail_count: usize,
    current_item: Option<String>,
    last_item_sent: Option<String>,
    rate_per_minute: f64,
    eta_seconds: Option<u64>,
    started_at: Option<String>,
    should_stop: bool,
}

impl JobSlot {
    fn idle() -> Self {
        Self {
            state: JobState::Idle,
            recipient: None,
            mode: None,
            current_index: 0,
            total: 0,
            success_count: 0,
            fail_count: 0,
            current_item: None,
            last_item_sent: None,
            rate_per_minute: 0.0,
            eta_seconds: None,
            started_at: None,
            should_stop: false,
        }
    }

    fn running(mode: SendMode, total: usize) -> Self {
        Self {
            state: JobState::Running,
            mode: Some(mode),
            total,
            ..Self::idle()
        }
    }
}

enum ItemOutcome {
    Sent,
    Failed,
    Disconnected,
}

/// Owns the send loop state machine. At most one job runs at a time; all
/// provider traffic goes through the shared gateway.
pub struct Dispatcher {
    gateway: Arc<ClientGateway>,
    auth: Arc<Mutex<AuthState>>,
    send_delay: Duration,
    job: Mutex<JobSlot>,
}

impl Dispatcher {
    pub fn new(
        gateway: Arc<ClientGateway>,
        auth: Arc<Mutex<AuthState>>,
        send_delay: Duration,
    ) -> Self {
        Self {
            gateway,
            auth,
            send_delay,
            job: Mutex::new(JobSlot::idle()),
        }
    }

    /// Validate a send request and claim the job slot.
    ///
    /// The slot flips to `Running` before the recipient lookup so a second
    /// request observes `AlreadyRunning` instead of racing this one; a failed
    /// lookup releases the claim as `Failed`.
    pub async fn begin(
        &self,
        recipient: &str,
        mode: SendMode,
        rows: Vec<Vec<String>>,
    ) -> Result<PreparedJob> {
        self.auth.lock().await.require_authenticated()?;

        let items = flatten_items(mode, &rows);
        {
            let mut job = self.job.lock().await;
            if job.state == JobState::Running {
                return Err(Error::AlreadyRunning);
            }
            *job = JobSlot::running(mode, items.len());
        }

        let peer = match self.gateway.resolve_recipient(recipient).await {
            Ok(peer) => peer,
            Err(e) => {
                self.job.lock().await.state = JobState::Failed;
                return Err(e);
            }
        };

        self.job.lock().await.recipient = Some(peer.name.clone());

        Ok(PreparedJob { peer, items })
    }

    /// Drive a prepared job to a terminal state.
    pub async fn run_prepared(&self, prepared: PreparedJob) -> JobOutcome {
        let PreparedJob { peer, items } = prepared;
        let started = Instant::now();
        self.job.lock().await.started_at = Some(Utc::now().to_rfc3339());
        info!(recipient = %peer.name, total = items.len(), "send job started");

        for (i, item) in items.iter().enumerate() {
            if self.job.lock().await.should_stop {
                self.finish(JobState::Cancelled).await;
                return JobOutcome::Cancelled;
            }
            // The monitor or a logout may have invalidated the session while
            // this job was sleeping between items.
            if !self.auth.lock().await.is_authenticated {
                self.finish(JobState::Failed).await;
                return JobOutcome::Failed {
                    connection_lost: false,
                };
            }

            self.job.lock().await.current_item = Some(item.clone());
            let outcome = self.send_one(&peer, item).await;
            let lost = matches!(outcome, ItemOutcome::Disconnected);
            {
                let mut job = self.job.lock().await;
                job.current_index += 1;
                match outcome {
                    ItemOutcome::Sent => {
                        job.success_count += 1;
                        job.last_item_sent = Some(item.clone());
                    }
                    ItemOutcome::Failed | ItemOutcome::Disconnected => job.fail_count += 1,
                }
                job.rate_per_minute = rate_per_minute(job.current_index, started.elapsed());
                job.eta_seconds = eta_seconds(job.total - job.current_index, job.rate_per_minute);
            }

            if lost {
                warn!("connection lost mid-job, a fresh login is required");
                self.auth.lock().await.mark_session_lost();
                self.finish(JobState::Failed).await;
                return JobOutcome::Failed {
                    connection_lost: true,
                };
            }

            if i + 1 < items.len() && !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
        }

        self.finish(JobState::Completed).await;
        JobOutcome::Completed
    }

    /// Ask the running job to stop after the item in flight. Returns whether
    /// a job was actually running.
    pub async fn request_stop(&self) -> bool {
        let mut job = self.job.lock().await;
        if job.state != JobState::Running {
            return false;
        }
        job.should_stop = true;
        true
    }

    pub async fn progress(&self) -> SendProgress {
        let job = self.job.lock().await;
        SendProgress {
            state: job.state,
            recipient: job.recipient.clone(),
            mode: job.mode,
            current_index: job.current_index,
            total: job.total,
            success_count: job.success_count,
            fail_count: job.fail_count,
            current_item: job.current_item.clone(),
            last_item_sent: job.last_item_sent.clone(),
            rate_per_minute: job.rate_per_minute,
            eta_seconds: job.eta_seconds,
            started_at: job.started_at.clone(),
        }
    }

    /// One item through the gateway; a flood wait is honored once and the
    /// item retried, any further error counts as the item's failure. The
    /// backoff sleep happens with the gate released.
    async fn send_one(&self, peer: &PeerRef, text: &str) -> ItemOutcome {
        match self.gateway.send_message(peer, text).await {
            Ok(_) => ItemOutcome::Sent,
            Err(err) => {
                let Some(wait) = err.flood_retry_after() else {
                    return classify_failure(err);
                };
                warn!(seconds = wait.as_secs(), "flood wait before retrying item");
                tokio::time::sleep(wait).await;
                match self.gateway.send_message(peer, text).await {
                    Ok(_) => ItemOutcome::Sent,
                    Err(retry_err) => classify_failure(retry_err),
                }
            }
        }
    }

    async fn finish(&self, state: JobState) {
        let mut job = self.job.lock().await;
        job.state = state;
        job.current_item = None;
        info!(
            state = ?state,
            sent = job.success_count,
            failed = job.fail_count,
            total = job.total,
            "send job finished"
        );
    }
}

fn classify_failure(err: Error) -> ItemOutcome {
    if err.is_disconnected() {
        ItemOutcome::Disconnected
    } else {
        warn!(error = %err, "item send failed");
        ItemOutcome::Failed
    }
}

/// Expand pasted rows into the ordered outbound payloads for a mode.
///
/// Column mode sends every cell as its own message, walking each row left to
/// right; row mode joins a row's cells with single spaces into one message.
/// Blank cells and blank rows are skipped.
fn flatten_items(mode: SendMode, rows: &[Vec<String>]) -> Vec<String> {
    match mode {
        SendMode::Columns => rows
            .iter()
            .flatten()
            .map(|cell| cell.trim())
            .filter(|cell| !cell.is_empty())
            .map(str::to_string)
            .collect(),
        SendMode::Rows => rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| cell.trim())
                    .filter(|cell| !cell.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|line| !line.is_empty())
            .collect(),
    }
}

/// Send rate in messages per minute measured over the whole job so far.
fn rate_per_minute(processed: usize, elapsed: Duration) -> f64 {
    let minutes = elapsed.as_secs_f64() / 60.0;
    if processed == 0 || minutes <= 0.0 {
        return 0.0;
    }
    processed as f64 / minutes
}

fn eta_seconds(remaining: usize, rate_per_minute: f64) -> Option<u64> {
    if remaining == 0 {
        return Some(0);
    }
    if rate_per_minute <= 0.0 {
        return None;
    }
    Some((remaining as f64 / rate_per_minute * 60.0).round() as u64)
}
