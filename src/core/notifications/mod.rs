mod discord;
mod slack;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{NotificationChannelType, NotificationConfig};
use crate::core::models::ProgressSnapshot;

pub use discord::DiscordNotifier;
pub use slack::SlackNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "percent")]
pub enum EventKind {
    Started,
    Milestone(u8),
    Completed,
    Failed,
}

/// Counts and paths carried with every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventPayload {
    pub project: String,
    pub destination: Option<String>,
    pub files_total: usize,
    pub files_done: usize,
    pub bytes_total: u64,
    pub bytes_copied: u64,
    pub error_count: u64,
    pub duration_secs: u64,
    pub eta_secs: Option<u64>,
    pub error: Option<String>,
}

impl From<&ProgressSnapshot> for EventPayload {
    fn from(snapshot: &ProgressSnapshot) -> Self {
        Self {
            project: snapshot.project.clone().unwrap_or_default(),
            destination: snapshot.destination.clone(),
            files_total: snapshot.files_total,
            files_done: snapshot.files_processed,
            bytes_total: snapshot.bytes_total,
            bytes_copied: snapshot.bytes_copied,
            error_count: snapshot.error_count,
            duration_secs: snapshot.elapsed_secs,
            eta_secs: snapshot.eta_secs,
            error: snapshot.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    pub job_id: String,
    pub kind: EventKind,
    pub payload: EventPayload,
}

/// Trait for notification channel implementations (Slack, Discord, etc.)
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, event: &NotificationEvent) -> Result<()>;
}

/// Factory function to create a notifier based on config
pub fn create_notifier(config: &NotificationConfig) -> Option<Arc<dyn NotificationChannel>> {
    let webhook = config
        .webhook_url
        .as_ref()
        .filter(|url| !url.trim().is_empty())?
        .clone();

    match config.channel {
        NotificationChannelType::None => None,
        NotificationChannelType::Discord => Some(Arc::new(DiscordNotifier::new(webhook))),
        NotificationChannelType::Slack => Some(Arc::new(SlackNotifier::new(webhook))),
    }
}

#[derive(Default)]
struct Fired {
    started: bool,
    terminal: bool,
    milestones: BTreeSet<u8>,
}

/// Per-job notification gate and delivery queue.
///
/// Each lifecycle event and each configured milestone passes the gate at
/// most once. Accepted events are queued in order and delivered by a
/// background worker, so callers never wait on the network.
pub struct NotificationDispatcher {
    job_id: String,
    milestones: Vec<u8>,
    fired: Mutex<Fired>,
    closed: AtomicBool,
    tx: Mutex<Option<mpsc::UnboundedSender<NotificationEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationDispatcher {
    pub fn new(
        job_id: impl Into<String>,
        milestones: &[u8],
        channel: Option<Arc<dyn NotificationChannel>>,
    ) -> Self {
        let mut milestones: Vec<u8> = milestones
            .iter()
            .copied()
            .filter(|m| (1..=100).contains(m))
            .collect();
        milestones.sort_unstable();
        milestones.dedup();

        let (tx, worker) = match channel {
            Some(channel) => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(tokio::spawn(deliver(channel, rx))))
            }
            None => (None, None),
        };

        Self {
            job_id: job_id.into(),
            milestones,
            fired: Mutex::new(Fired::default()),
            closed: AtomicBool::new(false),
            tx: Mutex::new(tx),
            worker: Mutex::new(worker),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Submit an event. Returns whether it passed the at-most-once gate.
    /// Always false once the dispatcher is closed.
    pub async fn notify(&self, kind: EventKind, payload: EventPayload) -> bool {
        if self.closed.load(Ordering::Acquire) {
            debug!(job_id = %self.job_id, kind = ?kind, "Dispatcher closed, ignoring event");
            return false;
        }
        {
            let mut fired = self.fired.lock().await;
            let accepted = match kind {
                EventKind::Started => !std::mem::replace(&mut fired.started, true),
                EventKind::Completed | EventKind::Failed => {
                    !std::mem::replace(&mut fired.terminal, true)
                }
                EventKind::Milestone(m) => {
                    let in_order = fired.milestones.last().is_none_or(|last| m > *last);
                    self.milestones.contains(&m) && in_order && fired.milestones.insert(m)
                }
            };
            if !accepted {
                return false;
            }
        }

        self.enqueue(NotificationEvent {
            job_id: self.job_id.clone(),
            kind,
            payload,
        })
        .await;
        true
    }

    /// Fire every configured milestone at or below `percent` that has not
    /// fired yet, lowest first.
    pub async fn observe_progress(&self, percent: f64, payload: &EventPayload) {
        for &milestone in &self.milestones {
            if f64::from(milestone) > percent {
                break;
            }
            self.notify(EventKind::Milestone(milestone), payload.clone())
                .await;
        }
    }

    pub async fn fired_milestones(&self) -> Vec<u8> {
        self.fired.lock().await.milestones.iter().copied().collect()
    }

    async fn enqueue(&self, event: NotificationEvent) {
        let tx = self.tx.lock().await;
        match tx.as_ref() {
            Some(tx) => {
                debug!(job_id = %event.job_id, kind = ?event.kind, "Queueing notification");
                if tx.send(event).is_err() {
                    warn!(job_id = %self.job_id, "Notification worker gone, dropping event");
                }
            }
            None => info!(
                job_id = %event.job_id,
                kind = ?event.kind,
                "No notification channel configured, dropping event"
            ),
        }
    }

    /// Stop accepting events and wait for the queue to drain.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.tx.lock().await.take();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                error!(error = %e, "Notification worker panicked");
            }
        }
    }
}

async fn deliver(
    channel: Arc<dyn NotificationChannel>,
    mut rx: mpsc::UnboundedReceiver<NotificationEvent>,
) {
    while let Some(event) = rx.recv().await {
        if let Err(first) = channel.notify(&event).await {
            warn!(
                job_id = %event.job_id,
                kind = ?event.kind,
                error = %first,
                "Notification failed, retrying once"
            );
            if let Err(e) = channel.notify(&event).await {
                error!(
                    job_id = %event.job_id,
                    kind = ?event.kind,
                    error = %e,
                    "Notification dropped"
                );
            }
        }
    }
}

pub fn human_size(bytes: f64) -> String {
    let mut value = bytes;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{:.1} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1} PB", value)
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

pub(crate) fn short_id(job_id: &str) -> &str {
    // UUIDv7 ids start with the timestamp; the tail is the unique part
    let start = job_id.len().saturating_sub(8);
    job_id.get(start..).unwrap_or(job_id)
}
