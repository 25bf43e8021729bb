//! Live progress derived from a job's counters.
//!
//! Progress is computed on demand from the atomics the engine publishes and
//! is NOT persisted. Only state transitions reach the database.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::broadcast::StatusBroadcaster;
use crate::core::job::TransferJob;
use crate::core::models::{JobState, ProgressSnapshot};
use crate::core::notifications::{EventPayload, NotificationDispatcher};
use crate::logging::ProgressLog;

/// EWMA smoothing factor applied to each interval's rate.
pub const SMOOTHING_FACTOR: f64 = 0.3;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Share of `bytes_total` held by files whose copy completed. Milestones are
/// measured against this; bytes of the file in flight do not count.
pub fn committed_percent(bytes_copied: u64, bytes_total: u64) -> f64 {
    if bytes_total == 0 {
        return 0.0;
    }
    (bytes_copied as f64 / bytes_total as f64 * 100.0).min(100.0)
}

/// Turns raw byte counters into percent, throughput and ETA.
pub struct ProgressTracker {
    alpha: f64,
    last: Option<(Instant, u64)>,
    throughput: Option<f64>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            alpha: SMOOTHING_FACTOR,
            last: None,
            throughput: None,
        }
    }

    /// Smoothed bytes/sec, zero until two samples have been taken.
    pub fn throughput(&self) -> f64 {
        self.throughput.unwrap_or(0.0)
    }

    pub fn sample(&mut self, job: &TransferJob) -> ProgressSnapshot {
        self.sample_at(job, Instant::now())
    }

    /// Timed sample: folds the bytes moved since the previous sample into the
    /// throughput estimate, then builds the snapshot.
    pub fn sample_at(&mut self, job: &TransferJob, now: Instant) -> ProgressSnapshot {
        let moved = job.bytes_copied() + job.in_flight_bytes();

        if let Some((then, previous)) = self.last {
            let dt = now.saturating_duration_since(then).as_secs_f64();
            if dt > 0.0 {
                // A failed file drops its in-flight bytes; that is not negative throughput
                let rate = moved.saturating_sub(previous) as f64 / dt;
                self.throughput = Some(match self.throughput {
                    Some(current) => self.alpha * rate + (1.0 - self.alpha) * current,
                    None => rate,
                });
            }
        }
        self.last = Some((now, moved));

        self.snapshot(job)
    }

    /// Rebuild the snapshot without touching the throughput estimate.
    pub fn snapshot(&self, job: &TransferJob) -> ProgressSnapshot {
        let state = job.state();
        let bytes_total = job.bytes_total();
        let bytes_copied = job.bytes_copied();
        let in_flight = job.in_flight_bytes();

        let percent = if state == JobState::Completed {
            100.0
        } else if bytes_total == 0 {
            0.0
        } else {
            ((bytes_copied + in_flight) as f64 / bytes_total as f64 * 100.0).min(100.0)
        };

        let throughput = self.throughput();
        let eta_secs = match state {
            JobState::Copying | JobState::Verifying if throughput > 0.0 => {
                let remaining = bytes_total.saturating_sub(bytes_copied);
                Some((remaining as f64 / throughput).ceil() as u64)
            }
            _ => None,
        };

        let elapsed_secs = job
            .record()
            .map(|r| r.duration_secs)
            .unwrap_or_else(|| job.elapsed().as_secs());

        ProgressSnapshot {
            job_id: Some(job.id().to_string()),
            project: Some(job.project().to_string()),
            state,
            percent,
            bytes_copied,
            bytes_total,
            current_file_bytes: in_flight,
            files_total: job.files_total(),
            files_processed: job.files_processed(),
            files_copied: job.files_copied(),
            files_verified: job.files_verified(),
            throughput_bps: throughput,
            eta_secs,
            current_file: job.current_file().map(|p| p.display().to_string()),
            error_count: job.error_count(),
            last_error: job.last_error(),
            destination: job.destination().map(str::to_string),
            started_at: Some(job.started_at()),
            elapsed_secs,
        }
    }
}

/// Sample `job` until it reaches a terminal state, feeding the broadcaster
/// and the notification dispatcher.
///
/// Wakes on every tick of `interval` (updating throughput) and on every
/// state change (rebuilding the snapshot only).
pub async fn run_sampler(
    job: Arc<TransferJob>,
    dispatcher: Arc<NotificationDispatcher>,
    broadcaster: StatusBroadcaster,
    interval: Duration,
) {
    let mut tracker = ProgressTracker::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut state_rx = job.watch_state();
    let mut progress_log = ProgressLog::new(PROGRESS_LOG_INTERVAL);

    loop {
        let (timed, sender_alive) = tokio::select! {
            _ = ticker.tick() => (true, true),
            changed = state_rx.changed() => (false, changed.is_ok()),
        };

        let snapshot = if timed {
            tracker.sample(&job)
        } else {
            tracker.snapshot(&job)
        };

        if matches!(snapshot.state, JobState::Copying | JobState::Verifying) {
            let committed = committed_percent(snapshot.bytes_copied, snapshot.bytes_total);
            dispatcher
                .observe_progress(committed, &EventPayload::from(&snapshot))
                .await;
            progress_log.observe(&snapshot);
        }

        let terminal = snapshot.state.is_terminal();
        broadcaster.publish(snapshot);
        if terminal || !sender_alive {
            break;
        }
    }
}
