//! Tracing setup for the daemon and CLI, and the progress-log policy for
//! running transfers.
//!
//! Console output is compact and human readable; `--log-json` switches to
//! one JSON object per line with the current span attached, so transfer
//! logs carry `job_id` and `project`.

use std::time::{Duration, Instant};

use tracing::{Level, info};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;
use crate::core::models::{JobState, ProgressSnapshot};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per line
    pub json: bool,
    /// Default to DEBUG for this crate
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.log_json,
            verbose: config.verbose,
        }
    }
}

fn default_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    EnvFilter::new(format!("offloader={}", level.as_str().to_lowercase()))
}

/// Install the global subscriber. `RUST_LOG` overrides the default
/// `offloader=info` (or `offloader=debug` when verbose) filter.
///
/// Later calls are ignored, so tests may call it freely.
pub fn init(config: LogConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config.verbose));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().compact().with_target(false))
            .try_init()
    };
    installed.ok();
}

/// Minimum spacing between two log lines.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True on the first call and whenever `interval` has passed since the
    /// last call that returned true.
    pub fn should_log_at(&mut self, now: Instant) -> bool {
        let due = self
            .last
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.last = Some(now);
        }
        due
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Decides which progress samples of a running transfer reach the log.
///
/// A line is written when the job enters a new phase and then at most once
/// per interval while it stays there. Only copy and verify phases report
/// progress.
#[derive(Debug)]
pub struct ProgressLog {
    throttle: LogThrottle,
    phase: Option<JobState>,
}

impl ProgressLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            throttle: LogThrottle::new(interval),
            phase: None,
        }
    }

    /// Log `snapshot` if it is due. Returns whether a line was written.
    pub fn observe(&mut self, snapshot: &ProgressSnapshot) -> bool {
        self.observe_at(snapshot, Instant::now())
    }

    pub fn observe_at(&mut self, snapshot: &ProgressSnapshot, now: Instant) -> bool {
        if !matches!(snapshot.state, JobState::Copying | JobState::Verifying) {
            return false;
        }
        if self.phase != Some(snapshot.state) {
            self.phase = Some(snapshot.state);
            self.throttle.reset();
        }
        if !self.throttle.should_log_at(now) {
            return false;
        }

        info!(
            job_id = snapshot.job_id.as_deref().unwrap_or("-"),
            state = %snapshot.state,
            percent = format!("{:.1}", snapshot.percent),
            bytes = snapshot.bytes_copied,
            bytes_total = snapshot.bytes_total,
            files = snapshot.files_processed,
            files_total = snapshot.files_total,
            throughput_bps = snapshot.throughput_bps as u64,
            eta_secs = ?snapshot.eta_secs,
            "Transfer progress"
        );
        true
    }
}
