//! Refresh health as observed from outside the source.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle state of an [`crate::X509Source`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// Waiting for the first update.
    Connecting,
    /// Subscribed and up to date.
    Ready,
    /// Lost the subscription; retrying with backoff. The last snapshot is served.
    Retrying,
    /// Refresh stopped on a terminal error. The last snapshot (if any) remains.
    Degraded,
    /// `close()` was called.
    Closed,
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Retrying => "retrying",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Point-in-time health of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceHealth {
    /// Current state.
    pub status: SourceStatus,
    /// Generation of the snapshot being served; 0 before the first update.
    pub generation: u64,
    /// Failures since the last applied update.
    pub consecutive_failures: u32,
    /// Most recent refresh error, cleared by the next update.
    pub last_error: Option<String>,
    /// When the current snapshot was applied.
    pub last_update: Option<DateTime<Utc>>,
}

impl SourceHealth {
    pub(crate) fn connecting() -> Self {
        Self {
            status: SourceStatus::Connecting,
            generation: 0,
            consecutive_failures: 0,
            last_error: None,
            last_update: None,
        }
    }

    /// Whether a snapshot has ever been applied.
    #[must_use]
    pub fn has_snapshot(&self) -> bool {
        self.generation > 0
    }

    pub(crate) fn record_update(&mut self, generation: u64) {
        if self.status == SourceStatus::Closed {
            return;
        }
        self.status = SourceStatus::Ready;
        self.generation = generation;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.last_update = Some(Utc::now());
    }

    pub(crate) fn record_failure(&mut self, error: &str, terminal: bool) {
        if self.status == SourceStatus::Closed {
            return;
        }
        self.status = if terminal {
            SourceStatus::Degraded
        } else {
            SourceStatus::Retrying
        };
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.to_owned());
    }

    pub(crate) fn record_closed(&mut self) {
        self.status = SourceStatus::Closed;
    }
}
