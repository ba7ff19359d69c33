use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::job::JobId;
use crate::progress::Progress;

/// Notifications delivered to the surrounding application.
///
/// Every generation job ends with exactly one of `Generated`, `Error` or
/// `Cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AppEvent {
    Progress {
        job: JobId,
        #[serde(flatten)]
        progress: Progress,
    },
    Generated {
        job: JobId,
        artifact: String,
    },
    /// Size ceiling exceeded or an unrecoverable I/O failure.
    Error {
        job: JobId,
        message: String,
    },
    /// Superseded or shut down. Multi-root jobs that had already produced
    /// output carry it, annotated, in `partial`.
    Cancelled {
        job: JobId,
        message: String,
        partial: Option<String>,
    },
    /// Something under a watched root changed; consumers re-query.
    FilesChanged {
        root: PathBuf,
    },
}

#[cfg(test)]
impl AppEvent {
    pub fn job(&self) -> Option<JobId> {
        match self {
            Self::Progress { job, .. }
            | Self::Generated { job, .. }
            | Self::Error { job, .. }
            | Self::Cancelled { job, .. } => Some(*job),
            Self::FilesChanged { .. } => None,
        }
    }

    /// Whether this event ends a generation job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Generated { .. } | Self::Error { .. } | Self::Cancelled { .. }
        )
    }
}

pub type EventSender = mpsc::UnboundedSender<AppEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<AppEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Fire-and-forget delivery; a dropped receiver is not an error.
pub fn emit(tx: &EventSender, event: AppEvent) {
    if tx.send(event).is_err() {
        debug!("event receiver dropped, notification discarded");
    }
}
