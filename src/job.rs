use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assembler::{Assembled, RootSpec, assemble, assemble_many};
use crate::error::{ContextError, Result};
use crate::events::{AppEvent, EventSender, emit};
use crate::progress::{DEFAULT_MAX_OUTPUT_BYTES, Progress, ProgressTracker};

/// Identity of one generation job. Never reused within a generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    #[cfg(test)]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What to generate: one or more roots sharing a byte ceiling.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub roots: Vec<RootSpec>,
    pub max_output_bytes: usize,
}

impl GenerationRequest {
    pub fn new(roots: Vec<RootSpec>) -> Self {
        Self {
            roots,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    fn describe(&self) -> String {
        match self.roots.as_slice() {
            [single] => single.path.display().to_string(),
            many => format!("{} projects", many.len()),
        }
    }
}

struct CurrentJob {
    id: JobId,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct GeneratorInner {
    current: Mutex<Option<CurrentJob>>,
    next_id: AtomicU64,
    events: EventSender,
    shutdown: CancellationToken,
}

impl GeneratorInner {
    fn slot(&self) -> MutexGuard<'_, Option<CurrentJob>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Release the slot only if `id` still owns it; a newer job's bookkeeping
    /// is left alone.
    fn clear_if_current(&self, id: JobId) -> bool {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|job| job.id == id) {
            *slot = None;
            debug!("job {id} finished and released the current slot");
            true
        } else {
            debug!("job {id} finished after being superseded; slot left untouched");
            false
        }
    }
}

/// Single-flight manager for context generation.
///
/// A new request cancels the running job and takes its place. The superseded
/// job unwinds on its own; its successor waits for that before starting, so
/// all of the old job's notifications come first.
#[derive(Clone)]
pub struct ContextGenerator {
    inner: Arc<GeneratorInner>,
}

impl ContextGenerator {
    pub fn new(events: EventSender) -> Self {
        Self {
            inner: Arc::new(GeneratorInner {
                current: Mutex::new(None),
                next_id: AtomicU64::new(0),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start generating and return at once; results arrive as [`AppEvent`]s.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request_generation(&self, request: GenerationRequest) -> JobId {
        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let cancel = self.inner.shutdown.child_token();

        let mut slot = self.inner.slot();
        let previous = slot.take().map(|job| {
            debug!("cancelling previous generation job {} for {id}", job.id);
            job.cancel.cancel();
            job.handle
        });
        info!(
            "starting generation job {id} for {} (max {} bytes)",
            request.describe(),
            request.max_output_bytes
        );
        let handle = tokio::spawn(run_job(
            Arc::clone(&self.inner),
            id,
            cancel.clone(),
            request,
            previous,
        ));
        *slot = Some(CurrentJob { id, cancel, handle });
        id
    }

    /// The job holding the slot, if any.
    #[cfg(test)]
    pub fn current_job(&self) -> Option<JobId> {
        self.inner.slot().as_ref().map(|job| job.id)
    }

    /// Raise the running job's cancellation signal, if there is one.
    pub fn cancel_current(&self) {
        if let Some(job) = self.inner.slot().as_ref() {
            debug!("cancelling generation job {}", job.id);
            job.cancel.cancel();
        }
    }

    /// Cancel the running job and every job requested afterwards.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

async fn run_job(
    inner: Arc<GeneratorInner>,
    id: JobId,
    cancel: CancellationToken,
    request: GenerationRequest,
    previous: Option<JoinHandle<()>>,
) {
    let started = Instant::now();
    if let Some(previous) = previous {
        if let Err(err) = previous.await {
            warn!("superseded generation task ended abnormally: {err}");
        }
    }

    let description = request.describe();
    let event = if request.roots.is_empty() {
        error!("generation job {id}: no project paths provided");
        AppEvent::Error {
            job: id,
            message: "No project paths provided".to_string(),
        }
    } else if cancel.is_cancelled() {
        info!("generation job {id} for {description} cancelled before starting");
        cancelled_event(id, &description, None)
    } else {
        let events = inner.events.clone();
        let token = cancel.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut sink =
                |progress: Progress| emit(&events, AppEvent::Progress { job: id, progress });
            generate(&request, &token, &mut sink)
        })
        .await;

        match outcome {
            Ok(result) => terminal_event(id, &description, result, cancel.is_cancelled()),
            Err(err) => {
                error!("generation job {id} task failed: {err}");
                AppEvent::Error {
                    job: id,
                    message: format!(
                        "Error generating context for {description}: task failed: {err}"
                    ),
                }
            }
        }
    };

    // Consumers that see the terminal event must already see the slot released.
    inner.clear_if_current(id);
    emit(&inner.events, event);
    info!("generation job {id} finished in {:?}", started.elapsed());
}

/// Run the assembler for a request on the current thread.
pub fn generate(
    request: &GenerationRequest,
    cancel: &CancellationToken,
    sink: &mut dyn FnMut(Progress),
) -> Result<Assembled> {
    let mut tracker = ProgressTracker::new(sink);
    match request.roots.as_slice() {
        [single] => assemble(single, request.max_output_bytes, &mut tracker, cancel)
            .map(Assembled::Complete),
        roots => assemble_many(roots, request.max_output_bytes, &mut tracker, cancel),
    }
}

fn cancelled_event(id: JobId, description: &str, partial: Option<String>) -> AppEvent {
    AppEvent::Cancelled {
        job: id,
        message: format!("Context generation cancelled for {description}"),
        partial,
    }
}

fn terminal_event(
    id: JobId,
    description: &str,
    result: Result<Assembled>,
    was_cancelled: bool,
) -> AppEvent {
    match result {
        Ok(Assembled::CancelledPartial(partial)) => {
            info!("generation job {id} for {description} cancelled with partial output");
            cancelled_event(id, description, Some(partial))
        }
        Err(ContextError::Cancelled) => {
            info!("generation job {id} for {description} cancelled");
            cancelled_event(id, description, None)
        }
        _ if was_cancelled => {
            info!(
                "generation job {id} for {description} cancelled after finishing; result dropped"
            );
            cancelled_event(id, description, None)
        }
        Ok(Assembled::Complete(artifact)) => {
            info!(
                "context generated for {description} ({} bytes)",
                artifact.len()
            );
            AppEvent::Generated { job: id, artifact }
        }
        Err(err) => {
            if err.is_too_long() {
                warn!("generation job {id} for {description}: {err}");
            } else {
                error!("generation job {id} for {description}: {err}");
            }
            AppEvent::Error {
                job: id,
                message: format!("Error generating context for {description}: {err}"),
            }
        }
    }
}
