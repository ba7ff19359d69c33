use serde::Serialize;

use crate::error::{ContextError, Result};

/// Default hard ceiling for one assembled artifact.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10_000_000;

/// Progress of one generation job, in work units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
}

/// Counts processed units and reports every step to a sink.
///
/// Owned by the single task running a job, so `current` only ever grows.
pub struct ProgressTracker<'a> {
    state: Progress,
    sink: &'a mut dyn FnMut(Progress),
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a mut dyn FnMut(Progress)) -> Self {
        Self {
            state: Progress::default(),
            sink,
        }
    }

    /// Set the total and report the starting point.
    pub fn start(&mut self, total: usize) {
        self.state = Progress { current: 0, total };
        (self.sink)(self.state);
    }

    /// Record one finished unit and report it.
    pub fn tick(&mut self) {
        self.state.current += 1;
        if self.state.current > self.state.total {
            // A file appeared between the counting pass and the walk.
            self.state.total = self.state.current;
        }
        (self.sink)(self.state);
    }

    pub fn state(&self) -> Progress {
        self.state
    }
}

/// Tracks bytes committed to an artifact against a hard ceiling.
///
/// `committed` covers output that already belongs to the artifact (earlier
/// roots, headers); `len` passed to [`SizeBudget::check`] is the size of the
/// buffers currently being filled.
#[derive(Debug, Clone, Copy)]
pub struct SizeBudget {
    limit: usize,
    committed: usize,
}

impl SizeBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            committed: 0,
        }
    }

    pub fn with_committed(limit: usize, committed: usize) -> Self {
        Self { limit, committed }
    }

    /// Fail with `TooLong` when `committed + len` is over the ceiling.
    pub fn check(&self, len: usize, detail: impl FnOnce() -> String) -> Result<()> {
        let size = self.committed + len;
        if size > self.limit {
            return Err(ContextError::TooLong {
                limit: self.limit,
                size,
                detail: detail(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_reports_every_step_monotonically() {
        let mut seen = Vec::new();
        let mut sink = |p: Progress| seen.push(p);
        let mut tracker = ProgressTracker::new(&mut sink);
        tracker.start(3);
        tracker.tick();
        tracker.tick();
        tracker.tick();
        assert_eq!(tracker.state().current, 3);
        assert_eq!(tracker.state().total, 3);
        drop(tracker);

        let currents: Vec<usize> = seen.iter().map(|p| p.current).collect();
        assert_eq!(currents, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_tracker_grows_total_when_undercounted() {
        let mut last = Progress::default();
        let mut sink = |p: Progress| last = p;
        let mut tracker = ProgressTracker::new(&mut sink);
        tracker.start(1);
        tracker.tick();
        tracker.tick();
        drop(tracker);
        assert_eq!((last.current, last.total), (2, 2));
    }

    #[test]
    fn test_budget_allows_exact_limit_and_rejects_one_more() {
        let budget = SizeBudget::with_committed(10, 4);
        assert!(budget.check(6, String::new).is_ok());
        let err = budget.check(7, || "after x".to_string()).unwrap_err();
        match err {
            ContextError::TooLong {
                limit,
                size,
                detail,
            } => {
                assert_eq!(limit, 10);
                assert_eq!(size, 11);
                assert_eq!(detail, "after x");
            }
            other => panic!("expected TooLong, got {other:?}"),
        }
    }
}
