//! When to stop a harvest.
//!
//! Evaluated once per batch, after persistence. A collection is considered
//! exhausted on an explicit signal only; "no new items" alone never ends a
//! harvest as `Done`, it feeds the stall streak instead.

use socdb_core::CheckpointStatus;

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Done,
    Capped,
    Stalled,
}

impl Decision {
    /// The checkpoint status a harvest ending on this decision is saved with.
    #[must_use]
    pub fn checkpoint_status(self) -> CheckpointStatus {
        match self {
            Decision::Continue => CheckpointStatus::InProgress,
            Decision::Done => CheckpointStatus::Done,
            Decision::Capped => CheckpointStatus::Capped,
            Decision::Stalled => CheckpointStatus::Stalled,
        }
    }
}

/// What the controller observed for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Items this batch created in the sink.
    pub net_new: u64,
    /// Cumulative accepted count, checkpoint included.
    pub accepted_total: u64,
    /// Batches fetched in this invocation, this one included.
    pub iteration: u32,
    /// The source said the collection is complete.
    pub complete: bool,
    /// The source's end-of-feed sentinel matched.
    pub end_signal: bool,
    /// The batch carried a next token.
    pub has_next: bool,
    /// The next token equals (or does not advance past) the current one.
    pub token_repeated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    /// `0` disables the item cap.
    pub max_items: u64,
    pub max_iterations: u32,
    pub stall_threshold: u32,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            max_items: 0,
            max_iterations: 300,
            stall_threshold: 20,
        }
    }
}

impl TerminationPolicy {
    /// The no-progress streak after a batch.
    #[must_use]
    pub fn next_streak(streak: u32, batch: &BatchResult) -> u32 {
        if batch.net_new > 0 {
            0
        } else {
            streak.saturating_add(1)
        }
    }

    /// Decides whether to fetch again. `streak` is the value after this
    /// batch, see [`TerminationPolicy::next_streak`].
    #[must_use]
    pub fn decide(&self, batch: &BatchResult, streak: u32) -> Decision {
        if batch.complete || batch.end_signal {
            return Decision::Done;
        }
        if self.max_items > 0 && batch.accepted_total >= self.max_items {
            return Decision::Capped;
        }
        if streak >= self.stall_threshold {
            return Decision::Stalled;
        }
        // A source that cannot say where to go next has nowhere to resume.
        if batch.token_repeated || !batch.has_next {
            return Decision::Stalled;
        }
        if batch.iteration >= self.max_iterations {
            return Decision::Capped;
        }
        Decision::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> TerminationPolicy {
        TerminationPolicy {
            max_items: 100,
            max_iterations: 10,
            stall_threshold: 3,
        }
    }

    fn progressing(iteration: u32, accepted_total: u64) -> BatchResult {
        BatchResult {
            net_new: 5,
            accepted_total,
            iteration,
            has_next: true,
            ..BatchResult::default()
        }
    }

    #[test]
    fn continues_while_progressing() {
        assert_eq!(policy().decide(&progressing(1, 5), 0), Decision::Continue);
    }

    #[test]
    fn explicit_completion_wins_over_everything() {
        let batch = BatchResult {
            complete: true,
            accepted_total: 500,
            iteration: 99,
            ..BatchResult::default()
        };
        assert_eq!(policy().decide(&batch, 50), Decision::Done);
    }

    #[test]
    fn sentinel_ends_as_done() {
        let batch = BatchResult {
            end_signal: true,
            ..progressing(2, 10)
        };
        assert_eq!(policy().decide(&batch, 0), Decision::Done);
    }

    #[test]
    fn item_cap_reached() {
        assert_eq!(policy().decide(&progressing(4, 100), 0), Decision::Capped);
    }

    #[test]
    fn zero_max_items_is_unbounded() {
        let policy = TerminationPolicy {
            max_items: 0,
            ..policy()
        };
        assert_eq!(
            policy.decide(&progressing(1, 1_000_000), 0),
            Decision::Continue
        );
    }

    #[test]
    fn streak_counts_batches_without_new_items() {
        let stale = BatchResult {
            net_new: 0,
            ..progressing(1, 5)
        };
        assert_eq!(TerminationPolicy::next_streak(0, &stale), 1);
        assert_eq!(TerminationPolicy::next_streak(2, &stale), 3);
        assert_eq!(TerminationPolicy::next_streak(2, &progressing(1, 5)), 0);
    }

    #[test]
    fn stall_threshold_reached() {
        let stale = BatchResult {
            net_new: 0,
            ..progressing(3, 5)
        };
        assert_eq!(policy().decide(&stale, 2), Decision::Continue);
        assert_eq!(policy().decide(&stale, 3), Decision::Stalled);
    }

    #[test]
    fn repeated_token_stalls_immediately() {
        let batch = BatchResult {
            token_repeated: true,
            ..progressing(2, 10)
        };
        assert_eq!(policy().decide(&batch, 0), Decision::Stalled);
    }

    #[test]
    fn missing_next_token_without_completion_stalls() {
        let batch = BatchResult {
            has_next: false,
            ..progressing(2, 10)
        };
        assert_eq!(policy().decide(&batch, 0), Decision::Stalled);
    }

    #[test]
    fn iteration_cap_reached() {
        assert_eq!(policy().decide(&progressing(10, 50), 0), Decision::Capped);
    }

    #[test]
    fn decisions_map_to_checkpoint_statuses() {
        assert_eq!(
            Decision::Continue.checkpoint_status(),
            CheckpointStatus::InProgress
        );
        assert_eq!(Decision::Stalled.checkpoint_status(), CheckpointStatus::Stalled);
    }
}
