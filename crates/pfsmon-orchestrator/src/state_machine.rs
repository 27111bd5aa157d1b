//! Pure state machine for install steps
//!
//! No async and no I/O: `transition(state, event) -> (state, actions)` is
//! deterministic and the control loop performs the returned actions.
//!
//! - Transitions only move forward, except InProgress -> Pending on a
//!   failure that will be retried
//! - Invalid transitions go to Failed (never panic)

use pfsmon_core::{PfsError, RetryPolicy, StepKind, StepState};
use std::time::Duration;

/// Events that drive a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A worker picked the step up
    Dispatched,
    /// The step's work finished (or its check showed it was already done)
    Completed { already_satisfied: bool },
    /// The step's work failed; `retry_after` is set when it will be retried
    Failed {
        error: String,
        retry_after: Option<Duration>,
    },
    /// A step it depends on failed terminally
    DependencyFailed { cause: String },
    /// The run was cancelled before the step started
    Cancelled,
}

/// Side effects for the control loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run the step on a worker
    Execute,
    /// Put the step back on the ready queue after `delay`
    ScheduleRetry { delay: Duration },
    /// Successors may now be ready
    ReleaseDependents,
    /// Mark every transitive dependent Skipped
    SkipDependents,
    /// Store this as the step's error
    RecordError { error: String },
    /// Store why the step never ran
    RecordSkip { reason: String },
    /// Log activity
    LogActivity { message: String },
}

/// Pure state transition function
///
/// # Invalid Transitions
/// Any invalid transition results in Failed with a RecordError action.
/// This function never panics.
pub fn transition(state: StepState, event: Event) -> (StepState, Vec<Action>) {
    match (state, event) {
        (StepState::Pending, Event::Dispatched) => (StepState::InProgress, vec![Action::Execute]),

        (StepState::InProgress, Event::Completed { already_satisfied }) => {
            let mut actions = vec![Action::ReleaseDependents];
            if already_satisfied {
                actions.push(Action::LogActivity {
                    message: "already satisfied, action skipped".to_string(),
                });
            }
            (StepState::Succeeded, actions)
        }

        (
            StepState::InProgress,
            Event::Failed {
                error,
                retry_after: Some(delay),
            },
        ) => (
            StepState::Pending,
            vec![
                Action::LogActivity {
                    message: format!("failed, retrying in {:?}: {}", delay, error),
                },
                Action::RecordError { error },
                Action::ScheduleRetry { delay },
            ],
        ),

        (
            StepState::InProgress,
            Event::Failed {
                error,
                retry_after: None,
            },
        ) => (
            StepState::Failed,
            vec![Action::RecordError { error }, Action::SkipDependents],
        ),

        (StepState::Pending, Event::DependencyFailed { cause }) => (
            StepState::Skipped,
            vec![Action::RecordSkip {
                reason: format!("dependency failed: {}", cause),
            }],
        ),

        (StepState::Pending, Event::Cancelled) => (
            StepState::Skipped,
            vec![Action::RecordSkip {
                reason: "run cancelled".to_string(),
            }],
        ),

        (state, event) => (
            StepState::Failed,
            vec![Action::RecordError {
                error: format!(
                    "Invalid step transition: {} cannot handle event {:?}",
                    state, event
                ),
            }],
        ),
    }
}

/// Decide whether a failed attempt is retried, and after how long
///
/// `attempts` counts attempts made so far, the failed one included.
/// Verify steps are never retried. Connect and timeout errors are retried
/// on every other kind; exec errors only when the step is retryable.
pub fn retry_delay(
    kind: StepKind,
    retryable: bool,
    error: &PfsError,
    attempts: u32,
    policy: &RetryPolicy,
) -> Option<Duration> {
    if kind == StepKind::Verify {
        return None;
    }

    let eligible = error.is_transient() || (retryable && matches!(error, PfsError::Exec { .. }));
    if !eligible || !policy.allows_retry(attempts) {
        return None;
    }
    Some(policy.backoff_for(attempts))
}
