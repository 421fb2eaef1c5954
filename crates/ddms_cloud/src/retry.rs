//! Retry decisions for failed cloud syncs.

use crate::config::RetryPolicy;
use crate::sync_info::SyncInfo;
use ddms_core::{GeneralError, StoreResult, TaskId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of one sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The sync completed.
    Success,
    /// The sync failed but a later attempt may succeed.
    Retryable(GeneralError),
    /// The sync failed for good.
    Fatal(GeneralError),
}

impl From<StoreResult<()>> for SyncOutcome {
    fn from(status: StoreResult<()>) -> Self {
        match status {
            Ok(()) => SyncOutcome::Success,
            Err(err) if err.is_retryable() => SyncOutcome::Retryable(err),
            Err(err) => SyncOutcome::Fatal(err),
        }
    }
}

/// What the retryer did with an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Nothing more to do.
    Done,
    /// Another task already covers the request.
    Merged,
    /// A new attempt was scheduled.
    Scheduled {
        /// Executor task of the new attempt.
        task: TaskId,
        /// Delay before it runs.
        delay: Duration,
    },
    /// The request failed; the callback was told.
    GaveUp(GeneralError),
}

/// Runs a request again later.
pub trait RetryScheduler: Send + Sync {
    /// Schedules `info` as attempt `attempt` after `delay`.
    ///
    /// Returns `None` if the request could not be scheduled.
    fn reschedule(&self, attempt: u32, delay: Duration, info: SyncInfo) -> Option<TaskId>;
}

/// Retry state of one sync attempt.
///
/// One attempt may fan out to several databases; the first retryable
/// failure schedules the next attempt and later ones merge into it.
pub struct Retryer {
    attempt: u32,
    policy: RetryPolicy,
    info: SyncInfo,
    scheduler: Arc<dyn RetryScheduler>,
    scheduled: Mutex<Option<TaskId>>,
}

impl Retryer {
    /// Creates the retryer of attempt `attempt` (1-based) of `info`.
    pub fn new(
        attempt: u32,
        policy: RetryPolicy,
        info: SyncInfo,
        scheduler: Arc<dyn RetryScheduler>,
    ) -> Self {
        Self {
            attempt,
            policy,
            info,
            scheduler,
            scheduled: Mutex::new(None),
        }
    }

    /// Attempt number this retryer decides for.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns true if no attempt is left after this one.
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_times
    }

    /// Base interval for `status`.
    pub fn interval(&self, status: StoreResult<()>) -> Duration {
        self.policy.interval(status)
    }

    /// Decides what to do after an attempt ended with `outcome`.
    pub fn report(&self, outcome: SyncOutcome) -> RetryDecision {
        let err = match outcome {
            SyncOutcome::Success => return RetryDecision::Done,
            SyncOutcome::Retryable(GeneralError::SyncTaskMerged)
            | SyncOutcome::Fatal(GeneralError::SyncTaskMerged) => return RetryDecision::Merged,
            SyncOutcome::Fatal(err) => return self.give_up(err),
            SyncOutcome::Retryable(err) => err,
        };
        if self.is_exhausted() {
            return self.give_up(err);
        }

        let mut scheduled = self.scheduled.lock();
        if scheduled.is_some() {
            return RetryDecision::Merged;
        }
        let delay = self.policy.delay_for_attempt(Err(err), self.attempt);
        match self.scheduler.reschedule(self.attempt, delay, self.info.clone()) {
            Some(task) => {
                info!(
                    user = self.info.user,
                    bundle = %self.info.bundle_name,
                    attempt = self.attempt,
                    ?delay,
                    error = %err,
                    "cloud sync retry scheduled"
                );
                *scheduled = Some(task);
                RetryDecision::Scheduled { task, delay }
            }
            None => {
                drop(scheduled);
                self.give_up(err)
            }
        }
    }

    fn give_up(&self, err: GeneralError) -> RetryDecision {
        warn!(
            user = self.info.user,
            bundle = %self.info.bundle_name,
            attempt = self.attempt,
            error = %err,
            "cloud sync failed"
        );
        self.info.set_error(err);
        RetryDecision::GaveUp(err)
    }
}

impl std::fmt::Debug for Retryer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retryer")
            .field("attempt", &self.attempt)
            .field("info", &self.info)
            .field("scheduled", &*self.scheduled.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddms_core::store::GenDetails;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(u32, Duration)>>,
        refuse: bool,
    }

    impl RetryScheduler for Recorder {
        fn reschedule(&self, attempt: u32, delay: Duration, _info: SyncInfo) -> Option<TaskId> {
            if self.refuse {
                return None;
            }
            let mut calls = self.calls.lock();
            calls.push((attempt, delay));
            Some(calls.len() as TaskId)
        }
    }

    fn retryer(attempt: u32, scheduler: Arc<Recorder>) -> (Retryer, Arc<Mutex<Vec<GenDetails>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let info = SyncInfo::new(100).with_callback(Arc::new(move |d: &GenDetails| {
            sink.lock().push(d.clone());
        }));
        let policy = RetryPolicy::default()
            .with_retry_interval(Duration::from_secs(1))
            .with_locked_interval(Duration::from_secs(3));
        (Retryer::new(attempt, policy, info, scheduler), seen)
    }

    #[test]
    fn outcome_from_status() {
        assert_eq!(SyncOutcome::from(Ok(())), SyncOutcome::Success);
        assert_eq!(
            SyncOutcome::from(Err(GeneralError::NetworkError)),
            SyncOutcome::Retryable(GeneralError::NetworkError)
        );
        assert_eq!(
            SyncOutcome::from(Err(GeneralError::SyncTaskMerged)),
            SyncOutcome::Fatal(GeneralError::SyncTaskMerged)
        );
        assert_eq!(
            SyncOutcome::from(Err(GeneralError::RecordLimitExceeded)),
            SyncOutcome::Fatal(GeneralError::RecordLimitExceeded)
        );
    }

    #[test]
    fn success_is_done() {
        let scheduler = Arc::new(Recorder::default());
        let (retryer, seen) = retryer(1, Arc::clone(&scheduler));
        assert_eq!(retryer.report(SyncOutcome::Success), RetryDecision::Done);
        assert!(scheduler.calls.lock().is_empty());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn merged_short_circuits() {
        let scheduler = Arc::new(Recorder::default());
        let (retryer, seen) = retryer(1, Arc::clone(&scheduler));
        let merged = SyncOutcome::from(Err(GeneralError::SyncTaskMerged));
        assert_eq!(retryer.report(merged), RetryDecision::Merged);
        assert!(scheduler.calls.lock().is_empty());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn transient_failure_schedules_once() {
        let scheduler = Arc::new(Recorder::default());
        let (retryer, _) = retryer(2, Arc::clone(&scheduler));
        let decision = retryer.report(SyncOutcome::Retryable(GeneralError::LockedByOthers));
        assert_eq!(
            decision,
            RetryDecision::Scheduled {
                task: 1,
                delay: Duration::from_secs(6)
            }
        );
        assert_eq!(
            retryer.report(SyncOutcome::Retryable(GeneralError::NetworkError)),
            RetryDecision::Merged
        );
        assert_eq!(*scheduler.calls.lock(), vec![(2, Duration::from_secs(6))]);
    }

    #[test]
    fn exhausted_budget_gives_up() {
        let scheduler = Arc::new(Recorder::default());
        let (retryer, seen) = retryer(6, Arc::clone(&scheduler));
        assert!(retryer.is_exhausted());
        assert_eq!(
            retryer.report(SyncOutcome::Retryable(GeneralError::Busy)),
            RetryDecision::GaveUp(GeneralError::Busy)
        );
        assert!(scheduler.calls.lock().is_empty());
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0].values().next().map(|d| d.code),
            Some(Err(GeneralError::Busy))
        );
    }

    #[test]
    fn fatal_failure_reports_immediately() {
        let scheduler = Arc::new(Recorder::default());
        let (retryer, seen) = retryer(1, Arc::clone(&scheduler));
        assert_eq!(
            retryer.report(SyncOutcome::Fatal(GeneralError::PermissionDenied)),
            RetryDecision::GaveUp(GeneralError::PermissionDenied)
        );
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn unschedulable_retry_gives_up() {
        let scheduler = Arc::new(Recorder {
            refuse: true,
            ..Recorder::default()
        });
        let (retryer, seen) = retryer(1, scheduler);
        assert_eq!(
            retryer.report(SyncOutcome::Retryable(GeneralError::NetworkError)),
            RetryDecision::GaveUp(GeneralError::NetworkError)
        );
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn interval_follows_policy() {
        let (retryer, _) = retryer(1, Arc::new(Recorder::default()));
        assert_eq!(retryer.interval(Err(GeneralError::LockedByOthers)), Duration::from_secs(3));
        assert_eq!(retryer.interval(Ok(())), Duration::from_secs(1));
    }
}
