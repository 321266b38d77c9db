//! Bounded-concurrency batch runner shared by indexing and classification.
//!
//! Profiles are processed by a `JoinSet` of tasks gated by a `Semaphore`.
//! Each task returns a [`ProfileOutcome`]; an `Err` means a failure no
//! profile can get past (an external dependency still down after retries),
//! which halts the batch: no new profiles start and in-flight ones stop at
//! their next cancellation check.
//!
//! Cancellation works the same way from the outside through a
//! [`CancelFlag`]. Profiles that never started or stopped before their
//! write are reported as cancelled and keep whatever progress they had.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use profile_fusion_core::FusionError;

use crate::progress::{ProgressEvent, ProgressReporter};

/// Cooperative cancellation shared between the caller and batch tasks.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.load(Ordering::SeqCst))
    }

    /// A flag that trips when either it or `self` is cancelled. Cancelling
    /// the child leaves `self` untouched.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(self.flag.clone()),
        }
    }
}

/// What happened to one profile.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileOutcome {
    Done(String),
    Skipped(String),
    Failed(String),
    Cancelled,
}

impl ProfileOutcome {
    pub fn describe(&self) -> String {
        match self {
            ProfileOutcome::Done(s) => s.clone(),
            ProfileOutcome::Skipped(why) => format!("skipped ({})", why),
            ProfileOutcome::Failed(why) => format!("failed: {}", why),
            ProfileOutcome::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Summary of one batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub done: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// `(profile_id, reason)` for every per-profile failure.
    pub failed: Vec<(String, String)>,
    /// Set when the batch halted on an unrecoverable error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl BatchReport {
    fn record(&mut self, profile_id: String, outcome: &ProfileOutcome) {
        match outcome {
            ProfileOutcome::Done(_) => self.done += 1,
            ProfileOutcome::Skipped(_) => self.skipped += 1,
            ProfileOutcome::Failed(why) => self.failed.push((profile_id, why.clone())),
            ProfileOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// Run `work` over `items` with at most `concurrency` in flight.
pub async fn run_batch<T, W, Fut>(
    pipeline: &'static str,
    items: Vec<T>,
    id_of: fn(&T) -> String,
    concurrency: usize,
    cancel: &CancelFlag,
    progress: &dyn ProgressReporter,
    work: W,
) -> BatchReport
where
    T: Send + 'static,
    W: Fn(T, CancelFlag) -> Fut,
    Fut: Future<Output = Result<ProfileOutcome, FusionError>> + Send + 'static,
{
    let total = items.len();
    let mut report = BatchReport {
        total,
        ..Default::default()
    };
    progress.report(ProgressEvent::Started {
        pipeline,
        total: total as u64,
    });

    let halt = cancel.child();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks: JoinSet<(String, Result<ProfileOutcome, FusionError>)> = JoinSet::new();
    let mut finished = 0u64;
    let mut started = 0usize;

    let mut on_result = |report: &mut BatchReport,
                         id: String,
                         result: Result<ProfileOutcome, FusionError>| {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if report.aborted.is_none() {
                    tracing::error!(pipeline, profile_id = %id, error = %e, "halting batch");
                    report.aborted = Some(e.to_string());
                }
                halt.cancel();
                ProfileOutcome::Cancelled
            }
        };
        finished += 1;
        progress.report(ProgressEvent::Profile {
            pipeline,
            n: finished,
            total: total as u64,
            profile_id: id.clone(),
            outcome: outcome.describe(),
        });
        report.record(id, &outcome);
    };

    for item in items {
        // Drain whatever already finished so halts are noticed early.
        while let Some(joined) = tasks.try_join_next() {
            match joined {
                Ok((id, result)) => on_result(&mut report, id, result),
                Err(e) => report.failed.push(("<unknown>".to_string(), e.to_string())),
            }
        }
        if halt.is_cancelled() {
            break;
        }
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        if halt.is_cancelled() {
            break;
        }
        let id = id_of(&item);
        let fut = work(item, halt.clone());
        tasks.spawn(async move {
            let result = fut.await;
            drop(permit);
            (id, result)
        });
        started += 1;
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, result)) => on_result(&mut report, id, result),
            Err(e) => {
                tracing::error!(pipeline, error = %e, "batch task panicked");
                report.failed.push(("<unknown>".to_string(), e.to_string()));
            }
        }
    }

    // Never started: still pending.
    report.cancelled += total - started;

    tracing::info!(
        pipeline,
        total,
        done = report.done,
        skipped = report.skipped,
        failed = report.failed.len(),
        cancelled = report.cancelled,
        "batch finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use std::sync::atomic::AtomicUsize;

    fn id(n: &u32) -> String {
        n.to_string()
    }

    #[tokio::test]
    async fn test_outcomes_are_tallied() {
        let report = run_batch(
            "test",
            vec![1u32, 2, 3, 4],
            id,
            2,
            &CancelFlag::new(),
            &NoProgress,
            |n, _| async move {
                Ok(match n {
                    1 => ProfileOutcome::Done("ok".into()),
                    2 => ProfileOutcome::Skipped("unchanged".into()),
                    _ => ProfileOutcome::Failed("bad".into()),
                })
            },
        )
        .await;
        assert_eq!(report.total, 4);
        assert_eq!(report.done, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed.len(), 2);
        assert!(report.aborted.is_none());
    }

    #[tokio::test]
    async fn test_fatal_error_halts_batch() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let report = run_batch(
            "test",
            (0u32..50).collect(),
            id,
            1,
            &CancelFlag::new(),
            &NoProgress,
            move |n, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Err(FusionError::external("store", "HTTP 503", true))
                    } else {
                        tokio::task::yield_now().await;
                        Ok(ProfileOutcome::Done("ok".into()))
                    }
                }
            },
        )
        .await;
        assert!(report.aborted.unwrap().contains("503"));
        assert!(ran.load(Ordering::SeqCst) < 50);
        assert_eq!(
            report.done + report.cancelled + report.skipped + report.failed.len(),
            50
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let report = run_batch(
            "test",
            vec![1u32, 2, 3],
            id,
            2,
            &cancel,
            &NoProgress,
            |_, _| async { Ok(ProfileOutcome::Done("ok".into())) },
        )
        .await;
        assert_eq!(report.cancelled, 3);
        assert_eq!(report.done, 0);
    }

    #[test]
    fn test_child_flag() {
        let parent = CancelFlag::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
