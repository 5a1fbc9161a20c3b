//! Recovery scheduler: cancellable countdown to a resume timestamp.
//!
//! The wait is a series of bounded sleeps. Each step re-derives `remaining`
//! from the clock, so a wait interrupted by shutdown leaves nothing behind and
//! a restarted process simply computes a fresh countdown.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::Clock;

/// Step length while far from the deadline.
pub const DEFAULT_LONG_STEP: Duration = Duration::from_secs(300);
/// Step length in the final stretch.
pub const DEFAULT_SHORT_STEP: Duration = Duration::from_secs(30);
/// Remaining time below which short steps are used.
pub const DEFAULT_SHORT_THRESHOLD: Duration = Duration::from_secs(300);

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Cancelled,
}

/// Progress report emitted once per step.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitProgress {
    pub reason: String,
    /// Share of the original wait already behind us, 0.0..=100.0.
    pub elapsed_pct: f64,
    pub remaining: Duration,
    pub remaining_human: String,
    pub eta: DateTime<Utc>,
}

impl fmt::Display for WaitProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.0}% elapsed, {} remaining (resumes at {})",
            self.elapsed_pct,
            self.remaining_human,
            self.eta.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S %Z")
        )
    }
}

pub type ProgressObserver = Arc<dyn Fn(&WaitProgress) + Send + Sync>;

pub struct RecoveryScheduler {
    clock: Arc<dyn Clock>,
    long_step: Duration,
    short_step: Duration,
    short_threshold: Duration,
    observer: Option<ProgressObserver>,
}

impl RecoveryScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            long_step: DEFAULT_LONG_STEP,
            short_step: DEFAULT_SHORT_STEP,
            short_threshold: DEFAULT_SHORT_THRESHOLD,
            observer: None,
        }
    }

    pub fn with_steps(
        mut self,
        long_step: Duration,
        short_step: Duration,
        short_threshold: Duration,
    ) -> Self {
        self.long_step = long_step.max(Duration::from_millis(1));
        self.short_step = short_step.max(Duration::from_millis(1));
        self.short_threshold = short_threshold;
        self
    }

    pub fn with_observer(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Block until `resume_at` or until `cancel` fires.
    ///
    /// Returns immediately with `Elapsed` when the timestamp is already past.
    pub async fn wait_until(
        &self,
        resume_at: DateTime<Utc>,
        reason: &str,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        let started = self.clock.now();
        let total = to_std(resume_at - started);
        if total.is_zero() {
            debug!(reason, "Resume time already reached");
            return WaitOutcome::Elapsed;
        }

        info!(
            reason,
            resume_at = %resume_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S %Z"),
            wait = %format_duration(total),
            "Usage limited, waiting before resuming"
        );

        loop {
            let remaining = to_std(resume_at - self.clock.now());
            if remaining.is_zero() {
                info!(reason, "Wait finished");
                return WaitOutcome::Elapsed;
            }

            self.report(reason, total, remaining, resume_at);

            let step = if remaining > self.short_threshold {
                self.long_step
            } else {
                self.short_step
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(reason, remaining = %format_duration(remaining), "Wait cancelled");
                    return WaitOutcome::Cancelled;
                }
                _ = tokio::time::sleep(step.min(remaining)) => {}
            }
        }
    }

    fn report(&self, reason: &str, total: Duration, remaining: Duration, eta: DateTime<Utc>) {
        let elapsed = total.saturating_sub(remaining);
        let elapsed_pct = (elapsed.as_secs_f64() / total.as_secs_f64() * 100.0).clamp(0.0, 100.0);
        let progress = WaitProgress {
            reason: reason.to_string(),
            elapsed_pct,
            remaining,
            remaining_human: format_duration(remaining),
            eta,
        };

        info!(reason, progress = %progress, "Usage limit countdown");
        if let Some(observer) = &self.observer {
            observer(&progress);
        }
    }
}

fn to_std(delta: chrono::Duration) -> Duration {
    delta.to_std().unwrap_or(Duration::ZERO)
}

/// `2h 5m`, `4m 30s`, `45s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m}m")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use std::sync::Mutex;

    type ProgressLog = Arc<Mutex<Vec<WaitProgress>>>;

    fn scheduler_with_log(clock: Arc<dyn Clock>) -> (RecoveryScheduler, ProgressLog) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let scheduler = RecoveryScheduler::new(clock)
            .with_observer(Arc::new(move |p: &WaitProgress| sink.lock().unwrap().push(p.clone())));
        (scheduler, log)
    }

    #[tokio::test(start_paused = true)]
    async fn long_then_short_steps() {
        let anchor = Utc::now();
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(anchor));
        let (scheduler, log) = scheduler_with_log(clock.clone());
        let cancel = CancellationToken::new();

        let resume = anchor + chrono::Duration::seconds(720);
        let outcome = scheduler.wait_until(resume, "usage limit", &cancel).await;

        assert_eq!(outcome, WaitOutcome::Elapsed);
        assert!(clock.now() >= resume);

        let remaining: Vec<u64> = log
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.remaining.as_secs_f64().round() as u64)
            .collect();
        assert_eq!(remaining, vec![720, 420, 120, 90, 60, 30]);

        let first = log.lock().unwrap()[0].clone();
        assert_eq!(first.elapsed_pct, 0.0);
        assert_eq!(first.remaining_human, "12m 0s");
        assert_eq!(first.eta, resume);
    }

    #[tokio::test(start_paused = true)]
    async fn past_deadline_returns_immediately() {
        let anchor = Utc::now();
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(anchor));
        let (scheduler, log) = scheduler_with_log(clock);

        let outcome = scheduler
            .wait_until(anchor - chrono::Duration::seconds(5), "stale", &CancellationToken::new())
            .await;
        assert_eq!(outcome, WaitOutcome::Elapsed);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_long_step() {
        let anchor = Utc::now();
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(anchor));
        let scheduler = RecoveryScheduler::new(clock.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.cancel();
        });

        let outcome = scheduler
            .wait_until(anchor + chrono::Duration::hours(2), "usage limit", &cancel)
            .await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!((clock.now() - anchor).num_seconds() <= 11);
    }

    #[test]
    fn human_durations() {
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(270)), "4m 30s");
        assert_eq!(format_duration(Duration::from_secs(7500)), "2h 5m");
    }
}
