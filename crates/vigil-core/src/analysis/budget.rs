//! Wall-clock budget shared by every stage of one analysis.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::{VigilError, VigilResult};

/// Loop iterations between deadline polls.
pub const CHECK_STRIDE: usize = 32;

/// Cooperative deadline. Clones share one cancellation flag, so the first
/// stage to observe expiry stops every other holder on its next check.
#[derive(Clone, Debug)]
pub struct Deadline {
    started: Instant,
    expires_at: Instant,
    budget_ms: u64,
    cancelled: Arc<AtomicBool>,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            expires_at: started + budget,
            budget_ms: budget.as_millis() as u64,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_millis(budget_ms: u64) -> Self {
        Self::new(Duration::from_millis(budget_ms))
    }

    pub fn budget_ms(&self) -> u64 {
        self.budget_ms
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Fail with `Timeout` once the budget is spent or another holder cancelled.
    pub fn check(&self, stage: &'static str) -> VigilResult<()> {
        if self.is_cancelled() || Instant::now() >= self.expires_at {
            self.cancel();
            return Err(VigilError::Timeout {
                budget_ms: self.budget_ms,
                stage,
            });
        }
        Ok(())
    }

    /// Step counter for long loops; polls `check` once per `CHECK_STRIDE`.
    pub fn ticker(&self, stage: &'static str) -> Ticker<'_> {
        Ticker {
            deadline: self,
            stage,
            steps: 0,
        }
    }
}

pub struct Ticker<'d> {
    deadline: &'d Deadline,
    stage: &'static str,
    steps: usize,
}

impl Ticker<'_> {
    pub fn tick(&mut self) -> VigilResult<()> {
        self.steps += 1;
        if self.steps % CHECK_STRIDE == 0 {
            self.deadline.check(self.stage)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_deadline_passes() {
        let deadline = Deadline::from_millis(10_000);
        assert!(deadline.check("parsing").is_ok());
        assert!(deadline.remaining() > Duration::from_millis(9_000));
    }

    #[test]
    fn test_zero_budget_times_out() {
        let deadline = Deadline::new(Duration::ZERO);
        match deadline.check("detecting") {
            Err(VigilError::Timeout { stage, budget_ms }) => {
                assert_eq!(stage, "detecting");
                assert_eq!(budget_ms, 0);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_cancel_propagates_to_clones() {
        let deadline = Deadline::from_millis(10_000);
        let clone = deadline.clone();
        deadline.cancel();
        assert!(clone.check("synthesizing").is_err());
    }

    #[test]
    fn test_ticker_polls_once_per_stride() {
        let deadline = Deadline::from_millis(10_000);
        let mut ticker = deadline.ticker("detecting");
        for _ in 0..CHECK_STRIDE - 1 {
            ticker.tick().unwrap();
        }
        deadline.cancel();
        // cancellation is only seen on the stride boundary
        assert!(matches!(
            ticker.tick(),
            Err(VigilError::Timeout { stage: "detecting", .. })
        ));
    }
}
