use std::time::Duration;

use crate::config::Mode;

pub const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
pub const BACKOFF_STEP: Duration = Duration::from_secs(3);
pub const BACKOFF_CEILING: Duration = Duration::from_secs(60);

/// Additive error backoff: floor, floor + step, ... up to the ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    current: Duration,
    floor: Duration,
    step: Duration,
    ceiling: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_FLOOR, BACKOFF_STEP, BACKOFF_CEILING)
    }
}

impl Backoff {
    pub fn new(floor: Duration, step: Duration, ceiling: Duration) -> Self {
        Self {
            current: floor,
            floor,
            step,
            ceiling: ceiling.max(floor),
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delay to sleep now; the next call returns a longer one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current + self.step).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

/// Process-wide bookkeeping for one worker.
#[derive(Debug)]
pub struct LifecycleState {
    pub mode: Mode,
    pub backoff: Backoff,
    jobs_done: u64,
    max_jobs: u64,
}

impl LifecycleState {
    pub fn new(mode: Mode, max_jobs: u64) -> Self {
        Self {
            mode,
            backoff: Backoff::default(),
            jobs_done: 0,
            max_jobs,
        }
    }

    pub fn jobs_done(&self) -> u64 {
        self.jobs_done
    }

    /// Count a finished job; true once the cap is reached.
    pub fn record_job(&mut self) -> bool {
        self.jobs_done += 1;
        self.cap_reached()
    }

    pub fn cap_reached(&self) -> bool {
        self.max_jobs > 0 && self.jobs_done >= self.max_jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_additively_and_saturates() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..24).map(|_| backoff.next_delay().as_secs()).collect();

        assert_eq!(&delays[..5], &[1, 4, 7, 10, 13]);
        assert!(delays.windows(2).all(|pair| pair[1] >= pair[0]));
        assert_eq!(*delays.iter().max().unwrap(), 60);
        assert_eq!(delays[23], 60);
    }

    #[test]
    fn reset_returns_to_floor() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), BACKOFF_FLOOR);
    }

    #[test]
    fn job_cap_triggers_at_limit() {
        let mut state = LifecycleState::new(Mode::Standalone, 3);
        assert!(!state.record_job());
        assert!(!state.record_job());
        assert!(state.record_job());
        assert_eq!(state.jobs_done(), 3);
    }

    #[test]
    fn zero_cap_is_unlimited() {
        let mut state = LifecycleState::new(Mode::Pooled, 0);
        for _ in 0..10_000 {
            assert!(!state.record_job());
        }
    }
}
