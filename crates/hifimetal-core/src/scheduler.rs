//! Per-epoch exponential learning rate schedule.
//!
//! Both adversarial optimizers decay their learning rate once per epoch:
//! `lr(e) = base_lr * gamma^e`. The schedule tracks the last epoch it was
//! stepped to, so resuming at epoch `e` means constructing it with a counter of
//! `e - 1` and stepping once at the start of the epoch.

/// Exponential learning rate decay driven by epoch boundaries.
#[derive(Debug, Clone)]
pub struct ExponentialLr {
    /// Learning rate at epoch zero.
    base_lr: f64,
    /// Multiplicative decay per epoch.
    gamma: f64,
    /// Last epoch the schedule was stepped to (`-1` before the first step).
    last_epoch: i64,
}

impl ExponentialLr {
    /// Create a schedule for a fresh run.
    pub fn new(base_lr: f64, gamma: f64) -> Self {
        Self {
            base_lr,
            gamma,
            last_epoch: -1,
        }
    }

    /// Create a schedule for a run resuming at `current_epoch`.
    ///
    /// The counter is positioned at `current_epoch - 1`, so the next
    /// [`step`](Self::step) yields the rate for `current_epoch`.
    pub fn resume(base_lr: f64, gamma: f64, current_epoch: usize) -> Self {
        Self {
            base_lr,
            gamma,
            last_epoch: current_epoch as i64 - 1,
        }
    }

    /// Learning rate for a given epoch.
    #[must_use]
    pub fn get_lr(&self, epoch: usize) -> f64 {
        self.base_lr * self.gamma.powi(epoch as i32)
    }

    /// Learning rate at the current counter position.
    #[must_use]
    pub fn current_lr(&self) -> f64 {
        self.get_lr(self.last_epoch.max(0) as usize)
    }

    /// Advance to the next epoch and return its learning rate.
    pub fn step(&mut self) -> f64 {
        self.last_epoch += 1;
        self.current_lr()
    }

    /// Last epoch the schedule was stepped to.
    #[must_use]
    pub fn last_epoch(&self) -> i64 {
        self.last_epoch
    }

    /// Base learning rate.
    #[must_use]
    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_schedule_starts_at_base() {
        let mut sched = ExponentialLr::new(2e-4, 0.5);
        assert_eq!(sched.last_epoch(), -1);
        assert!((sched.step() - 2e-4).abs() < 1e-12);
        assert!((sched.step() - 1e-4).abs() < 1e-12);
        assert_eq!(sched.last_epoch(), 1);
    }

    #[test]
    fn test_resume_positions_counter() {
        let sched = ExponentialLr::resume(1.0, 0.9, 10);
        assert_eq!(sched.last_epoch(), 9);
    }

    #[test]
    fn test_resume_matches_uninterrupted_run() {
        let mut fresh = ExponentialLr::new(1e-3, 0.999875);
        let mut lr_fresh = 0.0;
        for _ in 0..=7 {
            lr_fresh = fresh.step();
        }

        let mut resumed = ExponentialLr::resume(1e-3, 0.999875, 7);
        let lr_resumed = resumed.step();

        assert!((lr_fresh - lr_resumed).abs() < 1e-15);
        assert_eq!(fresh.last_epoch(), resumed.last_epoch());
    }

    #[test]
    fn test_resume_at_zero_equals_fresh() {
        let sched = ExponentialLr::resume(3e-4, 0.99, 0);
        assert_eq!(sched.last_epoch(), -1);
        assert!((sched.current_lr() - 3e-4).abs() < 1e-12);
    }
}
