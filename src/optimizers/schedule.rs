//! Learning rate schedules
//!
//! A schedule maps (base rate, epoch) to the rate the trainer hands the
//! optimizer for that epoch.

use crate::error::{invalid_argument, Result};

/// Per-epoch learning rate adjustment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearningRateSchedule {
    /// The base rate for every epoch.
    Constant,
    /// Multiplies the rate by `gamma` every `step_size` epochs.
    StepDecay { step_size: usize, gamma: f32 },
    /// Multiplies the rate by `decay_rate` each epoch.
    ExponentialDecay { decay_rate: f32 },
}

impl LearningRateSchedule {
    /// The learning rate for a zero-based epoch index.
    pub fn rate_for(&self, base: f32, epoch: usize) -> f32 {
        match *self {
            LearningRateSchedule::Constant => base,
            LearningRateSchedule::StepDecay { step_size, gamma } => {
                base * gamma.powi((epoch / step_size.max(1)) as i32)
            }
            LearningRateSchedule::ExponentialDecay { decay_rate } => {
                base * decay_rate.powi(epoch as i32)
            }
        }
    }

    /// Checks the schedule's parameters.
    pub fn validate(&self) -> Result<()> {
        match *self {
            LearningRateSchedule::Constant => Ok(()),
            LearningRateSchedule::StepDecay { step_size, gamma } => {
                if step_size == 0 {
                    return Err(invalid_argument("step size must be at least 1"));
                }
                if !(gamma > 0.0) {
                    return Err(invalid_argument("step decay gamma must be positive"));
                }
                Ok(())
            }
            LearningRateSchedule::ExponentialDecay { decay_rate } => {
                if !(decay_rate > 0.0) {
                    return Err(invalid_argument("decay rate must be positive"));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant() {
        let s = LearningRateSchedule::Constant;
        assert_eq!(s.rate_for(0.1, 0), 0.1);
        assert_eq!(s.rate_for(0.1, 100), 0.1);
    }

    #[test]
    fn test_step_decay_halves_every_step() {
        let s = LearningRateSchedule::StepDecay {
            step_size: 3,
            gamma: 0.5,
        };
        assert!((s.rate_for(0.1, 0) - 0.1).abs() < 1e-7);
        assert!((s.rate_for(0.1, 2) - 0.1).abs() < 1e-7);
        assert!((s.rate_for(0.1, 3) - 0.05).abs() < 1e-7);
        assert!((s.rate_for(0.1, 6) - 0.025).abs() < 1e-7);
    }

    #[test]
    fn test_exponential_decay() {
        let s = LearningRateSchedule::ExponentialDecay { decay_rate: 0.9 };
        assert!((s.rate_for(1.0, 0) - 1.0).abs() < 1e-7);
        assert!((s.rate_for(1.0, 2) - 0.81).abs() < 1e-6);
    }

    #[test]
    fn test_validation() {
        assert!(LearningRateSchedule::StepDecay {
            step_size: 0,
            gamma: 0.5
        }
        .validate()
        .is_err());
        assert!(LearningRateSchedule::ExponentialDecay { decay_rate: 0.0 }
            .validate()
            .is_err());
        assert!(LearningRateSchedule::Constant.validate().is_ok());
    }
}
