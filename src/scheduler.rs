//! Linear-quadratic sigma schedule for the Mochi flow-matching sampler.
//!
//! The schedule spends the first half of the steps on a shallow linear ramp
//! up to `threshold_noise`, then switches to a quadratic that meets the linear
//! part with matching value and slope and reaches 1.0 at the last step.
//! Values are finally inverted so the sequence runs from 1.0 (pure noise) to
//! 0.0 (clean sample).

use crate::config::DEFAULT_THRESHOLD_NOISE;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScheduleError {
    #[error("linear_steps must satisfy 0 < linear_steps < num_steps, got linear_steps={linear_steps}, num_steps={num_steps}")]
    InvalidLinearSteps {
        num_steps: usize,
        linear_steps: usize,
    },
}

/// Sigma schedule of `num_steps + 1` values from 1.0 down to 0.0.
///
/// `linear_steps` defaults to `num_steps / 2`.
pub fn linear_quadratic_schedule(
    num_steps: usize,
    threshold_noise: f64,
    linear_steps: Option<usize>,
) -> Result<Vec<f64>, ScheduleError> {
    let linear_steps = linear_steps.unwrap_or(num_steps / 2);
    if linear_steps == 0 || linear_steps >= num_steps {
        return Err(ScheduleError::InvalidLinearSteps {
            num_steps,
            linear_steps,
        });
    }

    let n = num_steps as f64;
    let l = linear_steps as f64;
    let q = (num_steps - linear_steps) as f64;

    let threshold_noise_step_diff = l - threshold_noise * n;
    let quadratic_coef = threshold_noise_step_diff / (l * q.powi(2));
    let linear_coef = threshold_noise / l - 2.0 * threshold_noise_step_diff / q.powi(2);
    let const_term = quadratic_coef * l.powi(2);

    let mut schedule: Vec<f64> = Vec::with_capacity(num_steps + 1);
    schedule.extend((0..linear_steps).map(|i| i as f64 * threshold_noise / l));
    schedule.extend((linear_steps..num_steps).map(|i| {
        let i = i as f64;
        quadratic_coef * i.powi(2) + linear_coef * i + const_term
    }));
    schedule.push(1.0);

    Ok(schedule.into_iter().map(|x| 1.0 - x).collect())
}

/// Constant guidance scale for every step.
pub fn cfg_schedule(cfg: f64, num_steps: usize) -> Vec<f64> {
    vec![cfg; num_steps]
}

/// Per-step sigma and guidance schedules handed to the denoising loop.
#[derive(Debug, Clone, PartialEq)]
pub struct MochiSchedule {
    /// `num_steps + 1` noise levels, 1.0 first and 0.0 last.
    pub sigmas: Vec<f64>,
    /// One guidance scale per step.
    pub cfg: Vec<f64>,
}

impl MochiSchedule {
    pub fn new(num_steps: usize, cfg: f64) -> Result<Self, ScheduleError> {
        Ok(Self {
            sigmas: linear_quadratic_schedule(num_steps, DEFAULT_THRESHOLD_NOISE, None)?,
            cfg: cfg_schedule(cfg, num_steps),
        })
    }

    pub fn num_steps(&self) -> usize {
        self.cfg.len()
    }

    /// `(sigma, sigma - next_sigma, cfg)` for each step.
    pub fn steps(&self) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
        self.sigmas
            .windows(2)
            .zip(self.cfg.iter())
            .map(|(w, &cfg)| (w[0], w[0] - w[1], cfg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sampler_schedule_shape() {
        let s = linear_quadratic_schedule(50, 0.025, None).unwrap();
        assert_eq!(s.len(), 51);
        assert!((s[0] - 1.0).abs() < 1e-12);
        assert!(s[50].abs() < 1e-12);
    }

    #[test]
    fn quadratic_segment_is_continuous_with_linear_segment() {
        let s = linear_quadratic_schedule(10, 0.025, None).unwrap();
        // Linear part ends one step short of the threshold; the quadratic
        // starts exactly at it.
        assert!((s[4] - (1.0 - 4.0 * 0.025 / 5.0)).abs() < 1e-12);
        assert!((s[5] - (1.0 - 0.025)).abs() < 1e-12);
    }

    #[test]
    fn degenerate_linear_steps_are_rejected() {
        assert!(linear_quadratic_schedule(1, 0.025, None).is_err());
        assert!(linear_quadratic_schedule(10, 0.025, Some(0)).is_err());
        assert_eq!(
            linear_quadratic_schedule(10, 0.025, Some(10)),
            Err(ScheduleError::InvalidLinearSteps {
                num_steps: 10,
                linear_steps: 10
            })
        );
    }

    #[test]
    fn mochi_schedule_steps() {
        let schedule = MochiSchedule::new(4, 4.5).unwrap();
        assert_eq!(schedule.num_steps(), 4);
        let steps: Vec<_> = schedule.steps().collect();
        assert_eq!(steps.len(), 4);
        let total: f64 = steps.iter().map(|(_, d, _)| d).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(steps.iter().all(|&(_, _, cfg)| cfg == 4.5));
    }
}
