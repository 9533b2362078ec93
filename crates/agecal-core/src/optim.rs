//! Box-constrained minimizers.
//!
//! - [`projected_gradient`]: spectral projected gradient (Barzilai–Borwein
//!   step with Armijo backtracking) for smooth objectives.
//! - [`compass_search`]: derivative-free pattern search for piecewise
//!   constant objectives such as an error rate.
//!
//! Both keep every iterate feasible, so the last iterate is always a valid
//! parameter set even when the iteration budget runs out.

use thiserror::Error;

const ARMIJO: f64 = 1e-4;
const MIN_STEP: f64 = 1e-20;
const MAX_STEP: f64 = 1e10;

/// Closed interval for one coordinate. Use infinities for open sides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound {
    pub lower: f64,
    pub upper: f64,
}

impl Bound {
    pub const FREE: Bound = Bound {
        lower: f64::NEG_INFINITY,
        upper: f64::INFINITY,
    };
    pub const NON_NEGATIVE: Bound = Bound {
        lower: 0.0,
        upper: f64::INFINITY,
    };
    pub const NON_POSITIVE: Bound = Bound {
        lower: f64::NEG_INFINITY,
        upper: 0.0,
    };

    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    pub fn clamp(&self, x: f64) -> f64 {
        x.max(self.lower).min(self.upper)
    }

    /// `false` for NaN.
    pub fn contains(&self, x: f64) -> bool {
        x >= self.lower && x <= self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// The iteration budget ran out before the convergence test passed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("optimizer did not converge within {iterations} iterations (objective {value:.6})")]
pub struct OptimizationError {
    pub iterations: usize,
    pub value: f64,
    /// Last feasible iterate.
    pub params: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct Solution {
    pub params: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl Solution {
    /// The non-convergence diagnostic, if any.
    pub fn error(&self) -> Option<OptimizationError> {
        (!self.converged).then(|| OptimizationError {
            iterations: self.iterations,
            value: self.value,
            params: self.params.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GradientOptions {
    pub max_iterations: usize,
    /// Convergence when the projected-gradient infinity norm drops below this.
    pub gradient_tolerance: f64,
    /// Or when the relative objective change drops below this.
    pub value_tolerance: f64,
}

impl Default for GradientOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            gradient_tolerance: 1e-6,
            value_tolerance: 1e-12,
        }
    }
}

fn project(x: &mut [f64], bounds: &[Bound]) {
    for (v, b) in x.iter_mut().zip(bounds) {
        *v = b.clamp(*v);
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Minimize a smooth objective over a box.
///
/// `objective` returns the value and gradient at a point.
pub fn projected_gradient<F>(mut objective: F, start: &[f64], bounds: &[Bound], options: &GradientOptions) -> Solution
where
    F: FnMut(&[f64]) -> (f64, Vec<f64>),
{
    let mut x = start.to_vec();
    project(&mut x, bounds);
    let (mut value, mut grad) = objective(&x);
    let mut step = 1.0f64;

    for iteration in 0..options.max_iterations {
        let mut probe: Vec<f64> = x.iter().zip(&grad).map(|(xi, gi)| xi - gi).collect();
        project(&mut probe, bounds);
        let pg_norm = probe
            .iter()
            .zip(&x)
            .map(|(p, xi)| (p - xi).abs())
            .fold(0.0f64, f64::max);
        if pg_norm < options.gradient_tolerance {
            return Solution {
                params: x,
                value,
                iterations: iteration,
                converged: true,
            };
        }

        // Backtrack along the projected arc until the Armijo condition holds.
        let mut accepted = None;
        let mut trial_step = step;
        while trial_step > MIN_STEP {
            let mut candidate: Vec<f64> = x.iter().zip(&grad).map(|(xi, gi)| xi - trial_step * gi).collect();
            project(&mut candidate, bounds);
            let delta: Vec<f64> = candidate.iter().zip(&x).map(|(c, xi)| c - xi).collect();
            let (candidate_value, candidate_grad) = objective(&candidate);
            if candidate_value.is_finite() && candidate_value <= value + ARMIJO * dot(&grad, &delta) {
                accepted = Some((candidate, delta, candidate_value, candidate_grad));
                break;
            }
            trial_step *= 0.5;
        }

        let Some((candidate, s, candidate_value, candidate_grad)) = accepted else {
            // No descent possible along the projected gradient: stationary
            // up to numerical precision.
            return Solution {
                params: x,
                value,
                iterations: iteration,
                converged: true,
            };
        };

        let y: Vec<f64> = candidate_grad.iter().zip(&grad).map(|(a, b)| a - b).collect();
        let sy = dot(&s, &y);
        step = if sy > 0.0 {
            (dot(&s, &s) / sy).clamp(MIN_STEP, MAX_STEP)
        } else {
            1.0
        };

        let change = (value - candidate_value).abs();
        x = candidate;
        grad = candidate_grad;
        let previous = value;
        value = candidate_value;

        if change <= options.value_tolerance * previous.abs().max(value.abs()).max(1.0) {
            return Solution {
                params: x,
                value,
                iterations: iteration + 1,
                converged: true,
            };
        }
    }

    Solution {
        params: x,
        value,
        iterations: options.max_iterations,
        converged: false,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompassOptions {
    /// Maximum number of objective evaluations.
    pub max_evaluations: usize,
    /// Initial step as a fraction of each coordinate's bound width.
    pub initial_step: f64,
    /// Stop once the step (as a width fraction) falls below this.
    pub min_step: f64,
}

impl Default for CompassOptions {
    fn default() -> Self {
        Self {
            max_evaluations: 2000,
            initial_step: 0.25,
            min_step: 1e-4,
        }
    }
}

/// Derivative-free bounded compass search.
///
/// Every coordinate must have finite bounds; steps are taken in units of the
/// bound width. A move is accepted only on strict improvement; when no
/// coordinate move improves, the step is halved.
pub fn compass_search<F>(mut objective: F, start: &[f64], bounds: &[Bound], options: &CompassOptions) -> Solution
where
    F: FnMut(&[f64]) -> f64,
{
    let mut x = start.to_vec();
    project(&mut x, bounds);
    let mut value = objective(&x);
    let mut evaluations = 1usize;
    let mut step = options.initial_step;

    while step >= options.min_step {
        let mut improved = false;
        for i in 0..x.len() {
            let width = bounds[i].width();
            if !width.is_finite() || width <= 0.0 {
                continue;
            }
            for direction in [-1.0, 1.0] {
                if evaluations >= options.max_evaluations {
                    return Solution {
                        params: x,
                        value,
                        iterations: evaluations,
                        converged: false,
                    };
                }
                let mut candidate = x.clone();
                candidate[i] = bounds[i].clamp(x[i] + direction * step * width);
                if candidate[i] == x[i] {
                    continue;
                }
                let candidate_value = objective(&candidate);
                evaluations += 1;
                if candidate_value < value {
                    x = candidate;
                    value = candidate_value;
                    improved = true;
                    break;
                }
            }
        }
        if !improved {
            step *= 0.5;
        }
    }

    Solution {
        params: x,
        value,
        iterations: evaluations,
        converged: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadratic(x: &[f64]) -> (f64, Vec<f64>) {
        // (x0 - 2)^2 + 10 (x1 + 1)^2
        let value = (x[0] - 2.0).powi(2) + 10.0 * (x[1] + 1.0).powi(2);
        (value, vec![2.0 * (x[0] - 2.0), 20.0 * (x[1] + 1.0)])
    }

    #[test]
    fn test_projected_gradient_unconstrained_minimum() {
        let solution = projected_gradient(quadratic, &[0.0, 0.0], &[Bound::FREE, Bound::FREE], &GradientOptions::default());
        assert!(solution.converged);
        assert!((solution.params[0] - 2.0).abs() < 1e-4);
        assert!((solution.params[1] + 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_projected_gradient_active_bound() {
        // Unconstrained optimum x1 = -1 violates x1 >= 0.
        let bounds = [Bound::FREE, Bound::NON_NEGATIVE];
        let solution = projected_gradient(quadratic, &[5.0, 5.0], &bounds, &GradientOptions::default());
        assert!(solution.converged);
        assert!((solution.params[0] - 2.0).abs() < 1e-4);
        assert_eq!(solution.params[1], 0.0);
    }

    #[test]
    fn test_projected_gradient_starts_feasible() {
        let bounds = [Bound::NON_POSITIVE, Bound::NON_POSITIVE];
        let mut seen_infeasible = false;
        let solution = projected_gradient(
            |x: &[f64]| {
                if x.iter().any(|&v| v > 0.0) {
                    seen_infeasible = true;
                }
                quadratic(x)
            },
            &[3.0, 3.0],
            &bounds,
            &GradientOptions::default(),
        );
        assert!(!seen_infeasible);
        assert_eq!(solution.params[0], 0.0);
        assert!((solution.params[1] + 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_projected_gradient_budget_exhausted() {
        let options = GradientOptions {
            max_iterations: 1,
            gradient_tolerance: 0.0,
            value_tolerance: 0.0,
        };
        let solution = projected_gradient(quadratic, &[0.0, 0.0], &[Bound::FREE, Bound::FREE], &options);
        assert!(!solution.converged);
        let err = solution.error().unwrap();
        assert_eq!(err.iterations, 1);
        assert_eq!(err.params, solution.params);
    }

    #[test]
    fn test_compass_search_step_function() {
        // Piecewise constant: floor-quantized distance to (0.3, 0.7).
        let objective = |x: &[f64]| (((x[0] - 0.3).abs() + (x[1] - 0.7).abs()) * 100.0).floor();
        let bounds = [Bound::new(0.0, 1.0), Bound::new(0.0, 1.0)];
        let solution = compass_search(objective, &[0.9, 0.1], &bounds, &CompassOptions::default());
        assert!(solution.converged);
        assert!(solution.value <= 1.0, "value {}", solution.value);
        assert!(solution.params.iter().zip(&bounds).all(|(v, b)| *v >= b.lower && *v <= b.upper));
    }

    #[test]
    fn test_compass_search_reaches_bound() {
        let objective = |x: &[f64]| x[0];
        let bounds = [Bound::new(0.0, 0.02)];
        let solution = compass_search(objective, &[0.005], &bounds, &CompassOptions::default());
        assert_eq!(solution.params[0], 0.0);
    }
}
