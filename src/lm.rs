use faer::linalg::solvers::Solve;
use faer::{Col, Mat};
use tracing::debug;

use crate::math::cholesky;
use crate::settings::LmSettings;

/// Result of a Levenberg-Marquardt run
#[derive(Debug, Clone)]
pub struct LmOutcome {
    /// Best point found.
    pub point: Col<f64>,
    /// Error at `point`.
    pub error: f64,
    pub accepted: usize,
    pub rejected: usize,
}

/// Minimize a sum of squares with damped Gauss-Newton steps.
///
/// `residual` returns the (weighted) sum of squares at a point and
/// `normal_equations` returns `(J'R, J'J)`. The damping `λ` is added as
/// `λ diag(J'J)`. Steps that increase the error are rejected and the damping
/// grows, accepted steps shrink it. This never fails: a singular damped
/// system counts as a rejected step, and the best point is always returned.
pub fn levenberg_marquardt<R, N>(
    x0: Col<f64>,
    residual: R,
    normal_equations: N,
    settings: &LmSettings,
) -> LmOutcome
where
    R: Fn(&Col<f64>) -> f64,
    N: Fn(&Col<f64>) -> (Col<f64>, Mat<f64>),
{
    let mut point = x0;
    let mut err = residual(&point);
    debug!(error = err, "LM initial error");

    let mut lambda = settings.damping;
    let mut delta = 2f64 * settings.tol + 1f64;
    let mut accepted = 0usize;
    let mut rejected = 0usize;
    let divergence_limit = (settings.max_iter / 10) as isize;

    while delta > settings.tol
        && err > settings.stop
        && accepted + rejected < settings.max_iter
        && (rejected as isize - accepted as isize) < divergence_limit
    {
        let (rj, mut jj) = normal_equations(&point);
        jj.diagonal_mut()
            .column_vector_mut()
            .iter_mut()
            .for_each(|x| *x += lambda * *x);

        let trial = cholesky(&jj).map(|llt| &point - llt.solve(&rj));
        let trial_err = trial.as_ref().map(&residual);

        match (trial, trial_err) {
            (Some(trial), Some(trial_err)) if trial_err <= err => {
                lambda *= settings.shrink;
                accepted += 1;
                delta = err - trial_err;
                err = trial_err;
                point = trial;
            }
            _ => {
                lambda /= settings.shrink;
                rejected += 1;
            }
        }
    }

    debug!(
        accepted,
        rejected,
        error = err,
        "Ending LM optimization."
    );

    LmOutcome {
        point,
        error: err,
        accepted,
        rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{col_dot, col_from_slice};
    use approx::assert_abs_diff_eq;

    // r(x) = A x - b with a non-diagonal A, minimum at A⁻¹ b
    fn quadratic() -> (Mat<f64>, Col<f64>, Col<f64>) {
        let a = Mat::from_fn(3, 2, |i, j| match (i, j) {
            (0, 0) => 2.,
            (0, 1) => 0.5,
            (1, 0) => -1.,
            (1, 1) => 1.5,
            (2, 0) => 0.3,
            _ => 1.,
        });
        let minimum = col_from_slice(&[1.25, -0.75]);
        let b = &a * &minimum;
        (a, b, minimum)
    }

    fn run(damping: f64) -> LmOutcome {
        let (a, b, _) = quadratic();
        let residual = |x: &Col<f64>| {
            let ax = &a * x;
            let r = &ax - &b;
            0.5 * col_dot(&r, &r)
        };
        let normal = |x: &Col<f64>| {
            let ax = &a * x;
            let r = &ax - &b;
            (a.transpose() * &r, a.transpose() * &a)
        };
        let settings = LmSettings {
            damping,
            tol: 1e-16,
            stop: 1e-24,
            max_iter: 2000,
            ..LmSettings::default()
        };
        levenberg_marquardt(col_from_slice(&[10., 10.]), residual, normal, &settings)
    }

    #[test]
    fn converges_for_any_damping() {
        let (_, _, minimum) = quadratic();
        for damping in [0., 1e-3, 0.1, 1., 10., 100.] {
            let out = run(damping);
            assert_abs_diff_eq!(out.point[0], minimum[0], epsilon = 1e-5);
            assert_abs_diff_eq!(out.point[1], minimum[1], epsilon = 1e-5);
            assert!(out.error < 1e-9);
        }
    }

    #[test]
    fn singular_system_returns_start() {
        let residual = |x: &Col<f64>| 1. + x[0] * 0.;
        let normal = |_: &Col<f64>| (Col::zeros(1), Mat::zeros(1, 1));
        let out = levenberg_marquardt(
            col_from_slice(&[3.]),
            residual,
            normal,
            &LmSettings::default(),
        );
        assert_eq!(out.point[0], 3.);
        assert_eq!(out.accepted, 0);
        assert_eq!(out.rejected, LmSettings::default().max_iter / 10);
    }
}
