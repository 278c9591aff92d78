use std::path::PathBuf;

use crate::error::{FitError, Result};

/// Settings for the damped Gauss-Newton refinement of nonlinear terms
#[derive(Debug, Clone, Copy)]
pub struct LmSettings {
    /// Initial damping added to the diagonal of the normal equations.
    pub damping: f64,
    /// The damping is multiplied by this after an accepted step and
    /// divided by it after a rejected one.
    pub shrink: f64,
    /// Stop once an accepted step decreases the error by less than this.
    pub tol: f64,
    /// Stop once the error itself drops below this.
    pub stop: f64,
    /// Total number of accepted plus rejected steps.
    pub max_iter: usize,
}

impl Default for LmSettings {
    fn default() -> Self {
        Self {
            damping: 0.1,
            shrink: 0.9,
            tol: 1e-5,
            stop: 1e-8,
            max_iter: 50,
        }
    }
}

/// Settings for data accumulation and the maximum a posteriori fit
#[derive(Debug, Clone, Copy)]
pub struct FitSettings {
    /// Time step of the trajectory, in the units the forces were written in.
    pub dt: f64,
    /// Thermal energy in the same units as the force field.
    pub kt: f64,
    /// Floor added to the Gamma rates so that vanishing residuals or
    /// penalties never divide by zero.
    pub e0: f64,
    /// Weight of the quadratic penalty keeping the solution on the
    /// equality constraint subspace.
    pub constraint_weight: f64,
    /// Frames processed at once while appending data.
    pub chunk_size: usize,
    /// The outer loop stops when the negative log posterior changes by less than this.
    pub tol: f64,
    /// Iteration budget of the outer loop.
    pub max_iter: usize,
    /// `theta0` is shifted when `sum|dtheta|` exceeds this fraction of `sum|theta0|`.
    pub recenter_fraction: f64,
    /// Eigenvalues below `sigma_tol²` count as free directions, above
    /// `1/sigma_tol²` as fixed ones.
    pub sigma_tol: f64,
    /// Singular values of the equality constraints below this are reported
    /// as redundant.
    pub redundancy_tol: f64,
    /// Refine the coefficients of registered nonlinear terms in every
    /// outer iteration. Without it they stay at their initial values.
    pub refine_nonlinear: bool,
    pub lm: LmSettings,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            dt: 1f64,
            kt: 1f64,
            e0: 1e-8,
            constraint_weight: 100f64,
            chunk_size: 100,
            tol: 1e-5,
            max_iter: 100,
            recenter_fraction: 0.1,
            sigma_tol: 1e-5,
            redundancy_tol: 1e-8,
            refine_nonlinear: true,
            lm: LmSettings::default(),
        }
    }
}

impl FitSettings {
    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.dt > 0f64 && self.dt.is_finite()) {
            return Err(FitError::Settings(format!("dt must be positive, got {}", self.dt)));
        }
        if !(self.kt > 0f64 && self.kt.is_finite()) {
            return Err(FitError::Settings(format!("kT must be positive, got {}", self.kt)));
        }
        if self.chunk_size == 0 {
            return Err(FitError::Settings("chunk size must be at least 1".into()));
        }
        if !(self.e0 > 0f64) {
            return Err(FitError::Settings("E0 must be positive".into()));
        }
        if !(self.lm.shrink > 0f64 && self.lm.shrink < 1f64) {
            return Err(FitError::Settings(format!(
                "LM shrink factor must be in (0, 1), got {}",
                self.lm.shrink
            )));
        }
        Ok(())
    }
}

/// Settings for posterior sampling
#[derive(Debug, Clone)]
pub struct SampleSettings {
    /// Number of recorded macro steps.
    pub draws: usize,
    /// Number of discarded macro steps before recording.
    pub burn_in: usize,
    /// Gibbs sweeps per macro step.
    pub thin: usize,
    /// Redraws of the random part of a parameter sample before giving up on
    /// the inequality constraints.
    pub max_redraws: usize,
    /// If set, every recorded sweep appends its `alpha` values to this file.
    pub alpha_trace: Option<PathBuf>,
}

impl Default for SampleSettings {
    fn default() -> Self {
        Self {
            draws: 1000,
            burn_in: 100,
            thin: 10,
            max_redraws: 1000,
            alpha_trace: None,
        }
    }
}

impl SampleSettings {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.draws == 0 {
            return Err(FitError::Settings("at least one draw must be recorded".into()));
        }
        if self.thin == 0 {
            return Err(FitError::Settings("every macro step needs at least one sweep".into()));
        }
        Ok(())
    }
}
