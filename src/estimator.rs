//! The force matching estimator and its maximum a posteriori loop.
//!
//! Parameters are written as `theta0 + dtheta`. All accumulated statistics
//! describe residuals at `theta0`, so the linear solve only ever produces
//! the increment `dtheta`. The per-type noise precisions `z` and the per
//! prior precisions `alpha` are updated in closed form between solves.

use faer::{Col, Mat};
use ndarray::ArrayView3;
use tracing::{debug, info, instrument, warn};

use crate::accumulator::{Accumulator, SufficientStats};
use crate::error::{Diagnostic, FitError, Result};
use crate::linear_solve::{dimensionality, DimensionReport, LinearSystem, SolveStrategy};
use crate::lm::levenberg_marquardt;
use crate::math::{
    abs_sum, col_dot, col_from_slice, col_to_vec, diagonal_block, quad_form, trace_product,
};
use crate::nonlinear::{NonlinearForce, NonlinearTerm, TermObjective};
use crate::orthonormal::{orthonormalize, ConstraintBasis};
use crate::posterior::{PosteriorSummary, SampleStore};
use crate::settings::FitSettings;
use crate::topology::{Structure, Topology, TypeIndex};

/// Lifecycle of a [`ForceMatch`].
///
/// Data can only be appended in `Empty` and `Accumulating`. The first
/// estimation or sampling call freezes the statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Empty,
    Accumulating,
    Fitting,
    /// An estimate is available. It may still carry a
    /// [`Diagnostic::NonConvergence`].
    Converged,
    /// The last estimation or sampling call failed, the statistics are intact.
    Failed,
}

#[derive(Debug, Clone)]
pub struct FitReport {
    pub iterations: usize,
    pub converged: bool,
    /// Final negative log posterior of the hyperparameters.
    pub objective: f64,
    /// Last change of the objective.
    pub delta: f64,
    pub diagnostics: Vec<Diagnostic>,
}

/// Parameter distribution conditional on the current hyperparameters.
#[derive(Debug, Clone)]
pub struct ThetaStats {
    /// Conditional mean of `dtheta`.
    pub mean: Col<f64>,
    /// Conditional covariance `iC⁻¹`.
    pub covariance: Mat<f64>,
    /// `trace(C D2_t)` for every atom type.
    pub dmu2: Vec<f64>,
    /// `trace(C_kk sum_t D2_t,kk)` for every prior block.
    pub fv: Vec<f64>,
}

/// Independent Gamma distributions for a vector of precisions.
#[derive(Debug, Clone)]
pub(crate) struct GammaPosterior {
    pub(crate) shape: Vec<f64>,
    pub(crate) rate: Vec<f64>,
}

impl GammaPosterior {
    pub(crate) fn mode(&self) -> Vec<f64> {
        self.shape
            .iter()
            .zip(&self.rate)
            .map(|(a, b)| (a - 1f64) / b)
            .collect()
    }

    /// Negative log density up to a constant.
    pub(crate) fn neg_log_density(&self, x: &[f64]) -> f64 {
        self.shape
            .iter()
            .zip(&self.rate)
            .zip(x)
            .map(|((a, b), x)| b * x - (a - 1f64) * x.ln())
            .sum()
    }

    /// `(rate - e0/2) / shape`, the mean squared residual behind the rate.
    pub(crate) fn residual_variance(&self, e0: f64) -> Vec<f64> {
        self.shape
            .iter()
            .zip(&self.rate)
            .map(|(a, b)| (b - 0.5 * e0).max(0f64) / a)
            .collect()
    }
}

/// Hierarchical Bayesian force matching for a linear force field plus
/// optional nonlinear terms.
pub struct ForceMatch<T: Topology> {
    pub(crate) topology: T,
    pub(crate) settings: FitSettings,
    pub(crate) strategy: SolveStrategy,
    pub(crate) basis: ConstraintBasis,
    pub(crate) inequalities: Option<Mat<f64>>,
    pub(crate) data: Accumulator,
    pub(crate) theta0: Col<f64>,
    pub(crate) dtheta: Col<f64>,
    pub(crate) z: Vec<f64>,
    pub(crate) alpha: Vec<f64>,
    /// Per type variance of the predicted force due to parameter uncertainty.
    pub(crate) dmu2: Vec<f64>,
    /// Per prior block variance of the predicted force.
    pub(crate) df2: Vec<f64>,
    pub(crate) phase: Phase,
    pub(crate) diagnostics: Vec<Diagnostic>,
    pub(crate) samples: SampleStore,
    pub(crate) posterior: Option<PosteriorSummary>,
}

fn validate_topology<T: Topology>(topology: &T) -> Result<()> {
    let params = topology.num_params();
    let bounds = topology.term_bounds();
    if bounds.first() != Some(&0)
        || bounds.last() != Some(&params)
        || bounds.windows(2).any(|w| w[0] > w[1])
    {
        return Err(FitError::Topology(format!(
            "term bounds {bounds:?} do not partition {params} parameters"
        )));
    }
    if topology.term_names().len() + 1 != bounds.len() {
        return Err(FitError::Topology(
            "every term needs exactly one name".into(),
        ));
    }

    let priors = topology.priors();
    let ranks = topology.prior_ranks();
    if ranks.len() != priors.len() || topology.num_hyperparams() != priors.len() {
        return Err(FitError::Topology(format!(
            "{} priors, {} prior ranks and {} hyperparameters",
            priors.len(),
            ranks.len(),
            topology.num_hyperparams()
        )));
    }
    for (prior, &rank) in priors.iter().zip(ranks) {
        if prior.term + 1 >= bounds.len() {
            return Err(FitError::Topology(format!(
                "prior refers to unknown term {}",
                prior.term
            )));
        }
        let size = bounds[prior.term + 1] - bounds[prior.term];
        if prior.precision.shape() != (size, size) {
            return Err(FitError::ShapeMismatch(format!(
                "prior precision of term {} has shape {:?}, the term has {size} parameters",
                prior.term,
                prior.precision.shape()
            )));
        }
        if rank <= 2 {
            return Err(FitError::Settings(format!(
                "prior of term {} has rank {rank}, the precision mode needs rank of at least 3",
                prior.term
            )));
        }
    }
    Ok(())
}

fn constraint_matrix(matrix: Option<Mat<f64>>, params: usize, what: &str) -> Result<Option<Mat<f64>>> {
    match matrix {
        Some(m) if m.ncols() != params => Err(FitError::ShapeMismatch(format!(
            "{what} constraints have {} columns for {params} parameters",
            m.ncols()
        ))),
        Some(m) if m.nrows() == 0 => Ok(None),
        other => Ok(other),
    }
}

impl<T: Topology> ForceMatch<T> {
    pub fn new<S: Structure + ?Sized>(
        topology: T,
        structure: &S,
        settings: FitSettings,
        strategy: SolveStrategy,
    ) -> Result<Self> {
        settings.validate()?;
        validate_topology(&topology)?;
        let params = topology.num_params();

        let types = TypeIndex::new(structure);
        let masses: Vec<f64> = (0..structure.num_atoms())
            .map(|atom| structure.mass(atom))
            .collect();
        if let Some(atom) = masses.iter().position(|m| !(*m > 0f64 && m.is_finite())) {
            return Err(FitError::Settings(format!(
                "atom {atom} has mass {}",
                masses[atom]
            )));
        }

        let mut diagnostics = Vec::new();
        let basis = match constraint_matrix(topology.equality_constraints(), params, "equality")? {
            Some(c) => {
                let (basis, diagnostic) = orthonormalize(&c, settings.redundancy_tol)?;
                diagnostics.extend(diagnostic);
                basis
            }
            None => ConstraintBasis::unconstrained(params),
        };
        let inequalities = constraint_matrix(topology.inequality_constraints(), params, "inequality")?;
        if let (Some(g), SolveStrategy::NullSpaceProjection) = (&inequalities, &strategy) {
            warn!(
                count = g.nrows(),
                "No quadratic program solver configured, the point estimate ignores inequality constraints."
            );
            diagnostics.push(Diagnostic::InequalitiesIgnored { count: g.nrows() });
        }

        let num_types = types.num_types();
        let num_priors = topology.priors().len();
        let data = Accumulator::new(
            types,
            &masses,
            params,
            settings.dt,
            settings.kt,
            settings.chunk_size,
        );

        Ok(Self {
            topology,
            settings,
            strategy,
            basis,
            inequalities,
            data,
            theta0: Col::zeros(params),
            dtheta: Col::zeros(params),
            z: vec![1f64; num_types],
            alpha: vec![1f64; num_priors],
            dmu2: vec![0f64; num_types],
            df2: vec![0f64; num_priors],
            phase: Phase::Empty,
            diagnostics,
            samples: SampleStore::default(),
            posterior: None,
        })
    }

    /// Start the fit from `theta0` instead of zero. Only possible before any
    /// data is appended, since the statistics are residuals at `theta0`.
    pub fn with_initial_parameters(mut self, theta0: &[f64]) -> Result<Self> {
        if self.phase != Phase::Empty {
            return Err(FitError::State(
                "initial parameters must be set before any data".into(),
            ));
        }
        self.check_params(theta0)?;
        self.theta0 = col_from_slice(theta0);
        self.dtheta = Col::zeros(theta0.len());
        Ok(self)
    }

    fn check_params(&self, values: &[f64]) -> Result<()> {
        if values.len() != self.num_params() {
            return Err(FitError::ShapeMismatch(format!(
                "expected {} parameters, got {}",
                self.num_params(),
                values.len()
            )));
        }
        Ok(())
    }

    /// Register a nonlinear force term. `name` must be unique and not
    /// `"linear"`.
    pub fn add_nonlin(
        &mut self,
        name: &str,
        coefficients: Vec<f64>,
        model: Box<dyn NonlinearForce>,
    ) -> Result<()> {
        if self.phase != Phase::Empty {
            return Err(FitError::State(format!(
                "cannot add nonlinear term '{name}' after data was appended"
            )));
        }
        self.data
            .add_nonlinear(name, NonlinearTerm::new(coefficients, model))
    }

    /// Add frames of positions and forces, both `frames x atoms x 3`.
    #[instrument(skip_all, fields(frames = positions.dim().0))]
    pub fn append(&mut self, positions: ArrayView3<'_, f64>, forces: ArrayView3<'_, f64>) -> Result<()> {
        if !matches!(self.phase, Phase::Empty | Phase::Accumulating) {
            return Err(FitError::State(format!(
                "statistics are frozen (phase {:?}), no more data can be appended",
                self.phase
            )));
        }
        self.data
            .append(&self.topology, positions, forces, &self.theta0)?;
        if self.data.frames() > 0 {
            self.phase = Phase::Accumulating;
        }
        info!(total = self.data.frames(), "Appended frames.");
        Ok(())
    }

    /// Freeze the statistics before estimation or sampling.
    pub(crate) fn enter_fitting(&mut self) -> Result<()> {
        if self.data.frames() == 0 {
            return Err(FitError::State("no frames have been appended".into()));
        }
        if self.phase == Phase::Accumulating {
            debug!(frames = self.data.frames(), "Statistics are frozen.");
        }
        self.phase = Phase::Fitting;
        Ok(())
    }

    /// Alternate between the parameter solve and closed form hyperparameter
    /// updates until the objective settles.
    #[instrument(skip_all, fields(frames = self.data.frames()))]
    pub fn maximize(&mut self) -> Result<FitReport> {
        self.enter_fitting()?;
        info!(
            types = self.z.len(),
            priors = self.alpha.len(),
            nonlinear = self.data.nonlinear().len(),
            "Starting maximization."
        );
        match self.run_maximization() {
            Ok(report) => {
                self.phase = Phase::Converged;
                Ok(report)
            }
            Err(err) => {
                warn!(%err, "Maximization failed.");
                self.phase = Phase::Failed;
                Err(err)
            }
        }
    }

    fn run_maximization(&mut self) -> Result<FitReport> {
        let mut objective = self.objective();
        let mut delta = f64::INFINITY;
        let mut iterations = 0;
        let mut converged = false;

        while iterations < self.settings.max_iter {
            iterations += 1;
            self.dtheta = self.system().solve(
                &self.basis,
                &self.strategy,
                self.inequalities.as_ref(),
                &self.theta0,
                self.settings.sigma_tol,
            )?;

            if abs_sum(&self.dtheta) > self.settings.recenter_fraction * abs_sum(&self.theta0) {
                let target = self.parameters();
                self.shift_reference(target)?;
            }

            if self.settings.refine_nonlinear && self.data.has_nonlinear() {
                self.refine_nonlinear()?;
            }

            let previous = objective;
            objective = self.update_hyperparameters();
            delta = previous - objective;
            debug!(iteration = iterations, objective, delta, "Outer iteration.");
            if delta.abs() < self.settings.tol {
                converged = true;
                break;
            }
        }

        let stats = self.theta_stats()?;
        self.store_uncertainty(&stats);

        let mut diagnostics = self.diagnostics.clone();
        if !converged {
            warn!(iterations, delta, "Maximization did not converge.");
            diagnostics.push(Diagnostic::NonConvergence { iterations, delta });
        } else {
            info!(iterations, objective, "Maximization converged.");
        }
        Ok(FitReport {
            iterations,
            converged,
            objective,
            delta,
            diagnostics,
        })
    }

    /// Normalize the conditional variances by the number of force
    /// components they were summed over.
    fn store_uncertainty(&mut self, stats: &ThetaStats) {
        let frames = self.data.frames() as f64;
        let counts = self.data.types().counts();
        self.dmu2 = stats
            .dmu2
            .iter()
            .zip(counts)
            .map(|(v, &n)| v / (frames * 3f64 * n as f64))
            .collect();
        let components = frames * 3f64 * self.data.types().num_atoms() as f64;
        self.df2 = stats.fv.iter().map(|v| v / components).collect();
    }

    /// Block coordinate descent over the nonlinear terms, each refined with
    /// all other contributions held at their current values.
    fn refine_nonlinear(&mut self) -> Result<()> {
        let theta = self.parameters();
        let names: Vec<String> = self.data.nonlinear().keys().cloned().collect();
        for name in names {
            let offsets = self.data.term_offsets(&name, &theta)?;
            let Some(term) = self.data.nonlinear().get(&name) else {
                continue;
            };
            let objective = TermObjective {
                offsets,
                term,
                scale: self.data.force_scale(),
                types: self.data.types(),
                z: &self.z,
            };
            let outcome = levenberg_marquardt(
                col_from_slice(&term.coefficients),
                |x| objective.error(x),
                |x| objective.normal_equations(x),
                &self.settings.lm,
            );
            debug!(
                term = %name,
                error = outcome.error,
                accepted = outcome.accepted,
                rejected = outcome.rejected,
                "Refined nonlinear term."
            );
            if let Some(term) = self.data.nonlinear_mut().get_mut(&name) {
                term.coefficients = col_to_vec(&outcome.point);
            }
        }
        self.data.recompute_residuals(&self.theta0)
    }

    fn update_hyperparameters(&mut self) -> f64 {
        let noise = self.noise_posterior();
        let prior = self.prior_posterior();
        self.z = noise.mode();
        self.alpha = prior.mode();
        let rms: Vec<f64> = noise
            .residual_variance(self.settings.e0)
            .iter()
            .map(|v| v.sqrt())
            .collect();
        debug!(?rms, z = ?self.z, alpha = ?self.alpha, "Updated hyperparameters.");
        noise.neg_log_density(&self.z) + prior.neg_log_density(&self.alpha)
    }

    /// Negative log posterior of the current hyperparameters.
    fn objective(&self) -> f64 {
        self.noise_posterior().neg_log_density(&self.z)
            + self.prior_posterior().neg_log_density(&self.alpha)
    }

    /// Conditional posterior of the noise precisions given `dtheta`.
    pub(crate) fn noise_posterior(&self) -> GammaPosterior {
        let stats = self.data.stats();
        let frames = stats.frames as f64;
        let e0 = self.settings.e0;
        let (shape, rate): (Vec<f64>, Vec<f64>) = self
            .data
            .types()
            .counts()
            .iter()
            .enumerate()
            .map(|(t, &n)| {
                let resid = stats.f2[t] + quad_form(&stats.d2[t], &self.dtheta)
                    - 2f64 * col_dot(&stats.df[t], &self.dtheta);
                (1.5 * n as f64 * frames, 0.5 * (resid.max(0f64) + e0))
            })
            .unzip();
        GammaPosterior { shape, rate }
    }

    /// Conditional posterior of the prior precisions given the parameters.
    pub(crate) fn prior_posterior(&self) -> GammaPosterior {
        let theta = self.parameters();
        let bounds = self.topology.term_bounds();
        let e0 = self.settings.e0;
        let (shape, rate): (Vec<f64>, Vec<f64>) = self
            .topology
            .priors()
            .iter()
            .zip(self.topology.prior_ranks())
            .map(|(prior, &rank)| {
                let start = bounds[prior.term];
                let block = Col::from_fn(prior.precision.nrows(), |i| theta[start + i]);
                let penalty = quad_form(&prior.precision, &block);
                (0.5 * rank as f64, 0.5 * (penalty.max(0f64) + e0))
            })
            .unzip();
        GammaPosterior { shape, rate }
    }

    /// Linear system for the current hyperparameters.
    pub(crate) fn system(&self) -> LinearSystem {
        LinearSystem::assemble(
            self.data.stats(),
            &self.z,
            &self.basis,
            self.settings.constraint_weight,
            self.topology.priors(),
            self.topology.term_bounds(),
            &self.alpha,
        )
    }

    /// Conditional distribution of the parameters for the current
    /// hyperparameters.
    pub fn theta_stats(&self) -> Result<ThetaStats> {
        let system = self.system();
        let covariance = system.covariance(self.settings.sigma_tol)?;
        let mean = &covariance * &system.rhs;

        let stats = self.data.stats();
        let dmu2 = stats
            .d2
            .iter()
            .map(|d2| trace_product(&covariance, d2))
            .collect();
        let bounds = self.topology.term_bounds();
        let fv = self
            .topology
            .priors()
            .iter()
            .map(|prior| {
                let range = bounds[prior.term]..bounds[prior.term + 1];
                let block = diagonal_block(&covariance, range.clone());
                trace_product(&block, &stats.d2_block_total(range))
            })
            .collect();

        Ok(ThetaStats {
            mean,
            covariance,
            dmu2,
            fv,
        })
    }

    /// Eigenvalue diagnostics of the current precision matrix.
    pub fn dimensionality(&self) -> Result<DimensionReport> {
        dimensionality(&self.system().precision, self.settings.sigma_tol)
    }

    /// Move the reference point to `theta0` without changing the fitted
    /// parameters.
    pub fn recenter(&mut self, theta0: &[f64]) -> Result<()> {
        self.check_params(theta0)?;
        self.shift_reference(col_from_slice(theta0))
    }

    pub(crate) fn shift_reference(&mut self, target: Col<f64>) -> Result<()> {
        let total = self.parameters();
        self.data.recenter(&self.theta0, &target)?;
        let shift = Col::from_fn(target.nrows(), |i| self.theta0[i] - target[i]);
        self.samples.shift(&shift);
        self.dtheta = Col::from_fn(target.nrows(), |i| total[i] - target[i]);
        self.theta0 = target;
        Ok(())
    }

    pub(crate) fn parameters(&self) -> Col<f64> {
        Col::from_fn(self.theta0.nrows(), |i| self.theta0[i] + self.dtheta[i])
    }

    /// `theta0 + dtheta` in non-dimensional units.
    pub fn fitted_parameters(&self) -> Vec<f64> {
        col_to_vec(&self.parameters())
    }

    pub fn theta0(&self) -> &Col<f64> {
        &self.theta0
    }

    pub fn dtheta(&self) -> &Col<f64> {
        &self.dtheta
    }

    /// Noise precision per atom type, in the order of [`TypeIndex::labels`].
    pub fn z(&self) -> &[f64] {
        &self.z
    }

    pub fn alpha(&self) -> &[f64] {
        &self.alpha
    }

    pub fn dmu2(&self) -> &[f64] {
        &self.dmu2
    }

    pub fn df2(&self) -> &[f64] {
        &self.df2
    }

    pub fn frames(&self) -> usize {
        self.data.frames()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn num_params(&self) -> usize {
        self.theta0.nrows()
    }

    pub fn statistics(&self) -> &SufficientStats {
        self.data.stats()
    }

    pub fn types(&self) -> &TypeIndex {
        self.data.types()
    }

    pub fn topology(&self) -> &T {
        &self.topology
    }

    pub fn settings(&self) -> &FitSettings {
        &self.settings
    }

    /// Diagnostics found while setting up the fit.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn nonlinear_coefficients(&self, name: &str) -> Option<&[f64]> {
        self.data
            .nonlinear()
            .get(name)
            .map(|term| term.coefficients.as_slice())
    }

    pub fn posterior(&self) -> Option<&PosteriorSummary> {
        self.posterior.as_ref()
    }
}
