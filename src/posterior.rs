//! Gibbs sampling of the parameters and hyperparameters.

use std::fs::File;
use std::io::{BufWriter, Write};

use faer::linalg::solvers::{Llt, Solve};
use faer::linalg::triangular_solve::solve_upper_triangular_in_place;
use faer::{Col, Mat, Par, Scale};
use itertools::Itertools;
use rand::Rng;
use rand_distr::{Distribution, Gamma, StandardNormal};
use tracing::{debug, info, instrument, warn};

use crate::error::{Diagnostic, FitError, Result};
use crate::estimator::{ForceMatch, GammaPosterior, Phase};
use crate::linear_solve::LinearSystem;
use crate::math::{axpy, quad_form};
use crate::orthonormal::ConstraintBasis;
use crate::settings::SampleSettings;
use crate::topology::Topology;

/// Values recorded once per macro step.
#[derive(Debug, Clone, Default)]
pub(crate) struct SampleStore {
    /// Conditional mean of `dtheta` given the hyperparameters of the step.
    pub(crate) means: Vec<Col<f64>>,
    pub(crate) dmu2: Vec<Vec<f64>>,
    pub(crate) fv: Vec<Vec<f64>>,
    pub(crate) inverse_z: Vec<Vec<f64>>,
    pub(crate) alpha: Vec<Vec<f64>>,
    pub(crate) resid2: Vec<Vec<f64>>,
}

impl SampleStore {
    pub(crate) fn len(&self) -> usize {
        self.means.len()
    }

    /// Express the stored increments relative to a moved reference point.
    pub(crate) fn shift(&mut self, shift: &Col<f64>) {
        for mean in self.means.iter_mut() {
            *mean += shift;
        }
    }
}

/// Posterior averages over the recorded macro steps.
#[derive(Debug, Clone)]
pub struct PosteriorSummary {
    pub draws: usize,
    /// Noise variance per type, sampled `1/z` plus the force variance due
    /// to parameter uncertainty.
    pub variance: Vec<f64>,
    /// Sample mean of `1/z`.
    pub mean_inverse_z: Vec<f64>,
    /// Sample standard deviation of `1/z`.
    pub sd_inverse_z: Vec<f64>,
    /// Mean squared residual per type.
    pub resid2: Vec<f64>,
    pub mean_alpha: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct SampleReport {
    pub draws: usize,
    /// Sweeps in which every parameter draw violated the inequalities.
    pub rejected: usize,
    pub diagnostics: Vec<Diagnostic>,
}

/// Gaussian conditional of the parameters on the feasible subspace.
pub(crate) struct ThetaSampler {
    /// Cholesky factorization of the projected precision.
    factor: Llt<f64>,
    /// Conditional mean in null space coordinates.
    mean: Col<f64>,
    /// Maps null space coordinates to parameters.
    lift: Mat<f64>,
}

impl ThetaSampler {
    pub(crate) fn new(system: &LinearSystem, basis: &ConstraintBasis, sigma_tol: f64) -> Result<Self> {
        let (factor, rhs) = system.projected_factor(basis, sigma_tol)?;
        let mean = factor.solve(&rhs);
        Ok(Self {
            factor,
            mean,
            lift: basis.null_space.transpose().to_owned(),
        })
    }

    pub(crate) fn mean(&self) -> Col<f64> {
        &self.lift * &self.mean
    }

    /// `mean + L⁻ᵀ e` with standard normal `e`, lifted to parameter space.
    pub(crate) fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Col<f64> {
        let mut noise = Col::<f64>::from_fn(self.mean.nrows(), |_| rng.sample(StandardNormal));
        solve_upper_triangular_in_place(self.factor.L().transpose(), noise.as_mat_mut(), Par::Seq);
        &self.lift * (&self.mean + noise)
    }
}

fn draw_gamma<R: Rng + ?Sized>(posterior: &GammaPosterior, rng: &mut R) -> Result<Vec<f64>> {
    posterior
        .shape
        .iter()
        .zip(&posterior.rate)
        .map(|(&shape, &rate)| {
            let gamma = Gamma::new(shape, 1f64)
                .map_err(|err| FitError::Settings(format!("Gamma shape {shape}: {err}")))?;
            Ok(gamma.sample(&mut *rng) / rate)
        })
        .collect()
}

fn column_means(rows: &[Vec<f64>]) -> Vec<f64> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    let mut out = vec![0f64; first.len()];
    let weight = 1f64 / rows.len() as f64;
    for row in rows {
        axpy(row, &mut out, weight);
    }
    out
}

fn column_sds(rows: &[Vec<f64>], means: &[f64]) -> Vec<f64> {
    let n = rows.len() as f64;
    (0..means.len())
        .map(|j| {
            let ss: f64 = rows.iter().map(|row| (row[j] - means[j]).powi(2)).sum();
            (ss / n).sqrt()
        })
        .collect()
}

fn write_trace_row(trace: &mut BufWriter<File>, values: &[f64]) -> std::io::Result<()> {
    writeln!(trace, "{}", values.iter().map(|v| format!("{v:e}")).join(" "))
}

impl<T: Topology> ForceMatch<T> {
    /// One unconstrained draw of `dtheta` from its conditional posterior.
    pub fn draw_theta<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Col<f64>> {
        let sampler = ThetaSampler::new(&self.system(), &self.basis, self.settings.sigma_tol)?;
        Ok(sampler.draw(rng))
    }

    fn is_feasible(&self, dtheta: &Col<f64>) -> bool {
        let Some(g) = &self.inequalities else {
            return true;
        };
        let values = g * (&self.theta0 + dtheta);
        let feasible = values.iter().all(|&v| v >= 0f64);
        feasible
    }

    /// One Gibbs sweep: parameters, then noise precisions, then prior
    /// precisions, each conditional on the current value of the others.
    pub(crate) fn update_sample<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        step: usize,
        max_redraws: usize,
    ) -> Result<Option<Diagnostic>> {
        let sampler = ThetaSampler::new(&self.system(), &self.basis, self.settings.sigma_tol)?;
        // The first draw plus up to `max_redraws` redraws of the noise.
        let tries = max_redraws + 1;
        let mut diagnostic = None;
        let accepted = (0..tries)
            .map(|_| sampler.draw(&mut *rng))
            .find(|candidate| self.is_feasible(candidate));
        match accepted {
            Some(dtheta) => self.dtheta = dtheta,
            None => {
                warn!(step, tries, "Every parameter draw violated the inequality constraints.");
                diagnostic = Some(Diagnostic::SamplingRejection { step, tries });
            }
        }

        self.z = draw_gamma(&self.noise_posterior(), rng)?;
        self.alpha = draw_gamma(&self.prior_posterior(), rng)?;
        Ok(diagnostic)
    }

    /// Run the Gibbs sampler and replace the point estimate by posterior
    /// averages.
    ///
    /// `burn_in` macro steps are discarded, then `draws` are recorded. Each
    /// macro step consists of `thin` sweeps.
    #[instrument(skip_all, fields(draws = settings.draws, burn_in = settings.burn_in))]
    pub fn sample<R: Rng + ?Sized>(
        &mut self,
        settings: &SampleSettings,
        rng: &mut R,
    ) -> Result<SampleReport> {
        settings.validate()?;
        self.enter_fitting()?;
        info!(thin = settings.thin, "Starting posterior sampling.");
        match self.run_sampler(settings, rng) {
            Ok(report) => {
                self.phase = Phase::Converged;
                Ok(report)
            }
            Err(err) => {
                warn!(%err, "Sampling failed.");
                self.phase = Phase::Failed;
                Err(err)
            }
        }
    }

    fn run_sampler<R: Rng + ?Sized>(
        &mut self,
        settings: &SampleSettings,
        rng: &mut R,
    ) -> Result<SampleReport> {
        let mut diagnostics = Vec::new();
        let mut step = 0;
        for _ in 0..settings.burn_in {
            for _ in 0..settings.thin {
                diagnostics.extend(self.update_sample(rng, step, settings.max_redraws)?);
                step += 1;
            }
        }
        debug!(sweeps = step, "Burn-in finished.");

        let mut trace = match &settings.alpha_trace {
            Some(path) => Some(BufWriter::new(File::create(path)?)),
            None => None,
        };
        self.samples = SampleStore::default();
        for _ in 0..settings.draws {
            for _ in 0..settings.thin {
                diagnostics.extend(self.update_sample(rng, step, settings.max_redraws)?);
                step += 1;
                if let Some(trace) = trace.as_mut() {
                    write_trace_row(trace, &self.alpha)?;
                }
            }
            self.record()?;
        }
        if let Some(mut trace) = trace {
            trace.flush()?;
        }

        self.posterior_estimate();
        let rejected = diagnostics
            .iter()
            .filter(|d| matches!(d, Diagnostic::SamplingRejection { .. }))
            .count();
        info!(draws = self.samples.len(), rejected, "Sampling finished.");
        Ok(SampleReport {
            draws: self.samples.len(),
            rejected,
            diagnostics,
        })
    }

    fn record(&mut self) -> Result<()> {
        let stats = self.theta_stats()?;
        let resid2 = self.noise_posterior().residual_variance(self.settings.e0);
        let inverse_z = self.z.iter().map(|z| 1f64 / z).collect();
        self.samples.means.push(stats.mean);
        self.samples.dmu2.push(stats.dmu2);
        self.samples.fv.push(stats.fv);
        self.samples.inverse_z.push(inverse_z);
        self.samples.alpha.push(self.alpha.clone());
        self.samples.resid2.push(resid2);
        Ok(())
    }

    /// Reduce the recorded steps to posterior means.
    ///
    /// The force variance due to parameter uncertainty has a within-step
    /// part (the conditional traces) and a between-step part (spread of the
    /// conditional means, propagated through `D2`).
    pub(crate) fn posterior_estimate(&mut self) {
        let draws = self.samples.len();
        if draws == 0 {
            return;
        }
        let params = self.num_params();
        let mut mean = Col::<f64>::zeros(params);
        for m in &self.samples.means {
            mean += Scale(1f64 / draws as f64) * m;
        }

        let stats = self.data.stats();
        let bounds = self.topology.term_bounds();
        let ranges: Vec<_> = self
            .topology
            .priors()
            .iter()
            .map(|prior| bounds[prior.term]..bounds[prior.term + 1])
            .collect();
        let block_totals: Vec<Mat<f64>> = ranges
            .iter()
            .map(|range| stats.d2_block_total(range.clone()))
            .collect();

        let mut dmu2 = vec![0f64; stats.num_types()];
        let mut df2 = vec![0f64; ranges.len()];
        for (s, m) in self.samples.means.iter().enumerate() {
            let dmu = m - &mean;
            for (t, out) in dmu2.iter_mut().enumerate() {
                *out += self.samples.dmu2[s][t] + quad_form(&stats.d2[t], &dmu);
            }
            for (k, out) in df2.iter_mut().enumerate() {
                let block = Col::from_fn(ranges[k].len(), |i| dmu[ranges[k].start + i]);
                *out += self.samples.fv[s][k] + quad_form(&block_totals[k], &block);
            }
        }

        let frames = stats.frames as f64;
        let counts = self.data.types().counts();
        for (out, &n) in dmu2.iter_mut().zip(counts) {
            *out /= draws as f64 * frames * 3f64 * n as f64;
        }
        let components = draws as f64 * frames * 3f64 * self.data.types().num_atoms() as f64;
        for out in df2.iter_mut() {
            *out /= components;
        }

        let mean_inverse_z = column_means(&self.samples.inverse_z);
        let sd_inverse_z = column_sds(&self.samples.inverse_z, &mean_inverse_z);
        let variance: Vec<f64> = mean_inverse_z
            .iter()
            .zip(&dmu2)
            .map(|(v, d)| v + d)
            .collect();
        let mean_alpha = column_means(&self.samples.alpha);

        self.dtheta = mean;
        self.z = variance.iter().map(|v| 1f64 / v).collect();
        self.alpha = mean_alpha.clone();
        self.dmu2 = dmu2;
        self.df2 = df2;
        self.posterior = Some(PosteriorSummary {
            draws,
            variance,
            mean_inverse_z,
            sd_inverse_z,
            resid2: column_means(&self.samples.resid2),
            mean_alpha,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::col_from_slice;
    use crate::orthonormal::orthonormalize;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn system() -> LinearSystem {
        let mut precision = Mat::zeros(2, 2);
        precision[(0, 0)] = 2f64;
        precision[(0, 1)] = 0.5;
        precision[(1, 0)] = 0.5;
        precision[(1, 1)] = 1f64;
        LinearSystem {
            precision,
            rhs: col_from_slice(&[1., -1.]),
        }
    }

    #[test]
    fn draws_follow_inverse_precision() {
        let system = system();
        let basis = ConstraintBasis::unconstrained(2);
        let sampler = ThetaSampler::new(&system, &basis, 1e-5).unwrap();
        let mean = sampler.mean();
        // iC⁻¹ = [[1, -0.5], [-0.5, 2]] / 1.75
        assert_abs_diff_eq!(mean[0], 1.5 / 1.75, epsilon = 1e-12);
        assert_abs_diff_eq!(mean[1], -2.5 / 1.75, epsilon = 1e-12);

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let n = 20_000;
        let draws: Vec<Col<f64>> = (0..n).map(|_| sampler.draw(&mut rng)).collect();
        let mut cov = [[0f64; 2]; 2];
        let mut avg = [0f64; 2];
        for d in &draws {
            for i in 0..2 {
                avg[i] += d[i] / n as f64;
            }
        }
        for d in &draws {
            for i in 0..2 {
                for j in 0..2 {
                    cov[i][j] += (d[i] - avg[i]) * (d[j] - avg[j]) / n as f64;
                }
            }
        }
        assert_abs_diff_eq!(avg[0], mean[0], epsilon = 0.03);
        assert_abs_diff_eq!(avg[1], mean[1], epsilon = 0.03);
        assert_abs_diff_eq!(cov[0][0], 1. / 1.75, epsilon = 0.03);
        assert_abs_diff_eq!(cov[0][1], -0.5 / 1.75, epsilon = 0.03);
        assert_abs_diff_eq!(cov[1][1], 2. / 1.75, epsilon = 0.05);
    }

    #[test]
    fn constrained_draws_stay_feasible() {
        let mut system = LinearSystem {
            precision: Mat::identity(3, 3),
            rhs: col_from_slice(&[1., 2., 3.]),
        };
        system.precision[(0, 1)] = 0.2;
        system.precision[(1, 0)] = 0.2;
        let c = Mat::from_fn(1, 3, |_, _| 1f64);
        let (basis, _) = orthonormalize(&c, 1e-8).unwrap();
        let sampler = ThetaSampler::new(&system, &basis, 1e-5).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..100 {
            let d = sampler.draw(&mut rng);
            assert_abs_diff_eq!(d[0] + d[1] + d[2], 0f64, epsilon = 1e-10);
        }
    }

    #[test]
    fn gamma_draws_have_the_right_mean() {
        let posterior = GammaPosterior {
            shape: vec![50.],
            rate: vec![10.],
        };
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let n = 20_000;
        let total: f64 = (0..n)
            .map(|_| draw_gamma(&posterior, &mut rng).unwrap()[0])
            .sum();
        assert_abs_diff_eq!(total / n as f64, 5., epsilon = 0.05);
    }

    #[test]
    fn column_statistics() {
        let rows = vec![vec![1., 10.], vec![3., 10.]];
        let means = column_means(&rows);
        assert_eq!(means, vec![2., 10.]);
        assert_eq!(column_sds(&rows, &means), vec![1., 0.]);
        assert!(column_means(&[]).is_empty());
    }

    #[test]
    fn stored_means_follow_the_reference() {
        let mut store = SampleStore::default();
        store.means.push(col_from_slice(&[1., 2.]));
        store.shift(&col_from_slice(&[0.5, -1.]));
        assert_eq!(store.len(), 1);
        assert_eq!(store.means[0][0], 1.5);
        assert_eq!(store.means[0][1], 1.);
    }
}
