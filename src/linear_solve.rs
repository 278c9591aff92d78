use std::fmt;

use faer::linalg::solvers::{DenseSolveCore, Llt, Solve};
use faer::{Col, Mat, Scale, Side};
use tracing::warn;

use crate::accumulator::SufficientStats;
use crate::error::{FitError, Result};
use crate::math::{cholesky, symmetrize};
use crate::orthonormal::ConstraintBasis;
use crate::topology::{PriorBlock, QpSolver};

/// How the parameter update honors constraints.
///
/// Chosen once when the estimator is built. With `NullSpaceProjection`
/// the update is exact for equality constraints, but inequality constraints
/// are ignored by the point estimate (the sampler still rejects draws that
/// violate them).
#[derive(Default)]
pub enum SolveStrategy {
    #[default]
    NullSpaceProjection,
    QuadraticProgram(Box<dyn QpSolver>),
}

impl fmt::Debug for SolveStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStrategy::NullSpaceProjection => f.write_str("NullSpaceProjection"),
            SolveStrategy::QuadraticProgram(_) => f.write_str("QuadraticProgram"),
        }
    }
}

/// Eigenvalue summary of a precision matrix.
#[derive(Debug, Clone)]
pub struct DimensionReport {
    /// In ascending order.
    pub eigenvalues: Vec<f64>,
    /// Directions with eigenvalue below `sigma_tol²`, i.e. not determined by the data.
    pub free: usize,
    /// Directions with eigenvalue above `1 / sigma_tol²`.
    pub fixed: usize,
}

impl DimensionReport {
    pub fn smallest(&self) -> f64 {
        self.eigenvalues.first().copied().unwrap_or(f64::NAN)
    }

    pub fn largest(&self) -> f64 {
        self.eigenvalues.last().copied().unwrap_or(f64::NAN)
    }

    pub(crate) fn into_error(self) -> FitError {
        FitError::DegenerateDesign {
            free: self.free,
            fixed: self.fixed,
            smallest: self.smallest(),
            largest: self.largest(),
        }
    }
}

/// Count free and over-determined directions of a symmetric matrix.
pub fn dimensionality(precision: &Mat<f64>, sigma_tol: f64) -> Result<DimensionReport> {
    let mut precision = precision.clone();
    symmetrize(&mut precision);
    let eigen = precision
        .self_adjoint_eigen(Side::Lower)
        .map_err(|err| FitError::Topology(format!("eigendecomposition failed: {err:?}")))?;
    let mut eigenvalues: Vec<f64> = eigen.S().column_vector().iter().copied().collect();
    eigenvalues.sort_by(f64::total_cmp);

    let lower = sigma_tol * sigma_tol;
    let upper = 1f64 / lower;
    Ok(DimensionReport {
        free: eigenvalues.iter().filter(|&&e| e < lower).count(),
        fixed: eigenvalues.iter().filter(|&&e| e > upper).count(),
        eigenvalues,
    })
}

/// Diagnose a matrix whose factorization failed.
fn degenerate(matrix: &Mat<f64>, sigma_tol: f64) -> FitError {
    match dimensionality(matrix, sigma_tol) {
        Ok(report) => {
            warn!(
                free = report.free,
                fixed = report.fixed,
                smallest = report.smallest(),
                largest = report.largest(),
                "Precision matrix is not positive definite."
            );
            report.into_error()
        }
        Err(err) => err,
    }
}

/// Posterior precision and right hand side of the parameter update, for
/// fixed hyperparameters.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    pub precision: Mat<f64>,
    pub rhs: Col<f64>,
}

impl LinearSystem {
    /// `iC = sum_t z_t D2_t + w R'R + sum_k alpha_k P_k` and `rhs = sum_t z_t DF_t`,
    /// where `R` is the constraint row space and `P_k` the prior blocks.
    pub(crate) fn assemble(
        stats: &SufficientStats,
        z: &[f64],
        basis: &ConstraintBasis,
        constraint_weight: f64,
        priors: &[PriorBlock],
        term_bounds: &[usize],
        alpha: &[f64],
    ) -> Self {
        debug_assert_eq!(z.len(), stats.num_types());
        debug_assert_eq!(alpha.len(), priors.len());
        let params = stats.num_params();
        let mut precision = Mat::<f64>::zeros(params, params);
        let mut rhs = Col::<f64>::zeros(params);
        for (t, &weight) in z.iter().enumerate() {
            precision += Scale(weight) * &stats.d2[t];
            rhs += Scale(weight) * &stats.df[t];
        }
        if basis.is_constrained() {
            let penalty = basis.row_space.transpose() * &basis.row_space;
            precision += Scale(constraint_weight) * penalty;
        }
        for (prior, &weight) in priors.iter().zip(alpha) {
            let start = term_bounds[prior.term];
            let size = prior.precision.nrows();
            let mut block = precision.submatrix_mut(start, start, size, size);
            block += Scale(weight) * &prior.precision;
        }
        Self { precision, rhs }
    }

    /// Restrict to the feasible subspace: `(N iC N', N rhs)`.
    pub(crate) fn project(&self, basis: &ConstraintBasis) -> (Mat<f64>, Col<f64>) {
        let null = &basis.null_space;
        let tmp = null * &self.precision;
        let mut precision = &tmp * null.transpose();
        symmetrize(&mut precision);
        (precision, null * &self.rhs)
    }

    /// Cholesky factorization of the projected precision together with the
    /// projected right hand side.
    pub(crate) fn projected_factor(
        &self,
        basis: &ConstraintBasis,
        sigma_tol: f64,
    ) -> Result<(Llt<f64>, Col<f64>)> {
        let (precision, rhs) = self.project(basis);
        match cholesky(&precision) {
            Some(llt) => Ok((llt, rhs)),
            None => Err(degenerate(&precision, sigma_tol)),
        }
    }

    /// `iC⁻¹` on the full parameter space.
    pub(crate) fn covariance(&self, sigma_tol: f64) -> Result<Mat<f64>> {
        let mut precision = self.precision.clone();
        symmetrize(&mut precision);
        match cholesky(&precision) {
            Some(llt) => Ok(llt.inverse()),
            None => Err(degenerate(&precision, sigma_tol)),
        }
    }

    /// Minimize `0.5 d'iC d - rhs'd` over the feasible increments `d`.
    pub(crate) fn solve(
        &self,
        basis: &ConstraintBasis,
        strategy: &SolveStrategy,
        inequalities: Option<&Mat<f64>>,
        theta0: &Col<f64>,
        sigma_tol: f64,
    ) -> Result<Col<f64>> {
        let inequalities = inequalities.filter(|g| g.nrows() > 0);
        match (strategy, inequalities) {
            (SolveStrategy::QuadraticProgram(qp), Some(g)) => {
                self.solve_qp(qp.as_ref(), basis, g, theta0)
            }
            _ if basis.is_constrained() => {
                let (llt, rhs) = self.projected_factor(basis, sigma_tol)?;
                let reduced = llt.solve(&rhs);
                Ok(basis.null_space.transpose() * &reduced)
            }
            _ => {
                let mut precision = self.precision.clone();
                symmetrize(&mut precision);
                match cholesky(&precision) {
                    Some(llt) => Ok(llt.solve(&self.rhs)),
                    None => Err(degenerate(&precision, sigma_tol)),
                }
            }
        }
    }

    fn solve_qp(
        &self,
        qp: &dyn QpSolver,
        basis: &ConstraintBasis,
        g: &Mat<f64>,
        theta0: &Col<f64>,
    ) -> Result<Col<f64>> {
        // G (d + theta0) >= 0
        let h = -(g * theta0);
        let zeros = Col::zeros(basis.num_constraints());
        let equality = basis
            .has_nonzero_rows()
            .then_some((&basis.row_space, &zeros));

        let out = qp
            .solve(&self.precision, &self.rhs, g, &h, equality)
            .map_err(FitError::QuadraticProgram)?;
        if out.nrows() != self.rhs.nrows() {
            return Err(FitError::ShapeMismatch(format!(
                "quadratic program returned {} values for {} parameters",
                out.nrows(),
                self.rhs.nrows()
            )));
        }
        Ok(out)
    }
}
