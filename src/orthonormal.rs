use faer::Mat;
use tracing::warn;

use crate::error::{Diagnostic, FitError, Result};

/// Orthonormal split of parameter space with respect to a set of linear
/// equality constraints.
///
/// Both bases are stored row-wise: each row of `row_space` spans the
/// constrained directions, each row of `null_space` a feasible direction.
/// Stacked together they form a square orthogonal matrix.
#[derive(Debug, Clone)]
pub struct ConstraintBasis {
    pub row_space: Mat<f64>,
    pub null_space: Mat<f64>,
}

impl ConstraintBasis {
    /// No constraints: the feasible subspace is all of parameter space.
    pub fn unconstrained(params: usize) -> Self {
        Self {
            row_space: Mat::zeros(0, params),
            null_space: Mat::identity(params, params),
        }
    }

    pub fn num_params(&self) -> usize {
        self.null_space.ncols()
    }

    pub fn num_constraints(&self) -> usize {
        self.row_space.nrows()
    }

    pub fn is_constrained(&self) -> bool {
        self.row_space.nrows() > 0
    }

    /// Whether any constraint row carries a non-negligible entry.
    pub(crate) fn has_nonzero_rows(&self) -> bool {
        let rows = &self.row_space;
        (0..rows.nrows()).any(|i| (0..rows.ncols()).any(|j| rows[(i, j)].abs() >= 1e-10))
    }
}

/// Decompose a `K x P` constraint matrix into orthonormal row-space and
/// null-space bases.
///
/// Redundant constraints (tiny singular values) are reported through the
/// returned diagnostic but the full decomposition is still returned.
pub fn orthonormalize(
    constraints: &Mat<f64>,
    redundancy_tol: f64,
) -> Result<(ConstraintBasis, Option<Diagnostic>)> {
    let (nrows, params) = constraints.shape();
    if nrows == 0 {
        return Ok((ConstraintBasis::unconstrained(params), None));
    }

    let svd = constraints.svd().map_err(|err| {
        FitError::Topology(format!("SVD of the equality constraints failed: {err:?}"))
    })?;
    let singular = svd.S().column_vector().to_owned();
    let v = svd.V().to_owned();

    let rank = nrows.min(params);
    let row_space = Mat::from_fn(rank, params, |i, j| v[(j, i)]);
    let null_space = Mat::from_fn(params - rank, params, |i, j| v[(j, rank + i)]);

    let tiny: Vec<f64> = singular
        .iter()
        .copied()
        .filter(|s| s.abs() < redundancy_tol)
        .collect();
    let diagnostic = if tiny.is_empty() {
        None
    } else {
        let smallest = tiny.iter().copied().fold(f64::INFINITY, f64::min);
        warn!(
            count = tiny.len(),
            smallest, "Equality constraints are degenerate."
        );
        Some(Diagnostic::RedundantConstraints {
            count: tiny.len(),
            smallest,
        })
    };

    Ok((
        ConstraintBasis {
            row_space,
            null_space,
        },
        diagnostic,
    ))
}
