//! Force terms that are not linear in their coefficients.

use std::fmt;

use faer::{Col, Mat, Scale};
use ndarray::{Array3, Array4, ArrayD, ArrayView3, Axis};

use crate::error::{FitError, Result};
use crate::topology::TypeIndex;

/// Identifies the contribution a force prediction comes from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TermId {
    /// The spline force field, linear in `theta`.
    Linear,
    Nonlinear(String),
}

impl TermId {
    /// Name under which the linear contribution is reported.
    pub const LINEAR_NAME: &'static str = "linear";

    pub fn parse(name: &str) -> Self {
        if name == Self::LINEAR_NAME {
            TermId::Linear
        } else {
            TermId::Nonlinear(name.to_string())
        }
    }
}

impl fmt::Display for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermId::Linear => f.write_str(Self::LINEAR_NAME),
            TermId::Nonlinear(name) => f.write_str(name),
        }
    }
}

/// A force model with coefficients entering nonlinearly.
///
/// Any extra arguments the model needs are fields of the implementing type.
pub trait NonlinearForce: Send + Sync {
    /// Precompute whatever the model needs from a block of positions
    /// (`frames x atoms x 3`). The first axis of the result must be frames.
    fn seed(&self, positions: ArrayView3<'_, f64>) -> ArrayD<f64>;

    /// Forces (`frames x atoms x 3`) for the given coefficients, in the
    /// units of the trajectory forces.
    fn force(&self, coefficients: &[f64], seed: &ArrayD<f64>) -> Array3<f64>;

    /// Derivative of [`NonlinearForce::force`] with respect to the
    /// coefficients, `frames x atoms x 3 x coefficients`.
    fn jacobian(&self, coefficients: &[f64], seed: &ArrayD<f64>) -> Array4<f64>;
}

/// Registered nonlinear term together with its per-chunk seeds.
pub struct NonlinearTerm {
    pub coefficients: Vec<f64>,
    pub model: Box<dyn NonlinearForce>,
    pub(crate) seeds: Vec<ArrayD<f64>>,
}

impl fmt::Debug for NonlinearTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonlinearTerm")
            .field("coefficients", &self.coefficients)
            .field("chunks", &self.seeds.len())
            .finish()
    }
}

impl NonlinearTerm {
    pub fn new(coefficients: Vec<f64>, model: Box<dyn NonlinearForce>) -> Self {
        Self {
            coefficients,
            model,
            seeds: Vec::new(),
        }
    }

    /// Seed the model on a new block of positions and return the seed with
    /// the (dimensional) force at the current coefficients. Both the force
    /// and the Jacobian must have the shape of the block.
    pub(crate) fn seed_block(
        &self,
        name: &str,
        positions: ArrayView3<'_, f64>,
    ) -> Result<(ArrayD<f64>, Array3<f64>)> {
        let (frames, atoms, _) = positions.dim();
        let seed = self.model.seed(positions);
        let force = self.model.force(&self.coefficients, &seed);
        if force.dim() != (frames, atoms, 3) {
            return Err(FitError::ShapeMismatch(format!(
                "nonlinear term '{name}' returned forces of shape {:?}, expected {:?}",
                force.shape(),
                [frames, atoms, 3]
            )));
        }
        let jacobian = self.model.jacobian(&self.coefficients, &seed);
        let expected = (frames, atoms, 3, self.coefficients.len());
        if jacobian.dim() != expected {
            return Err(FitError::ShapeMismatch(format!(
                "nonlinear term '{name}' returned a Jacobian of shape {:?}, expected {expected:?}",
                jacobian.shape()
            )));
        }
        Ok((seed, force))
    }

    /// Non-dimensional force prediction for cached chunk `chunk`.
    pub(crate) fn scaled_force(&self, coefficients: &[f64], chunk: usize, scale: &[f64]) -> Array3<f64> {
        let mut force = self.model.force(coefficients, &self.seeds[chunk]);
        scale_atoms(&mut force, scale);
        force
    }
}

/// Multiply every atom's entries (axis 1) by its own factor.
pub(crate) fn scale_atoms<D: ndarray::RemoveAxis>(values: &mut ndarray::Array<f64, D>, scale: &[f64]) {
    assert!(values.shape()[1] == scale.len());
    for (atom, mut sub) in values.axis_iter_mut(Axis(1)).enumerate() {
        sub *= scale[atom];
    }
}

/// Type weighted least squares problem for the coefficients of a single
/// nonlinear term, all other contributions held fixed.
pub(crate) struct TermObjective<'a> {
    /// Prediction of every other term minus the observed forces, per chunk.
    pub(crate) offsets: Vec<Array3<f64>>,
    pub(crate) term: &'a NonlinearTerm,
    pub(crate) scale: &'a [f64],
    pub(crate) types: &'a TypeIndex,
    pub(crate) z: &'a [f64],
}

impl TermObjective<'_> {
    fn residual(&self, coefficients: &[f64], chunk: usize) -> Array3<f64> {
        self.term.scaled_force(coefficients, chunk, self.scale) + &self.offsets[chunk]
    }

    /// `0.5 * sum_t z_t |R_t|²`
    pub(crate) fn error(&self, coefficients: &Col<f64>) -> f64 {
        let coefficients: Vec<f64> = coefficients.iter().copied().collect();
        let mut err = 0f64;
        for chunk in 0..self.offsets.len() {
            let resid = self.residual(&coefficients, chunk);
            for (atom, ty) in self.types.iter() {
                let r = resid.index_axis(Axis(1), atom);
                err += self.z[ty] * r.iter().map(|x| x * x).sum::<f64>();
            }
        }
        0.5 * err
    }

    /// Gradient `J'R` and Gauss-Newton matrix `J'J`, both type weighted.
    pub(crate) fn normal_equations(&self, coefficients: &Col<f64>) -> (Col<f64>, Mat<f64>) {
        let n = coefficients.nrows();
        let coefficients: Vec<f64> = coefficients.iter().copied().collect();
        let mut rj = Col::<f64>::zeros(n);
        let mut jj = Mat::<f64>::zeros(n, n);
        for chunk in 0..self.offsets.len() {
            let resid = self.residual(&coefficients, chunk);
            let mut jac = self
                .term
                .model
                .jacobian(&coefficients, &self.term.seeds[chunk]);
            scale_atoms(&mut jac, self.scale);
            let rows = resid.shape()[0] * 3;
            for (atom, ty) in self.types.iter() {
                let r_atom = resid.index_axis(Axis(1), atom);
                let j_atom = jac.index_axis(Axis(1), atom);
                let r = Col::from_fn(rows, |row| r_atom[[row / 3, row % 3]]);
                let m = Mat::from_fn(rows, n, |row, k| j_atom[[row / 3, row % 3, k]]);
                rj += Scale(self.z[ty]) * (m.transpose() * &r);
                jj += Scale(self.z[ty]) * (m.transpose() * &m);
            }
        }
        (rj, jj)
    }
}
