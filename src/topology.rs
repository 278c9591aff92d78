//! Interfaces to the collaborators that describe the molecular system.
//!
//! Building the force field basis, parsing structures and solving
//! inequality constrained quadratic programs all happen outside of this
//! crate. The engine only sees them through the traits in this module.

use std::path::Path;

use faer::{Col, Mat};
use ndarray::{Array2, Array4, ArrayView3};

use crate::error::BoxError;

/// Basis expansion of the energy for a block of frames.
#[derive(Debug, Clone)]
pub struct Design {
    /// Energy basis summed over all interactions, `frames x P`.
    pub energy: Array2<f64>,
    /// Derivative of the energy basis with respect to the atom positions,
    /// `frames x atoms x 3 x P`. Only present if `order >= 1` was requested.
    pub gradient: Option<Array4<f64>>,
}

/// Gaussian smoothness prior for one force field sub-term.
#[derive(Debug, Clone)]
pub struct PriorBlock {
    /// Index of the sub-term, the block covers the parameters
    /// `term_bounds()[term]..term_bounds()[term + 1]`.
    pub term: usize,
    /// Precision matrix of the block, scaled by its own `alpha`.
    pub precision: Mat<f64>,
}

/// A force field that is linear in its parameters.
pub trait Topology: Sync {
    /// Total number of fit parameters `P`.
    fn num_params(&self) -> usize;

    /// Parameter index boundaries of the sub-terms.
    ///
    /// Has one more entry than there are sub-terms, starts at zero and
    /// ends at `num_params()`.
    fn term_bounds(&self) -> &[usize];

    /// Human readable label for every sub-term.
    fn term_names(&self) -> Vec<String>;

    /// Evaluate the basis (and, for `order >= 1`, its position derivative)
    /// for positions of shape `frames x atoms x 3`.
    fn design(&self, positions: ArrayView3<'_, f64>, order: usize) -> Design;

    /// Smoothness priors, one hyperparameter each.
    fn priors(&self) -> &[PriorBlock];

    /// Rank of each prior precision matrix.
    fn prior_ranks(&self) -> &[usize];

    /// Rows `C` with `C theta = 0` for every admissible parameter vector.
    fn equality_constraints(&self) -> Option<Mat<f64>> {
        None
    }

    /// Rows `G` with `G theta >= 0` for every admissible parameter vector.
    fn inequality_constraints(&self) -> Option<Mat<f64>> {
        None
    }

    fn num_hyperparams(&self) -> usize {
        self.priors().len()
    }

    /// Store fitted (dimensional) coefficients below `dir`.
    fn write_coefficients(&self, dir: &Path, coefficients: &[f64]) -> anyhow::Result<()>;
}

/// Atom level information about the simulated system.
pub trait Structure {
    fn num_atoms(&self) -> usize;
    fn type_label(&self, atom: usize) -> &str;
    fn mass(&self, atom: usize) -> f64;
}

/// Solver for inequality constrained quadratic programs.
///
/// Must return the minimizer of `0.5 x'Qx - c'x` subject to `G x >= h`
/// and, if present, `A x = b`.
pub trait QpSolver: Send + Sync {
    fn solve(
        &self,
        q: &Mat<f64>,
        c: &Col<f64>,
        g: &Mat<f64>,
        h: &Col<f64>,
        equality: Option<(&Mat<f64>, &Col<f64>)>,
    ) -> Result<Col<f64>, BoxError>;
}

/// Map from atoms to atom types.
#[derive(Debug, Clone)]
pub struct TypeIndex {
    labels: Vec<String>,
    of_atom: Vec<usize>,
    counts: Vec<usize>,
}

impl TypeIndex {
    /// Types are numbered in the order in which they first appear.
    pub fn new<S: Structure + ?Sized>(structure: &S) -> Self {
        let mut labels: Vec<String> = Vec::new();
        let mut counts = Vec::new();
        let mut of_atom = Vec::with_capacity(structure.num_atoms());
        for atom in 0..structure.num_atoms() {
            let label = structure.type_label(atom);
            let idx = match labels.iter().position(|known| known == label) {
                Some(idx) => idx,
                None => {
                    labels.push(label.to_string());
                    counts.push(0);
                    labels.len() - 1
                }
            };
            counts[idx] += 1;
            of_atom.push(idx);
        }
        Self {
            labels,
            of_atom,
            counts,
        }
    }

    pub fn num_types(&self) -> usize {
        self.labels.len()
    }

    pub fn num_atoms(&self) -> usize {
        self.of_atom.len()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Number of atoms of every type.
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.of_atom.iter().copied().enumerate()
    }

    /// Sum per-atom values over atoms sharing a type.
    pub fn reduce(&self, per_atom: &[f64]) -> Vec<f64> {
        assert!(per_atom.len() == self.num_atoms());
        let mut out = vec![0f64; self.num_types()];
        for (atom, ty) in self.iter() {
            out[ty] += per_atom[atom];
        }
        out
    }
}
