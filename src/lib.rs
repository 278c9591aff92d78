//! Bayesian force matching.
//!
//! Fits the parameters of a coarse grained force field, linear in its
//! parameters plus optional nonlinear terms, to atomistic forces. Noise
//! precisions per atom type and smoothness prior precisions are inferred
//! together with the parameters, either as a maximum a posteriori estimate
//! ([`ForceMatch::maximize`]) or by Gibbs sampling ([`ForceMatch::sample`]).

pub(crate) mod accumulator;
pub(crate) mod error;
pub(crate) mod estimator;
pub(crate) mod linear_solve;
pub(crate) mod lm;
pub(crate) mod math;
pub(crate) mod nonlinear;
pub(crate) mod orthonormal;
pub(crate) mod posterior;
pub(crate) mod report;
pub(crate) mod settings;
pub(crate) mod topology;

pub use accumulator::SufficientStats;
pub use error::{BoxError, Diagnostic, FitError, Result};
pub use estimator::{FitReport, ForceMatch, Phase, ThetaStats};
pub use linear_solve::{dimensionality, DimensionReport, LinearSystem, SolveStrategy};
pub use lm::{levenberg_marquardt, LmOutcome};
pub use nonlinear::{NonlinearForce, NonlinearTerm, TermId};
pub use orthonormal::{orthonormalize, ConstraintBasis};
pub use posterior::{PosteriorSummary, SampleReport};
pub use report::TypeVariance;
pub use settings::{FitSettings, LmSettings, SampleSettings};
pub use topology::{Design, PriorBlock, QpSolver, Structure, Topology, TypeIndex};
