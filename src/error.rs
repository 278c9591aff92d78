use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that abort the current call.
///
/// Accumulated statistics are never modified by a failing call, so
/// callers may fix the problem (or the settings) and try again.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum FitError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Nonlinear term name '{0}' is reserved or already registered")]
    NameCollision(String),

    #[error(
        "Force design matrix is degenerate ({free} free and {fixed} fixed directions, \
         eigenvalues in [{smallest:e}, {largest:e}])"
    )]
    DegenerateDesign {
        free: usize,
        fixed: usize,
        smallest: f64,
        largest: f64,
    },

    #[error("Invalid settings: {0}")]
    Settings(String),

    #[error("Topology contract violated: {0}")]
    Topology(String),

    #[error("Quadratic program solver failed")]
    QuadraticProgram(#[source] BoxError),

    #[error(transparent)]
    Array(#[from] ndarray::ShapeError),

    #[error("Could not write sampling trace")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FitError>;

/// Conditions that are reported but do not abort a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// The outer loop used its iteration budget before the objective settled.
    NonConvergence { iterations: usize, delta: f64 },
    /// A constrained parameter draw violated the inequalities on every retry,
    /// the previous parameters were kept.
    SamplingRejection { step: usize, tries: usize },
    /// Some singular values of the equality constraint matrix are tiny.
    RedundantConstraints { count: usize, smallest: f64 },
    /// Inequality constraints exist but no quadratic program solver was
    /// configured, the point estimate only honors equality constraints.
    InequalitiesIgnored { count: usize },
}
