use crate::shape::Shape;

/// All errors that can occur within Vole.
///
/// One enum covers both the tensor substrate (shape/dtype faults) and the
/// lowering pipeline (illegal transitions, contract violations, verification
/// failures). A single error type across the workspace simplifies propagation.
///
/// Pipeline variants carry stage names as strings so this crate stays
/// independent of the pipeline crate's stage enum.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g., adding [2,3] to [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// DType mismatch between tensors in an operation.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Element count mismatch when creating a tensor from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication inner-dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}] — inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Caller attempted a stage that is not a legal successor of the
    /// current stage. Non-recoverable for this session.
    #[error("invalid transition: cannot run stage '{to}' after stage '{from}'")]
    InvalidTransition { from: String, to: String },

    /// Caller re-invoked a stage kind that already ran in this session.
    #[error("duplicate stage: '{stage}' already ran in this session")]
    DuplicateStage { stage: String },

    /// Artifact or debug view requested before the owning stage executed.
    #[error("stage '{stage}' has not run yet")]
    NotYetRun { stage: String },

    /// A stage's internal precondition failed (missing calibration data,
    /// artifact kind mismatch, malformed program, ...).
    #[error("stage execution failed: {0}")]
    StageExecution(String),

    /// Numeric or shape divergence beyond tolerance during verification.
    /// `detail` carries the full diagnostic payload (shapes, statistics).
    #[error("output {index} does not match reference output\n{detail}")]
    ComparisonMismatch { index: usize, detail: String },

    /// Expected operator occurrence counts not met.
    #[error("expected {expected} '{op}' nodes but found {found}. Nodes: {counts}")]
    NodeCountMismatch {
        op: String,
        expected: usize,
        found: usize,
        counts: String,
    },

    /// A textual pattern check over a stage's debug view failed.
    #[error("graph check failed: {0}")]
    CheckFailed(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout Vole.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
