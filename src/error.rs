use thiserror::Error;

/// Errors raised while planning or running a build.
///
/// The clash variants carry externally stable messages; tools and tests match
/// on the rendered string, so their wording must not drift.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Two task instances with identical specifications were submitted in the
    /// same build.
    #[error("Clashing build specification. Found duplicate tasks: '{first}' and '{second}'.")]
    DuplicateTaskSpec { first: String, second: String },

    /// Two distinct tasks digested to the same signature.
    #[error("Tasks '{first}' and '{second}' are clashing. They have the same signature '{signature}'.")]
    SignatureClash {
        first: String,
        second: String,
        signature: String,
    },

    /// Two tasks produced the same file path relative to their output roots.
    #[error("Tasks '{first}' and '{second}' are clashing. They produced the same file '{file}'.")]
    OutputClash {
        first: String,
        second: String,
        file: String,
    },

    /// Task dependencies do not form a DAG.
    #[error("Task dependencies form a cycle through '{0}'")]
    CyclicDependency(String),

    /// A task's own signature computation or execution failed.
    #[error("Task '{0}' failed.\n{1}")]
    TaskFailed(String, anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    PathFormat(#[from] camino::FromPathBufError),
}

/// Every failure observed while a task graph settled, in completion order.
///
/// The graph keeps draining after the first failure so that already-running
/// siblings finish; whatever they report ends up here too.
#[derive(Debug, Error)]
#[error("{} build task(s) failed; the first failure was: {}", .0.len(), .0[0])]
pub struct AggregateError(pub Vec<BuildError>);

impl AggregateError {
    /// Unwrap the first observed failure.
    pub fn into_first(self) -> BuildError {
        self.0
            .into_iter()
            .next()
            .expect("an aggregate error always carries at least one failure")
    }
}

/// Errors from the hex decoding utilities.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HexError {
    #[error("The given string has an odd length. Hex strings must be of even length.")]
    OddLength,

    #[error("The character '{0}' is not a valid hexadecimal digit. Allowed characters: 0-9, a-f, A-F.")]
    InvalidDigit(char),
}
