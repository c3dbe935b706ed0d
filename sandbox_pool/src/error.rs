use std::error::Error as StdError;

/// Common error type for `sandbox_pool`.
///
/// Provisioning failures surface to the `connect` caller, teardown failures
/// are logged by the service and never block sibling teardowns. Tool-call
/// failures never become an `Error`; they travel inside the tool response.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("teardown failed: {0}")]
    Teardown(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    pub fn backend(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Convenience: wrap any error into `Backend` with "reqwest" context.
    pub fn backend_reqwest(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend {
            context: "reqwest".into(),
            source: Box::new(source),
        }
    }

    /// Whether this error came out of provisioning (as opposed to transport or input).
    pub fn is_provisioning(&self) -> bool {
        matches!(self, Self::Provisioning(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
