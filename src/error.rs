use std::sync::Arc;

use thiserror::Error;

/// Errors raised by the memoization engine.
///
/// All variants are cheap to clone so that a terminal failure can be
/// replayed verbatim to every caller that requests the same identity.
#[derive(Debug, Clone, Error)]
pub enum OnceError {
    /// The wrapped type's mutable surface is not safe to memoize.
    ///
    /// Raised at wrap time, never deferred to the first call. Lists every
    /// offending member at once.
    #[error("{type_name} is not safe to memoize:\n{}", violations.join("\n"))]
    Configuration { type_name: String, violations: Vec<String> },

    /// A property was written after its value had already been read and
    /// thereby frozen.
    #[error("property {property} can only be set before it is first read")]
    SetAfterFirstGet { property: String },

    /// The underlying operation raised an error. The original cause is
    /// preserved and this wrapper is cached as the terminal result.
    #[error("{target} failed.")]
    InvocationFailed { target: String, cause: Arc<anyhow::Error> },

    /// The waiter was released by the container-wide cancellation signal.
    /// The in-flight operation still settles on its own and its outcome
    /// remains the cached terminal result.
    #[error("cancelled while waiting for {target}")]
    Cancelled { target: String },
}

impl OnceError {
    /// The original error raised by the operation, if this is a cached
    /// invocation failure.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            Self::InvocationFailed { cause, .. } => Some(cause),
            _ => None,
        }
    }
}
