use thiserror::Error;

/// Failure classes for the generation pipeline.
///
/// The distinction that matters operationally is retryability: provider,
/// timeout, and persistence failures are charged against a page's retry
/// budget, while validation and assembly failures are not retried at all.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Missing or malformed generation inputs. Surfaced synchronously at
    /// enqueue time; never enters the queue.
    #[error("invalid generation request: {0}")]
    Validation(String),

    /// Network failure, non-success HTTP status, or an explicit failed state
    /// reported by a provider.
    #[error("provider error: {0}")]
    Provider(String),

    /// The poll loop exhausted its iteration ceiling without completion.
    #[error("provider timed out: {0}")]
    Timeout(String),

    /// Downloading or persisting a generated asset failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Laying out the final document failed. Fatal to the book even when
    /// every page succeeded.
    #[error("assembly error: {0}")]
    Assembly(String),
}

impl GenerationError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(_) | Self::Timeout(_) | Self::Persistence(_)
        )
    }
}
