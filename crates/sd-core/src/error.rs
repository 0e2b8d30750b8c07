//! Error types for staggered DiD estimation

use thiserror::Error;

/// Workspace-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind() {
        let e = Error::Validation("weights must be positive".into());
        assert_eq!(e.to_string(), "Validation error: weights must be positive");
        let e = Error::Computation("singular".into());
        assert!(e.to_string().starts_with("Computation error"));
    }

    #[test]
    fn test_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.json");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
    }
}
