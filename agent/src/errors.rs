use infermesh_common::ErrorBody;
use thiserror::Error;

/// Errors that can occur in the worker outside of request execution.
#[derive(Error, Debug)]
pub enum AgentError {
    /// IO error occurred (config files, sockets)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP transport error talking to the manager
    #[error("HTTP error: {0}")]
    Http(String),

    /// The manager answered with a classified error
    #[error("Manager rejected request: {0}")]
    Manager(ErrorBody),
}

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<toml::ser::Error> for AgentError {
    fn from(e: toml::ser::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for AgentError {
    fn from(e: toml::de::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infermesh_common::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = AgentError::Config("capacity must be positive".to_string());
        assert_eq!(err.to_string(), "Configuration error: capacity must be positive");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let agent_err: AgentError = io_err.into();
        assert!(agent_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_manager_error_display() {
        let err = AgentError::Manager(ErrorBody::new(ErrorKind::Unauthorized, "bad key"));
        assert_eq!(err.to_string(), "Manager rejected request: unauthorized: bad key");
    }
}
