//! Error types for the Pipecast server.
//!
//! Each subsystem owns a narrow error type:
//!
//! - [`ConfigError`](crate::config::ConfigError) - environment parsing failures
//! - [`TokenError`](crate::auth::TokenError) - token verification failures
//! - [`SendError`](crate::registry::SendError) - per-connection send failures
//!
//! [`ServerError`] is the top-level error used by the process entry point.
//! Only its variants are fatal; the subsystem errors above are logged and
//! isolated to the connection that produced them.
//!
//! # Example
//!
//! ```rust
//! use pipecast_server::error::ServerError;
//!
//! let err = ServerError::bind("0.0.0.0:3000", "address in use");
//! assert!(matches!(err, ServerError::Bind { .. }));
//! ```

use std::error::Error;
use std::fmt;

use crate::config::ConfigError;

/// Top-level error type for the Pipecast server.
///
/// # Error Categories
///
/// - **Configuration errors**: the environment could not be parsed
/// - **Input errors**: standard input is unusable as a line feed
/// - **Bind errors**: the listening socket could not be opened
/// - **Internal errors**: anything else
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error during startup.
    Config(ConfigError),

    /// The input stream cannot be used (for example, it is a terminal).
    Input(String),

    /// The HTTP listener could not bind to its address.
    Bind {
        /// The address that was requested.
        address: String,
        /// Why binding failed.
        reason: String,
    },

    /// Unexpected internal server error.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::Input(msg) => write!(f, "input error: {msg}"),
            Self::Bind { address, reason } => {
                write!(f, "failed to bind {address}: {reason}")
            }
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl ServerError {
    /// Creates a new input error.
    pub fn input(message: impl Into<String>) -> Self {
        Self::Input(message.into())
    }

    /// Creates a new bind error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use pipecast_server::error::ServerError;
    ///
    /// let err = ServerError::bind("0.0.0.0:80", "permission denied");
    /// assert_eq!(err.to_string(), "failed to bind 0.0.0.0:80: permission denied");
    /// ```
    pub fn bind(address: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Bind {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_config_displays_correctly() {
        let err = ServerError::Config(ConfigError::MissingEnvVar(
            "PIPECAST_JWT_SECRET".to_string(),
        ));
        assert_eq!(
            err.to_string(),
            "configuration error: missing required environment variable: PIPECAST_JWT_SECRET"
        );
    }

    #[test]
    fn server_error_input_displays_correctly() {
        let err = ServerError::input("no pipe");
        assert_eq!(err.to_string(), "input error: no pipe");
    }

    #[test]
    fn server_error_internal_displays_correctly() {
        let err = ServerError::internal("writer task panicked");
        assert_eq!(err.to_string(), "internal server error: writer task panicked");
    }

    #[test]
    fn config_error_converts_with_question_mark() {
        fn inner() -> Result<()> {
            let _: () = Err(ConfigError::MissingEnvVar("KEY".to_string()))?;
            Ok(())
        }

        assert!(matches!(inner().unwrap_err(), ServerError::Config(_)));
    }

    #[test]
    fn source_is_only_set_for_config_errors() {
        let err = ServerError::from(ConfigError::MissingEnvVar("KEY".to_string()));
        assert!(err.source().is_some());
        assert!(ServerError::input("x").source().is_none());
        assert!(ServerError::bind("a", "b").source().is_none());
    }
}
