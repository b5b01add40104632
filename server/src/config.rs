//! Server configuration module.
//!
//! Parses configuration from environment variables for the Pipecast server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PIPECAST_JWT_SECRET` | Yes | - | HMAC secret used to verify client tokens |
//! | `PORT` | No | 3000 | HTTP server port |
//! | `PIPECAST_WS_PATH` | No | `/ws` | WebSocket endpoint path |

use std::env;
use std::fmt;

use thiserror::Error;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 3000;

/// Default WebSocket endpoint path.
pub const DEFAULT_WS_PATH: &str = "/ws";

const JWT_SECRET_VAR: &str = "PIPECAST_JWT_SECRET";
const WS_PATH_VAR: &str = "PIPECAST_WS_PATH";

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// Pre-shared HMAC secret for token verification.
    pub jwt_secret: String,

    /// HTTP server port.
    pub port: u16,

    /// Path of the WebSocket upgrade endpoint.
    pub ws_path: String,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `PIPECAST_JWT_SECRET` is missing or empty
    /// - `PIPECAST_WS_PATH` does not start with `/`
    /// - `PORT` is not a valid u16
    ///
    /// # Example
    ///
    /// ```no_run
    /// use pipecast_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_port()?;
        let jwt_secret = parse_secret()?;
        let ws_path = parse_ws_path()?;

        Ok(Self {
            jwt_secret,
            port,
            ws_path,
        })
    }

    /// Builds a configuration directly, mostly for tests and embedding.
    pub fn new(jwt_secret: impl Into<String>, port: u16) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            port,
            ws_path: DEFAULT_WS_PATH.to_string(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("jwt_secret", &"<redacted>")
            .field("port", &self.port)
            .field("ws_path", &self.ws_path)
            .finish()
    }
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.trim().parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

fn parse_secret() -> Result<String, ConfigError> {
    match env::var(JWT_SECRET_VAR) {
        Ok(secret) if !secret.is_empty() => Ok(secret),
        Ok(_) | Err(env::VarError::NotPresent) => {
            Err(ConfigError::MissingEnvVar(JWT_SECRET_VAR.to_string()))
        }
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: JWT_SECRET_VAR.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse the PIPECAST_WS_PATH environment variable.
///
/// The path must be absolute and literal; an empty value falls back to the
/// default.
fn parse_ws_path() -> Result<String, ConfigError> {
    let path = match env::var(WS_PATH_VAR) {
        Ok(path) if !path.trim().is_empty() => path.trim().to_string(),
        _ => return Ok(DEFAULT_WS_PATH.to_string()),
    };

    if !path.starts_with('/') {
        return Err(ConfigError::InvalidFormat {
            var: WS_PATH_VAR.to_string(),
            message: format!("path must start with '/', got '{path}'"),
        });
    }

    if path.contains(['{', '}'])
        || path
            .split('/')
            .any(|segment| segment.starts_with(':') || segment.starts_with('*'))
    {
        return Err(ConfigError::InvalidFormat {
            var: WS_PATH_VAR.to_string(),
            message: format!("path must not contain route parameters, got '{path}'"),
        });
    }

    if path == "/health" {
        return Err(ConfigError::InvalidFormat {
            var: WS_PATH_VAR.to_string(),
            message: "'/health' is reserved for the health check".to_string(),
        });
    }

    Ok(path)
}
