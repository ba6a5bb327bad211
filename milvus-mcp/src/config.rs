//! Server and connection configuration

use crate::error::{Error, Result};
use std::time::Duration;

/// Default Milvus endpoint
pub const DEFAULT_URI: &str = "http://localhost:19530";

/// Default database name
pub const DEFAULT_DB_NAME: &str = "default";

/// Default upper bound for `limit` arguments (Milvus' top-k cap)
pub const DEFAULT_MAX_LIMIT: usize = 16_384;

/// Default number of rows per mutation chunk
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default per-request timeout for remote backends
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Connection settings handed to the backend once at startup
#[derive(Clone)]
pub struct ConnectionConfig {
    /// `http(s)://host:port` for a Milvus server, a file path or `:memory:` for the local store
    pub uri: String,
    /// Optional credential, passed through as a bearer token
    pub token: Option<String>,
    /// Database name
    pub db_name: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            token: None,
            db_name: DEFAULT_DB_NAME.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl ConnectionConfig {
    /// Create a config for the given URI with default settings
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    /// Set the authentication token
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    /// Set the database name
    pub fn with_db_name(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = db_name.into();
        self
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the URI points at a remote Milvus server
    pub fn is_remote(&self) -> bool {
        self.uri.starts_with("http://") || self.uri.starts_with("https://")
    }
}

// Keep the token out of logs
impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("uri", &self.uri)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("db_name", &self.db_name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Limits applied by the validator and the batch coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest accepted `limit`; larger values are clamped
    pub max_limit: usize,
    /// Rows per mutation chunk when the caller does not choose one
    pub batch_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_limit: DEFAULT_MAX_LIMIT,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl Limits {
    /// Clamp a caller-supplied limit into `[1, max_limit]`
    pub fn clamp_limit(&self, requested: i64) -> usize {
        if requested < 1 {
            return 1;
        }
        usize::try_from(requested)
            .unwrap_or(usize::MAX)
            .min(self.max_limit)
    }

    /// Check the limits are usable
    pub fn validate(&self) -> Result<()> {
        if self.max_limit == 0 {
            return Err(Error::Config("max_limit must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Complete server configuration
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Backend connection
    pub connection: ConnectionConfig,
    /// Argument and batching limits
    pub limits: Limits,
}

impl ServerConfig {
    /// Validate the configuration before connecting
    pub fn validate(&self) -> Result<()> {
        if self.connection.uri.trim().is_empty() {
            return Err(Error::Config("connection URI must not be empty".to_string()));
        }
        self.limits.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        let limits = Limits {
            max_limit: 100,
            batch_size: 10,
        };
        assert_eq!(limits.clamp_limit(0), 1);
        assert_eq!(limits.clamp_limit(-7), 1);
        assert_eq!(limits.clamp_limit(42), 42);
        assert_eq!(limits.clamp_limit(1_000_000), 100);
    }

    #[test]
    fn test_token_is_redacted() {
        let config = ConnectionConfig::new("http://milvus:19530")
            .with_token(Some("root:Milvus".to_string()));
        let debug = format!("{:?}", config);
        assert!(!debug.contains("root:Milvus"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_empty_token_is_dropped() {
        let config = ConnectionConfig::default().with_token(Some(String::new()));
        assert!(config.token.is_none());
    }

    #[test]
    fn test_validate() {
        assert!(ServerConfig::default().validate().is_ok());

        let mut config = ServerConfig::default();
        config.limits.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.connection.uri = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_is_remote() {
        assert!(ConnectionConfig::new("https://in01.zillizcloud.com").is_remote());
        assert!(!ConnectionConfig::new("./milvus.db").is_remote());
        assert!(!ConnectionConfig::new(":memory:").is_remote());
    }
}
