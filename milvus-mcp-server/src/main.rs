//! Milvus MCP Server
//!
//! A Model Context Protocol (MCP) server that exposes Milvus vector database
//! operations to AI agents over stdio transport.
//!
//! ## Usage
//!
//! ```bash
//! # Connect to a local Milvus server (http://localhost:19530)
//! milvus-mcp-server
//!
//! # Connect to a remote server with a token
//! milvus-mcp-server --milvus-uri https://in01.example.com --milvus-token root:Milvus
//!
//! # Use the local SQLite store instead of a server
//! milvus-mcp-server --milvus-uri ./milvus.db
//!
//! # Enable verbose logging
//! milvus-mcp-server --verbose
//! ```
//!
//! ## MCP Configuration
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "milvus": {
//!       "command": "milvus-mcp-server",
//!       "args": ["--milvus-uri", "http://localhost:19530"]
//!     }
//!   }
//! }
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use milvus_mcp::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_DB_NAME, DEFAULT_MAX_LIMIT, DEFAULT_TIMEOUT_SECS, DEFAULT_URI,
};
use milvus_mcp::{ConnectionConfig, Limits, McpServer, ServerConfig};
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Milvus MCP Server - Expose vector database operations via Model Context Protocol
#[derive(Parser, Debug)]
#[command(name = "milvus-mcp-server")]
#[command(
    author,
    version,
    about = "Milvus MCP Server - Model Context Protocol interface for Milvus"
)]
struct Args {
    /// Milvus server URI, a local database file, or :memory:
    #[arg(long, env = "MILVUS_URI", default_value = DEFAULT_URI)]
    milvus_uri: String,

    /// Authentication token (user:password or API key)
    #[arg(long, env = "MILVUS_TOKEN", hide_env_values = true)]
    milvus_token: Option<String>,

    /// Database name
    #[arg(long, env = "MILVUS_DB", default_value = DEFAULT_DB_NAME)]
    db_name: String,

    /// Per-request timeout in seconds
    #[arg(long, env = "MILVUS_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Largest accepted result limit
    #[arg(long, env = "MILVUS_MCP_MAX_LIMIT", default_value_t = DEFAULT_MAX_LIMIT)]
    max_limit: usize,

    /// Rows per insert chunk
    #[arg(long, env = "MILVUS_MCP_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Enable verbose logging (outputs to stderr)
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Log filter, e.g. "info" or "milvus_mcp=debug" (overrides --verbose)
    #[arg(long, env = "MILVUS_MCP_LOG")]
    log_level: Option<String>,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            connection: ConnectionConfig::new(&self.milvus_uri)
                .with_token(self.milvus_token.clone())
                .with_db_name(&self.db_name)
                .with_timeout(Duration::from_secs(self.timeout_secs)),
            limits: Limits {
                max_limit: self.max_limit,
                batch_size: self.batch_size,
            },
        }
    }

    fn log_filter(&self) -> EnvFilter {
        match &self.log_level {
            Some(level) => EnvFilter::new(level),
            None if self.verbose => EnvFilter::new("debug"),
            // Quiet by default; stdout carries the protocol
            None => EnvFilter::new("error"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(args.log_filter())
        .init();

    let config = args.server_config();
    config.validate().context("invalid configuration")?;

    tracing::info!("Starting Milvus MCP server for {}", config.connection.uri);

    let server = McpServer::new(&config)
        .await
        .with_context(|| format!("failed to connect to {}", config.connection.uri))?;
    server.run().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_args_parsing() {
        let args = Args::try_parse_from(["milvus-mcp-server"]).unwrap();
        assert_eq!(args.milvus_uri, DEFAULT_URI);
        assert_eq!(args.db_name, DEFAULT_DB_NAME);
        assert!(!args.verbose);

        let args = Args::try_parse_from([
            "milvus-mcp-server",
            "--milvus-uri",
            "./milvus.db",
            "--max-limit",
            "100",
            "--batch-size",
            "50",
            "-v",
        ])
        .unwrap();
        assert_eq!(args.milvus_uri, "./milvus.db");
        assert!(args.verbose);

        let config = args.server_config();
        assert_eq!(config.limits.max_limit, 100);
        assert_eq!(config.limits.batch_size, 50);
        assert!(!config.connection.is_remote());
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        assert!(Args::try_parse_from(["milvus-mcp-server", "--batch-size", "lots"]).is_err());
    }

    #[tokio::test]
    async fn test_server_creation_with_local_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("milvus.db");
        let args =
            Args::try_parse_from(["milvus-mcp-server", "--milvus-uri", path.to_str().unwrap()])
                .unwrap();

        let server = McpServer::new(&args.server_config()).await;
        assert!(server.is_ok(), "Server should be created successfully");
    }
}
