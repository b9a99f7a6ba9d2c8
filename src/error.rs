use std::path::PathBuf;

/// Errors from loading and validating the `mcpServers` config document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in config file {path}: {source}")]
    InvalidSyntax {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no 'mcpServers' found in config, or it was empty")]
    NoServers,

    #[error("invalid server config for '{name}': {reason}")]
    SchemaViolation { name: String, reason: String },
}

/// Errors from spawning and driving a child MCP server over stdio.
#[derive(Debug, thiserror::Error)]
pub enum ChildSessionError {
    #[error("failed to spawn child process for '{server}': {source}")]
    SpawnFailed {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("child stdio stream closed for '{server}'")]
    StreamClosed { server: String },

    #[error("initialize handshake with '{server}' timed out")]
    InitializeTimeout { server: String },

    #[error("child '{server}' rejected initialize: {reason}")]
    InitializeRejected { server: String, reason: String },

    #[error("child '{server}' returned a JSON-RPC error ({code}): {message}")]
    RpcError {
        server: String,
        code: i64,
        message: String,
    },

    #[error("session for '{server}' is not connected")]
    NotConnected { server: String },
}

/// Errors from mutating the route table directly.
#[derive(Debug, thiserror::Error)]
pub enum RouteTableError {
    #[error("route already mounted at {0}")]
    AlreadyMounted(String),
}

/// Errors surfaced while applying a reconfiguration.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("failed to mount server '{name}': {source}")]
    MountFailed {
        name: String,
        #[source]
        source: ChildSessionError,
    },
}
