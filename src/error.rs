//! Error types for the MCP server and the automation driver.

use std::time::Duration;

use thiserror::Error;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// MCP server errors.
#[derive(Error, Debug)]
pub enum Error {
    /// JSON-RPC protocol error.
    #[error("JSON-RPC error: {code} - {message}")]
    JsonRpc {
        /// Error code.
        code: i32,
        /// Error message.
        message: String,
    },

    /// Tool not found.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Invalid tool parameters. Rejected before any automation I/O.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Automation session could not be established.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Connection establishment exceeded the configured timeout.
    #[error("connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The automation session died underneath us. The cached connection
    /// is invalidated; the next call reconnects.
    #[error("session lost: {0}")]
    SessionLost(String),

    /// An individual automation call failed. The connection survives.
    #[error("automation error: {0}")]
    Automation(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the JSON-RPC error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::JsonRpc { code, .. } => *code,
            Error::ToolNotFound(_) => codes::METHOD_NOT_FOUND,
            Error::InvalidParams(_) => codes::INVALID_PARAMS,
            Error::Connection(_) | Error::ConnectTimeout(_) => -32000,
            Error::SessionLost(_) => -32001,
            Error::Automation(_) => -32002,
            Error::Serialization(_) => codes::PARSE_ERROR,
            Error::Io(_) => -32003,
            Error::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Whether this error means the automation session itself is dead,
    /// as opposed to a single operation failing on a healthy session.
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self,
            Error::SessionLost(_) | Error::Connection(_) | Error::ConnectTimeout(_) | Error::Io(_)
        )
    }
}

/// Standard JSON-RPC error codes.
pub mod codes {
    /// Parse error.
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid request.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i32 = -32603;
}
