//! Error types for server lifecycle operations.

use thiserror::Error;

/// Errors that can occur while starting, supervising or stopping the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Every port in the search window was already taken.
    #[error("No free port found after {attempts} attempts starting at {start}")]
    NoPortAvailable { start: u16, attempts: u16 },

    /// Binding the probe socket failed for a reason other than the port being in use.
    #[error("Failed to probe port {port}: {source}")]
    PortProbe {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The server process could not be created.
    #[error("Failed to spawn server `{program}`: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The server process exited before it reported readiness.
    #[error("Server exited before becoming ready (exit code: {})", display_code(.code))]
    ServerExitedBeforeReady { code: Option<i32> },

    /// Waiting on the server process failed.
    #[error("Server process failed: {0}")]
    ProcessFailed(String),

    /// HTTP request to the server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered the init handshake with a non-success status.
    #[error("Server rejected init with status {status}: {body}")]
    InitRejected { status: u16, body: String },

    /// Timeout waiting for the server to become ready.
    #[error("Timeout waiting for server to become ready")]
    ServerStartTimeout,

    /// The start was superseded by `stop` or by a newer `start`.
    #[error("Server start was cancelled")]
    StartCancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "killed by signal".to_string(),
    }
}
