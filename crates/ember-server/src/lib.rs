//! Lifecycle management for Ember's local inference server.
//!
//! The desktop shell owns one [`ServerManager`]. Starting it finds a free
//! loopback port, launches the server process on it, waits for the server to
//! report readiness and then tells it which model to load over HTTP.
//!
//! ```ignore
//! use ember_server::{ServerConfig, ServerManager};
//!
//! let manager = ServerManager::new(ServerConfig::from_env());
//! manager.start("mlx-community/gemma-2b-it").await?;
//! // ...
//! manager.shutdown();
//! ```

pub mod cleanup;
mod client;
mod config;
mod error;
pub mod launch;
mod manager;
pub mod paths;
pub mod port;

pub use client::{HttpServerApi, ServerApi};
pub use config::{ReadinessProbe, ServerConfig, ServerConfigBuilder};
pub use error::ServerError;
pub use launch::Launcher;
pub use manager::{ServerManager, ServerPhase, ServerStatus};
pub use port::find_open_port;

/// Port the search for a free server port starts at.
pub const DEFAULT_PORT: u16 = 8080;

/// Interface the server binds to and is reached on.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Path of the init handshake endpoint.
pub const INIT_PATH: &str = "/api/init";

/// Line fragment the server prints once its HTTP listener is up.
///
/// Part of the contract with the server; bump the suffix if the server's
/// startup line changes.
pub const READY_MARKER_V1: &str = "Starting httpd";
