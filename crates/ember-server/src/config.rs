//! Server manager configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::launch::Launcher;
use crate::paths::{packaged_server_path, resources_dir};
use crate::{DEFAULT_PORT, READY_MARKER_V1};

/// How the manager decides that a freshly spawned server is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessProbe {
    /// Scan the server's stdout for a literal marker.
    ///
    /// Compatibility shim for servers whose only signal is their log output.
    /// The marker is a versioned contract with the server, see
    /// [`READY_MARKER_V1`].
    LogMarker { marker: String },
    /// Poll the server over HTTP with doubling backoff until it answers.
    Poll {
        interval: Duration,
        max_interval: Duration,
    },
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self::LogMarker {
            marker: READY_MARKER_V1.to_string(),
        }
    }
}

/// Configuration for the server manager.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// First port tried by the port search (default: 8080)
    pub preferred_port: u16,
    /// Number of consecutive ports tried before giving up
    pub max_port_attempts: u16,
    /// How the server process is launched
    pub launcher: Launcher,
    /// Optional adapter weights passed to the server
    pub adapter_file: Option<PathBuf>,
    /// Readiness detection strategy
    pub readiness: ReadinessProbe,
    /// Pause between readiness and the init call
    pub init_grace: Duration,
    /// Bound on the init call (default: none, model loading can take minutes)
    pub init_timeout: Option<Duration>,
    /// Give up on readiness after this long (default: wait forever)
    pub ready_timeout: Option<Duration>,
    /// How long a stopped server gets to exit before it is killed
    pub stop_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let launcher = if cfg!(debug_assertions) {
            Launcher::development()
        } else {
            Launcher::Packaged {
                executable: packaged_server_path(&resources_dir()),
            }
        };

        Self {
            preferred_port: DEFAULT_PORT,
            max_port_attempts: 1000,
            launcher,
            adapter_file: None,
            readiness: ReadinessProbe::default(),
            init_grace: Duration::from_secs(1),
            init_timeout: None,
            ready_timeout: None,
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(port) = lookup("EMBER_SERVER_PORT").and_then(|v| v.parse().ok()) {
            config.preferred_port = port;
        }

        if let Some(attempts) = lookup("EMBER_MAX_PORT_ATTEMPTS").and_then(|v| v.parse().ok()) {
            config.max_port_attempts = attempts;
        }

        let mode = lookup("EMBER_SERVER_MODE").map(|v| v.to_lowercase());
        match mode.as_deref() {
            Some("packaged") | Some("production") => {
                let executable = lookup("EMBER_SERVER_EXECUTABLE")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| packaged_server_path(&resources_dir()));
                config.launcher = Launcher::Packaged { executable };
            }
            Some("development") | Some("dev") => {
                config.launcher = Launcher::development();
            }
            _ => {}
        }

        if let Launcher::Development {
            interpreter,
            module,
            working_dir,
        } = &mut config.launcher
        {
            if let Some(python) = lookup("EMBER_PYTHON") {
                *interpreter = PathBuf::from(python);
            }
            if let Some(server_module) = lookup("EMBER_SERVER_MODULE") {
                *module = server_module;
            }
            if let Some(dir) = lookup("EMBER_SERVER_DIR") {
                *working_dir = PathBuf::from(dir);
            }
        }

        config.adapter_file = lookup("EMBER_ADAPTER_FILE").map(PathBuf::from);

        if let Some(marker) = lookup("EMBER_READY_MARKER").filter(|m| !m.is_empty()) {
            config.readiness = ReadinessProbe::LogMarker { marker };
        }

        if let Some(ms) = lookup("EMBER_INIT_GRACE_MS").and_then(|v| v.parse().ok()) {
            config.init_grace = Duration::from_millis(ms);
        }

        if let Some(ms) = lookup("EMBER_INIT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.init_timeout = Some(Duration::from_millis(ms));
        }

        config
    }

    /// Create a builder for configuration.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for server configuration.
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn preferred_port(mut self, port: u16) -> Self {
        self.config.preferred_port = port;
        self
    }

    pub fn max_port_attempts(mut self, attempts: u16) -> Self {
        self.config.max_port_attempts = attempts;
        self
    }

    pub fn launcher(mut self, launcher: Launcher) -> Self {
        self.config.launcher = launcher;
        self
    }

    pub fn adapter_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.adapter_file = Some(path.into());
        self
    }

    pub fn readiness(mut self, readiness: ReadinessProbe) -> Self {
        self.config.readiness = readiness;
        self
    }

    pub fn init_grace(mut self, grace: Duration) -> Self {
        self.config.init_grace = grace;
        self
    }

    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.config.init_timeout = Some(timeout);
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.config.ready_timeout = Some(timeout);
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.config.stop_grace = grace;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.preferred_port, 8080);
        assert_eq!(config.init_grace, Duration::from_secs(1));
        assert_eq!(config.init_timeout, None);
        assert_eq!(config.ready_timeout, None);
        assert_eq!(
            config.readiness,
            ReadinessProbe::LogMarker {
                marker: "Starting httpd".to_string()
            }
        );
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("EMBER_SERVER_PORT", "9100"),
            ("EMBER_MAX_PORT_ATTEMPTS", "5"),
            ("EMBER_SERVER_MODE", "dev"),
            ("EMBER_PYTHON", "/usr/bin/python3"),
            ("EMBER_SERVER_DIR", "/src/ember"),
            ("EMBER_READY_MARKER", "Listening"),
            ("EMBER_INIT_GRACE_MS", "250"),
            ("EMBER_INIT_TIMEOUT_MS", "600000"),
        ]));

        assert_eq!(config.preferred_port, 9100);
        assert_eq!(config.max_port_attempts, 5);
        assert_eq!(config.init_grace, Duration::from_millis(250));
        assert_eq!(config.init_timeout, Some(Duration::from_secs(600)));
        assert_eq!(
            config.readiness,
            ReadinessProbe::LogMarker {
                marker: "Listening".to_string()
            }
        );
        assert_eq!(
            config.launcher,
            Launcher::Development {
                interpreter: PathBuf::from("/usr/bin/python3"),
                module: "server.server".to_string(),
                working_dir: PathBuf::from("/src/ember"),
            }
        );
    }

    #[test]
    fn test_from_lookup_packaged() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("EMBER_SERVER_MODE", "packaged"),
            ("EMBER_SERVER_EXECUTABLE", "/opt/ember/server/ember-server"),
        ]));

        assert_eq!(
            config.launcher,
            Launcher::Packaged {
                executable: PathBuf::from("/opt/ember/server/ember-server")
            }
        );
    }

    #[test]
    fn test_invalid_values_are_ignored() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("EMBER_SERVER_PORT", "not-a-port"),
            ("EMBER_READY_MARKER", ""),
        ]));
        assert_eq!(config.preferred_port, 8080);
        assert_eq!(config.readiness, ReadinessProbe::default());
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::builder()
            .preferred_port(9000)
            .init_grace(Duration::ZERO)
            .ready_timeout(Duration::from_secs(30))
            .adapter_file("adapters.npz")
            .build();

        assert_eq!(config.preferred_port, 9000);
        assert_eq!(config.init_grace, Duration::ZERO);
        assert_eq!(config.ready_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.adapter_file, Some(PathBuf::from("adapters.npz")));
    }
}
