//! Building and spawning the server process.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::error::ServerError;
use crate::paths::development_root;
use crate::LOOPBACK_HOST;

/// How the server process is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launcher {
    /// Pre-built executable shipped with the application.
    Packaged { executable: PathBuf },
    /// Server module run through an interpreter from a source checkout.
    Development {
        interpreter: PathBuf,
        module: String,
        working_dir: PathBuf,
    },
    /// Any other program; the server arguments are appended after `args`.
    Custom { program: PathBuf, args: Vec<String> },
}

impl Launcher {
    /// Development launcher for `python -m server.server` from the project root.
    pub fn development() -> Self {
        Launcher::Development {
            interpreter: PathBuf::from("python"),
            module: "server.server".to_string(),
            working_dir: development_root(),
        }
    }

    /// The program that gets executed.
    pub fn program(&self) -> &Path {
        match self {
            Launcher::Packaged { executable } => executable,
            Launcher::Development { interpreter, .. } => interpreter,
            Launcher::Custom { program, .. } => program,
        }
    }
}

/// Arguments understood by the inference server.
pub fn server_args(port: u16, model: &str, adapter_file: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "--model".to_string(),
        model.to_string(),
        "--host".to_string(),
        LOOPBACK_HOST.to_string(),
        "--port".to_string(),
        port.to_string(),
    ];

    if let Some(adapter) = adapter_file {
        args.push("--adapter-file".to_string());
        args.push(adapter.display().to_string());
    }

    args
}

/// Build the command for a launcher without spawning it.
///
/// stdout and stderr are piped so the manager can watch them. The child is
/// killed if its handle is dropped.
pub fn build_command(launcher: &Launcher, server_args: &[String]) -> Command {
    let mut cmd = match launcher {
        Launcher::Packaged { executable } => Command::new(executable),
        Launcher::Development {
            interpreter,
            module,
            working_dir,
        } => {
            let mut cmd = Command::new(interpreter);
            cmd.arg("-m")
                .arg(module)
                .current_dir(working_dir)
                // Piped stdout is block-buffered otherwise and the ready line never shows up.
                .env("PYTHONUNBUFFERED", "1");
            cmd
        }
        Launcher::Custom { program, args } => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    };

    cmd.args(server_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd
}

/// Spawn the server process.
pub fn spawn_server(launcher: &Launcher, server_args: &[String]) -> Result<Child, ServerError> {
    info!(
        "Launching server: {} {}",
        launcher.program().display(),
        server_args.join(" ")
    );

    let child = build_command(launcher, server_args)
        .spawn()
        .map_err(|source| ServerError::SpawnFailed {
            program: launcher.program().display().to_string(),
            source,
        })?;

    debug!("Server process started with PID: {:?}", child.id());
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_server_args() {
        let args = server_args(8081, "mlx-community/gemma-2b", None);
        assert_eq!(
            args,
            [
                "--model",
                "mlx-community/gemma-2b",
                "--host",
                "127.0.0.1",
                "--port",
                "8081"
            ]
        );
    }

    #[test]
    fn test_server_args_with_adapter() {
        let args = server_args(8080, "llama", Some(Path::new("adapters.npz")));
        assert_eq!(&args[6..], ["--adapter-file", "adapters.npz"]);
    }

    #[test]
    fn test_development_command() {
        let launcher = Launcher::Development {
            interpreter: PathBuf::from("python3"),
            module: "server.server".to_string(),
            working_dir: PathBuf::from("/src/ember"),
        };
        let cmd = build_command(&launcher, &server_args(8080, "m", None));
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), OsStr::new("python3"));
        assert_eq!(std_cmd.get_current_dir(), Some(Path::new("/src/ember")));
        assert_eq!(
            args_of(&cmd)[..4],
            ["-m", "server.server", "--model", "m"]
        );
        assert!(std_cmd
            .get_envs()
            .any(|(k, v)| k == "PYTHONUNBUFFERED" && v == Some(OsStr::new("1"))));
    }

    #[test]
    fn test_packaged_command() {
        let launcher = Launcher::Packaged {
            executable: PathBuf::from("/opt/ember/server/ember-server"),
        };
        let cmd = build_command(&launcher, &server_args(9000, "m", None));

        assert_eq!(
            cmd.as_std().get_program(),
            OsStr::new("/opt/ember/server/ember-server")
        );
        assert_eq!(args_of(&cmd)[0], "--model");
        assert_eq!(cmd.as_std().get_current_dir(), None);
    }

    #[test]
    fn test_custom_command_appends_server_args() {
        let launcher = Launcher::Custom {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), "true".to_string()],
        };
        let cmd = build_command(&launcher, &server_args(9000, "m", None));
        let args = args_of(&cmd);

        assert_eq!(args[..2], ["-c", "true"]);
        assert_eq!(args[2], "--model");
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let launcher = Launcher::Packaged {
            executable: PathBuf::from("/nonexistent/ember-server"),
        };
        let err = spawn_server(&launcher, &[]).unwrap_err();
        match err {
            ServerError::SpawnFailed { program, .. } => {
                assert_eq!(program, "/nonexistent/ember-server");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_pipes_stdout() {
        use tokio::io::AsyncReadExt;

        let launcher = Launcher::Custom {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), "echo \"port $5\"".to_string()],
        };
        let mut child = spawn_server(&launcher, &server_args(8123, "m", None)).unwrap();

        let mut out = String::new();
        child
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        child.wait().await.unwrap();

        assert_eq!(out.trim(), "port 8123");
    }
}
