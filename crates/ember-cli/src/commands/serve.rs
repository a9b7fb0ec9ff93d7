//! Serve command - run the inference server until interrupted.

use std::path::PathBuf;

use ember_server::{Launcher, ServerConfig, ServerManager};
use tracing::info;

/// Options collected from the command line.
#[derive(Debug, Default)]
pub(crate) struct ServeOptions {
    pub model: String,
    pub port: Option<u16>,
    pub dev: bool,
    pub server_dir: Option<PathBuf>,
    pub adapter_file: Option<PathBuf>,
    pub json: bool,
}

/// Layer command-line flags over the environment configuration.
fn configure(mut config: ServerConfig, options: &ServeOptions) -> ServerConfig {
    if let Some(port) = options.port {
        config.preferred_port = port;
    }

    if options.dev || options.server_dir.is_some() {
        if !matches!(config.launcher, Launcher::Development { .. }) {
            config.launcher = Launcher::development();
        }
        if let (Launcher::Development { working_dir, .. }, Some(dir)) =
            (&mut config.launcher, &options.server_dir)
        {
            *working_dir = dir.clone();
        }
    }

    if let Some(adapter) = &options.adapter_file {
        config.adapter_file = Some(adapter.clone());
    }

    config
}

pub(crate) async fn run(options: ServeOptions) -> miette::Result<()> {
    let config = configure(ServerConfig::from_env(), &options);
    let manager = ServerManager::new(config);

    tokio::select! {
        result = manager.start(&options.model) => {
            if let Err(e) = result {
                manager.shutdown();
                return Err(miette::miette!("Failed to start server: {}", e));
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted during startup");
            manager.shutdown();
            return Ok(());
        }
    }

    let status = manager.status();
    if options.json {
        let line = serde_json::to_string(&status)
            .map_err(|e| miette::miette!("Failed to encode status: {}", e))?;
        println!("{}", line);
    } else {
        println!(
            "Server running for model '{}' on http://{}:{}",
            options.model,
            ember_server::LOOPBACK_HOST,
            status.port.unwrap_or_default()
        );
        println!("Press Ctrl-C to stop.");
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for Ctrl-C: {}", e))?;

    info!("Shutting down");
    manager.shutdown();

    Ok(())
}
