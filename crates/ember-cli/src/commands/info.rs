//! Info command - show the resolved server configuration.

use ember_server::{paths, Launcher, ReadinessProbe, ServerConfig};

pub(crate) fn run() -> miette::Result<()> {
    let config = ServerConfig::from_env();

    println!("Ember Server Configuration");
    println!("==========================");
    println!();
    println!("Version:          {}", env!("CARGO_PKG_VERSION"));
    println!("Preferred port:   {}", config.preferred_port);
    println!("Port attempts:    {}", config.max_port_attempts);
    println!();

    match &config.launcher {
        Launcher::Packaged { executable } => {
            println!("Launch mode:      packaged");
            println!("Server binary:    {}", executable.display());
            println!("  Exists: {}", executable.exists());
        }
        Launcher::Development {
            interpreter,
            module,
            working_dir,
        } => {
            println!("Launch mode:      development");
            println!(
                "Command:          {} -m {}",
                interpreter.display(),
                module
            );
            println!("Working dir:      {}", working_dir.display());
        }
        Launcher::Custom { program, args } => {
            println!("Launch mode:      custom");
            println!("Command:          {} {}", program.display(), args.join(" "));
        }
    }
    println!("Resources dir:    {}", paths::resources_dir().display());
    println!();

    match &config.readiness {
        ReadinessProbe::LogMarker { marker } => println!("Readiness:        log marker \"{}\"", marker),
        ReadinessProbe::Poll { interval, .. } => {
            println!("Readiness:        HTTP poll every {:?}", interval)
        }
    }
    println!("Init grace:       {:?}", config.init_grace);
    match config.init_timeout {
        Some(timeout) => println!("Init timeout:     {:?}", timeout),
        None => println!("Init timeout:     none"),
    }
    println!("Init endpoint:    {}", ember_server::INIT_PATH);

    if let Some(adapter) = &config.adapter_file {
        println!("Adapter file:     {}", adapter.display());
    }

    Ok(())
}
