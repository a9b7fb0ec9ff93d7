//! Cleanup command - kill processes left listening on a port.

pub(crate) fn run(port: u16) -> miette::Result<()> {
    let killed = ember_server::cleanup::kill_port_listeners(port)
        .map_err(|e| miette::miette!("Failed to clean up port {}: {}", port, e))?;

    if killed.is_empty() {
        println!("Nothing listening on port {}.", port);
    } else {
        for pid in killed {
            println!("Killed process {}", pid);
        }
    }

    Ok(())
}
