//! Find-port command - print a free loopback port.

pub(crate) async fn run(from: u16, attempts: u16) -> miette::Result<()> {
    let port = ember_server::find_open_port(from, attempts)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    println!("{}", port);
    Ok(())
}
