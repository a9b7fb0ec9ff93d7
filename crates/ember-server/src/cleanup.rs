//! Best-effort cleanup of processes left listening on the server port.
//!
//! Used at application teardown in case the child handle was lost and the
//! server outlived the manager.

use std::process::Command;

use tracing::{debug, warn};

use crate::error::ServerError;

/// Force-kill every process listening on `port`.
///
/// Returns the pids that were signalled. The current process is never killed.
pub fn kill_port_listeners(port: u16) -> Result<Vec<u32>, ServerError> {
    let own_pid = std::process::id();
    let pids: Vec<u32> = listening_pids(port)?
        .into_iter()
        .filter(|&pid| pid != own_pid)
        .collect();

    let mut killed = Vec::with_capacity(pids.len());
    for pid in pids {
        match force_kill(pid) {
            Ok(()) => {
                debug!("Killed process {} listening on port {}", pid, port);
                killed.push(pid);
            }
            Err(e) => warn!("Failed to kill process {}: {}", pid, e),
        }
    }

    Ok(killed)
}

#[cfg(unix)]
fn listening_pids(port: u16) -> Result<Vec<u32>, ServerError> {
    let output = Command::new("lsof")
        .arg("-t")
        .arg(format!("-iTCP:{}", port))
        .arg("-sTCP:LISTEN")
        .output()?;

    // lsof exits with 1 when nothing matches.
    Ok(parse_lsof_pids(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(windows)]
fn listening_pids(port: u16) -> Result<Vec<u32>, ServerError> {
    let output = Command::new("netstat").args(["-ano", "-p", "TCP"]).output()?;
    Ok(parse_netstat_pids(&String::from_utf8_lossy(&output.stdout), port))
}

#[cfg(unix)]
fn force_kill(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(windows)]
fn force_kill(pid: u32) -> std::io::Result<()> {
    let status = Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("taskkill exited with {status}")))
    }
}

/// Parse `lsof -t` output: one pid per line.
#[cfg_attr(not(unix), allow(dead_code))]
fn parse_lsof_pids(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Parse `netstat -ano` output for sockets listening on `port`.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_netstat_pids(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // Proto  Local Address  Foreign Address  State  PID
            match fields.as_slice() {
                [proto, local, _, state, pid]
                    if proto.eq_ignore_ascii_case("tcp")
                        && local.ends_with(&suffix)
                        && state.eq_ignore_ascii_case("listening") =>
                {
                    pid.parse().ok()
                }
                _ => None,
            }
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsof_pids() {
        assert_eq!(parse_lsof_pids("4242\n17\n4242\n\n"), vec![17, 4242]);
        assert!(parse_lsof_pids("").is_empty());
    }

    #[test]
    fn test_parse_netstat_pids() {
        let output = "\
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING       1012
  TCP    127.0.0.1:8080         0.0.0.0:0              LISTENING       5120
  TCP    127.0.0.1:8080         127.0.0.1:51234        ESTABLISHED     5120
  TCP    127.0.0.1:18080        0.0.0.0:0              LISTENING       777
  TCP    [::1]:8080             [::]:0                 LISTENING       5121
";
        assert_eq!(parse_netstat_pids(output, 8080), vec![5120, 5121]);
        assert!(parse_netstat_pids(output, 9999).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_kill_port_listeners_skips_own_process() {
        // Our own listener must survive the sweep.
        let listener = std::net::TcpListener::bind((crate::LOOPBACK_HOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        // lsof may be missing on minimal systems; that surfaces as an I/O error.
        match kill_port_listeners(port) {
            Ok(killed) => assert!(killed.is_empty()),
            Err(ServerError::Io(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
        assert!(listener.local_addr().is_ok());
    }
}
