//! Free port discovery on the loopback interface.

use std::io::ErrorKind;

use tokio::net::TcpListener;
use tracing::debug;

use crate::error::ServerError;
use crate::LOOPBACK_HOST;

/// Find the first port at or above `start` that can be bound on loopback.
///
/// Each candidate is probed by binding a transient listener, reading back the
/// bound port and dropping the socket again. Only `AddrInUse` moves the search
/// on to the next port; any other bind error is returned as-is.
///
/// The port is free at the moment of the check. Nothing stops another process
/// from taking it before the server binds it.
pub async fn find_open_port(start: u16, max_attempts: u16) -> Result<u16, ServerError> {
    let mut port = start;

    for attempt in 0..max_attempts {
        match TcpListener::bind((LOOPBACK_HOST, port)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                drop(listener);
                debug!("Port {} is free (attempt {})", bound, attempt + 1);
                return Ok(bound);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!("Port {} is in use", port);
                port = match port.checked_add(1) {
                    Some(next) => next,
                    None => break,
                };
            }
            Err(source) => return Err(ServerError::PortProbe { port, source }),
        }
    }

    Err(ServerError::NoPortAvailable {
        start,
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bind `count` consecutive loopback ports and make sure the one after
    /// them is free. Returns the first port and the held listeners.
    async fn occupy_consecutive(count: u16) -> (u16, Vec<TcpListener>) {
        'retry: loop {
            let first = TcpListener::bind((LOOPBACK_HOST, 0)).await.unwrap();
            let base = first.local_addr().unwrap().port();
            if base > u16::MAX - count - 1 {
                continue;
            }

            let mut held = vec![first];
            for offset in 1..count {
                match TcpListener::bind((LOOPBACK_HOST, base + offset)).await {
                    Ok(listener) => held.push(listener),
                    Err(_) => continue 'retry,
                }
            }

            // The port right after the block has to be free for the search to land on it.
            if TcpListener::bind((LOOPBACK_HOST, base + count)).await.is_err() {
                continue;
            }

            return (base, held);
        }
    }

    #[tokio::test]
    async fn test_free_start_port_is_returned() {
        let (base, held) = occupy_consecutive(1).await;
        drop(held);

        let port = find_open_port(base, 10).await.unwrap();
        assert_eq!(port, base);
    }

    #[tokio::test]
    async fn test_skips_occupied_ports() {
        let (base, _held) = occupy_consecutive(4).await;

        let port = find_open_port(base, 10).await.unwrap();
        assert_eq!(port, base + 4);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let (base, _held) = occupy_consecutive(2).await;

        let err = find_open_port(base, 2).await.unwrap_err();
        match err {
            ServerError::NoPortAvailable { start, attempts } => {
                assert_eq!(start, base);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_zero_attempts() {
        let err = find_open_port(8080, 0).await.unwrap_err();
        assert!(matches!(err, ServerError::NoPortAvailable { .. }));
    }
}
