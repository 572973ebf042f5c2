use crate::error::ServerError;
use std::net::TcpListener;
use tracing::{info, warn};

/// Consecutive ports tried before giving up.
pub const PORT_SEARCH_WINDOW: u16 = 100;

/// Finds the first port in `start..start + window` that `host` can bind.
///
/// Each candidate is bound and released right away; nothing is held.
/// Port 0 asks the OS for any free port.
pub fn find_available_port(host: &str, start: u16, window: u16) -> Result<u16, ServerError> {
    if window == 0 {
        return Err(ServerError::NoPortAvailable { start, end: start });
    }
    let end = start.saturating_add(window - 1);

    for port in start..=end {
        match TcpListener::bind((host, port)) {
            Ok(probe) => {
                let port = probe.local_addr()?.port();
                info!("Found available port: {}", port);
                return Ok(port);
            }
            Err(e) => warn!("Port {} in use or unavailable: {}", port, e),
        }
    }

    Err(ServerError::NoPortAvailable { start, end })
}
