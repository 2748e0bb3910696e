//! Single-instance negotiation
//!
//! Exactly one daemon owns the socket at a time. Before binding we probe
//! the socket: a live owner either keeps it (startup fails) or is asked to
//! quit when `--replace` was given; a dead owner's stale socket file is
//! removed.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use chronolog_core::error::{Error, Result};
use chronolog_core::ipc::IpcClient;

const RELEASE_WAIT: Duration = Duration::from_millis(100);
const RELEASE_ATTEMPTS: u32 = 50;

/// Make sure the socket path is free to bind, negotiating with a running
/// instance if there is one.
pub fn acquire(socket_path: &Path, replace: bool) -> Result<()> {
    if !socket_path.exists() {
        return Ok(());
    }

    let client = IpcClient::with_socket_path(socket_path.to_path_buf())
        .with_timeout(Duration::from_secs(2));
    match client.ping() {
        Ok((version, uptime_secs)) => {
            if !replace {
                warn!(
                    version,
                    uptime_secs,
                    "another instance owns {:?}",
                    socket_path
                );
                return Err(Error::SocketOwnership);
            }
            info!(version, "asking running instance to quit");
            client.quit()?;
            wait_for_release(socket_path)?;
        }
        Err(_) => {
            warn!("removing stale socket {:?}", socket_path);
            std::fs::remove_file(socket_path)?;
        }
    }
    Ok(())
}

fn wait_for_release(socket_path: &Path) -> Result<()> {
    for _ in 0..RELEASE_ATTEMPTS {
        if !socket_path.exists() {
            return Ok(());
        }
        std::thread::sleep(RELEASE_WAIT);
    }
    // The old instance acknowledged the quit but never released the
    // socket; reclaim the path rather than fail the takeover.
    warn!("previous instance did not release the socket, removing it");
    std::fs::remove_file(socket_path)?;
    Ok(())
}
