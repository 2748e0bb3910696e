//! Unix socket server for the daemon

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use chronolog_core::ipc::IpcResponse;

use crate::handlers::{self, PostAction};
use crate::DaemonState;

/// Run the daemon server until shutdown is requested.
pub async fn run(state: Arc<DaemonState>) -> Result<()> {
    let socket_path = state.socket_path.clone();

    let listener = UnixListener::bind(&socket_path)?;
    info!("Listening on {:?}", socket_path);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let connection = state.next_connection_id();
                            if let Err(e) = handle_client(stream, &state, connection).await {
                                error!("Client error: {}", e);
                            }
                            state.monitors.lock().await.remove_connection(connection);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
            _ = state.shutdown.notified() => {
                info!("Shutdown requested, stopping server");
                break;
            }
        }
    }

    // Cleanup
    state.engine.lock().await.close();
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }

    info!("Daemon stopped");
    Ok(())
}

/// Handle a single client connection. The connection carries request and
/// reply lines interleaved with monitor notifications; a reply is always
/// written before any notification the request itself triggered.
async fn handle_client(
    mut stream: UnixStream,
    state: &Arc<DaemonState>,
    connection: u64,
) -> Result<()> {
    debug!(connection, "client connected");
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<IpcResponse>();

    loop {
        tokio::select! {
            read = reader.read_line(&mut line) => {
                if read? == 0 {
                    break;
                }
                let (response, action) = match serde_json::from_str(&line) {
                    Ok(msg) => handlers::handle_message(msg, state, connection, &push_tx).await,
                    Err(e) => {
                        warn!("Invalid message: {}", e);
                        (IpcResponse::Error(format!("Invalid message: {}", e)), None)
                    }
                };

                let response_json = serde_json::to_string(&response)? + "\n";
                writer.write_all(response_json.as_bytes()).await?;

                if let Some(action) = action {
                    apply_post_action(action, state).await;
                }

                line.clear();
            }
            push = push_rx.recv() => {
                // push_tx is held above, so recv never yields None here.
                if let Some(notification) = push {
                    let json = serde_json::to_string(&notification)? + "\n";
                    writer.write_all(json.as_bytes()).await?;
                }
            }
        }
    }

    debug!(connection, "client disconnected");
    Ok(())
}

async fn apply_post_action(action: PostAction, state: &Arc<DaemonState>) {
    match action {
        PostAction::NotifyInsert(events) => {
            state.monitors.lock().await.notify_insert(&events);
        }
        PostAction::NotifyDelete(time_range, ids) => {
            state.monitors.lock().await.notify_delete(time_range, &ids);
        }
        PostAction::Broadcast(notification) => {
            state.monitors.lock().await.broadcast(notification);
        }
        PostAction::Quit => {
            state.request_shutdown();
        }
    }
}
