//! IPC protocol and client
//!
//! The daemon listens on a Unix socket and speaks newline-delimited JSON:
//! one [`IpcMessage`] per request line, one [`IpcResponse`] per reply line.
//! A connection that has installed a monitor additionally receives pushed
//! [`IpcResponse::Notification`] lines as matching activity happens.
//!
//! Events, templates and data-sources travel in their positional plain
//! forms so the wire layout stays independent of the Rust types.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{DataSourcePlain, EventPlain, TimeRange};

/// Data directory, `CHRONOLOG_DATA_PATH` or the XDG user data dir.
pub fn data_path() -> PathBuf {
    if let Ok(path) = std::env::var("CHRONOLOG_DATA_PATH") {
        return PathBuf::from(path);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("chronolog")
}

pub fn socket_path() -> PathBuf {
    data_path().join("chronologd.sock")
}

pub fn database_path() -> PathBuf {
    data_path().join("activity.sqlite")
}

/// Requests understood by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum IpcMessage {
    /// Insert a batch of events. `sender` identifies the producing
    /// data-source; empty for anonymous clients.
    InsertEvents {
        events: Vec<EventPlain>,
        sender: String,
    },
    /// Resolve ids to full events, order-preserving.
    GetEvents { ids: Vec<u64> },
    FindEventIds {
        time_range: TimeRange,
        templates: Vec<EventPlain>,
        storage_state: u32,
        max_events: u32,
        result_type: u32,
    },
    FindEvents {
        time_range: TimeRange,
        templates: Vec<EventPlain>,
        storage_state: u32,
        max_events: u32,
        result_type: u32,
    },
    /// Rank URIs that co-occur with events matching `templates`.
    FindRelatedUris {
        time_range: TimeRange,
        templates: Vec<EventPlain>,
        result_templates: Vec<EventPlain>,
        storage_state: u32,
        max_results: u32,
        result_type: u32,
    },
    DeleteEvents { ids: Vec<u64> },
    /// Drop the whole log and start over with an empty database.
    DeleteLog,
    RenameSubject { old_uri: String, new_uri: String },

    // Blacklist extension
    AddTemplate { id: String, template: EventPlain },
    RemoveTemplate { id: String },
    GetTemplates,

    // Data-source registry extension
    RegisterDataSource {
        unique_id: String,
        name: String,
        description: String,
        templates: Vec<EventPlain>,
    },
    GetDataSources,
    GetDataSourceFromId { unique_id: String },
    SetDataSourceEnabled { unique_id: String, enabled: bool },

    /// Start pushing notifications for matching activity down this
    /// connection. `path` names the monitor within the connection.
    InstallMonitor {
        path: String,
        time_range: TimeRange,
        templates: Vec<EventPlain>,
    },
    RemoveMonitor { path: String },

    Ping,
    Quit,
}

/// Replies and pushed notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum IpcResponse {
    Ok,
    Error(String),
    /// Assigned ids, 0 for events that were vetoed or failed.
    EventIds(Vec<u64>),
    /// One entry per requested id, `None` for unknown ids.
    Events(Vec<Option<EventPlain>>),
    Uris(Vec<String>),
    /// Bounding timestamps of deleted rows, `None` when nothing matched.
    DeleteResult(Option<(i64, i64)>),
    Count(u64),
    Bool(bool),
    Templates(Vec<(String, EventPlain)>),
    DataSources(Vec<DataSourcePlain>),
    DataSource(DataSourcePlain),
    Pong { version: String, uptime_secs: u64 },
    Notification(MonitorNotification),
}

/// Activity pushed to monitor connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MonitorNotification {
    EventsInserted {
        path: String,
        time_range: TimeRange,
        events: Vec<EventPlain>,
    },
    EventsDeleted {
        path: String,
        time_range: TimeRange,
        ids: Vec<u64>,
    },
    TemplateAdded { id: String, template: EventPlain },
    TemplateRemoved { id: String, template: EventPlain },
    DataSourceRegistered { source: DataSourcePlain },
}

/// Synchronous client for one-shot requests.
pub struct IpcClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Default for IpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcClient {
    pub fn new() -> Self {
        Self {
            socket_path: socket_path(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether something is listening on the socket.
    pub fn daemon_available(&self) -> bool {
        UnixStream::connect(&self.socket_path).is_ok()
    }

    /// Send one request and wait for the reply. A daemon-side error reply
    /// is surfaced as [`Error::Ipc`].
    pub fn send(&self, message: &IpcMessage) -> Result<IpcResponse> {
        let mut connection = self.connect()?;
        connection.send(message)?;
        let response = connection.recv()?;
        if let IpcResponse::Error(msg) = &response {
            return Err(Error::Ipc(msg.clone()));
        }
        Ok(response)
    }

    /// Open a persistent connection, e.g. for installing monitors.
    pub fn connect(&self) -> Result<IpcConnection> {
        let stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            if matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
            ) {
                Error::DaemonNotRunning
            } else {
                Error::Io(e)
            }
        })?;
        stream.set_read_timeout(Some(self.timeout)).ok();
        stream.set_write_timeout(Some(self.timeout)).ok();
        IpcConnection::new(stream)
    }

    pub fn ping(&self) -> Result<(String, u64)> {
        match self.send(&IpcMessage::Ping)? {
            IpcResponse::Pong {
                version,
                uptime_secs,
            } => Ok((version, uptime_secs)),
            other => Err(Error::Ipc(format!("unexpected reply to ping: {:?}", other))),
        }
    }

    /// Ask a running daemon to shut down. `Ok(())` also when nothing is
    /// listening.
    pub fn quit(&self) -> Result<()> {
        match self.send(&IpcMessage::Quit) {
            Ok(_) | Err(Error::DaemonNotRunning) => Ok(()),
            // The daemon may drop the connection while replying.
            Err(Error::Io(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A connected stream speaking the line protocol.
pub struct IpcConnection {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl IpcConnection {
    pub fn new(stream: UnixStream) -> Result<Self> {
        let writer = stream.try_clone()?;
        Ok(IpcConnection {
            reader: BufReader::new(stream),
            writer,
        })
    }

    pub fn send(&mut self, message: &IpcMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read the next reply or pushed notification.
    pub fn recv(&mut self) -> Result<IpcResponse> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Err(Error::Ipc("connection closed".to_string()));
        }
        let response = serde_json::from_str(&line)?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_honors_env_override() {
        // Runs in-process, so take care to restore the variable.
        let saved = std::env::var("CHRONOLOG_DATA_PATH").ok();
        std::env::set_var("CHRONOLOG_DATA_PATH", "/tmp/chronolog-test");
        assert_eq!(
            socket_path(),
            PathBuf::from("/tmp/chronolog-test/chronologd.sock")
        );
        match saved {
            Some(v) => std::env::set_var("CHRONOLOG_DATA_PATH", v),
            None => std::env::remove_var("CHRONOLOG_DATA_PATH"),
        }
    }

    #[test]
    fn daemon_not_running_maps_to_typed_error() {
        let client = IpcClient::with_socket_path(PathBuf::from("/nonexistent/x.sock"));
        assert!(!client.daemon_available());
        assert!(matches!(
            client.send(&IpcMessage::Ping),
            Err(Error::DaemonNotRunning)
        ));
    }

    #[test]
    fn message_json_round_trip() {
        let msg = IpcMessage::FindEventIds {
            time_range: TimeRange::always(),
            templates: vec![],
            storage_state: 2,
            max_events: 10,
            result_type: 0,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: IpcMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, IpcMessage::FindEventIds { max_events: 10, .. }));
    }
}
