//! Monitor dispatch
//!
//! A monitor is a client-installed subscription identified by
//! (connection, path). Matching activity is pushed down the owning
//! connection through its outbound channel; a connection task that went
//! away shows up as a send failure, and three consecutive failures evict
//! the monitor. Delivery to a single monitor preserves insertion order;
//! ordering across monitors is unspecified.

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use chronolog_core::error::{Error, Result};
use chronolog_core::ipc::{IpcResponse, MonitorNotification};
use chronolog_core::ontology;
use chronolog_core::types::{Event, EventTemplate, TimeRange};

const MAX_DELIVERY_FAILURES: u32 = 3;

pub type ConnectionId = u64;

struct Monitor {
    connection: ConnectionId,
    path: String,
    time_range: TimeRange,
    templates: Vec<EventTemplate>,
    tx: UnboundedSender<IpcResponse>,
    failures: u32,
}

impl Monitor {
    fn matches(&self, event: &Event) -> bool {
        if !self.time_range.contains(event.timestamp) {
            return false;
        }
        if self.templates.is_empty() {
            return true;
        }
        let registry = ontology::registry();
        self.templates
            .iter()
            .any(|t| t.matches_event(event, registry))
    }
}

#[derive(Default)]
pub struct MonitorRegistry {
    monitors: Vec<Monitor>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        MonitorRegistry::default()
    }

    pub fn install(
        &mut self,
        connection: ConnectionId,
        path: &str,
        time_range: TimeRange,
        templates: Vec<EventTemplate>,
        tx: UnboundedSender<IpcResponse>,
    ) -> Result<()> {
        if self
            .monitors
            .iter()
            .any(|m| m.connection == connection && m.path == path)
        {
            return Err(Error::Other(format!("monitor {} already installed", path)));
        }
        info!(connection, path, "installed monitor");
        self.monitors.push(Monitor {
            connection,
            path: path.to_string(),
            time_range,
            templates,
            tx,
            failures: 0,
        });
        Ok(())
    }

    pub fn remove(&mut self, connection: ConnectionId, path: &str) -> Result<()> {
        let before = self.monitors.len();
        self.monitors
            .retain(|m| !(m.connection == connection && m.path == path));
        if self.monitors.len() == before {
            return Err(Error::Other(format!("no such monitor {}", path)));
        }
        info!(connection, path, "removed monitor");
        Ok(())
    }

    /// Drop every monitor of a disconnected client.
    pub fn remove_connection(&mut self, connection: ConnectionId) {
        let before = self.monitors.len();
        self.monitors.retain(|m| m.connection != connection);
        if self.monitors.len() != before {
            debug!(connection, "dropped monitors of closed connection");
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    /// Deliver an inserted batch: each monitor gets the matching subset in
    /// insertion order.
    pub fn notify_insert(&mut self, events: &[Event]) {
        self.dispatch(|monitor| {
            let matched: Vec<&Event> =
                events.iter().filter(|e| monitor.matches(e)).collect();
            if matched.is_empty() {
                return None;
            }
            let begin = matched.iter().map(|e| e.timestamp).min().unwrap_or(0);
            let end = matched.iter().map(|e| e.timestamp).max().unwrap_or(0);
            Some(MonitorNotification::EventsInserted {
                path: monitor.path.clone(),
                time_range: TimeRange::new(begin, end),
                events: matched.iter().map(|e| e.to_plain()).collect(),
            })
        });
    }

    /// Deliver a delete: monitors whose range overlaps the deleted span
    /// get the intersection and the ids.
    pub fn notify_delete(&mut self, time_range: TimeRange, ids: &[u64]) {
        self.dispatch(|monitor| {
            let overlap = monitor.time_range.intersect(&time_range)?;
            Some(MonitorNotification::EventsDeleted {
                path: monitor.path.clone(),
                time_range: overlap,
                ids: ids.to_vec(),
            })
        });
    }

    /// Deliver a notification to every monitor regardless of templates,
    /// e.g. blacklist changes.
    pub fn broadcast(&mut self, notification: MonitorNotification) {
        self.dispatch(|_| Some(notification.clone()));
    }

    fn dispatch(&mut self, make: impl Fn(&Monitor) -> Option<MonitorNotification>) {
        for monitor in &mut self.monitors {
            let Some(notification) = make(monitor) else {
                continue;
            };
            match monitor.tx.send(IpcResponse::Notification(notification)) {
                Ok(()) => monitor.failures = 0,
                Err(_) => {
                    monitor.failures += 1;
                    warn!(
                        connection = monitor.connection,
                        path = monitor.path.as_str(),
                        failures = monitor.failures,
                        "monitor delivery failed"
                    );
                }
            }
        }
        self.monitors.retain(|m| {
            if m.failures >= MAX_DELIVERY_FAILURES {
                warn!(path = m.path.as_str(), "evicting unresponsive monitor");
                false
            } else {
                true
            }
        });
    }
}
