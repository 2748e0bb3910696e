//! Chronolog core library
//!
//! Shared foundation for the daemon and the CLI: the event data model and
//! its wire forms, the symbol ontology, the database schema and upgrade
//! pipeline, and the IPC protocol with a synchronous client.

pub mod error;
pub mod ipc;
pub mod ontology;
pub mod schema;
pub mod types;
pub mod upgrades;

pub use error::{Error, Result};
pub use ipc::{IpcClient, IpcConnection, IpcMessage, IpcResponse, MonitorNotification};
pub use types::{
    DataSource, Event, EventPlain, EventTemplate, ResultType, StorageState, Subject,
    SubjectTemplate, TimeRange,
};
