//! Message handlers for the daemon

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use chronolog_core::error::Result;
use chronolog_core::ipc::{IpcMessage, IpcResponse, MonitorNotification};
use chronolog_core::types::{
    Event, EventPlain, EventTemplate, ResultType, StorageState, TimeRange,
};

use crate::blacklist::Blacklist;
use crate::datasource::DataSourceRegistry;
use crate::notify::ConnectionId;
use crate::DaemonState;

/// Work that must happen after the reply has been written, so a client
/// always sees its own reply before any notification triggered by it.
pub enum PostAction {
    NotifyInsert(Vec<Event>),
    NotifyDelete(TimeRange, Vec<u64>),
    Broadcast(MonitorNotification),
    Quit,
}

/// Handle one request. Returns the reply plus any deferred work.
pub async fn handle_message(
    msg: IpcMessage,
    state: &Arc<DaemonState>,
    connection: ConnectionId,
    push_tx: &UnboundedSender<IpcResponse>,
) -> (IpcResponse, Option<PostAction>) {
    match msg {
        IpcMessage::InsertEvents { events, sender } => {
            let parsed = match parse_events(&events) {
                Ok(parsed) => parsed,
                Err(e) => return (IpcResponse::Error(e.to_string()), None),
            };
            let mut engine = state.engine.lock().await;
            match engine.insert_events(parsed, &sender) {
                Ok(ids) => {
                    let inserted: Vec<u64> = ids.iter().copied().filter(|&id| id != 0).collect();
                    let stored = match engine.get_events(&inserted) {
                        Ok(stored) => stored.into_iter().flatten().collect::<Vec<_>>(),
                        Err(_) => Vec::new(),
                    };
                    let action = if stored.is_empty() {
                        None
                    } else {
                        Some(PostAction::NotifyInsert(stored))
                    };
                    (IpcResponse::EventIds(ids), action)
                }
                Err(e) => (IpcResponse::Error(e.to_string()), None),
            }
        }

        IpcMessage::GetEvents { ids } => {
            let mut engine = state.engine.lock().await;
            match engine.get_events(&ids) {
                Ok(events) => (
                    IpcResponse::Events(
                        events.iter().map(|e| e.as_ref().map(Event::to_plain)).collect(),
                    ),
                    None,
                ),
                Err(e) => (IpcResponse::Error(e.to_string()), None),
            }
        }

        IpcMessage::FindEventIds {
            time_range,
            templates,
            storage_state,
            max_events,
            result_type,
        } => {
            let query = parse_query(&templates, storage_state, result_type);
            let (templates, storage_state, result_type) = match query {
                Ok(q) => q,
                Err(e) => return (IpcResponse::Error(e.to_string()), None),
            };
            let mut engine = state.engine.lock().await;
            match engine.find_event_ids(
                time_range,
                &templates,
                storage_state,
                max_events,
                result_type,
            ) {
                Ok(ids) => (IpcResponse::EventIds(ids), None),
                Err(e) => (IpcResponse::Error(e.to_string()), None),
            }
        }

        IpcMessage::FindEvents {
            time_range,
            templates,
            storage_state,
            max_events,
            result_type,
        } => {
            let query = parse_query(&templates, storage_state, result_type);
            let (templates, storage_state, result_type) = match query {
                Ok(q) => q,
                Err(e) => return (IpcResponse::Error(e.to_string()), None),
            };
            let mut engine = state.engine.lock().await;
            match engine.find_events(
                time_range,
                &templates,
                storage_state,
                max_events,
                result_type,
            ) {
                Ok(events) => (
                    IpcResponse::Events(
                        events.iter().map(|e| Some(e.to_plain())).collect(),
                    ),
                    None,
                ),
                Err(e) => (IpcResponse::Error(e.to_string()), None),
            }
        }

        IpcMessage::FindRelatedUris {
            time_range,
            templates,
            result_templates,
            storage_state,
            max_results,
            result_type,
        } => {
            let parsed = parse_templates(&templates)
                .and_then(|t| Ok((t, parse_templates(&result_templates)?)))
                .and_then(|(t, rt)| Ok((t, rt, StorageState::try_from(storage_state)?)));
            let (templates, result_templates, storage_state) = match parsed {
                Ok(p) => p,
                Err(e) => return (IpcResponse::Error(e.to_string()), None),
            };
            let mut engine = state.engine.lock().await;
            match engine.find_related_uris(
                time_range,
                &templates,
                &result_templates,
                storage_state,
                max_results,
                result_type,
            ) {
                Ok(uris) => (IpcResponse::Uris(uris), None),
                Err(e) => (IpcResponse::Error(e.to_string()), None),
            }
        }

        IpcMessage::DeleteEvents { ids } => {
            let mut engine = state.engine.lock().await;
            match engine.delete_events(&ids, "") {
                Ok(Some((min, max))) => (
                    IpcResponse::DeleteResult(Some((min, max))),
                    Some(PostAction::NotifyDelete(TimeRange::new(min, max), ids)),
                ),
                Ok(None) => (IpcResponse::DeleteResult(None), None),
                Err(e) => (IpcResponse::Error(e.to_string()), None),
            }
        }

        IpcMessage::DeleteLog => {
            let mut engine = state.engine.lock().await;
            match engine.delete_log() {
                Ok(()) => (IpcResponse::Ok, None),
                Err(e) => (IpcResponse::Error(e.to_string()), None),
            }
        }

        IpcMessage::RenameSubject { old_uri, new_uri } => {
            let mut engine = state.engine.lock().await;
            match engine.rename_subject(&old_uri, &new_uri) {
                Ok(count) => (IpcResponse::Count(count), None),
                Err(e) => (IpcResponse::Error(e.to_string()), None),
            }
        }

        IpcMessage::AddTemplate { id, template } => {
            let parsed = match EventTemplate::from_plain(&template) {
                Ok(t) => t,
                Err(e) => return (IpcResponse::Error(e.to_string()), None),
            };
            let mut engine = state.engine.lock().await;
            let Some(blacklist) = engine.extensions.get_mut::<Blacklist>() else {
                return (IpcResponse::Error("blacklist not loaded".to_string()), None);
            };
            match blacklist.add_template(&id, parsed) {
                Ok(()) => (
                    IpcResponse::Ok,
                    Some(PostAction::Broadcast(MonitorNotification::TemplateAdded {
                        id,
                        template,
                    })),
                ),
                Err(e) => (IpcResponse::Error(e.to_string()), None),
            }
        }

        IpcMessage::RemoveTemplate { id } => {
            let mut engine = state.engine.lock().await;
            let Some(blacklist) = engine.extensions.get_mut::<Blacklist>() else {
                return (IpcResponse::Error("blacklist not loaded".to_string()), None);
            };
            match blacklist.remove_template(&id) {
                Ok(Some(template)) => (
                    IpcResponse::Ok,
                    Some(PostAction::Broadcast(MonitorNotification::TemplateRemoved {
                        id,
                        template: template.to_plain(),
                    })),
                ),
                Ok(None) => (IpcResponse::Ok, None),
                Err(e) => (IpcResponse::Error(e.to_string()), None),
            }
        }

        IpcMessage::GetTemplates => {
            let engine = state.engine.lock().await;
            match engine.extensions.get::<Blacklist>() {
                Some(blacklist) => (IpcResponse::Templates(blacklist.templates()), None),
                None => (IpcResponse::Error("blacklist not loaded".to_string()), None),
            }
        }

        IpcMessage::RegisterDataSource {
            unique_id,
            name,
            description,
            templates,
        } => {
            let parsed = match parse_templates(&templates) {
                Ok(t) => t,
                Err(e) => return (IpcResponse::Error(e.to_string()), None),
            };
            let mut engine = state.engine.lock().await;
            let Some(registry) = engine.extensions.get_mut::<DataSourceRegistry>() else {
                return (
                    IpcResponse::Error("data-source registry not loaded".to_string()),
                    None,
                );
            };
            match registry.register(&unique_id, &name, &description, parsed) {
                Ok((enabled, source)) => (
                    IpcResponse::Bool(enabled),
                    Some(PostAction::Broadcast(
                        MonitorNotification::DataSourceRegistered {
                            source: source.to_plain(),
                        },
                    )),
                ),
                Err(e) => (IpcResponse::Error(e.to_string()), None),
            }
        }

        IpcMessage::GetDataSources => {
            let engine = state.engine.lock().await;
            match engine.extensions.get::<DataSourceRegistry>() {
                Some(registry) => (
                    IpcResponse::DataSources(
                        registry.sources().iter().map(|s| s.to_plain()).collect(),
                    ),
                    None,
                ),
                None => (
                    IpcResponse::Error("data-source registry not loaded".to_string()),
                    None,
                ),
            }
        }

        IpcMessage::GetDataSourceFromId { unique_id } => {
            let engine = state.engine.lock().await;
            let Some(registry) = engine.extensions.get::<DataSourceRegistry>() else {
                return (
                    IpcResponse::Error("data-source registry not loaded".to_string()),
                    None,
                );
            };
            match registry.get(&unique_id) {
                Some(source) => (IpcResponse::DataSource(source.to_plain()), None),
                None => (
                    IpcResponse::Error(format!("unknown data-source {}", unique_id)),
                    None,
                ),
            }
        }

        IpcMessage::SetDataSourceEnabled { unique_id, enabled } => {
            let mut engine = state.engine.lock().await;
            let Some(registry) = engine.extensions.get_mut::<DataSourceRegistry>() else {
                return (
                    IpcResponse::Error("data-source registry not loaded".to_string()),
                    None,
                );
            };
            match registry.set_enabled(&unique_id, enabled) {
                Ok(()) => (IpcResponse::Ok, None),
                Err(e) => (IpcResponse::Error(e.to_string()), None),
            }
        }

        IpcMessage::InstallMonitor {
            path,
            time_range,
            templates,
        } => {
            let parsed = match parse_templates(&templates) {
                Ok(t) => t,
                Err(e) => return (IpcResponse::Error(e.to_string()), None),
            };
            let mut monitors = state.monitors.lock().await;
            match monitors.install(connection, &path, time_range, parsed, push_tx.clone()) {
                Ok(()) => (IpcResponse::Ok, None),
                Err(e) => (IpcResponse::Error(e.to_string()), None),
            }
        }

        IpcMessage::RemoveMonitor { path } => {
            let mut monitors = state.monitors.lock().await;
            match monitors.remove(connection, &path) {
                Ok(()) => (IpcResponse::Ok, None),
                Err(e) => (IpcResponse::Error(e.to_string()), None),
            }
        }

        IpcMessage::Ping => {
            debug!("ping");
            (
                IpcResponse::Pong {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    uptime_secs: state.uptime_secs(),
                },
                None,
            )
        }

        IpcMessage::Quit => {
            info!("shutdown requested over IPC");
            (IpcResponse::Ok, Some(PostAction::Quit))
        }
    }
}

fn parse_events(plains: &[EventPlain]) -> Result<Vec<Event>> {
    plains.iter().map(Event::from_plain).collect()
}

fn parse_templates(plains: &[EventPlain]) -> Result<Vec<EventTemplate>> {
    plains.iter().map(EventTemplate::from_plain).collect()
}

fn parse_query(
    templates: &[EventPlain],
    storage_state: u32,
    result_type: u32,
) -> Result<(Vec<EventTemplate>, StorageState, ResultType)> {
    Ok((
        parse_templates(templates)?,
        StorageState::try_from(storage_state)?,
        ResultType::try_from(result_type)?,
    ))
}
