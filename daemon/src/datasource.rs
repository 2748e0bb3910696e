//! Data-source registry extension
//!
//! Producers of events register themselves under a unique id with a human
//! readable name, a description and the templates of the events they emit.
//! A data-source can be disabled, which silently drops everything it tries
//! to insert. The registry persists as JSON plain-form records; `running`
//! is transient and reset on load.

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{info, warn};

use chronolog_core::error::{Error, Result};
use chronolog_core::types::{timestamp_now, DataSource, DataSourcePlain, Event, EventTemplate};

use crate::extension::Extension;

pub struct DataSourceRegistry {
    path: PathBuf,
    sources: HashMap<String, DataSource>,
}

impl DataSourceRegistry {
    pub fn load(path: PathBuf) -> Self {
        let sources = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<DataSourcePlain>>(&bytes) {
                Ok(plain) => plain
                    .iter()
                    .filter_map(|p| match DataSource::from_plain(p) {
                        Ok(source) => Some((source.unique_id.clone(), source)),
                        Err(e) => {
                            warn!(error = %e, "skipping malformed data-source record");
                            None
                        }
                    })
                    .collect(),
                Err(e) => {
                    warn!(error = %e, "data-source registry is corrupt, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        DataSourceRegistry { path, sources }
    }

    fn persist(&self) -> Result<()> {
        let mut plain: Vec<DataSourcePlain> =
            self.sources.values().map(DataSource::to_plain).collect();
        plain.sort_by(|a, b| a.0.cmp(&b.0));
        let bytes = serde_json::to_vec_pretty(&plain)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Register or update a data-source. A previously disabled source
    /// stays disabled. Returns whether the source is enabled, plus the
    /// stored record for broadcasting.
    pub fn register(
        &mut self,
        unique_id: &str,
        name: &str,
        description: &str,
        templates: Vec<EventTemplate>,
    ) -> Result<(bool, DataSource)> {
        let source = self
            .sources
            .entry(unique_id.to_string())
            .and_modify(|s| {
                s.name = name.to_string();
                s.description = description.to_string();
                s.event_templates = templates.clone();
                s.running = true;
                s.last_seen = timestamp_now();
            })
            .or_insert_with(|| DataSource::new(unique_id, name, description, templates.clone()));
        let result = (source.enabled, source.clone());
        self.persist()?;
        info!(unique_id, name, "registered data-source");
        Ok(result)
    }

    pub fn sources(&self) -> Vec<DataSource> {
        let mut all: Vec<DataSource> = self.sources.values().cloned().collect();
        all.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        all
    }

    pub fn get(&self, unique_id: &str) -> Option<&DataSource> {
        self.sources.get(unique_id)
    }

    pub fn set_enabled(&mut self, unique_id: &str, enabled: bool) -> Result<()> {
        let source = self
            .sources
            .get_mut(unique_id)
            .ok_or_else(|| Error::Extension(format!("unknown data-source {}", unique_id)))?;
        source.enabled = enabled;
        self.persist()?;
        info!(unique_id, enabled, "changed data-source state");
        Ok(())
    }
}

impl Extension for DataSourceRegistry {
    fn name(&self) -> &'static str {
        "data-source-registry"
    }

    fn public_methods(&self) -> &'static [&'static str] {
        &[
            "RegisterDataSource",
            "GetDataSources",
            "SetDataSourceEnabled",
        ]
    }

    fn pre_insert_event(&mut self, event: Event, sender: &str) -> Result<Option<Event>> {
        if sender.is_empty() {
            return Ok(Some(event));
        }
        if let Some(source) = self.sources.get_mut(sender) {
            source.last_seen = timestamp_now();
            if !source.enabled {
                return Ok(None);
            }
        }
        Ok(Some(event))
    }

    fn unload(&mut self) {
        if let Err(e) = self.persist() {
            warn!(error = %e, "could not persist data-source registry");
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronolog_core::types::Subject;

    fn registry(dir: &tempfile::TempDir) -> DataSourceRegistry {
        DataSourceRegistry::load(dir.path().join("datasources.json"))
    }

    fn event() -> Event {
        Event {
            timestamp: 1,
            subjects: vec![Subject::new("file:///a")],
            ..Default::default()
        }
    }

    #[test]
    fn register_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(&dir);
        let (enabled, _) = reg.register("app/1", "App", "An app", vec![]).unwrap();
        assert!(enabled);
        drop(reg);

        let reg = registry(&dir);
        let sources = reg.sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].unique_id, "app/1");
        // Running state never survives a restart.
        assert!(!sources[0].running);
    }

    #[test]
    fn disabled_source_stays_disabled_across_reregistration() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(&dir);
        reg.register("app/1", "App", "An app", vec![]).unwrap();
        reg.set_enabled("app/1", false).unwrap();
        let (enabled, _) = reg.register("app/1", "App", "An app", vec![]).unwrap();
        assert!(!enabled);
    }

    #[test]
    fn disabled_source_inserts_are_vetoed() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(&dir);
        reg.register("app/1", "App", "An app", vec![]).unwrap();
        reg.set_enabled("app/1", false).unwrap();

        assert!(reg.pre_insert_event(event(), "app/1").unwrap().is_none());
        // Unknown and anonymous senders pass through.
        assert!(reg.pre_insert_event(event(), "other").unwrap().is_some());
        assert!(reg.pre_insert_event(event(), "").unwrap().is_some());
    }

    #[test]
    fn insert_stamps_last_seen() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(&dir);
        reg.register("app/1", "App", "An app", vec![]).unwrap();
        let before = reg.get("app/1").unwrap().last_seen;
        std::thread::sleep(std::time::Duration::from_millis(5));
        reg.pre_insert_event(event(), "app/1").unwrap();
        assert!(reg.get("app/1").unwrap().last_seen > before);
    }

    #[test]
    fn set_enabled_on_unknown_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = registry(&dir);
        assert!(reg.set_enabled("missing", true).is_err());
    }
}
