//! Blacklist extension
//!
//! Holds a set of named event templates; any event matching one of them is
//! vetoed before it reaches the store. The set persists as a JSON object of
//! plain-form templates and survives restarts. Matching uses the exact
//! same relation as queries and monitors.

use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{info, warn};

use chronolog_core::error::Result;
use chronolog_core::ontology;
use chronolog_core::types::{Event, EventPlain, EventTemplate};

use crate::extension::Extension;

pub struct Blacklist {
    path: PathBuf,
    templates: HashMap<String, EventTemplate>,
}

impl Blacklist {
    /// Load the persisted template set. A corrupt file is moved aside to
    /// `<name>.bak` and the blacklist starts empty.
    pub fn load(path: PathBuf) -> Self {
        let templates = match std::fs::read(&path) {
            Ok(bytes) => {
                match serde_json::from_slice::<HashMap<String, EventPlain>>(&bytes) {
                    Ok(plain) => plain
                        .iter()
                        .filter_map(|(id, p)| match EventTemplate::from_plain(p) {
                            Ok(t) => Some((id.clone(), t)),
                            Err(e) => {
                                warn!(id, error = %e, "skipping malformed blacklist template");
                                None
                            }
                        })
                        .collect(),
                    Err(e) => {
                        warn!(error = %e, "blacklist file is corrupt, starting empty");
                        let backup = path.with_extension("json.bak");
                        if let Err(e) = std::fs::rename(&path, &backup) {
                            warn!(error = %e, "could not preserve corrupt blacklist file");
                        }
                        HashMap::new()
                    }
                }
            }
            Err(_) => HashMap::new(),
        };
        Blacklist { path, templates }
    }

    fn persist(&self) -> Result<()> {
        let plain: HashMap<&String, EventPlain> = self
            .templates
            .iter()
            .map(|(id, t)| (id, t.to_plain()))
            .collect();
        let bytes = serde_json::to_vec_pretty(&plain)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Add or overwrite a template under `id`.
    pub fn add_template(&mut self, id: &str, template: EventTemplate) -> Result<()> {
        self.templates.insert(id.to_string(), template);
        self.persist()?;
        info!(id, "added blacklist template");
        Ok(())
    }

    /// Remove the template under `id`, returning it. Unknown ids are a
    /// no-op.
    pub fn remove_template(&mut self, id: &str) -> Result<Option<EventTemplate>> {
        let removed = self.templates.remove(id);
        if removed.is_some() {
            self.persist()?;
            info!(id, "removed blacklist template");
        }
        Ok(removed)
    }

    pub fn templates(&self) -> Vec<(String, EventPlain)> {
        let mut all: Vec<(String, EventPlain)> = self
            .templates
            .iter()
            .map(|(id, t)| (id.clone(), t.to_plain()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

impl Extension for Blacklist {
    fn name(&self) -> &'static str {
        "blacklist"
    }

    fn public_methods(&self) -> &'static [&'static str] {
        &["AddTemplate", "RemoveTemplate", "GetTemplates"]
    }

    fn pre_insert_event(&mut self, event: Event, _sender: &str) -> Result<Option<Event>> {
        let registry = ontology::registry();
        for (id, template) in &self.templates {
            if template.matches_event(&event, registry) {
                info!(template = id.as_str(), "event blocked by blacklist");
                return Ok(None);
            }
        }
        Ok(Some(event))
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
    use chronolog_core::ontology::zg;
    use chronolog_core::types::Subject;

    fn event(actor: &str) -> Event {
        Event {
            timestamp: 100,
            interpretation: zg::ACCESS_EVENT.to_string(),
            manifestation: zg::USER_ACTIVITY.to_string(),
            actor: actor.to_string(),
            subjects: vec![Subject::new("file:///a")],
            ..Default::default()
        }
    }

    fn actor_template(actor: &str) -> EventTemplate {
        EventTemplate {
            actor: Some(actor.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn matching_event_is_vetoed() {
        let dir = tempfile::tempdir().unwrap();
        let mut blacklist = Blacklist::load(dir.path().join("blacklist.json"));
        blacklist
            .add_template("no-spy", actor_template("app://spy.desktop"))
            .unwrap();

        assert!(blacklist
            .pre_insert_event(event("app://spy.desktop"), "")
            .unwrap()
            .is_none());
        assert!(blacklist
            .pre_insert_event(event("app://fine.desktop"), "")
            .unwrap()
            .is_some());
    }

    #[test]
    fn templates_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        let mut blacklist = Blacklist::load(path.clone());
        blacklist
            .add_template("no-spy", actor_template("app://spy.desktop"))
            .unwrap();
        drop(blacklist);

        let blacklist = Blacklist::load(path);
        let templates = blacklist.templates();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].0, "no-spy");
    }

    #[test]
    fn remove_unknown_id_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut blacklist = Blacklist::load(dir.path().join("blacklist.json"));
        assert!(blacklist.remove_template("missing").unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_preserved_and_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let blacklist = Blacklist::load(path.clone());
        assert!(blacklist.templates().is_empty());
        assert!(path.with_extension("json.bak").exists());
        assert!(!path.exists());
    }

    #[test]
    fn overwrite_replaces_template() {
        let dir = tempfile::tempdir().unwrap();
        let mut blacklist = Blacklist::load(dir.path().join("blacklist.json"));
        blacklist
            .add_template("t", actor_template("app://one.desktop"))
            .unwrap();
        blacklist
            .add_template("t", actor_template("app://two.desktop"))
            .unwrap();
        assert!(blacklist
            .pre_insert_event(event("app://one.desktop"), "")
            .unwrap()
            .is_some());
        assert!(blacklist
            .pre_insert_event(event("app://two.desktop"), "")
            .unwrap()
            .is_none());
    }
}
