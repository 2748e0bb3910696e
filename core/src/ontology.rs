//! Symbol ontology
//!
//! Event and subject classifiers are URIs arranged in two trees, one for
//! interpretations ("what happened" / "what kind of thing") and one for
//! manifestations ("how it happened" / "how it is stored"). Template
//! matching treats a parent symbol as matching any of its descendants.
//!
//! The registry is built explicitly by [`registry`] from a static table;
//! nothing is registered as an import side effect.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// ZG event-level symbols.
pub mod zg {
    pub const NAMESPACE: &str = "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#";

    pub const EVENT_INTERPRETATION: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#EventInterpretation";
    pub const ACCESS_EVENT: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#AccessEvent";
    pub const LEAVE_EVENT: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#LeaveEvent";
    pub const CREATE_EVENT: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#CreateEvent";
    pub const DELETE_EVENT: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#DeleteEvent";
    pub const MODIFY_EVENT: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#ModifyEvent";
    pub const MOVE_EVENT: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#MoveEvent";
    pub const RECEIVE_EVENT: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#ReceiveEvent";
    pub const SEND_EVENT: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#SendEvent";
    pub const ACCEPT_EVENT: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#AcceptEvent";
    pub const DENY_EVENT: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#DenyEvent";
    pub const EXPIRE_EVENT: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#ExpireEvent";

    pub const EVENT_MANIFESTATION: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#EventManifestation";
    pub const USER_ACTIVITY: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#UserActivity";
    pub const SCHEDULED_ACTIVITY: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#ScheduledActivity";
    pub const SYSTEM_NOTIFICATION: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#SystemNotification";
    pub const WORLD_ACTIVITY: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#WorldActivity";
    pub const HEURISTIC_ACTIVITY: &str =
        "http://www.zeitgeist-project.com/ontologies/2010/01/27/zg#HeuristicActivity";
}

/// NIE/NFO subject symbols (the subset the engine itself needs).
pub mod nfo {
    pub const INFORMATION_ELEMENT: &str =
        "http://www.semanticdesktop.org/ontologies/2007/01/19/nie#InformationElement";
    pub const DATA_OBJECT: &str =
        "http://www.semanticdesktop.org/ontologies/2007/01/19/nie#DataObject";

    pub const DOCUMENT: &str =
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#Document";
    pub const TEXT_DOCUMENT: &str =
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#TextDocument";
    pub const MEDIA: &str = "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#Media";
    pub const AUDIO: &str = "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#Audio";
    pub const VIDEO: &str = "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#Video";
    pub const IMAGE: &str = "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#Image";
    pub const WEBSITE: &str = "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#Website";

    pub const FILE_DATA_OBJECT: &str =
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#FileDataObject";
    pub const REMOTE_DATA_OBJECT: &str =
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#RemoteDataObject";
    pub const EMBEDDED_FILE_DATA_OBJECT: &str =
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#EmbeddedFileDataObject";
    pub const SOFTWARE_ITEM: &str =
        "http://www.semanticdesktop.org/ontologies/2007/03/22/nfo#SoftwareItem";
}

/// Parent/child table the process-wide registry is built from.
/// An empty parent list marks a tree root.
const SYMBOL_TABLE: &[(&str, &[&str])] = &[
    // Event interpretations
    (zg::EVENT_INTERPRETATION, &[]),
    (zg::ACCESS_EVENT, &[zg::EVENT_INTERPRETATION]),
    (zg::LEAVE_EVENT, &[zg::EVENT_INTERPRETATION]),
    (zg::CREATE_EVENT, &[zg::EVENT_INTERPRETATION]),
    (zg::DELETE_EVENT, &[zg::EVENT_INTERPRETATION]),
    (zg::MODIFY_EVENT, &[zg::EVENT_INTERPRETATION]),
    (zg::MOVE_EVENT, &[zg::EVENT_INTERPRETATION]),
    (zg::RECEIVE_EVENT, &[zg::EVENT_INTERPRETATION]),
    (zg::SEND_EVENT, &[zg::EVENT_INTERPRETATION]),
    (zg::ACCEPT_EVENT, &[zg::EVENT_INTERPRETATION]),
    (zg::DENY_EVENT, &[zg::EVENT_INTERPRETATION]),
    (zg::EXPIRE_EVENT, &[zg::EVENT_INTERPRETATION]),
    // Event manifestations
    (zg::EVENT_MANIFESTATION, &[]),
    (zg::USER_ACTIVITY, &[zg::EVENT_MANIFESTATION]),
    (zg::SCHEDULED_ACTIVITY, &[zg::EVENT_MANIFESTATION]),
    (zg::SYSTEM_NOTIFICATION, &[zg::EVENT_MANIFESTATION]),
    (zg::WORLD_ACTIVITY, &[zg::EVENT_MANIFESTATION]),
    (zg::HEURISTIC_ACTIVITY, &[zg::EVENT_MANIFESTATION]),
    // Subject interpretations
    (nfo::INFORMATION_ELEMENT, &[]),
    (nfo::DOCUMENT, &[nfo::INFORMATION_ELEMENT]),
    (nfo::TEXT_DOCUMENT, &[nfo::DOCUMENT]),
    (nfo::MEDIA, &[nfo::INFORMATION_ELEMENT]),
    (nfo::AUDIO, &[nfo::MEDIA]),
    (nfo::VIDEO, &[nfo::MEDIA]),
    (nfo::IMAGE, &[nfo::MEDIA]),
    (nfo::WEBSITE, &[nfo::INFORMATION_ELEMENT]),
    (nfo::SOFTWARE_ITEM, &[nfo::INFORMATION_ELEMENT]),
    // Subject manifestations
    (nfo::DATA_OBJECT, &[]),
    (nfo::FILE_DATA_OBJECT, &[nfo::DATA_OBJECT]),
    (nfo::EMBEDDED_FILE_DATA_OBJECT, &[nfo::FILE_DATA_OBJECT]),
    (nfo::REMOTE_DATA_OBJECT, &[nfo::FILE_DATA_OBJECT]),
];

/// Registry of symbol URIs and their parent links.
///
/// Matching is by exact, case-sensitive URI. Symbols never registered are
/// still valid match targets; they simply have no descendants.
#[derive(Debug, Default)]
pub struct SymbolRegistry {
    parents: HashMap<String, Vec<String>>,
    children: HashMap<String, Vec<String>>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        SymbolRegistry::default()
    }

    /// Register `uri` under `parent_uris`. Registering the same URI twice
    /// with the same parents is a no-op; with different parents it is an
    /// error.
    pub fn register(&mut self, uri: &str, parent_uris: &[&str]) -> Result<()> {
        let parents: Vec<String> = parent_uris.iter().map(|p| p.to_string()).collect();
        if let Some(existing) = self.parents.get(uri) {
            if *existing == parents {
                return Ok(());
            }
            return Err(Error::Other(format!(
                "symbol {} already registered with different parents",
                uri
            )));
        }
        for parent in &parents {
            self.children
                .entry(parent.clone())
                .or_default()
                .push(uri.to_string());
        }
        self.parents.insert(uri.to_string(), parents);
        Ok(())
    }

    pub fn is_registered(&self, uri: &str) -> bool {
        self.parents.contains_key(uri)
    }

    /// All registered descendants of `uri`, plus `uri` itself. Unknown
    /// URIs yield just themselves.
    pub fn descendants(&self, uri: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut order: Vec<String> = Vec::new();
        let mut stack: Vec<&str> = vec![uri];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            order.push(current.to_string());
            if let Some(kids) = self.children.get(current) {
                for child in kids {
                    stack.push(child);
                }
            }
        }
        order
    }
}

/// The process-wide registry, loaded from the static symbol table on
/// first use.
pub fn registry() -> &'static SymbolRegistry {
    static REGISTRY: OnceLock<SymbolRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut registry = SymbolRegistry::new();
        for (uri, parents) in SYMBOL_TABLE {
            // The static table carries no duplicates, so this cannot fail.
            let _ = registry.register(uri, parents);
        }
        registry
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descendants_include_self() {
        let registry = registry();
        let desc = registry.descendants(zg::ACCESS_EVENT);
        assert_eq!(desc, vec![zg::ACCESS_EVENT.to_string()]);
    }

    #[test]
    fn descendants_are_transitive() {
        let registry = registry();
        let desc = registry.descendants(nfo::DATA_OBJECT);
        assert!(desc.contains(&nfo::FILE_DATA_OBJECT.to_string()));
        assert!(desc.contains(&nfo::EMBEDDED_FILE_DATA_OBJECT.to_string()));
        assert!(desc.contains(&nfo::REMOTE_DATA_OBJECT.to_string()));
    }

    #[test]
    fn unknown_uri_yields_itself() {
        let registry = registry();
        assert_eq!(
            registry.descendants("example://custom"),
            vec!["example://custom".to_string()]
        );
    }

    #[test]
    fn conflicting_reregistration_fails() {
        let mut registry = SymbolRegistry::new();
        registry.register("a", &[]).unwrap();
        registry.register("b", &["a"]).unwrap();
        assert!(registry.register("b", &["a"]).is_ok());
        assert!(registry.register("b", &[]).is_err());
    }

    #[test]
    fn diamond_parents_counted_once() {
        let mut registry = SymbolRegistry::new();
        registry.register("root", &[]).unwrap();
        registry.register("a", &["root"]).unwrap();
        registry.register("b", &["root"]).unwrap();
        registry.register("leaf", &["a", "b"]).unwrap();
        let desc = registry.descendants("root");
        assert_eq!(desc.iter().filter(|d| *d == "leaf").count(), 1);
    }
}
