//! Extension framework
//!
//! Extensions are compiled in and registered explicitly at startup; there
//! is no runtime discovery. They observe and can veto the engine's insert
//! and delete paths through the hooks below, and may expose named public
//! operations on the IPC surface (the registry rejects two extensions
//! claiming the same operation name).

use std::any::Any;

use tracing::warn;

use chronolog_core::error::{Error, Result};
use chronolog_core::types::Event;

/// Hook points around the engine. All hooks default to pass-through.
pub trait Extension: Send {
    fn name(&self) -> &'static str;

    /// IPC operation names this extension services.
    fn public_methods(&self) -> &'static [&'static str] {
        &[]
    }

    /// Inspect or rewrite an event about to be inserted. `Ok(None)` vetoes
    /// the insert.
    fn pre_insert_event(&mut self, event: Event, _sender: &str) -> Result<Option<Event>> {
        Ok(Some(event))
    }

    fn post_insert_event(&mut self, _event: &Event, _sender: &str) -> Result<()> {
        Ok(())
    }

    /// Narrow or expand the set of ids about to be deleted.
    fn pre_delete_events(&mut self, ids: Vec<u64>, _sender: &str) -> Result<Vec<u64>> {
        Ok(ids)
    }

    fn post_delete_events(&mut self, _ids: &[u64], _sender: &str) -> Result<()> {
        Ok(())
    }

    /// Called once at shutdown; flush state here.
    fn unload(&mut self) {}

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Registered extensions in registration order.
#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Box<dyn Extension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        ExtensionRegistry::default()
    }

    /// Register an extension. Fails when one of its public method names is
    /// already claimed.
    pub fn register(&mut self, extension: Box<dyn Extension>) -> Result<()> {
        for method in extension.public_methods() {
            for existing in &self.extensions {
                if existing.public_methods().contains(method) {
                    return Err(Error::Extension(format!(
                        "operation {} claimed by both {} and {}",
                        method,
                        existing.name(),
                        extension.name()
                    )));
                }
            }
        }
        self.extensions.push(extension);
        Ok(())
    }

    /// Borrow a registered extension by concrete type.
    pub fn get_mut<T: Extension + 'static>(&mut self) -> Option<&mut T> {
        self.extensions
            .iter_mut()
            .find_map(|e| e.as_any_mut().downcast_mut::<T>())
    }

    pub fn get<T: Extension + 'static>(&self) -> Option<&T> {
        self.extensions
            .iter()
            .find_map(|e| e.as_any().downcast_ref::<T>())
    }

    /// Run the pre-insert chain. The first veto wins; a failing hook is
    /// logged and treated as a veto.
    pub fn apply_pre_insert(&mut self, mut event: Event, sender: &str) -> Option<Event> {
        for extension in &mut self.extensions {
            match extension.pre_insert_event(event, sender) {
                Ok(Some(e)) => event = e,
                Ok(None) => return None,
                Err(e) => {
                    warn!(extension = extension.name(), error = %e,
                        "pre-insert hook failed, treating as veto");
                    return None;
                }
            }
        }
        Some(event)
    }

    pub fn apply_post_insert(&mut self, event: &Event, sender: &str) {
        for extension in &mut self.extensions {
            if let Err(e) = extension.post_insert_event(event, sender) {
                warn!(extension = extension.name(), error = %e, "post-insert hook failed");
            }
        }
    }

    pub fn apply_pre_delete(&mut self, mut ids: Vec<u64>, sender: &str) -> Vec<u64> {
        for extension in &mut self.extensions {
            match extension.pre_delete_events(ids.clone(), sender) {
                Ok(filtered) => ids = filtered,
                Err(e) => {
                    warn!(extension = extension.name(), error = %e, "pre-delete hook failed");
                }
            }
        }
        ids
    }

    pub fn apply_post_delete(&mut self, ids: &[u64], sender: &str) {
        for extension in &mut self.extensions {
            if let Err(e) = extension.post_delete_events(ids, sender) {
                warn!(extension = extension.name(), error = %e, "post-delete hook failed");
            }
        }
    }

    pub fn unload_all(&mut self) {
        for extension in &mut self.extensions {
            extension.unload();
        }
    }
}
