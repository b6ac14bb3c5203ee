//! Installed modules.
//!
//! Modules are registered once at startup. Readers take a snapshot
//! (`Arc<Vec<_>>`) so one dispatch always sees one consistent module set,
//! even if a registration lands concurrently.

use crate::plugin::DynPlugin;
use labctl_core::envelope::validate_module_name;
use labctl_core::{Error, Result, TopicFilter};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

/// A module with its parsed filters.
pub struct RegisteredModule {
    name: String,
    filters: Vec<TopicFilter>,
    plugin: DynPlugin,
}

impl RegisteredModule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filters(&self) -> &[TopicFilter] {
        &self.filters
    }

    pub fn plugin(&self) -> &DynPlugin {
        &self.plugin
    }

    /// Whether any of the module's filters matches `topic`.
    pub fn matches(&self, topic: &str) -> bool {
        self.filters.iter().any(|f| f.matches(topic))
    }
}

impl std::fmt::Debug for RegisteredModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredModule")
            .field("name", &self.name)
            .field("filters", &self.filters)
            .finish()
    }
}

pub type ModuleSnapshot = Arc<Vec<Arc<RegisteredModule>>>;

#[derive(Default)]
pub struct PluginRegistry {
    modules: RwLock<ModuleSnapshot>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module. Fails on a duplicate name or a malformed filter.
    pub fn register(&self, plugin: DynPlugin) -> Result<()> {
        let name = plugin.name().to_string();
        validate_module_name(&name)?;
        let filters = plugin
            .topic_filters()
            .iter()
            .map(|f| TopicFilter::parse(f))
            .collect::<Result<Vec<_>>>()?;

        let mut modules = self.modules.write();
        if modules.iter().any(|m| m.name == name) {
            return Err(Error::DuplicateModule(name));
        }

        let mut next: Vec<Arc<RegisteredModule>> = modules.as_ref().clone();
        info!(
            category = "router",
            module = %name,
            filters = ?filters.iter().map(TopicFilter::as_str).collect::<Vec<_>>(),
            "Module registered"
        );
        next.push(Arc::new(RegisteredModule {
            name,
            filters,
            plugin,
        }));
        *modules = Arc::new(next);
        Ok(())
    }

    pub fn snapshot(&self) -> ModuleSnapshot {
        self.modules.read().clone()
    }

    /// Modules with at least one filter matching `topic`, in registration order.
    pub fn matching(&self, topic: &str) -> Vec<Arc<RegisteredModule>> {
        self.snapshot()
            .iter()
            .filter(|m| m.matches(topic))
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredModule>> {
        self.modules.read().iter().find(|m| m.name == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.read().iter().map(|m| m.name.clone()).collect()
    }

    /// Every distinct filter across all modules, in registration order.
    pub fn all_filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = Vec::new();
        for module in self.snapshot().iter() {
            for filter in &module.filters {
                if !filters.iter().any(|f| f == filter.as_str()) {
                    filters.push(filter.as_str().to_string());
                }
            }
        }
        filters
    }

    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
