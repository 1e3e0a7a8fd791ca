//! Plugin contract consumed by the executor, plus a simple registry.
//!
//! The executor makes exactly one call into plugin code:
//! [`Plugin::execute_pipeline_step`]. Plugins are resolved by
//! `"Type.Name"` or, when unqualified, by name across all types.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

/// Failure reported by a plugin.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("invalid plugin input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),
}

/// A unit of work the executor can call from a `plugin` step.
pub trait Plugin: Send + Sync {
    /// Plugin type, the `Type` in `"Type.Name"`.
    fn plugin_type(&self) -> &str;

    fn name(&self) -> &str;

    /// Run one step. `step_config` is the step definition with templates
    /// resolved; `context` is the live pipeline context. The returned map is
    /// merged into the live context.
    fn execute_pipeline_step(
        &self,
        step_config: &Map<String, Value>,
        context: &Map<String, Value>,
    ) -> Result<Map<String, Value>, PluginError>;
}

/// Resolves plugin references to instances.
pub trait PluginManager: Send + Sync {
    fn get_plugin(&self, plugin_type: &str, name: &str) -> Option<Arc<dyn Plugin>>;

    /// Look a plugin up by name alone, searching every type.
    fn find_plugin(&self, name: &str) -> Option<Arc<dyn Plugin>>;
}

/// Registry of plugin instances keyed by (type, name).
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<(String, String), Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin, replacing any plugin with the same type and name.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let key = (plugin.plugin_type().to_string(), plugin.name().to_string());
        self.plugins.insert(key, plugin);
    }

    /// All registered references as `"Type.Name"`.
    pub fn list_names(&self) -> Vec<String> {
        self.plugins
            .keys()
            .map(|(plugin_type, name)| format!("{plugin_type}.{name}"))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl PluginManager for PluginRegistry {
    fn get_plugin(&self, plugin_type: &str, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .get(&(plugin_type.to_string(), name.to_string()))
            .cloned()
    }

    fn find_plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .iter()
            .find(|((_, plugin_name), _)| plugin_name == name)
            .map(|(_, plugin)| Arc::clone(plugin))
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.list_names())
            .finish()
    }
}
