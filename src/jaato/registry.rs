//! Plugin discovery, lifecycle, and aggregation.
//!
//! The registry separates *availability* from *exposure*. A plugin becomes
//! available through one of two discovery paths (a linked factory
//! registered at startup, or a `plugin.json` manifest found by scanning a
//! plugins directory) and becomes active only when
//! [`expose_tool`](PluginRegistry::expose_tool) constructs it, runs
//! `initialize`, and adds it to the exposed set.
//! [`unexpose_tool`](PluginRegistry::unexpose_tool) runs `shutdown` and
//! restores the registry to its pre-expose state.
//!
//! Aggregation walks the exposed set in exposure order: tool schemas are
//! deduplicated by name (first wins), system instructions concatenate,
//! auto-approved sets union, user commands concatenate. Two exposed plugins
//! declaring the same tool name is a configuration error caught at expose
//! time.
//!
//! # Example
//!
//! ```rust,no_run
//! use jaato::registry::PluginRegistry;
//!
//! # async fn demo(my_plugin_factory: jaato::registry::PluginFactory) -> jaato::Result<()> {
//! let mut registry = PluginRegistry::new();
//! registry.register_factory("calculator", my_plugin_factory);
//! registry.expose_tool("calculator", None).await?;
//! assert_eq!(registry.list_exposed(), vec!["calculator".to_string()]);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::jaato::error::{JaatoError, Result};
use crate::jaato::plugin::ToolPlugin;
use crate::jaato::types::{Completion, EnrichedPrompt, ToolSchema, UserCommand};

/// Constructor for a plugin instance.
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn ToolPlugin> + Send + Sync>;

/// A `plugin.json` manifest found by the directory scan.
#[derive(Debug, Clone, Deserialize)]
struct PluginManifest {
    /// Name the plugin is exposed under.
    name: String,
    /// Factory that builds it; must be registered with the registry.
    factory: String,
    /// Configuration handed to `initialize` on expose.
    #[serde(default)]
    config: Option<Value>,
}

/// An available-but-not-exposed plugin discovered from a manifest.
#[derive(Debug, Clone)]
struct DiscoveredPlugin {
    factory: String,
    config: Option<Value>,
}

/// One active plugin in the exposed set.
struct ExposedPlugin {
    name: String,
    plugin: Arc<dyn ToolPlugin>,
    /// Schemas captured at expose time; exposure order is aggregation order.
    schemas: Vec<ToolSchema>,
}

/// Discovery, lifecycle, and aggregation over tool plugins.
#[derive(Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
    discovered: BTreeMap<String, DiscoveredPlugin>,
    exposed: Vec<ExposedPlugin>,
    /// tool name → owning plugin name, for call routing.
    tool_routes: HashMap<String, String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- Discovery ----

    /// Register a linked plugin factory under a name. Re-registering the
    /// same name replaces the factory (idempotent for identical factories).
    pub fn register_factory(&mut self, name: impl Into<String>, factory: PluginFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Scan `dir` for `<subdir>/plugin.json` manifests and record each as an
    /// available plugin bound to a registered factory.
    ///
    /// Idempotent: rescanning refreshes manifest bindings. Individual
    /// manifest failures are logged and skipped; discovery always proceeds.
    /// Returns the names made available by this scan.
    pub fn discover_manifests(&mut self, dir: impl AsRef<Path>) -> Vec<String> {
        let dir = dir.as_ref();
        let mut found = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("plugin scan of {} failed: {}", dir.display(), err);
                return found;
            }
        };
        for entry in entries.flatten() {
            let manifest_path = entry.path().join("plugin.json");
            if !manifest_path.is_file() {
                continue;
            }
            let manifest: PluginManifest = match std::fs::read_to_string(&manifest_path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
            {
                Ok(manifest) => manifest,
                Err(err) => {
                    log::warn!(
                        "skipping plugin manifest {}: {}",
                        manifest_path.display(),
                        err
                    );
                    continue;
                }
            };
            if !self.factories.contains_key(&manifest.factory) {
                log::warn!(
                    "skipping plugin '{}': factory '{}' is not registered",
                    manifest.name,
                    manifest.factory
                );
                continue;
            }
            found.push(manifest.name.clone());
            self.discovered.insert(
                manifest.name,
                DiscoveredPlugin {
                    factory: manifest.factory,
                    config: manifest.config,
                },
            );
        }
        found.sort();
        found
    }

    /// Names of all available plugins (registered factories plus manifest
    /// discoveries), sorted.
    pub fn available_plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        for name in self.discovered.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names.sort();
        names
    }

    // ---- Exposure lifecycle ----

    /// Construct, initialize, and activate a plugin.
    ///
    /// `config` overrides any manifest-bound configuration. Exposing an
    /// already-exposed plugin is a no-op. Tool-name collisions with the
    /// already-exposed set fail with
    /// [`JaatoError::DuplicateToolName`] and leave the registry unchanged.
    pub async fn expose_tool(&mut self, name: &str, config: Option<Value>) -> Result<()> {
        if self.is_exposed(name) {
            return Ok(());
        }

        let (factory_name, bound_config) = match self.discovered.get(name) {
            Some(d) => (d.factory.clone(), d.config.clone()),
            None if self.factories.contains_key(name) => (name.to_string(), None),
            None => return Err(JaatoError::PluginNotFound(name.to_string())),
        };
        let factory = self
            .factories
            .get(&factory_name)
            .ok_or_else(|| JaatoError::PluginNotFound(factory_name.clone()))?
            .clone();

        let plugin: Arc<dyn ToolPlugin> = Arc::from(factory());
        let schemas = plugin.tool_schemas();

        // Reject tool-name collisions before mutating anything.
        for schema in &schemas {
            if let Some(owner) = self.tool_routes.get(&schema.name) {
                return Err(JaatoError::DuplicateToolName {
                    tool: schema.name.clone(),
                    first: owner.clone(),
                    second: name.to_string(),
                });
            }
        }

        let effective_config = config.or(bound_config);
        plugin
            .initialize(effective_config.as_ref())
            .await
            .map_err(|message| JaatoError::PluginDiscoveryFailure {
                plugin: name.to_string(),
                message,
            })?;

        for schema in &schemas {
            self.tool_routes
                .insert(schema.name.clone(), name.to_string());
        }
        self.exposed.push(ExposedPlugin {
            name: name.to_string(),
            plugin,
            schemas,
        });
        log::debug!("exposed plugin '{}'", name);
        Ok(())
    }

    /// Shut down and deactivate a plugin, restoring the pre-expose state.
    /// Unexposing an unknown or inactive plugin is a no-op.
    pub async fn unexpose_tool(&mut self, name: &str) {
        let index = match self.exposed.iter().position(|p| p.name == name) {
            Some(index) => index,
            None => return,
        };
        let entry = self.exposed.remove(index);
        for schema in &entry.schemas {
            self.tool_routes.remove(&schema.name);
        }
        if let Err(err) = entry.plugin.shutdown().await {
            log::warn!("plugin '{}' shutdown reported: {}", name, err);
        }
        log::debug!("unexposed plugin '{}'", name);
    }

    /// Expose several plugins with per-plugin configs.
    ///
    /// Failures are logged and skipped; the rest of the set still activates.
    /// Calling again with identical arguments is idempotent.
    pub async fn expose_all(&mut self, configs: &[(String, Option<Value>)]) {
        for (name, config) in configs {
            if let Err(err) = self.expose_tool(name, config.clone()).await {
                log::warn!("expose of plugin '{}' failed: {}", name, err);
            }
        }
    }

    /// Unexpose every active plugin, in reverse exposure order.
    pub async fn unexpose_all(&mut self) {
        let names: Vec<String> = self.exposed.iter().rev().map(|p| p.name.clone()).collect();
        for name in names {
            self.unexpose_tool(&name).await;
        }
    }

    /// Whether a plugin is currently exposed.
    pub fn is_exposed(&self, name: &str) -> bool {
        self.exposed.iter().any(|p| p.name == name)
    }

    /// Names of exposed plugins, in exposure order.
    pub fn list_exposed(&self) -> Vec<String> {
        self.exposed.iter().map(|p| p.name.clone()).collect()
    }

    // ---- Aggregation over the exposed set ----

    /// All exposed tool schemas, deduplicated by name (first wins, keeping
    /// declaration ids stable), optionally filtered to a plugin subset.
    pub fn exposed_tool_schemas(&self, plugin_names: Option<&[String]>) -> Vec<ToolSchema> {
        let mut seen = std::collections::HashSet::new();
        let mut schemas = Vec::new();
        for entry in &self.exposed {
            if let Some(filter) = plugin_names {
                if !filter.contains(&entry.name) {
                    continue;
                }
            }
            for schema in &entry.schemas {
                if seen.insert(schema.name.clone()) {
                    schemas.push(schema.clone());
                }
            }
        }
        schemas
    }

    /// Concatenated system instructions of exposed plugins, in exposure
    /// order; `None` when no plugin contributes any.
    pub fn system_instructions(&self) -> Option<String> {
        let chunks: Vec<String> = self
            .exposed
            .iter()
            .filter_map(|p| p.plugin.system_instructions())
            .collect();
        if chunks.is_empty() {
            None
        } else {
            Some(chunks.join("\n\n"))
        }
    }

    /// Union of auto-approved tool names across exposed plugins.
    pub fn auto_approved_tools(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut tools = Vec::new();
        for entry in &self.exposed {
            for tool in entry.plugin.auto_approved_tools() {
                if seen.insert(tool.clone()) {
                    tools.push(tool);
                }
            }
        }
        tools
    }

    /// Concatenated user commands across exposed plugins, in exposure order.
    pub fn user_commands(&self) -> Vec<UserCommand> {
        self.exposed
            .iter()
            .flat_map(|p| p.plugin.user_commands())
            .collect()
    }

    /// Resolve a tool name to the plugin that owns it.
    pub fn plugin_for_tool(&self, tool: &str) -> Option<Arc<dyn ToolPlugin>> {
        let owner = self.tool_routes.get(tool)?;
        self.exposed
            .iter()
            .find(|p| &p.name == owner)
            .map(|p| Arc::clone(&p.plugin))
    }

    /// Resolve a user-command name to the plugin that declared it.
    pub fn plugin_for_command(&self, command: &str) -> Option<Arc<dyn ToolPlugin>> {
        self.exposed
            .iter()
            .find(|p| p.plugin.user_commands().iter().any(|c| c.name == command))
            .map(|p| Arc::clone(&p.plugin))
    }

    /// Completion candidates for a command, from its owning plugin.
    pub fn command_completions(&self, command: &str, args: &[String]) -> Vec<Completion> {
        self.plugin_for_command(command)
            .map(|p| p.command_completions(command, args))
            .unwrap_or_default()
    }

    /// Thread a user prompt through every subscribed plugin, in exposure
    /// order, accumulating per-plugin metadata.
    pub async fn enrich_prompt(&self, prompt: &str) -> EnrichedPrompt {
        let mut out = EnrichedPrompt {
            prompt: prompt.to_string(),
            metadata: Default::default(),
        };
        for entry in &self.exposed {
            if !entry.plugin.subscribes_to_prompt_enrichment() {
                continue;
            }
            let step = entry.plugin.enrich_prompt(&out.prompt).await;
            out.prompt = step.prompt;
            for (key, value) in step.metadata {
                out.metadata.insert(format!("{}.{}", entry.name, key), value);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakePlugin {
        name: String,
        tools: Vec<&'static str>,
        shutdown_flag: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ToolPlugin for FakePlugin {
        fn name(&self) -> &str {
            &self.name
        }

        fn tool_schemas(&self) -> Vec<ToolSchema> {
            self.tools
                .iter()
                .map(|t| ToolSchema::new(*t, "fake tool"))
                .collect()
        }

        async fn execute(&self, tool: &str, _args: &Value) -> std::result::Result<Value, String> {
            Ok(json!({"tool": tool}))
        }

        async fn shutdown(&self) -> std::result::Result<(), String> {
            self.shutdown_flag.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn system_instructions(&self) -> Option<String> {
            Some(format!("instructions from {}", self.name))
        }

        fn auto_approved_tools(&self) -> Vec<String> {
            self.tools.iter().map(|t| t.to_string()).collect()
        }
    }

    fn fake_factory(
        name: &'static str,
        tools: Vec<&'static str>,
        flag: Arc<AtomicBool>,
    ) -> PluginFactory {
        Arc::new(move || {
            Box::new(FakePlugin {
                name: name.to_string(),
                tools: tools.clone(),
                shutdown_flag: Arc::clone(&flag),
            }) as Box<dyn ToolPlugin>
        })
    }

    #[tokio::test]
    async fn test_expose_unexpose_round_trip() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut registry = PluginRegistry::new();
        registry.register_factory("alpha", fake_factory("alpha", vec!["a1", "a2"], flag.clone()));

        let before = registry.list_exposed();
        registry.expose_tool("alpha", None).await.unwrap();
        assert_eq!(registry.list_exposed(), vec!["alpha".to_string()]);
        assert_eq!(registry.exposed_tool_schemas(None).len(), 2);
        assert!(registry.plugin_for_tool("a1").is_some());

        registry.unexpose_tool("alpha").await;
        assert_eq!(registry.list_exposed(), before);
        assert!(registry.exposed_tool_schemas(None).is_empty());
        assert!(registry.plugin_for_tool("a1").is_none());
        assert!(flag.load(Ordering::SeqCst), "shutdown was not called");
    }

    #[tokio::test]
    async fn test_expose_is_idempotent() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut registry = PluginRegistry::new();
        registry.register_factory("alpha", fake_factory("alpha", vec!["a1"], flag));
        registry.expose_tool("alpha", None).await.unwrap();
        registry.expose_tool("alpha", None).await.unwrap();
        assert_eq!(registry.list_exposed().len(), 1);
        assert_eq!(registry.exposed_tool_schemas(None).len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_tool_name_rejected() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut registry = PluginRegistry::new();
        registry.register_factory("alpha", fake_factory("alpha", vec!["shared"], flag.clone()));
        registry.register_factory("beta", fake_factory("beta", vec!["shared"], flag));

        registry.expose_tool("alpha", None).await.unwrap();
        let err = registry.expose_tool("beta", None).await.unwrap_err();
        match err {
            JaatoError::DuplicateToolName { tool, first, second } => {
                assert_eq!(tool, "shared");
                assert_eq!(first, "alpha");
                assert_eq!(second, "beta");
            }
            other => panic!("unexpected error: {}", other),
        }
        // The failed expose left the registry unchanged.
        assert_eq!(registry.list_exposed(), vec!["alpha".to_string()]);
    }

    #[tokio::test]
    async fn test_aggregation_order_and_union() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut registry = PluginRegistry::new();
        registry.register_factory("alpha", fake_factory("alpha", vec!["a1"], flag.clone()));
        registry.register_factory("beta", fake_factory("beta", vec!["b1"], flag));

        registry.expose_tool("beta", None).await.unwrap();
        registry.expose_tool("alpha", None).await.unwrap();

        // Exposure order, not alphabetical order.
        let schemas = registry.exposed_tool_schemas(None);
        assert_eq!(schemas[0].name, "b1");
        assert_eq!(schemas[1].name, "a1");

        let instructions = registry.system_instructions().unwrap();
        let beta_pos = instructions.find("beta").unwrap();
        let alpha_pos = instructions.find("alpha").unwrap();
        assert!(beta_pos < alpha_pos);

        let auto = registry.auto_approved_tools();
        assert!(auto.contains(&"a1".to_string()) && auto.contains(&"b1".to_string()));
    }

    #[tokio::test]
    async fn test_manifest_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_dir = dir.path().join("calc");
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(
            plugin_dir.join("plugin.json"),
            r#"{"name": "calc", "factory": "alpha", "config": {"precision": 4}}"#,
        )
        .unwrap();
        // A broken manifest must be skipped, not fatal.
        let broken_dir = dir.path().join("broken");
        std::fs::create_dir_all(&broken_dir).unwrap();
        std::fs::write(broken_dir.join("plugin.json"), "{not json").unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        let mut registry = PluginRegistry::new();
        registry.register_factory("alpha", fake_factory("alpha", vec!["a1"], flag));

        let found = registry.discover_manifests(dir.path());
        assert_eq!(found, vec!["calc".to_string()]);
        assert!(registry.available_plugins().contains(&"calc".to_string()));

        registry.expose_tool("calc", None).await.unwrap();
        assert!(registry.is_exposed("calc"));
    }
}
