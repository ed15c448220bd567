//! The shared environment sessions run on.
//!
//! A [`JaatoRuntime`] binds one provider factory set, one plugin registry,
//! one permission policy/channel, and one token ledger. Many sessions can
//! run on one runtime: the registry and ledger are shared, the interaction
//! channel is serialized runtime-wide, and each session gets its own
//! permission engine (session rules are per-conversation state).
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use jaato::provider::{ModelProvider, ProviderConfig};
//! use jaato::providers::openai_compat::OpenAiCompatProvider;
//! use jaato::runtime::JaatoRuntime;
//!
//! # async fn demo() -> jaato::Result<()> {
//! let runtime = Arc::new(
//!     JaatoRuntime::new("openai_compat").with_provider_factory(
//!         "openai_compat",
//!         Arc::new(|| {
//!             Box::new(OpenAiCompatProvider::new("https://api.openai.com/v1"))
//!                 as Box<dyn ModelProvider>
//!         }),
//!     ),
//! );
//! runtime.connect(ProviderConfig::from_env());
//! runtime.registry().write().await.expose_tool("calculator", None).await?;
//!
//! let mut session = runtime.create_session("gpt-4o");
//! session.configure(Default::default()).await?;
//! let answer = session.send_message("What is 6 * 7?").await?;
//! println!("{}", answer);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock as StdRwLock};

use tokio::sync::RwLock;

use crate::jaato::error::{JaatoError, Result};
use crate::jaato::ledger::TokenLedger;
use crate::jaato::permission::channels::InteractionChannel;
use crate::jaato::permission::{PermissionEngine, PermissionEngineConfig, PermissionPolicy, SharedPrompter};
use crate::jaato::provider::{ModelProvider, ProviderConfig};
use crate::jaato::registry::PluginRegistry;
use crate::jaato::session::JaatoSession;
use crate::jaato::types::{ToolSchema, UserCommand};

/// Constructor for a provider instance.
pub type ProviderFactory = Arc<dyn Fn() -> Box<dyn ModelProvider> + Send + Sync>;

/// Shared environment: provider factories, registry, permission, ledger.
pub struct JaatoRuntime {
    provider_name: String,
    factories: StdRwLock<BTreeMap<String, ProviderFactory>>,
    provider_config: StdRwLock<Option<ProviderConfig>>,
    registry: Arc<RwLock<PluginRegistry>>,
    prompter: StdRwLock<Arc<SharedPrompter>>,
    policy: StdRwLock<PermissionPolicy>,
    permission_config: StdRwLock<PermissionEngineConfig>,
    ledger: Arc<TokenLedger>,
    /// Runtime-level additions to the auto-approved set, beyond what the
    /// exposed plugins contribute.
    extra_auto_approved: StdRwLock<Vec<String>>,
}

impl JaatoRuntime {
    /// Runtime defaulting to the named provider, an empty registry, an
    /// allow-all policy, and a fresh ledger. Without a configured
    /// interaction channel the `ask` policy denies, so interactive gating
    /// requires [`with_interaction_channel`](JaatoRuntime::with_interaction_channel).
    pub fn new(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            factories: StdRwLock::new(BTreeMap::new()),
            provider_config: StdRwLock::new(None),
            registry: Arc::new(RwLock::new(PluginRegistry::new())),
            prompter: StdRwLock::new(Arc::new(SharedPrompter::new(Box::new(
                crate::jaato::permission::channels::AutoChannel::always(
                    crate::jaato::permission::channels::PromptAction::No,
                ),
            )))),
            policy: StdRwLock::new(PermissionPolicy::allow_all()),
            permission_config: StdRwLock::new(PermissionEngineConfig::default()),
            ledger: Arc::new(TokenLedger::new()),
            extra_auto_approved: StdRwLock::new(Vec::new()),
        }
    }

    /// Register a provider factory under a name (builder pattern).
    pub fn with_provider_factory(
        self,
        name: impl Into<String>,
        factory: ProviderFactory,
    ) -> Self {
        self.factories
            .write()
            .expect("runtime poisoned")
            .insert(name.into(), factory);
        self
    }

    /// Replace the permission policy (builder pattern).
    pub fn with_permission_policy(self, policy: PermissionPolicy) -> Self {
        *self.policy.write().expect("runtime poisoned") = policy;
        self
    }

    /// Replace the interaction channel behind the `ask` policy (builder
    /// pattern). All sessions share one serialized channel.
    pub fn with_interaction_channel(self, channel: Box<dyn InteractionChannel>) -> Self {
        *self.prompter.write().expect("runtime poisoned") =
            Arc::new(SharedPrompter::new(channel));
        self
    }

    /// Replace channel and engine tuning together (builder pattern).
    pub fn with_permission_config(self, config: PermissionEngineConfig) -> Self {
        *self.permission_config.write().expect("runtime poisoned") = config;
        self
    }

    /// Add runtime-level auto-approved tools (builder pattern).
    pub fn with_auto_approved(self, tools: Vec<String>) -> Self {
        self.extra_auto_approved
            .write()
            .expect("runtime poisoned")
            .extend(tools);
        self
    }

    /// Store the provider configuration used by every
    /// [`create_provider`](JaatoRuntime::create_provider) call. May be
    /// called again to reconnect with different credentials.
    pub fn connect(&self, config: ProviderConfig) {
        *self.provider_config.write().expect("runtime poisoned") = Some(config);
    }

    /// Whether [`connect`](JaatoRuntime::connect) has been called.
    pub fn is_connected(&self) -> bool {
        self.provider_config
            .read()
            .expect("runtime poisoned")
            .is_some()
    }

    /// The stored provider configuration, if connected.
    pub fn provider_config(&self) -> Option<ProviderConfig> {
        self.provider_config
            .read()
            .expect("runtime poisoned")
            .clone()
    }

    /// The shared plugin registry.
    pub fn registry(&self) -> Arc<RwLock<PluginRegistry>> {
        Arc::clone(&self.registry)
    }

    /// The shared token ledger.
    pub fn ledger(&self) -> Arc<TokenLedger> {
        Arc::clone(&self.ledger)
    }

    /// Name of the default provider factory.
    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Expose a set of plugins with per-plugin configs. Idempotent for
    /// identical arguments: already-exposed plugins are left untouched.
    pub async fn configure_plugins(&self, exposures: &[(String, Option<serde_json::Value>)]) {
        self.registry.write().await.expose_all(exposures).await;
    }

    /// Build, initialize, and connect a provider for `model` using the
    /// default factory and the stored configuration.
    pub async fn create_provider(&self, model: &str) -> Result<Box<dyn ModelProvider>> {
        let config = self
            .provider_config
            .read()
            .expect("runtime poisoned")
            .clone()
            .ok_or(JaatoError::NotConnected)?;
        let factory = self
            .factories
            .read()
            .expect("runtime poisoned")
            .get(&self.provider_name)
            .cloned()
            .ok_or_else(|| JaatoError::ProviderNotFound(self.provider_name.clone()))?;
        let mut provider = factory();
        provider.initialize(&config).await?;
        provider.connect(model);
        Ok(provider)
    }

    /// Fresh permission engine for one session, sharing the runtime's
    /// policy and serialized channel.
    pub fn permission_engine(&self) -> PermissionEngine {
        let policy = self.policy.read().expect("runtime poisoned").clone();
        let prompter = Arc::clone(&self.prompter.read().expect("runtime poisoned"));
        let config = self
            .permission_config
            .read()
            .expect("runtime poisoned")
            .clone();
        PermissionEngine::with_prompter(policy, prompter).with_config(config)
    }

    /// Runtime-level auto-approved tool names.
    pub fn extra_auto_approved(&self) -> Vec<String> {
        self.extra_auto_approved
            .read()
            .expect("runtime poisoned")
            .clone()
    }

    /// Aggregate tool schemas over the exposed set, optionally filtered to
    /// a plugin subset.
    pub async fn tool_schemas(&self, plugin_names: Option<&[String]>) -> Vec<ToolSchema> {
        self.registry.read().await.exposed_tool_schemas(plugin_names)
    }

    /// Aggregate system instructions over the exposed set, with optional
    /// session-specific additions appended.
    pub async fn system_instructions(&self, additional: Option<&str>) -> Option<String> {
        let base = self.registry.read().await.system_instructions();
        match (base, additional) {
            (Some(base), Some(extra)) => Some(format!("{}\n\n{}", base, extra)),
            (Some(base), None) => Some(base),
            (None, Some(extra)) => Some(extra.to_string()),
            (None, None) => None,
        }
    }

    /// Aggregate user commands over the exposed set.
    pub async fn user_commands(&self) -> Vec<UserCommand> {
        self.registry.read().await.user_commands()
    }

    /// Bind a new session to this runtime for the given model. The session
    /// is inert until [`JaatoSession::configure`] is called.
    pub fn create_session(self: &Arc<Self>, model: &str) -> JaatoSession {
        JaatoSession::new(Arc::clone(self), model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_starts_disconnected() {
        let runtime = JaatoRuntime::new("openai_compat");
        assert!(!runtime.is_connected());
        assert_eq!(runtime.provider_name(), "openai_compat");
    }

    #[tokio::test]
    async fn test_create_provider_requires_connection() {
        let runtime = JaatoRuntime::new("openai_compat");
        let err = runtime.create_provider("gpt-4o").await.err().unwrap();
        assert!(matches!(err, JaatoError::NotConnected));
    }

    #[tokio::test]
    async fn test_create_provider_requires_factory() {
        let runtime = JaatoRuntime::new("missing");
        runtime.connect(ProviderConfig::ApiKey {
            api_key: "k".into(),
        });
        let err = runtime.create_provider("gpt-4o").await.err().unwrap();
        assert!(matches!(err, JaatoError::ProviderNotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_system_instruction_aggregation_with_additional() {
        let runtime = JaatoRuntime::new("openai_compat");
        let combined = runtime.system_instructions(Some("Be a researcher.")).await;
        assert_eq!(combined.as_deref(), Some("Be a researcher."));
    }
}
