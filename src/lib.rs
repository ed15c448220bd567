//! # jaato
//!
//! An agentic orchestration runtime. A client submits a user prompt; the
//! runtime drives a multi-turn conversation in which the model may request
//! tool invocations, each gated by a permission policy, executed by a
//! plugin, accounted for in tokens and latency, and fed back into the model
//! until a final textual answer is produced.
//!
//! ## Subsystems
//!
//! - **Provider abstraction** ([`provider`], [`providers`]): a polymorphic
//!   interface over AI backends (chat sessions, tool declarations,
//!   structured output, token counting, history (de)serialization).
//! - **Plugin registry and contract** ([`plugin`], [`registry`]):
//!   discovery, expose/unexpose lifecycle, and aggregation of tool schemas,
//!   executors, system instructions, auto-approvals, and user commands.
//! - **Orchestration loop** ([`client`]): send prompt, gate and dispatch
//!   tool calls (in parallel), return results to the model, repeat, with
//!   per-turn token and latency accounting.
//! - **Permission engine** ([`permission`]): whitelist/blacklist/ask policy
//!   evaluation, session rules, and pluggable console/webhook/file
//!   interaction channels.
//! - **Token ledger** ([`ledger`]): append-only record of provider calls,
//!   token counts, and the retry policy with exponential backoff.
//! - **Runtime and session shells** ([`runtime`], [`session`]): thin
//!   composition binding one provider factory, one registry, one permission
//!   policy, and one shared ledger to many conversations.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use jaato::provider::{ModelProvider, ProviderConfig};
//! use jaato::providers::openai_compat::OpenAiCompatProvider;
//! use jaato::JaatoRuntime;
//!
//! #[tokio::main]
//! async fn main() -> jaato::Result<()> {
//!     let runtime = Arc::new(
//!         JaatoRuntime::new("openai_compat").with_provider_factory(
//!             "openai_compat",
//!             Arc::new(|| {
//!                 Box::new(OpenAiCompatProvider::new("https://api.openai.com/v1"))
//!                     as Box<dyn ModelProvider>
//!             }),
//!         ),
//!     );
//!     runtime.connect(ProviderConfig::from_env());
//!
//!     let mut session = runtime.create_session("gpt-4o");
//!     session.configure(Default::default()).await?;
//!     let answer = session.send_message("Say hi.").await?;
//!     println!("{}", answer);
//!     Ok(())
//! }
//! ```

// Import the top-level `jaato` module.
pub mod jaato;

// Re-export the subsystem modules at the crate root so callers write
// `jaato::provider::...` instead of navigating the inner hierarchy.
pub use crate::jaato::client;
pub use crate::jaato::error;
pub use crate::jaato::event;
pub use crate::jaato::ledger;
pub use crate::jaato::permission;
pub use crate::jaato::plugin;
pub use crate::jaato::provider;
pub use crate::jaato::providers;
pub use crate::jaato::registry;
pub use crate::jaato::runtime;
pub use crate::jaato::session;
pub use crate::jaato::types;

// Re-export the key items for easier external access.
pub use crate::jaato::client::{CancelHandle, ClientConfig, JaatoClient};
pub use crate::jaato::error::{JaatoError, Result};
pub use crate::jaato::event::{ClientEvent, EventHandler, OutputMode};
pub use crate::jaato::ledger::TokenLedger;
pub use crate::jaato::permission::{
    PermissionDecision, PermissionEngine, PermissionPolicy, PermissionRule,
};
pub use crate::jaato::plugin::{GcPlugin, SessionHook, ToolPlugin};
pub use crate::jaato::provider::{ModelProvider, ProviderConfig};
pub use crate::jaato::registry::PluginRegistry;
pub use crate::jaato::runtime::JaatoRuntime;
pub use crate::jaato::session::{
    AgentKind, CommandOutcome, JaatoSession, SessionOptions, SessionSnapshot,
};
pub use crate::jaato::types::{
    FunctionCall, Message, Part, ProviderResponse, Role, TokenUsage, ToolResult, ToolSchema,
};
