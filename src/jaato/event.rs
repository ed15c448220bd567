//! Callback-based observability for the orchestration loop.
//!
//! Implement [`EventHandler`] to receive real-time notifications about turn
//! boundaries, tool dispatch, permission decisions, plan updates, GC
//! collapses, and model/plugin output. The handler is wrapped in
//! `Arc<dyn EventHandler>` and shared with the client; the single trait
//! method has a default no-op body so handlers match only the variants they
//! care about.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use jaato::event::{ClientEvent, EventHandler};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_client_event(&self, event: &ClientEvent) {
//!         if let ClientEvent::ToolStarted { tool, .. } = event {
//!             println!("running {}...", tool);
//!         }
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde_json::Value;

use crate::jaato::permission::PermissionDecision;
use crate::jaato::types::{TokenUsage, TurnAccounting};

/// Whether an output chunk starts a new block or continues the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Start a new output block.
    Write,
    /// Continue the current block (streamed continuation).
    Append,
}

/// Events emitted by [`JaatoClient`](crate::JaatoClient) during a turn.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A user-request-to-final-answer cycle began.
    TurnStarted {
        /// 0-based turn index.
        turn: usize,
        /// First ~120 characters of the (enriched) prompt.
        prompt_preview: String,
    },

    /// The turn finished; its accounting row is final.
    TurnCompleted {
        turn: usize,
        accounting: TurnAccounting,
    },

    /// A model round-trip completed within the turn.
    ModelCallCompleted {
        /// 1-based round index within the turn.
        round: usize,
        usage: TokenUsage,
        /// Number of function calls the model issued in this round.
        function_calls: usize,
    },

    /// A tool execution is about to start (after gating).
    ToolStarted {
        tool: String,
        call_id: String,
        args: Value,
    },

    /// A tool execution finished (success, error, or denial).
    ToolCompleted {
        tool: String,
        call_id: String,
        duration_seconds: f64,
        is_error: bool,
        denied: bool,
    },

    /// A gating decision was made for a call.
    PermissionDecided { decision: PermissionDecision },

    /// A plan/TODO payload produced by a planning tool, forwarded for UIs.
    PlanUpdated { plan: Value },

    /// Conversation history was collapsed by the GC plugin.
    GcPerformed {
        items_collected: usize,
        messages_before: usize,
        messages_after: usize,
    },

    /// Text produced for the user: model output or plugin output.
    Output {
        /// `"model"` or the producing plugin's name.
        source: String,
        text: String,
        mode: OutputMode,
    },
}

/// Receiver of [`ClientEvent`]s.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for every event; the default implementation ignores it.
    async fn on_client_event(&self, _event: &ClientEvent) {}
}

/// Handler that discards every event.
pub struct NullEventHandler;

#[async_trait]
impl EventHandler for NullEventHandler {}
