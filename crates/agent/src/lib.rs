//! Scrivener agent: translates a batch of work items by driving a chat model through a
//! budgeted `search` / `apply_translations` / `skip` tool protocol.
//!
//! The model never sees conversation history. Each round it gets a fresh snapshot of the
//! queue, the search cache, the remaining budget and the last error, and must answer with
//! tool calls. Executors validate whole calls before mutating, so a rejected call leaves
//! the run exactly as it was.

#![forbid(unsafe_code)]

pub mod budget;
pub mod config;
pub mod dedup;
pub mod driver;
pub mod error;
pub mod exec;
pub mod model;
pub mod prompt;
pub mod state;
pub mod tools;

pub use budget::compute_budget;
pub use config::AgentConfig;
pub use driver::{BatchOutcome, LearnedTerm, SessionDriver, Termination};
pub use error::{ModelError, ToolError};
pub use model::{ChatModel, ChatRequest, ModelResponse, OpenAiClient, RawToolCall};
pub use state::SessionState;
pub use tokio_util::sync::CancellationToken;
