//! The per-batch loop: prompt, model round-trip, tool dispatch, repeat.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use metrics::{counter, histogram};
use scrivener_core::{Candidate, SessionObserver, TermAnnotator, TermLookup, WorkItem};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{preview, AgentConfig};
use crate::error::ToolError;
use crate::exec;
use crate::model::{ChatModel, ChatRequest, ModelResponse, RawToolCall};
use crate::prompt;
use crate::state::{LastError, SearchStatus, SessionState};
use crate::tools::{self, ToolCall};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "message")]
pub enum Termination {
    Success,
    Cancelled,
    Exhausted,
    Error(String),
}

/// A term the `search` tool resolved to candidates during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnedTerm {
    pub term: String,
    pub candidates: Vec<Candidate>,
}

/// Final report of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub termination: Termination,
    pub completed: usize,
    pub translated: usize,
    pub skipped: usize,
    pub total: usize,
    pub rounds: usize,
    /// `ok` entries of the search cache, in term order.
    pub learned: Vec<LearnedTerm>,
}

impl BatchOutcome {
    pub fn success(&self) -> bool {
        self.termination == Termination::Success
    }

    /// Terminal reason for anything but success.
    pub fn error(&self) -> Option<String> {
        match &self.termination {
            Termination::Success => None,
            Termination::Cancelled => Some("cancelled".to_string()),
            Termination::Exhausted => Some(format!("iteration limit reached after {} rounds", self.rounds)),
            Termination::Error(msg) => Some(msg.clone()),
        }
    }
}

/// Drives one batch to completion against a chat model. One instance may run many
/// batches; each run owns its own [`SessionState`].
pub struct SessionDriver {
    model: Arc<dyn ChatModel>,
    lookup: Arc<dyn TermLookup>,
    annotator: Option<Arc<dyn TermAnnotator>>,
    config: AgentConfig,
}

impl SessionDriver {
    pub fn new(model: Arc<dyn ChatModel>, lookup: Arc<dyn TermLookup>, config: AgentConfig) -> Self {
        Self { model, lookup, annotator: None, config }
    }

    pub fn with_annotator(mut self, annotator: Arc<dyn TermAnnotator>) -> Self {
        self.annotator = Some(annotator);
        self
    }

    pub async fn run(&self, items: Vec<WorkItem>, observer: &mut dyn SessionObserver, cancel: &CancellationToken) -> BatchOutcome {
        let started = Instant::now();
        if items.is_empty() {
            return BatchOutcome { termination: Termination::Success, completed: 0, translated: 0, skipped: 0, total: 0, rounds: 0, learned: Vec::new() };
        }
        observer.status(&format!("preparing {} entries", items.len()));
        let texts = self.preprocess(&items).await;
        let mut state = SessionState::new(items, texts);
        observer.progress(0, state.total);
        info!(entries = state.total, budget = state.search_meta.budget_total, "translation batch started");

        let mut rounds = 0usize;
        let termination = loop {
            if cancel.is_cancelled() {
                break Termination::Cancelled;
            }
            if rounds >= self.config.max_iterations {
                warn!(rounds, queued = state.queue.len(), "iteration limit reached");
                break Termination::Exhausted;
            }
            rounds += 1;
            counter!("agent_rounds_total", 1u64);
            observer.status(&format!("round {}: {} queued", rounds, state.queue.len()));

            let req = ChatRequest {
                system: prompt::system_prompt(&self.config),
                user: prompt::snapshot(&state),
                tools: tools::definitions(),
            };
            let t0 = Instant::now();
            let response = match self.model.complete(&req).await {
                Ok(r) => r,
                Err(e) => {
                    error!(error = %e, round = rounds, "model call failed");
                    break Termination::Error(e.to_string());
                }
            };
            histogram!("agent_model_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);

            if response.tool_calls.is_empty() {
                warn!(round = rounds, "model replied without a tool call");
                state.last_error = Some(LastError {
                    tool: "(none)".to_string(),
                    args: String::new(),
                    error: "reply contained no tool call; every reply must call search, apply_translations or skip".to_string(),
                    model_response_preview: response.content.as_deref().map(|c| preview(c, self.config.preview_chars * 2)),
                });
                continue;
            }

            self.dispatch_all(&mut state, &response, observer).await;
            if state.is_done() {
                break Termination::Success;
            }
        };

        let outcome = BatchOutcome {
            termination,
            completed: state.completed,
            translated: state.translated,
            skipped: state.skipped,
            total: state.total,
            rounds,
            learned: state
                .search_cache
                .iter()
                .filter(|(_, r)| r.status == SearchStatus::Ok)
                .map(|(term, r)| LearnedTerm { term: term.clone(), candidates: r.candidates.clone() })
                .collect(),
        };
        histogram!("agent_batch_ms", started.elapsed().as_secs_f64() * 1000.0);
        match outcome.error() {
            None => info!(rounds, translated = outcome.translated, skipped = outcome.skipped, "translation batch finished"),
            Some(reason) => warn!(rounds, completed = outcome.completed, total = outcome.total, reason = %reason, "translation batch stopped"),
        }
        observer.status(&match outcome.error() {
            None => format!("done: {} translated, {} skipped", outcome.translated, outcome.skipped),
            Some(reason) => format!("stopped ({}): {}/{} done", reason, outcome.completed, outcome.total),
        });
        outcome
    }

    /// Annotate every source text concurrently; failures fall back to the raw text.
    async fn preprocess(&self, items: &[WorkItem]) -> Vec<String> {
        let Some(annotator) = self.annotator.as_ref() else {
            return items.iter().map(|i| i.original_text.clone()).collect();
        };
        let results = join_all(items.iter().map(|i| annotator.annotate(&i.original_text))).await;
        results
            .into_iter()
            .zip(items)
            .map(|(r, item)| match r {
                Ok(text) => text,
                Err(e) => {
                    debug!(index = item.batch_index, error = %e, "annotation failed; using source text");
                    item.original_text.clone()
                }
            })
            .collect()
    }

    /// Run every call of one reply in order. The first failure lands in `last_error`.
    async fn dispatch_all(&self, state: &mut SessionState, response: &ModelResponse, observer: &mut dyn SessionObserver) {
        state.last_error = None;
        for call in &response.tool_calls {
            counter!("agent_tool_calls_total", 1u64, "tool" => tool_label(&call.name));
            match self.dispatch(state, call, observer).await {
                Ok(n) => debug!(tool = %call.name, rows = n, "tool call ok"),
                Err(e) => {
                    counter!("agent_tool_errors_total", 1u64, "tool" => tool_label(&call.name));
                    warn!(tool = %call.name, error = %e, "tool call rejected");
                    if state.last_error.is_none() {
                        state.last_error = Some(LastError {
                            tool: call.name.clone(),
                            args: call.arguments.clone(),
                            error: e.to_string(),
                            model_response_preview: response.content.as_deref().map(|c| preview(c, self.config.preview_chars * 2)),
                        });
                    }
                }
            }
        }
    }

    async fn dispatch(&self, state: &mut SessionState, call: &RawToolCall, observer: &mut dyn SessionObserver) -> Result<usize, ToolError> {
        match ToolCall::parse(&call.name, &call.arguments)? {
            ToolCall::Search(args) => exec::search(state, self.lookup.as_ref(), args).await,
            ToolCall::Apply(args) => exec::apply(state, args, observer),
            ToolCall::Skip(args) => exec::skip(state, args, observer),
        }
    }
}

fn tool_label(name: &str) -> &'static str {
    match name {
        tools::TOOL_SEARCH => tools::TOOL_SEARCH,
        tools::TOOL_APPLY => tools::TOOL_APPLY,
        tools::TOOL_SKIP => tools::TOOL_SKIP,
        _ => "unknown",
    }
}
