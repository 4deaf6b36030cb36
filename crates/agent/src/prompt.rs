//! Prompt rendering. Every round sends a fresh system prompt plus a snapshot of the state.

#![forbid(unsafe_code)]

use std::fmt::Write as _;

use crate::config::AgentConfig;
use crate::state::{RecentDisposition, SessionState};

pub fn system_prompt(cfg: &AgentConfig) -> String {
    format!(
        "You translate text fragments from a game mod into {lang}.\n\
         Every reply must call at least one tool; plain text replies are rejected.\n\
         \n\
         Tools:\n\
         - search(terms): look up proper nouns and recurring terms. Terms not already cached cost one unit of the search budget; \
         results stay in the cache for the whole run. When the budget is spent, translate with what you have.\n\
         - apply_translations(translations): commit translations by queue index. If any index is not in the queue the whole call \
         is rejected. Entries with identical source text are filled automatically.\n\
         - skip(entries): drop entries that need no translation (numbers, symbols, text already in {lang}).\n\
         \n\
         Rules:\n\
         - Terms annotated inline as Term(译) carry the established translation; use it and do not copy the annotation.\n\
         - Keep placeholders, tags, numbers and line breaks exactly as in the source.\n\
         - Prefer glossary and earlier translations from the search cache over new renderings.\n\
         - If the last call failed, read the error and correct the call.\n\
         - The run ends when the queue is empty.",
        lang = cfg.target_language
    )
}

/// Advisory snapshot of the run for the next model call.
pub fn snapshot(state: &SessionState) -> String {
    let mut out = String::with_capacity(256 + state.queue.len() * 48);
    let meta = &state.search_meta;
    let _ = writeln!(out, "## Progress\n{}/{} done ({} translated, {} skipped), {} queued", state.completed, state.total, state.translated, state.skipped, state.queue.len());
    let _ = writeln!(out, "\n## Search budget\n{}/{} used, {} remaining", meta.budget_used, meta.budget_total, meta.remaining());
    if !meta.last_requested_terms.is_empty() {
        let _ = writeln!(
            out,
            "last request: {}; executed: {}; cache hits: {}; deferred: {}",
            list(&meta.last_requested_terms),
            list(&meta.executed_terms),
            list(&meta.cache_hits),
            list(&meta.deferred_terms)
        );
    }

    let _ = writeln!(out, "\n## Queue\n| index | text |\n|---|---|");
    for q in &state.queue {
        let _ = writeln!(out, "| {} | {} |", q.index, escape_cell(&q.text));
    }

    let _ = writeln!(out, "\n## Search cache");
    if state.search_cache.is_empty() {
        let _ = writeln!(out, "(empty)");
    } else {
        let cache = serde_json::to_string_pretty(&state.search_cache).unwrap_or_else(|_| "{}".to_string());
        let _ = writeln!(out, "```json\n{}\n```", cache);
    }

    if let Some(r) = &state.recent_apply {
        recent(&mut out, "Recently applied", r);
    }
    if let Some(r) = &state.recent_skip {
        recent(&mut out, "Recently skipped", r);
    }
    if let Some(e) = &state.last_error {
        let _ = writeln!(out, "\n## Last error\ntool: {}\narguments: {}\nerror: {}", e.tool, e.args, e.error);
        if let Some(p) = &e.model_response_preview {
            let _ = writeln!(out, "your reply: {}", p);
        }
    }
    out
}

fn recent(out: &mut String, title: &str, r: &RecentDisposition) {
    let idx: Vec<String> = r.indices.iter().map(|i| i.to_string()).collect();
    let _ = writeln!(out, "\n## {}\nindices: {}", title, idx.join(", "));
    for p in &r.previews {
        let _ = writeln!(out, "- {}", p);
    }
}

fn list(v: &[String]) -> String {
    if v.is_empty() {
        return "-".to_string();
    }
    v.join(", ")
}

fn escape_cell(s: &str) -> String {
    s.replace('\\', "\\\\").replace('|', "\\|").replace('\r', "").replace('\n', "\\n")
}
