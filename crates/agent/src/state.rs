//! Mutable state of one translation run. Owned exclusively by its driver.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use scrivener_core::{Candidate, WorkItem};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::warn;

use crate::budget::compute_budget;

pub const RECENT_INDICES: usize = 5;
pub const RECENT_PREVIEWS: usize = 3;

/// One entry awaiting disposition. `text` is the annotated source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Ok,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub status: SearchStatus,
    /// At most three, shortest target first.
    pub candidates: Vec<Candidate>,
}

impl SearchResult {
    pub fn not_found() -> Self {
        Self { status: SearchStatus::NotFound, candidates: Vec::new() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMeta {
    pub last_requested_terms: Vec<String>,
    pub executed_terms: Vec<String>,
    pub cache_hits: Vec<String>,
    pub deferred_terms: Vec<String>,
    pub budget_used: usize,
    pub budget_total: usize,
}

impl SearchMeta {
    pub fn remaining(&self) -> usize {
        self.budget_total.saturating_sub(self.budget_used)
    }
}

/// Indices and short previews of the latest apply or skip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentDisposition {
    pub indices: SmallVec<[usize; RECENT_INDICES]>,
    pub previews: SmallVec<[String; RECENT_PREVIEWS]>,
}

impl RecentDisposition {
    pub fn new(indices: impl IntoIterator<Item = usize>, previews: impl IntoIterator<Item = String>) -> Self {
        Self {
            indices: indices.into_iter().take(RECENT_INDICES).collect(),
            previews: previews.into_iter().take(RECENT_PREVIEWS).collect(),
        }
    }
}

/// The first failure of the latest round, shown to the model verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub tool: String,
    pub args: String,
    pub error: String,
    pub model_response_preview: Option<String>,
}

#[derive(Debug)]
pub struct SessionState {
    items: Vec<WorkItem>,
    by_index: FxHashMap<usize, usize>,
    pub queue: Vec<QueueEntry>,
    pub search_cache: BTreeMap<String, SearchResult>,
    pub search_meta: SearchMeta,
    pub completed: usize,
    pub translated: usize,
    pub skipped: usize,
    pub total: usize,
    pub recent_apply: Option<RecentDisposition>,
    pub recent_skip: Option<RecentDisposition>,
    pub last_error: Option<LastError>,
}

impl SessionState {
    /// `texts[i]` is the queue text for `items[i]`; missing texts fall back to the source.
    pub fn new(items: Vec<WorkItem>, texts: Vec<String>) -> Self {
        let mut by_index = FxHashMap::default();
        let mut kept = Vec::with_capacity(items.len());
        let mut queue = Vec::with_capacity(items.len());
        let mut texts = texts.into_iter();
        for item in items {
            let text = texts.next().unwrap_or_else(|| item.original_text.clone());
            if by_index.contains_key(&item.batch_index) {
                warn!(index = item.batch_index, "duplicate batch index ignored");
                continue;
            }
            by_index.insert(item.batch_index, kept.len());
            queue.push(QueueEntry { index: item.batch_index, text });
            kept.push(item);
        }
        let budget_total = compute_budget(queue.iter().map(|q| q.text.as_str()));
        Self {
            total: kept.len(),
            items: kept,
            by_index,
            queue,
            search_cache: BTreeMap::new(),
            search_meta: SearchMeta { budget_total, ..SearchMeta::default() },
            completed: 0,
            translated: 0,
            skipped: 0,
            recent_apply: None,
            recent_skip: None,
            last_error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn item(&self, index: usize) -> Option<&WorkItem> {
        self.by_index.get(&index).map(|&i| &self.items[i])
    }

    pub fn in_queue(&self, index: usize) -> bool {
        self.queue.iter().any(|q| q.index == index)
    }

    /// Remove `index` from the queue, returning its entry.
    pub(crate) fn take(&mut self, index: usize) -> Option<QueueEntry> {
        let pos = self.queue.iter().position(|q| q.index == index)?;
        Some(self.queue.remove(pos))
    }

    /// Fresh budget sized to the remaining queue.
    pub(crate) fn reset_search_meta(&mut self) {
        self.search_meta.deferred_terms.clear();
        self.search_meta.budget_used = 0;
        self.search_meta.budget_total = compute_budget(self.queue.iter().map(|q| q.text.as_str()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(batch_index: usize, text: &str) -> WorkItem {
        WorkItem {
            batch_index,
            record_index: 0,
            form_id: format!("{:08X}", batch_index),
            record_type: "WEAP".into(),
            subrecord_type: "FULL".into(),
            original_text: text.into(),
        }
    }

    #[test]
    fn queue_follows_items_and_budget_starts_full() {
        let s = SessionState::new(vec![item(3, "Sword"), item(7, "Shield")], vec!["Sword(剑)".into()]);
        assert_eq!(s.queue, vec![
            QueueEntry { index: 3, text: "Sword(剑)".into() },
            QueueEntry { index: 7, text: "Shield".into() },
        ]);
        assert_eq!(s.search_meta.budget_total, 8);
        assert_eq!(s.search_meta.remaining(), 8);
        assert_eq!(s.item(7).map(|i| i.original_text.as_str()), Some("Shield"));
        assert_eq!(s.total, 2);
    }

    #[test]
    fn duplicate_batch_index_is_dropped() {
        let s = SessionState::new(vec![item(1, "a"), item(1, "b")], Vec::new());
        assert_eq!(s.total, 1);
        assert_eq!(s.item(1).map(|i| i.original_text.as_str()), Some("a"));
    }

    #[test]
    fn recent_disposition_is_bounded() {
        let r = RecentDisposition::new(0..10, (0..10).map(|i| i.to_string()));
        assert_eq!(r.indices.len(), RECENT_INDICES);
        assert_eq!(r.previews.len(), RECENT_PREVIEWS);
    }
}
