//! Tool executors. Each one validates its whole input before touching state.

#![forbid(unsafe_code)]

use futures::future::try_join_all;
use metrics::counter;
use rustc_hash::FxHashSet;
use scrivener_core::{Candidate, Provenance, RowSkip, RowUpdate, SessionObserver, TermLookup};
use tracing::{debug, warn};

use crate::config::preview;
use crate::dedup::duplicates_of;
use crate::error::ToolError;
use crate::state::{RecentDisposition, SearchResult, SearchStatus, SessionState};
use crate::tools::{ApplyArgs, SearchArgs, SkipArgs, TOOL_APPLY, TOOL_SKIP};

/// Reference candidates requested per term.
pub const REFERENCE_LIMIT: usize = 5;
/// Candidates kept per term after merging.
pub const MAX_CANDIDATES: usize = 3;

const PREVIEW_CHARS: usize = 40;

/// Resolve search terms against the cache and the lookup collaborators, within budget.
/// Returns the number of terms actually queried.
pub async fn search(state: &mut SessionState, lookup: &dyn TermLookup, args: SearchArgs) -> Result<usize, ToolError> {
    let mut seen = FxHashSet::default();
    let terms: Vec<String> = args
        .terms
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect();
    if terms.is_empty() {
        return Err(ToolError::EmptySearch);
    }

    let (cache_hits, missing): (Vec<String>, Vec<String>) = terms.iter().cloned().partition(|t| {
        state.search_cache.get(t).map(|r| r.status == SearchStatus::Ok).unwrap_or(false)
    });
    let remaining = state.search_meta.remaining();
    if !missing.is_empty() && remaining == 0 {
        return Err(ToolError::BudgetExhausted { used: state.search_meta.budget_used, total: state.search_meta.budget_total });
    }
    let split = missing.len().min(remaining);
    let to_query = missing[..split].to_vec();
    let deferred = missing[split..].to_vec();

    let results = match try_join_all(to_query.iter().map(|t| resolve(lookup, t))).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, terms = to_query.len(), "term lookup failed; marking request not_found");
            counter!("agent_lookup_errors_total", 1u64);
            vec![SearchResult::not_found(); to_query.len()]
        }
    };
    for (term, result) in to_query.iter().zip(results) {
        state.search_cache.insert(term.clone(), result);
    }

    let meta = &mut state.search_meta;
    meta.budget_used = (meta.budget_used + to_query.len()).min(meta.budget_total);
    meta.last_requested_terms = terms;
    meta.executed_terms = to_query;
    meta.cache_hits = cache_hits;
    meta.deferred_terms = deferred;
    debug!(
        executed = meta.executed_terms.len(),
        hits = meta.cache_hits.len(),
        deferred = meta.deferred_terms.len(),
        used = meta.budget_used,
        total = meta.budget_total,
        "search"
    );
    Ok(meta.executed_terms.len())
}

async fn resolve(lookup: &dyn TermLookup, term: &str) -> anyhow::Result<SearchResult> {
    let (glossary, references) = futures::try_join!(lookup.glossary(term), lookup.references(term, REFERENCE_LIMIT))?;
    let candidates = merge_candidates(glossary, references.into_iter().take(REFERENCE_LIMIT).collect());
    if candidates.is_empty() {
        return Ok(SearchResult::not_found());
    }
    Ok(SearchResult { status: SearchStatus::Ok, candidates })
}

/// Glossary first so it wins target collisions; stable sort keeps that order among equal lengths.
fn merge_candidates(glossary: Vec<Candidate>, references: Vec<Candidate>) -> Vec<Candidate> {
    let mut targets = FxHashSet::default();
    let mut merged: Vec<Candidate> = glossary
        .into_iter()
        .chain(references)
        .filter(|c| !c.target.trim().is_empty())
        .filter(|c| targets.insert(c.target.clone()))
        .collect();
    merged.sort_by_key(|c| c.target.chars().count());
    merged.truncate(MAX_CANDIDATES);
    merged
}

/// Commit translations, propagating each to queued duplicates. Returns rows written.
pub fn apply(state: &mut SessionState, args: ApplyArgs, observer: &mut dyn SessionObserver) -> Result<usize, ToolError> {
    let indices: Vec<usize> = args.translations.iter().map(|t| t.index).collect();
    validate_indices(state, TOOL_APPLY, &indices)?;
    let blank: Vec<usize> = args.translations.iter().filter(|t| t.translated.trim().is_empty()).map(|t| t.index).collect();
    if !blank.is_empty() {
        return Err(ToolError::BlankTranslations(blank));
    }

    let mut applied: Vec<(usize, String)> = Vec::with_capacity(args.translations.len());
    for t in args.translations {
        state.take(t.index);
        applied.push((t.index, t.translated));
    }
    let mut expanded: Vec<(usize, String)> = Vec::new();
    for (index, text) in &applied {
        for dup in duplicates_of(state, *index) {
            state.take(dup);
            expanded.push((dup, text.clone()));
        }
    }

    let mut updates = Vec::with_capacity(applied.len() + expanded.len());
    let mut previews = Vec::new();
    for (flag, (index, text)) in applied.iter().map(|e| (false, e)).chain(expanded.iter().map(|e| (true, e))) {
        let Some(item) = state.item(*index) else { continue };
        if previews.len() < crate::state::RECENT_PREVIEWS {
            previews.push(format!("#{} {} => {}", index, preview(&item.original_text, PREVIEW_CHARS), preview(text, PREVIEW_CHARS)));
        }
        updates.push(RowUpdate { key: item.key(), translated_text: text.clone(), provenance: Provenance::Ai, expanded: flag });
    }
    observer.rows_updated(&updates);

    let n = updates.len();
    state.completed += n;
    state.translated += n;
    state.recent_apply = Some(RecentDisposition::new(applied.iter().chain(expanded.iter()).map(|(i, _)| *i), previews));
    state.reset_search_meta();
    counter!("agent_rows_translated_total", n as u64);
    if !expanded.is_empty() {
        counter!("agent_rows_expanded_total", expanded.len() as u64);
    }
    debug!(applied = applied.len(), expanded = expanded.len(), queue = state.queue.len(), "apply");
    observer.progress(state.completed, state.total);
    Ok(n)
}

/// Drop entries that need no translation. Returns rows skipped.
pub fn skip(state: &mut SessionState, args: SkipArgs, observer: &mut dyn SessionObserver) -> Result<usize, ToolError> {
    let indices: Vec<usize> = args.entries.iter().map(|e| e.index).collect();
    validate_indices(state, TOOL_SKIP, &indices)?;

    let mut skips = Vec::with_capacity(args.entries.len());
    let mut previews = Vec::new();
    for e in args.entries {
        let Some(entry) = state.take(e.index) else { continue };
        if previews.len() < crate::state::RECENT_PREVIEWS {
            let why = e.reason.as_deref().unwrap_or("no reason");
            previews.push(format!("#{} {} ({})", e.index, preview(&entry.text, PREVIEW_CHARS), why));
        }
        if let Some(item) = state.item(e.index) {
            skips.push(RowSkip { key: item.key(), reason: e.reason });
        }
    }
    observer.rows_skipped(&skips);

    let n = indices.len();
    state.completed += n;
    state.skipped += n;
    state.recent_skip = Some(RecentDisposition::new(indices, previews));
    counter!("agent_rows_skipped_total", n as u64);
    debug!(skipped = n, queue = state.queue.len(), "skip");
    observer.progress(state.completed, state.total);
    Ok(n)
}

fn validate_indices(state: &SessionState, tool: &'static str, indices: &[usize]) -> Result<(), ToolError> {
    if indices.is_empty() {
        return Err(ToolError::EmptyBatch(tool));
    }
    let invalid: Vec<usize> = indices.iter().copied().filter(|&i| !state.in_queue(i)).collect();
    if !invalid.is_empty() {
        return Err(ToolError::InvalidIndices(invalid));
    }
    let mut seen = FxHashSet::default();
    let mut dups: Vec<usize> = indices.iter().copied().filter(|&i| !seen.insert(i)).collect();
    dups.dedup();
    if !dups.is_empty() {
        return Err(ToolError::DuplicateIndices(dups));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{SkipEntry, TranslationArg};
    use scrivener_core::{NullObserver, WorkItem};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn item(batch_index: usize, text: &str) -> WorkItem {
        WorkItem {
            batch_index,
            record_index: batch_index as u32,
            form_id: format!("{:08X}", 0xA000 + batch_index),
            record_type: "WEAP".into(),
            subrecord_type: "FULL".into(),
            original_text: text.into(),
        }
    }

    fn state(texts: &[(usize, &str)]) -> SessionState {
        SessionState::new(texts.iter().map(|(i, t)| item(*i, t)).collect(), Vec::new())
    }

    #[derive(Default)]
    struct Recorder {
        updates: Vec<RowUpdate>,
        skips: Vec<RowSkip>,
        progress: Vec<(usize, usize)>,
    }

    impl SessionObserver for Recorder {
        fn rows_updated(&mut self, updates: &[RowUpdate]) {
            self.updates.extend_from_slice(updates);
        }
        fn rows_skipped(&mut self, skips: &[RowSkip]) {
            self.skips.extend_from_slice(skips);
        }
        fn progress(&mut self, completed: usize, total: usize) {
            self.progress.push((completed, total));
        }
    }

    struct FakeLookup {
        glossary: Vec<(&'static str, Candidate)>,
        references: Vec<(&'static str, Candidate)>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeLookup {
        fn new() -> Self {
            Self { glossary: Vec::new(), references: Vec::new(), fail: false, calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait::async_trait]
    impl TermLookup for FakeLookup {
        async fn glossary(&self, term: &str) -> anyhow::Result<Vec<Candidate>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("glossary offline");
            }
            let lower = term.to_lowercase();
            Ok(self.glossary.iter().filter(|(k, _)| *k == lower).map(|(_, c)| c.clone()).collect())
        }
        async fn references(&self, term: &str, limit: usize) -> anyhow::Result<Vec<Candidate>> {
            let lower = term.to_lowercase();
            Ok(self.references.iter().filter(|(k, _)| *k == lower).take(limit).map(|(_, c)| c.clone()).collect())
        }
    }

    fn apply_args(pairs: &[(usize, &str)]) -> ApplyArgs {
        ApplyArgs { translations: pairs.iter().map(|(i, t)| TranslationArg { index: *i, translated: t.to_string() }).collect() }
    }

    #[test]
    fn apply_propagates_to_identical_sources() {
        let mut s = state(&[(1, "Sword"), (2, "Sword")]);
        let mut rec = Recorder::default();
        let n = apply(&mut s, apply_args(&[(1, "剑")]), &mut rec).unwrap();
        assert_eq!(n, 2);
        assert!(s.queue.is_empty());
        assert_eq!(s.completed, 2);
        assert_eq!(rec.updates.len(), 2);
        assert!(rec.updates.iter().all(|u| u.translated_text == "剑" && u.provenance == Provenance::Ai));
        assert_eq!(rec.updates.iter().filter(|u| u.expanded).count(), 1);
        assert_eq!(rec.updates[1].key.form_id, "0000A002");
        assert_eq!(s.recent_apply.as_ref().unwrap().indices.as_slice(), &[1, 2]);
    }

    #[test]
    fn apply_is_all_or_nothing() {
        let mut s = state(&[(0, "Sword"), (1, "Shield")]);
        let mut rec = Recorder::default();
        let err = apply(&mut s, apply_args(&[(0, "剑"), (5, "x"), (9, "y")]), &mut rec).unwrap_err();
        assert_eq!(err, ToolError::InvalidIndices(vec![5, 9]));
        assert_eq!(s.queue.len(), 2);
        assert!(rec.updates.is_empty());
        assert_eq!(s.completed, 0);

        assert_eq!(apply(&mut s, apply_args(&[]), &mut rec), Err(ToolError::EmptyBatch(TOOL_APPLY)));
        assert_eq!(apply(&mut s, apply_args(&[(0, "剑"), (0, "刀")]), &mut rec), Err(ToolError::DuplicateIndices(vec![0])));
        assert_eq!(apply(&mut s, apply_args(&[(0, " ")]), &mut rec), Err(ToolError::BlankTranslations(vec![0])));
        assert_eq!(s.queue.len(), 2);
    }

    #[test]
    fn apply_resets_budget_to_remaining_queue() {
        let mut s = state(&[(0, "Sword"), (1, "Shield")]);
        s.search_meta.budget_used = 8;
        s.search_meta.deferred_terms = vec!["Sothis".into()];
        apply(&mut s, apply_args(&[(0, "剑")]), &mut NullObserver).unwrap();
        assert_eq!(s.search_meta.budget_used, 0);
        assert_eq!(s.search_meta.budget_total, 8);
        assert!(s.search_meta.deferred_terms.is_empty());
    }

    #[test]
    fn skip_removes_without_writing() {
        let mut s = state(&[(0, "100"), (1, "Sword"), (2, "100")]);
        let mut rec = Recorder::default();
        let args = SkipArgs { entries: vec![SkipEntry { index: 0, reason: Some("numeral".into()) }] };
        assert_eq!(skip(&mut s, args, &mut rec).unwrap(), 1);
        assert!(rec.updates.is_empty());
        assert_eq!(rec.skips.len(), 1);
        assert_eq!(rec.skips[0].reason.as_deref(), Some("numeral"));
        // Skips do not propagate to duplicates.
        assert!(s.in_queue(2));
        assert_eq!((s.completed, s.skipped), (1, 1));
        assert_eq!(rec.progress, vec![(1, 3)]);

        let bad = SkipArgs { entries: vec![SkipEntry { index: 1, reason: None }, SkipEntry { index: 0, reason: None }] };
        assert_eq!(skip(&mut s, bad, &mut rec), Err(ToolError::InvalidIndices(vec![0])));
        assert!(s.in_queue(1));
    }

    #[tokio::test]
    async fn search_merges_and_ranks_candidates() {
        let mut lookup = FakeLookup::new();
        lookup.glossary.push(("sothis", Candidate::new("sothis", "索希斯")));
        lookup.references.push(("sothis", Candidate::new("Sothis", "索希斯")));
        lookup.references.push(("sothis", Candidate::new("Sothis Ring", "索希斯之戒")));
        lookup.references.push(("sothis", Candidate::new("Sothis's Hammer", "索希斯之锤")));
        lookup.references.push(("sothis", Candidate::new("Sothis Temple", "索希斯圣殿神庙")));
        lookup.references.push(("sothis", Candidate::new("Sir Sothis", "索")));
        let mut s = state(&[(0, "Sothis Ring")]);

        let n = search(&mut s, &lookup, SearchArgs { terms: vec![" Sothis ".into(), "Sothis".into(), "".into(), "Qzx".into()] }).await.unwrap();
        assert_eq!(n, 2);
        let hit = &s.search_cache["Sothis"];
        assert_eq!(hit.status, SearchStatus::Ok);
        let targets: Vec<&str> = hit.candidates.iter().map(|c| c.target.as_str()).collect();
        assert_eq!(targets, vec!["索", "索希斯", "索希斯之戒"]);
        assert_eq!(hit.candidates[1].source, "sothis");
        assert_eq!(s.search_cache["Qzx"].status, SearchStatus::NotFound);
        assert_eq!(s.search_meta.budget_used, 2);
        assert_eq!(s.search_meta.last_requested_terms, vec!["Sothis", "Qzx"]);

        // Cached ok terms cost nothing; not_found terms are queried again.
        search(&mut s, &lookup, SearchArgs { terms: vec!["Sothis".into(), "Qzx".into()] }).await.unwrap();
        assert_eq!(s.search_meta.cache_hits, vec!["Sothis"]);
        assert_eq!(s.search_meta.executed_terms, vec!["Qzx"]);
        assert_eq!(s.search_meta.budget_used, 3);
    }

    #[tokio::test]
    async fn search_with_no_budget_left_fails_without_mutation() {
        let lookup = FakeLookup::new();
        let mut s = state(&[(0, "Sothis")]);
        s.search_meta.budget_used = s.search_meta.budget_total;
        let err = search(&mut s, &lookup, SearchArgs { terms: vec!["Sothis".into()] }).await.unwrap_err();
        assert_eq!(err, ToolError::BudgetExhausted { used: 8, total: 8 });
        assert!(s.search_cache.is_empty());
        assert_eq!(s.search_meta.budget_used, 8);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn search_defers_beyond_remaining_budget() {
        let lookup = FakeLookup::new();
        let mut s = state(&[(0, "Sword")]);
        s.search_meta.budget_used = 6;
        let terms: Vec<String> = ["a", "b", "c", "d"].iter().map(|t| t.to_string()).collect();
        assert_eq!(search(&mut s, &lookup, SearchArgs { terms }).await.unwrap(), 2);
        assert_eq!(s.search_meta.deferred_terms, vec!["c", "d"]);
        assert!(!s.search_cache.contains_key("c"));
        assert_eq!(s.search_meta.budget_used, s.search_meta.budget_total);
        assert!(matches!(
            search(&mut s, &lookup, SearchArgs { terms: vec!["  ".into()] }).await,
            Err(ToolError::EmptySearch)
        ));
    }

    #[tokio::test]
    async fn lookup_failure_marks_terms_not_found() {
        let mut lookup = FakeLookup::new();
        lookup.fail = true;
        let mut s = state(&[(0, "Sword")]);
        let n = search(&mut s, &lookup, SearchArgs { terms: vec!["Sword".into(), "Shield".into()] }).await.unwrap();
        assert_eq!(n, 2);
        assert!(s.search_cache.values().all(|r| r.status == SearchStatus::NotFound));
        assert_eq!(s.search_meta.budget_used, 2);
    }
}
