//! Scrivener search: in-RAM glossary and a fuzzy index over previously persisted
//! translations. Together they back the `search` tool and the term pre-processor.

#![forbid(unsafe_code)]

pub mod glossary;

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use rustc_hash::FxHashSet;
use scrivener_core::{Candidate, TermAnnotator, TermLookup};
use tracing::debug;

pub use glossary::{Glossary, GlossaryEntry, TermSource};

/// Upper bound for reference candidates per term.
pub const MAX_REFERENCE_CANDIDATES: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceOpts {
    /// Drop hits scoring below this value.
    pub min_score: Option<i64>,
    /// Ignore sources longer than this many chars (long dialogue is a poor term reference).
    pub max_source_chars: Option<usize>,
}

#[derive(Debug, Clone)]
struct RefDoc {
    source: String,
    target: String,
    source_lower: String,
    source_chars: usize,
}

/// Fuzzy index over `(source, target)` pairs.
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    docs: Vec<RefDoc>,
    opts: ReferenceOpts,
}

#[derive(Debug, Clone, Copy)]
struct Scored {
    doc: usize,
    exact: bool,
    score: i64,
}

impl ReferenceIndex {
    pub fn build(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self::build_with_opts(pairs, ReferenceOpts { min_score: None, max_source_chars: Some(120) })
    }

    pub fn build_with_opts(pairs: impl IntoIterator<Item = (String, String)>, opts: ReferenceOpts) -> Self {
        let mut seen: FxHashSet<(String, String)> = FxHashSet::default();
        let mut docs = Vec::new();
        for (source, target) in pairs {
            let source = source.trim().to_string();
            let target = target.trim().to_string();
            if source.is_empty() || target.is_empty() || source == target {
                continue;
            }
            if !seen.insert((source.clone(), target.clone())) {
                continue;
            }
            let source_chars = source.chars().count();
            if opts.max_source_chars.map(|cap| source_chars > cap).unwrap_or(false) {
                continue;
            }
            docs.push(RefDoc { source_lower: source.to_lowercase(), source, target, source_chars });
        }
        metrics::gauge!("reference_docs", docs.len() as f64);
        Self { docs, opts }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Best `limit` (capped at [`MAX_REFERENCE_CANDIDATES`]) references for `term`.
    /// Exact case-insensitive source matches rank first, then fuzzy score, then shorter sources.
    pub fn lookup(&self, term: &str, limit: usize) -> Vec<Candidate> {
        let started = std::time::Instant::now();
        let limit = limit.min(MAX_REFERENCE_CANDIDATES);
        let needle = term.trim();
        if needle.is_empty() || limit == 0 {
            return Vec::new();
        }
        let needle_lower = needle.to_lowercase();
        let matcher = SkimMatcherV2::default();
        let mut scored: Vec<Scored> = Vec::new();
        for (i, d) in self.docs.iter().enumerate() {
            let exact = d.source_lower == needle_lower;
            let score = if exact {
                i64::MAX
            } else {
                match matcher.fuzzy_match(&d.source, needle) {
                    Some(s) => s,
                    None => continue,
                }
            };
            if !exact && self.opts.min_score.map(|m| score < m).unwrap_or(false) {
                continue;
            }
            scored.push(Scored { doc: i, exact, score });
        }
        scored.sort_by(|a, b| {
            b.exact
                .cmp(&a.exact)
                .then(b.score.cmp(&a.score))
                .then(self.docs[a.doc].source_chars.cmp(&self.docs[b.doc].source_chars))
                .then_with(|| self.docs[a.doc].source.cmp(&self.docs[b.doc].source))
        });
        let mut out: Vec<Candidate> = Vec::with_capacity(limit);
        let mut targets: FxHashSet<&str> = FxHashSet::default();
        for s in scored {
            let d = &self.docs[s.doc];
            if !targets.insert(d.target.as_str()) {
                continue;
            }
            out.push(Candidate::new(d.source.clone(), d.target.clone()));
            if out.len() >= limit {
                break;
            }
        }
        metrics::histogram!("reference_lookup_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(term = %needle, hits = out.len(), "reference lookup");
        out
    }
}

/// In-process lookup and annotation backed by a [`Glossary`] and a [`ReferenceIndex`].
#[derive(Debug, Default)]
pub struct LocalLookup {
    glossary: Glossary,
    references: ReferenceIndex,
}

impl LocalLookup {
    pub fn new(glossary: Glossary, references: ReferenceIndex) -> Self {
        Self { glossary, references }
    }
}

#[async_trait::async_trait]
impl TermLookup for LocalLookup {
    async fn glossary(&self, term: &str) -> anyhow::Result<Vec<Candidate>> {
        Ok(self
            .glossary
            .get(term)
            .map(|e| vec![Candidate::new(e.term.clone(), e.translation.clone())])
            .unwrap_or_default())
    }

    async fn references(&self, term: &str, limit: usize) -> anyhow::Result<Vec<Candidate>> {
        Ok(self.references.lookup(term, limit))
    }
}

#[async_trait::async_trait]
impl TermAnnotator for LocalLookup {
    async fn annotate(&self, text: &str) -> anyhow::Result<String> {
        Ok(self.glossary.annotate(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(s, t)| (s.to_string(), t.to_string())).collect()
    }

    #[test]
    fn exact_match_ranks_first() {
        let idx = ReferenceIndex::build(pairs(&[
            ("Iron Sword of Sothis", "索希斯铁剑"),
            ("Sothis", "索希斯"),
            ("Sothis Ring", "索希斯之戒"),
        ]));
        let hits = idx.lookup("sothis", 5);
        assert_eq!(hits[0].target, "索希斯");
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn limit_is_bounded() {
        let items: Vec<(String, String)> =
            (0..20).map(|i| (format!("Dragon {}", i), format!("龙{}", i))).collect();
        let idx = ReferenceIndex::build(items);
        assert_eq!(idx.lookup("dragon", 50).len(), MAX_REFERENCE_CANDIDATES);
        assert_eq!(idx.lookup("dragon", 2).len(), 2);
    }

    #[test]
    fn untranslated_and_duplicate_pairs_are_dropped() {
        let idx = ReferenceIndex::build(pairs(&[
            ("Whiterun", "Whiterun"),
            ("Whiterun", "雪漫城"),
            ("Whiterun", "雪漫城"),
            ("", "空"),
        ]));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn no_match_yields_empty() {
        let idx = ReferenceIndex::build(pairs(&[("Whiterun", "雪漫城")]));
        assert!(idx.lookup("qqq", 5).is_empty());
        assert!(idx.lookup("   ", 5).is_empty());
    }

    #[tokio::test]
    async fn local_lookup_serves_both_sources() {
        let mut g = Glossary::new();
        g.upsert("Whiterun", "雪漫城", TermSource::Base);
        let lookup = LocalLookup::new(g, ReferenceIndex::build(pairs(&[("Whiterun Guard", "雪漫城守卫")])));
        let gl = lookup.glossary("WHITERUN").await.unwrap();
        assert_eq!(gl, vec![Candidate::new("whiterun", "雪漫城")]);
        let refs = lookup.references("whiterun", 5).await.unwrap();
        assert_eq!(refs[0].target, "雪漫城守卫");
        let text = lookup.annotate("Go to Whiterun.").await.unwrap();
        assert_eq!(text, "Go to Whiterun(雪漫城).");
    }
}
