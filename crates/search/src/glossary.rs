//! In-RAM glossary of known terms plus the inline annotator built from it.

#![forbid(unsafe_code)]

use regex::{Regex, RegexBuilder};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Where a glossary entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TermSource {
    Base,
    Ai,
    Manual,
}

impl TermSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TermSource::Base => "base",
            TermSource::Ai => "ai",
            TermSource::Manual => "manual",
        }
    }

    /// Unknown labels fall back to `Manual`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "base" => TermSource::Base,
            "ai" => TermSource::Ai,
            _ => TermSource::Manual,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    /// Lowercased source term.
    pub term: String,
    pub translation: String,
    pub source: TermSource,
}

/// Case-insensitive term table. The annotator regex is rebuilt on every mutation.
#[derive(Debug, Default)]
pub struct Glossary {
    entries: FxHashMap<String, GlossaryEntry>,
    matcher: Option<Regex>,
}

impl Glossary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = GlossaryEntry>) -> Self {
        let mut g = Self::new();
        for e in entries {
            let term = e.term.trim().to_lowercase();
            if term.is_empty() {
                continue;
            }
            g.entries.insert(term.clone(), GlossaryEntry { term, ..e });
        }
        g.rebuild_matcher();
        g
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn upsert(&mut self, term: &str, translation: &str, source: TermSource) {
        let key = term.trim().to_lowercase();
        if key.is_empty() {
            return;
        }
        self.entries.insert(
            key.clone(),
            GlossaryEntry { term: key, translation: translation.to_string(), source },
        );
        self.rebuild_matcher();
    }

    pub fn remove(&mut self, term: &str) -> bool {
        let removed = self.entries.remove(&term.trim().to_lowercase()).is_some();
        if removed {
            self.rebuild_matcher();
        }
        removed
    }

    /// Exact, case-insensitive lookup.
    pub fn get(&self, term: &str) -> Option<&GlossaryEntry> {
        self.entries.get(&term.trim().to_lowercase())
    }

    /// Lookup that also folds simple English plurals (`s`, `es`, `ies` -> `y`).
    pub fn get_folded(&self, term: &str) -> Option<&GlossaryEntry> {
        let lower = term.trim().to_lowercase();
        if let Some(e) = self.entries.get(&lower) {
            return Some(e);
        }
        if let Some(stem) = lower.strip_suffix("ies") {
            if !stem.is_empty() {
                if let Some(e) = self.entries.get(&format!("{}y", stem)) {
                    return Some(e);
                }
            }
        }
        if let Some(stem) = lower.strip_suffix("es") {
            if stem.chars().count() > 1 {
                if let Some(e) = self.entries.get(stem) {
                    return Some(e);
                }
            }
        }
        if let Some(stem) = lower.strip_suffix('s') {
            if stem.chars().count() > 1 {
                if let Some(e) = self.entries.get(stem) {
                    return Some(e);
                }
            }
        }
        None
    }

    /// Rewrite every known term in `text` as `Term(translation)`, keeping the original casing.
    /// Matches are leftmost, longest-term-first and never overlap.
    pub fn annotate(&self, text: &str) -> String {
        let Some(re) = self.matcher.as_ref() else { return text.to_string() };
        let mut out = String::with_capacity(text.len() + 16);
        let mut last = 0usize;
        for m in re.find_iter(text) {
            let Some(entry) = self.get_folded(m.as_str()) else { continue };
            out.push_str(&text[last..m.start()]);
            out.push_str(m.as_str());
            out.push('(');
            out.push_str(&entry.translation);
            out.push(')');
            last = m.end();
        }
        out.push_str(&text[last..]);
        out
    }

    fn rebuild_matcher(&mut self) {
        if self.entries.is_empty() {
            self.matcher = None;
            return;
        }
        let mut terms: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        // Longer terms first so alternation prefers them at the same start offset.
        terms.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then(a.cmp(b)));
        let alternation = terms.iter().map(|t| term_pattern(t)).collect::<Vec<_>>().join("|");
        match RegexBuilder::new(&alternation).case_insensitive(true).size_limit(64 << 20).build() {
            Ok(re) => {
                debug!(terms = terms.len(), "glossary matcher rebuilt");
                self.matcher = Some(re);
            }
            Err(e) => {
                warn!(error = %e, terms = terms.len(), "glossary matcher build failed; annotation disabled");
                self.matcher = None;
            }
        }
    }
}

fn term_pattern(term: &str) -> String {
    let starts_word = term.chars().next().map(|c| c.is_alphanumeric()).unwrap_or(false);
    let ends_word = term.chars().last().map(|c| c.is_alphanumeric()).unwrap_or(false);
    let body = match term.strip_suffix('y') {
        Some(stem) if !stem.is_empty() => format!("{}(?:ies|ys|y)", regex::escape(stem)),
        _ if ends_word => format!("{}(?:es|s)?", regex::escape(term)),
        _ => regex::escape(term),
    };
    format!(
        "{}{}{}",
        if starts_word { r"\b" } else { "" },
        body,
        if ends_word { r"\b" } else { "" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glossary(pairs: &[(&str, &str)]) -> Glossary {
        Glossary::from_entries(pairs.iter().map(|(t, tr)| GlossaryEntry {
            term: t.to_string(),
            translation: tr.to_string(),
            source: TermSource::Base,
        }))
    }

    #[test]
    fn annotates_terms_keeping_case() {
        let g = glossary(&[("savangard", "松加德"), ("argonian", "亚龙人")]);
        let out = g.annotate("The Argonian waits in Savangard.");
        assert_eq!(out, "The Argonian(亚龙人) waits in Savangard(松加德).");
    }

    #[test]
    fn annotates_plural_forms() {
        let g = glossary(&[("argonian", "亚龙人"), ("berry", "浆果"), ("box", "箱子")]);
        assert_eq!(g.annotate("Many argonians"), "Many argonians(亚龙人)");
        assert_eq!(g.annotate("two berries"), "two berries(浆果)");
        assert_eq!(g.annotate("boxes"), "boxes(箱子)");
    }

    #[test]
    fn annotates_plain_s_plural_of_y_terms() {
        let g = glossary(&[("key", "钥匙"), ("valley", "山谷")]);
        assert_eq!(g.annotate("two keys"), "two keys(钥匙)");
        assert_eq!(g.annotate("a key"), "a key(钥匙)");
        assert_eq!(g.annotate("Valleys of the north"), "Valleys(山谷) of the north");
        assert_eq!(g.annotate("keystone"), "keystone");
    }

    #[test]
    fn case_insensitive_matches() {
        let g = glossary(&[("skyrim", "天际")]);
        let out = g.annotate("Welcome to SKYRIM and Skyrim!");
        assert!(out.contains("SKYRIM(天际)"));
        assert!(out.contains("Skyrim(天际)"));
    }

    #[test]
    fn longest_term_wins_and_no_partial_words() {
        let g = glossary(&[("iron", "铁"), ("iron sword", "铁剑"), ("art", "艺术")]);
        assert_eq!(g.annotate("An Iron Sword"), "An Iron Sword(铁剑)");
        assert_eq!(g.annotate("part of the iron"), "part of the iron(铁)");
    }

    #[test]
    fn exact_lookup_ignores_case_but_not_plurals() {
        let g = glossary(&[("Sothis", "索希斯")]);
        assert_eq!(g.get("SOTHIS").map(|e| e.translation.as_str()), Some("索希斯"));
        assert!(g.get("sothises").is_none());
        assert!(g.get_folded("sothises").is_some());
    }

    #[test]
    fn remove_rebuilds_matcher() {
        let mut g = glossary(&[("skyrim", "天际")]);
        assert!(g.remove("Skyrim"));
        assert!(g.is_empty());
        assert_eq!(g.annotate("Skyrim"), "Skyrim");
        assert!(!g.remove("skyrim"));
    }
}
