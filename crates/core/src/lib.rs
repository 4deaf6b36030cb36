//! Scrivener core types: string rows, row identity, and the collaborator seams
//! shared by the lookup, history and orchestrator crates.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

/// Durable identity of one translatable string inside a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub form_id: String,
    pub record_type: String,
    pub subrecord_type: String,
    pub index: u32,
}

impl RecordKey {
    /// `formId|recordType|subrecordType|index`, the id used by history and pending sets.
    pub fn record_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}|{}", self.form_id, self.record_type, self.subrecord_type, self.index)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationStatus {
    #[default]
    Untranslated,
    /// Loaded from (or written to) the translation store.
    Persisted,
    Manual,
    Ai,
}

impl TranslationStatus {
    /// Durable statuses need no save; anything else is a pending change.
    pub fn is_durable(self) -> bool {
        matches!(self, TranslationStatus::Untranslated | TranslationStatus::Persisted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TranslationStatus::Untranslated => "untranslated",
            TranslationStatus::Persisted => "persisted",
            TranslationStatus::Manual => "manual",
            TranslationStatus::Ai => "ai",
        }
    }
}

/// One editable row of a plugin session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringRecord {
    pub form_id: String,
    #[serde(default)]
    pub editor_id: Option<String>,
    pub record_type: String,
    pub subrecord_type: String,
    pub index: u32,
    pub original_text: String,
    pub translated_text: String,
    #[serde(default)]
    pub translation_status: TranslationStatus,
}

impl StringRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            form_id: self.form_id.clone(),
            record_type: self.record_type.clone(),
            subrecord_type: self.subrecord_type.clone(),
            index: self.index,
        }
    }

    pub fn record_id(&self) -> String {
        self.key().record_id()
    }

    /// True when `key` addresses this row.
    pub fn matches(&self, key: &RecordKey) -> bool {
        self.index == key.index
            && self.form_id == key.form_id
            && self.record_type == key.record_type
            && self.subrecord_type == key.subrecord_type
    }
}

/// One fragment handed to the orchestrator. Immutable for the lifetime of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub batch_index: usize,
    pub record_index: u32,
    pub form_id: String,
    pub record_type: String,
    pub subrecord_type: String,
    pub original_text: String,
}

impl WorkItem {
    pub fn from_record(batch_index: usize, rec: &StringRecord) -> Self {
        Self {
            batch_index,
            record_index: rec.index,
            form_id: rec.form_id.clone(),
            record_type: rec.record_type.clone(),
            subrecord_type: rec.subrecord_type.clone(),
            original_text: rec.original_text.clone(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            form_id: self.form_id.clone(),
            record_type: self.record_type.clone(),
            subrecord_type: self.subrecord_type.clone(),
            index: self.record_index,
        }
    }
}

/// Where a translated value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Ai,
    Manual,
}

impl Provenance {
    pub fn status(self) -> TranslationStatus {
        match self {
            Provenance::Ai => TranslationStatus::Ai,
            Provenance::Manual => TranslationStatus::Manual,
        }
    }
}

/// A committed translation for one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowUpdate {
    pub key: RecordKey,
    pub translated_text: String,
    pub provenance: Provenance,
    /// Filled by duplicate propagation rather than requested directly.
    pub expanded: bool,
}

/// A row the model decided needs no translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSkip {
    pub key: RecordKey,
    pub reason: Option<String>,
}

/// A source/target pair offered to the model as a terminology hint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub source: String,
    pub target: String,
}

impl Candidate {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self { source: source.into(), target: target.into() }
    }
}

/// Term lookups consumed by the `search` tool.
#[async_trait::async_trait]
pub trait TermLookup: Send + Sync {
    /// Exact, case-insensitive glossary match.
    async fn glossary(&self, term: &str) -> anyhow::Result<Vec<Candidate>>;

    /// Fuzzy match over previously persisted translations, at most `limit` results.
    async fn references(&self, term: &str, limit: usize) -> anyhow::Result<Vec<Candidate>>;
}

/// Marks known terms inline before a batch starts.
#[async_trait::async_trait]
pub trait TermAnnotator: Send + Sync {
    async fn annotate(&self, text: &str) -> anyhow::Result<String>;
}

/// Callbacks produced by a running batch.
pub trait SessionObserver: Send {
    /// Called once per successful apply with every applied and expanded row.
    fn rows_updated(&mut self, updates: &[RowUpdate]);

    fn rows_skipped(&mut self, _skips: &[RowSkip]) {}

    fn progress(&mut self, _completed: usize, _total: usize) {}

    /// Human-readable narration of what the batch is doing.
    fn status(&mut self, _message: &str) {}
}

/// Observer that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl SessionObserver for NullObserver {
    fn rows_updated(&mut self, _updates: &[RowUpdate]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(index: u32, text: &str) -> StringRecord {
        StringRecord {
            form_id: "0001A2B3".into(),
            editor_id: Some("IronSword".into()),
            record_type: "WEAP".into(),
            subrecord_type: "FULL".into(),
            index,
            original_text: text.into(),
            translated_text: text.into(),
            translation_status: TranslationStatus::Untranslated,
        }
    }

    #[test]
    fn record_id_joins_identity_with_pipes() {
        assert_eq!(rec(3, "Iron Sword").record_id(), "0001A2B3|WEAP|FULL|3");
    }

    #[test]
    fn work_item_keeps_record_identity() {
        let r = rec(7, "Iron Sword");
        let w = WorkItem::from_record(0, &r);
        assert_eq!(w.key(), r.key());
        assert!(r.matches(&w.key()));
    }

    #[test]
    fn durable_statuses() {
        assert!(TranslationStatus::Untranslated.is_durable());
        assert!(TranslationStatus::Persisted.is_durable());
        assert!(!TranslationStatus::Manual.is_durable());
        assert!(!TranslationStatus::Ai.is_durable());
    }

    #[test]
    fn missing_status_defaults_to_untranslated() {
        let raw = r#"{"form_id":"01","record_type":"BOOK","subrecord_type":"DESC","index":0,
                      "original_text":"a","translated_text":"a"}"#;
        let r: StringRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(r.translation_status, TranslationStatus::Untranslated);
        assert_eq!(r.editor_id, None);
    }
}
