//! Scrivener store: editable rows per session, with reversible edits.
//!
//! Every mutation (manual edit or AI apply) commits a [`HistoryCommand`] holding full
//! row snapshots and marks the rows pending; `undo` restores the before-snapshots and
//! re-derives pending membership from them.

#![forbid(unsafe_code)]

pub mod history;

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use scrivener_core::{RecordKey, RowSkip, RowUpdate, SessionObserver, StringRecord, TranslationStatus};
use tracing::{debug, info, warn};

pub use history::{CommandKind, HistoryCommand, HistoryRecord, HistoryStore, PendingChanges};

/// Default number of undoable commands retained per session.
pub const DEFAULT_HISTORY_CAP: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("session already open: {0}")]
    SessionExists(String),
    #[error("unknown record(s): {}", .0.join(", "))]
    UnknownRecords(Vec<String>),
}

#[derive(Debug, Default)]
struct Session {
    rows: Vec<StringRecord>,
    by_id: FxHashMap<String, usize>,
}

impl Session {
    fn new(rows: Vec<StringRecord>) -> Self {
        let by_id = rows.iter().enumerate().map(|(i, r)| (r.record_id(), i)).collect();
        Self { rows, by_id }
    }

    fn position(&self, key: &RecordKey) -> Option<usize> {
        self.by_id.get(&key.record_id()).copied()
    }
}

/// Owns every open session's rows, undo history and pending set.
#[derive(Debug)]
pub struct EditorStore {
    sessions: FxHashMap<String, Session>,
    history: HistoryStore,
    pending: PendingChanges,
}

impl Default for EditorStore {
    fn default() -> Self {
        Self::with_history_cap(DEFAULT_HISTORY_CAP)
    }
}

impl EditorStore {
    pub fn with_history_cap(cap: usize) -> Self {
        Self { sessions: FxHashMap::default(), history: HistoryStore::with_capacity(cap), pending: PendingChanges::default() }
    }

    /// Cap from `SCRIV_HISTORY_CAP`, falling back to [`DEFAULT_HISTORY_CAP`].
    pub fn from_env() -> Self {
        let cap = std::env::var("SCRIV_HISTORY_CAP")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_HISTORY_CAP);
        Self::with_history_cap(cap)
    }

    pub fn open_session(&mut self, session_id: &str, rows: Vec<StringRecord>) -> Result<(), StoreError> {
        if self.sessions.contains_key(session_id) {
            return Err(StoreError::SessionExists(session_id.to_string()));
        }
        // Rows that arrive with unsaved edits start out pending.
        for row in rows.iter().filter(|r| !r.translation_status.is_durable()) {
            self.pending.mark(session_id, &row.record_id());
        }
        info!(session = %session_id, rows = rows.len(), pending = self.pending.len(session_id), "session opened");
        self.sessions.insert(session_id.to_string(), Session::new(rows));
        Ok(())
    }

    /// Drop the session with its history and pending set. Returns the final rows.
    pub fn close_session(&mut self, session_id: &str) -> Option<Vec<StringRecord>> {
        let session = self.sessions.remove(session_id)?;
        self.history.clear(session_id);
        self.pending.clear(session_id);
        info!(session = %session_id, "session closed");
        Some(session.rows)
    }

    pub fn rows(&self, session_id: &str) -> Result<&[StringRecord], StoreError> {
        Ok(&self.session(session_id)?.rows)
    }

    pub fn row(&self, session_id: &str, key: &RecordKey) -> Option<&StringRecord> {
        let s = self.sessions.get(session_id)?;
        s.position(key).map(|i| &s.rows[i])
    }

    /// Manual edit of one row. Returns `false` when the text is unchanged.
    pub fn edit_row(&mut self, session_id: &str, key: &RecordKey, text: &str) -> Result<bool, StoreError> {
        let session = self.sessions.get_mut(session_id).ok_or_else(|| StoreError::UnknownSession(session_id.to_string()))?;
        let pos = session.position(key).ok_or_else(|| StoreError::UnknownRecords(vec![key.record_id()]))?;
        let row = &mut session.rows[pos];
        if row.translated_text == text {
            return Ok(false);
        }
        let before = row.clone();
        row.translated_text = text.to_string();
        row.translation_status = TranslationStatus::Manual;
        let rec = HistoryRecord::new(before, row.clone());
        self.pending.mark(session_id, &rec.record_id);
        let cmd = HistoryCommand::new(session_id, CommandKind::Single, format!("edit {}", rec.record_id), vec![rec]);
        self.history.push(cmd);
        Ok(true)
    }

    /// Apply a batch of updates as one command. Unknown keys reject the whole batch.
    pub fn apply_updates(&mut self, session_id: &str, updates: &[RowUpdate]) -> Result<usize, StoreError> {
        let session = self.sessions.get_mut(session_id).ok_or_else(|| StoreError::UnknownSession(session_id.to_string()))?;
        let mut positions = Vec::with_capacity(updates.len());
        let mut unknown = Vec::new();
        for u in updates {
            match session.position(&u.key) {
                Some(p) => positions.push(p),
                None => unknown.push(u.key.record_id()),
            }
        }
        if !unknown.is_empty() {
            return Err(StoreError::UnknownRecords(unknown));
        }
        if updates.is_empty() {
            return Ok(0);
        }
        let mut records = Vec::with_capacity(updates.len());
        for (u, pos) in updates.iter().zip(positions) {
            let row = &mut session.rows[pos];
            let before = row.clone();
            row.translated_text = u.translated_text.clone();
            row.translation_status = u.provenance.status();
            records.push(HistoryRecord::new(before, row.clone()));
        }
        for r in &records {
            self.pending.mark(session_id, &r.record_id);
        }
        let expanded = updates.iter().filter(|u| u.expanded).count();
        let description = if expanded > 0 {
            format!("translate {} rows ({} duplicates)", records.len(), expanded)
        } else {
            format!("translate {} rows", records.len())
        };
        let n = records.len();
        self.history.push(HistoryCommand::new(session_id, CommandKind::Batch, description, records));
        debug!(session = %session_id, rows = n, "batch applied");
        Ok(n)
    }

    /// Revert the most recent command of the session. `Ok(None)` when there is nothing to undo.
    pub fn undo(&mut self, session_id: &str) -> Result<Option<HistoryCommand>, StoreError> {
        let session = self.sessions.get_mut(session_id).ok_or_else(|| StoreError::UnknownSession(session_id.to_string()))?;
        let Some(cmd) = self.history.undo(session_id) else { return Ok(None) };
        // A row may appear twice in one command; reverse order leaves its earliest snapshot.
        for rec in cmd.records.iter().rev() {
            match session.by_id.get(&rec.record_id) {
                Some(&pos) => session.rows[pos] = rec.before.clone(),
                None => warn!(session = %session_id, record = %rec.record_id, "undo target missing"),
            }
        }
        self.pending.rederive(&cmd);
        debug!(session = %session_id, command = %cmd.id, rows = cmd.records.len(), "undo");
        Ok(Some(cmd))
    }

    pub fn can_undo(&self, session_id: &str) -> bool {
        self.history.can_undo(session_id)
    }

    pub fn undo_depth(&self, session_id: &str) -> usize {
        self.history.len(session_id)
    }

    pub fn pending(&self, session_id: &str) -> Vec<String> {
        self.pending.ids(session_id)
    }

    /// Rows with unsaved edits, in row order.
    pub fn pending_rows(&self, session_id: &str) -> Result<Vec<StringRecord>, StoreError> {
        let s = self.session(session_id)?;
        Ok(s.rows.iter().filter(|r| self.pending.contains(session_id, &r.record_id())).cloned().collect())
    }

    /// Mark every pending row persisted and clear the pending set.
    pub fn mark_saved(&mut self, session_id: &str) -> Result<usize, StoreError> {
        let session = self.sessions.get_mut(session_id).ok_or_else(|| StoreError::UnknownSession(session_id.to_string()))?;
        let ids = self.pending.ids(session_id);
        for id in &ids {
            if let Some(&pos) = session.by_id.get(id) {
                session.rows[pos].translation_status = TranslationStatus::Persisted;
            }
        }
        self.pending.clear(session_id);
        info!(session = %session_id, rows = ids.len(), "session saved");
        Ok(ids.len())
    }

    fn session(&self, session_id: &str) -> Result<&Session, StoreError> {
        self.sessions.get(session_id).ok_or_else(|| StoreError::UnknownSession(session_id.to_string()))
    }
}

/// Observer that routes agent row updates into a shared [`EditorStore`] session.
pub struct EditorSink {
    store: Arc<Mutex<EditorStore>>,
    session_id: String,
    skipped: Vec<RowSkip>,
}

impl EditorSink {
    pub fn new(store: Arc<Mutex<EditorStore>>, session_id: impl Into<String>) -> Self {
        Self { store, session_id: session_id.into(), skipped: Vec::new() }
    }

    pub fn skipped(&self) -> &[RowSkip] {
        &self.skipped
    }
}

impl SessionObserver for EditorSink {
    fn rows_updated(&mut self, updates: &[RowUpdate]) {
        let mut store = match self.store.lock() {
            Ok(g) => g,
            Err(_) => {
                warn!(session = %self.session_id, "editor store lock poisoned; dropping row updates");
                return;
            }
        };
        if let Err(e) = store.apply_updates(&self.session_id, updates) {
            warn!(session = %self.session_id, error = %e, "row updates rejected");
        }
    }

    fn rows_skipped(&mut self, skips: &[RowSkip]) {
        self.skipped.extend_from_slice(skips);
    }

    fn progress(&mut self, completed: usize, total: usize) {
        debug!(session = %self.session_id, completed, total, "progress");
    }

    fn status(&mut self, message: &str) {
        info!(session = %self.session_id, "{}", message);
    }
}
