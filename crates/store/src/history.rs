//! Per-session undo stacks and the pending-changes ledger.

#![forbid(unsafe_code)]

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};
use scrivener_core::StringRecord;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Single,
    Batch,
}

/// Full before/after snapshots of one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub record_id: String,
    pub before: StringRecord,
    pub after: StringRecord,
}

impl HistoryRecord {
    pub fn new(before: StringRecord, after: StringRecord) -> Self {
        Self { record_id: before.record_id(), before, after }
    }
}

/// One undoable unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCommand {
    pub id: Uuid,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub kind: CommandKind,
    pub description: String,
    pub session_id: String,
    pub records: Vec<HistoryRecord>,
}

impl HistoryCommand {
    pub fn new(session_id: &str, kind: CommandKind, description: impl Into<String>, records: Vec<HistoryRecord>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            kind,
            description: description.into(),
            session_id: session_id.to_string(),
            records,
        }
    }
}

/// LIFO stacks keyed by session id, each capped with FIFO eviction of the oldest command.
#[derive(Debug)]
pub struct HistoryStore {
    stacks: FxHashMap<String, VecDeque<HistoryCommand>>,
    cap: usize,
    evicted: u64,
}

impl HistoryStore {
    pub fn with_capacity(cap: usize) -> Self {
        Self { stacks: FxHashMap::default(), cap: cap.max(1), evicted: 0 }
    }

    pub fn cap(&self) -> usize { self.cap }
    pub fn evicted(&self) -> u64 { self.evicted }

    pub fn push(&mut self, cmd: HistoryCommand) {
        let stack = self.stacks.entry(cmd.session_id.clone()).or_default();
        if stack.len() >= self.cap {
            if let Some(old) = stack.pop_front() {
                self.evicted += 1;
                metrics::counter!("history_evicted_total", 1u64);
                debug!(session = %old.session_id, command = %old.id, "history cap reached; evicted oldest");
            }
        }
        stack.push_back(cmd);
        metrics::counter!("history_push_total", 1u64);
    }

    /// Pop the most recent command of `session_id`. Not recorded as a new command.
    pub fn undo(&mut self, session_id: &str) -> Option<HistoryCommand> {
        self.stacks.get_mut(session_id).and_then(|s| s.pop_back())
    }

    pub fn len(&self, session_id: &str) -> usize {
        self.stacks.get(session_id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn can_undo(&self, session_id: &str) -> bool {
        self.len(session_id) > 0
    }

    pub fn clear(&mut self, session_id: &str) {
        self.stacks.remove(session_id);
    }
}

/// Record ids with unsaved edits, per session.
#[derive(Debug, Default)]
pub struct PendingChanges {
    sets: FxHashMap<String, FxHashSet<String>>,
}

impl PendingChanges {
    pub fn mark(&mut self, session_id: &str, record_id: &str) {
        self.sets.entry(session_id.to_string()).or_default().insert(record_id.to_string());
    }

    pub fn unmark(&mut self, session_id: &str, record_id: &str) {
        if let Some(set) = self.sets.get_mut(session_id) {
            set.remove(record_id);
        }
    }

    pub fn contains(&self, session_id: &str, record_id: &str) -> bool {
        self.sets.get(session_id).map(|s| s.contains(record_id)).unwrap_or(false)
    }

    pub fn len(&self, session_id: &str) -> usize {
        self.sets.get(session_id).map(|s| s.len()).unwrap_or(0)
    }

    /// Sorted for stable output.
    pub fn ids(&self, session_id: &str) -> Vec<String> {
        let mut out: Vec<String> = self.sets.get(session_id).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        out.sort();
        out
    }

    pub fn clear(&mut self, session_id: &str) {
        self.sets.remove(session_id);
    }

    /// Re-derive membership for rows reverted by `cmd`: a durable before-status drops
    /// the row from pending, anything else keeps it.
    pub fn rederive(&mut self, cmd: &HistoryCommand) {
        for rec in cmd.records.iter().rev() {
            if rec.before.translation_status.is_durable() {
                self.unmark(&cmd.session_id, &rec.record_id);
            } else {
                self.mark(&cmd.session_id, &rec.record_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrivener_core::TranslationStatus;

    fn row(index: u32, text: &str, status: TranslationStatus) -> StringRecord {
        StringRecord {
            form_id: "00012EB7".into(),
            editor_id: None,
            record_type: "WEAP".into(),
            subrecord_type: "FULL".into(),
            index,
            original_text: "Iron Sword".into(),
            translated_text: text.into(),
            translation_status: status,
        }
    }

    fn cmd(session: &str, n: u32) -> HistoryCommand {
        let before = row(n, "Iron Sword", TranslationStatus::Untranslated);
        let after = row(n, "铁剑", TranslationStatus::Manual);
        HistoryCommand::new(session, CommandKind::Single, format!("edit {}", n), vec![HistoryRecord::new(before, after)])
    }

    #[test]
    fn cap_plus_one_drops_oldest() {
        let mut h = HistoryStore::with_capacity(3);
        for n in 0..4 {
            h.push(cmd("s", n));
        }
        assert_eq!(h.len("s"), 3);
        assert_eq!(h.evicted(), 1);
        let mut popped = Vec::new();
        while let Some(c) = h.undo("s") {
            popped.push(c.description);
        }
        assert_eq!(popped, vec!["edit 3", "edit 2", "edit 1"]);
    }

    #[test]
    fn sessions_do_not_interfere() {
        let mut h = HistoryStore::with_capacity(2);
        h.push(cmd("a", 0));
        h.push(cmd("b", 1));
        h.push(cmd("b", 2));
        h.push(cmd("b", 3));
        assert_eq!(h.len("a"), 1);
        assert_eq!(h.len("b"), 2);
        h.clear("b");
        assert!(!h.can_undo("b"));
        assert_eq!(h.undo("a").map(|c| c.description), Some("edit 0".to_string()));
        assert!(h.undo("a").is_none());
    }

    #[test]
    fn rederive_follows_before_status() {
        let mut p = PendingChanges::default();
        let reverted_to_durable = cmd("s", 0);
        let id0 = reverted_to_durable.records[0].record_id.clone();
        p.mark("s", &id0);
        p.rederive(&reverted_to_durable);
        assert!(!p.contains("s", &id0));

        let before = row(1, "钢剑", TranslationStatus::Manual);
        let after = row(1, "铁剑", TranslationStatus::Ai);
        let reverted_to_unsaved = HistoryCommand::new("s", CommandKind::Batch, "ai", vec![HistoryRecord::new(before, after)]);
        p.rederive(&reverted_to_unsaved);
        assert_eq!(p.ids("s"), vec!["00012EB7|WEAP|FULL|1".to_string()]);
    }
}
