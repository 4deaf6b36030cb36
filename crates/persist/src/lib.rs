//! Scrivener persistence: one SQLite file holding persisted translations (the
//! reference corpus), glossary terms and model API profiles.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use rusqlite::{params, Connection, OptionalExtension};
use scrivener_core::{Candidate, StringRecord, TranslationStatus};
use scrivener_search::{GlossaryEntry, TermSource};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A persisted translation, keyed by `(form_id, record_type, subrecord_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub form_id: String,
    pub record_type: String,
    pub subrecord_type: String,
    pub editor_id: Option<String>,
    pub original_text: String,
    pub translated_text: String,
    pub plugin_name: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginCount {
    pub plugin_name: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationStats {
    pub total_count: i64,
    pub plugin_counts: Vec<PluginCount>,
    pub last_updated: i64,
}

/// Connection profile for an OpenAI-compatible chat endpoint. At most one is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub id: i64,
    pub name: String,
    pub endpoint: String,
    pub api_key: String,
    pub model_name: String,
    pub max_tokens: i64,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Candidates the `search` tool found for a term in an earlier run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHistoryEntry {
    pub term: String,
    pub candidates: Vec<Candidate>,
    pub updated_at: i64,
}

pub trait TranslationStore {
    fn put_translations(&self, rows: &[Translation]) -> Result<usize>;
    fn get_translation(&self, form_id: &str, record_type: &str, subrecord_type: &str) -> Result<Option<Translation>>;
    /// `(original, translated)` pairs feeding the reference index.
    fn reference_pairs(&self) -> Result<Vec<(String, String)>>;
    fn stats(&self) -> Result<TranslationStats>;
    fn clear_plugin(&self, plugin_name: &str) -> Result<usize>;
}

pub trait GlossaryStore {
    fn put_term(&self, entry: &GlossaryEntry) -> Result<()>;
    fn delete_term(&self, term: &str) -> Result<bool>;
    fn list_terms(&self) -> Result<Vec<GlossaryEntry>>;
}

pub trait SearchHistoryStore {
    /// Upsert by term; `updated_at` is stamped at write time.
    fn put_search_history(&self, entries: &[SearchHistoryEntry]) -> Result<usize>;
    /// Most recently updated first.
    fn list_search_history(&self) -> Result<Vec<SearchHistoryEntry>>;
    fn delete_search_history(&self, term: &str) -> Result<bool>;
}

/// SQLite-backed store. Simple, synchronous; callers hold it behind their own handle.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("SCRIV_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS translations (
                form_id         TEXT NOT NULL,
                record_type     TEXT NOT NULL,
                subrecord_type  TEXT NOT NULL,
                editor_id       TEXT,
                original_text   TEXT NOT NULL,
                translated_text TEXT NOT NULL,
                plugin_name     TEXT,
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL,
                PRIMARY KEY (form_id, record_type, subrecord_type)
            );
            CREATE INDEX IF NOT EXISTS idx_translations_plugin ON translations(plugin_name);
            CREATE TABLE IF NOT EXISTS glossary_terms (
                term        TEXT PRIMARY KEY,
                translation TEXT NOT NULL,
                source      TEXT NOT NULL,
                updated_at  INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS api_configs (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                name       TEXT NOT NULL,
                endpoint   TEXT NOT NULL,
                api_key    TEXT NOT NULL,
                model_name TEXT NOT NULL,
                max_tokens INTEGER NOT NULL,
                is_active  INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_api_is_active ON api_configs(is_active);
            CREATE TABLE IF NOT EXISTS search_history (
                term       TEXT PRIMARY KEY,
                candidates TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .context("creating tables")?;
        let me = Self { db: Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path = %path, "store opened");
        Ok(me)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }

    /// Persist every edited row of a session (`manual`/`ai`) under `plugin_name`.
    pub fn save_records(&self, plugin_name: &str, records: &[StringRecord]) -> Result<usize> {
        let now = now_ts();
        let rows: Vec<Translation> = records
            .iter()
            .filter(|r| !r.translation_status.is_durable())
            .map(|r| Translation {
                form_id: r.form_id.clone(),
                record_type: r.record_type.clone(),
                subrecord_type: r.subrecord_type.clone(),
                editor_id: r.editor_id.clone(),
                original_text: r.original_text.clone(),
                translated_text: r.translated_text.clone(),
                plugin_name: Some(plugin_name.to_string()),
                created_at: now,
                updated_at: now,
            })
            .collect();
        self.put_translations(&rows)
    }

    /// Fill rows from persisted translations; matched rows become `persisted`.
    pub fn hydrate_records(&self, records: &mut [StringRecord]) -> Result<usize> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT original_text, translated_text FROM translations
             WHERE form_id = ?1 AND record_type = ?2 AND subrecord_type = ?3",
        )?;
        let mut hits = 0usize;
        for r in records.iter_mut() {
            let row: Option<(String, String)> = stmt
                .query_row(params![r.form_id, r.record_type, r.subrecord_type], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .optional()?;
            // A changed source invalidates the stored translation.
            if let Some((original, translated)) = row {
                if original == r.original_text {
                    r.translated_text = translated;
                    r.translation_status = TranslationStatus::Persisted;
                    hits += 1;
                }
            }
        }
        histogram!("persist_hydrate_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(rows = records.len(), hits, "hydrated records");
        Ok(hits)
    }

    pub fn list_api_configs(&self) -> Result<Vec<ApiConfig>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, name, endpoint, api_key, model_name, max_tokens, is_active, created_at, updated_at
             FROM api_configs ORDER BY is_active DESC, created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([], api_config_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn create_api_config(&self, name: &str, endpoint: &str, api_key: &str, model_name: &str, max_tokens: i64) -> Result<i64> {
        let db = self.conn()?;
        let now = now_ts();
        db.execute(
            "INSERT INTO api_configs (name, endpoint, api_key, model_name, max_tokens, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
            params![name, endpoint, api_key, model_name, max_tokens, now],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn api_config(&self, id: i64) -> Result<Option<ApiConfig>> {
        let db = self.conn()?;
        let row = db
            .query_row(
                "SELECT id, name, endpoint, api_key, model_name, max_tokens, is_active, created_at, updated_at
                 FROM api_configs WHERE id = ?1",
                params![id],
                api_config_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn update_api_config(&self, cfg: &ApiConfig) -> Result<()> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE api_configs
             SET name = ?1, endpoint = ?2, api_key = ?3, model_name = ?4, max_tokens = ?5, updated_at = ?6
             WHERE id = ?7",
            params![cfg.name, cfg.endpoint, cfg.api_key, cfg.model_name, cfg.max_tokens, now_ts(), cfg.id],
        )?;
        if n == 0 {
            return Err(anyhow!("api config {} not found", cfg.id));
        }
        Ok(())
    }

    pub fn delete_api_config(&self, id: i64) -> Result<bool> {
        let db = self.conn()?;
        Ok(db.execute("DELETE FROM api_configs WHERE id = ?1", params![id])? > 0)
    }

    /// Activate `id` and deactivate every other profile in one transaction.
    pub fn activate_api_config(&self, id: i64) -> Result<()> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute("UPDATE api_configs SET is_active = 0", [])?;
        let n = tx.execute(
            "UPDATE api_configs SET is_active = 1, updated_at = ?1 WHERE id = ?2",
            params![now_ts(), id],
        )?;
        if n == 0 {
            return Err(anyhow!("api config {} not found", id));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn current_api_config(&self) -> Result<Option<ApiConfig>> {
        let db = self.conn()?;
        let row = db
            .query_row(
                "SELECT id, name, endpoint, api_key, model_name, max_tokens, is_active, created_at, updated_at
                 FROM api_configs WHERE is_active = 1 LIMIT 1",
                [],
                api_config_from_row,
            )
            .optional()?;
        Ok(row)
    }
}

fn api_config_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiConfig> {
    Ok(ApiConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        endpoint: row.get(2)?,
        api_key: row.get(3)?,
        model_name: row.get(4)?,
        max_tokens: row.get(5)?,
        is_active: row.get::<_, i64>(6)? == 1,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl TranslationStore for SqliteStore {
    fn put_translations(&self, rows: &[Translation]) -> Result<usize> {
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO translations
                    (form_id, record_type, subrecord_type, editor_id, original_text,
                     translated_text, plugin_name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(form_id, record_type, subrecord_type) DO UPDATE SET
                    editor_id = excluded.editor_id,
                    original_text = excluded.original_text,
                    translated_text = excluded.translated_text,
                    plugin_name = excluded.plugin_name,
                    updated_at = excluded.updated_at",
            )?;
            for t in rows {
                stmt.execute(params![
                    t.form_id,
                    t.record_type,
                    t.subrecord_type,
                    t.editor_id,
                    t.original_text,
                    t.translated_text,
                    t.plugin_name,
                    t.created_at,
                    t.updated_at,
                ])?;
            }
        }
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", rows.len() as u64);
        Ok(rows.len())
    }

    fn get_translation(&self, form_id: &str, record_type: &str, subrecord_type: &str) -> Result<Option<Translation>> {
        let db = self.conn()?;
        let row = db
            .query_row(
                "SELECT form_id, record_type, subrecord_type, editor_id, original_text,
                        translated_text, plugin_name, created_at, updated_at
                 FROM translations WHERE form_id = ?1 AND record_type = ?2 AND subrecord_type = ?3",
                params![form_id, record_type, subrecord_type],
                |row| {
                    Ok(Translation {
                        form_id: row.get(0)?,
                        record_type: row.get(1)?,
                        subrecord_type: row.get(2)?,
                        editor_id: row.get(3)?,
                        original_text: row.get(4)?,
                        translated_text: row.get(5)?,
                        plugin_name: row.get(6)?,
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn reference_pairs(&self) -> Result<Vec<(String, String)>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT original_text, translated_text FROM translations
             WHERE original_text != translated_text ORDER BY updated_at DESC",
        )?;
        let out = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn stats(&self) -> Result<TranslationStats> {
        let db = self.conn()?;
        let (total_count, last_updated): (i64, i64) = db.query_row(
            "SELECT COUNT(*), COALESCE(MAX(updated_at), 0) FROM translations",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let mut stmt = db.prepare(
            "SELECT COALESCE(plugin_name, ''), COUNT(*) FROM translations
             GROUP BY plugin_name ORDER BY COUNT(*) DESC",
        )?;
        let plugin_counts = stmt
            .query_map([], |row| Ok(PluginCount { plugin_name: row.get(0)?, count: row.get(1)? }))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(TranslationStats { total_count, plugin_counts, last_updated })
    }

    fn clear_plugin(&self, plugin_name: &str) -> Result<usize> {
        let db = self.conn()?;
        Ok(db.execute("DELETE FROM translations WHERE plugin_name = ?1", params![plugin_name])?)
    }
}

impl GlossaryStore for SqliteStore {
    fn put_term(&self, entry: &GlossaryEntry) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "INSERT INTO glossary_terms (term, translation, source, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(term) DO UPDATE SET
                translation = excluded.translation,
                source = excluded.source,
                updated_at = excluded.updated_at",
            params![entry.term.trim().to_lowercase(), entry.translation, entry.source.as_str(), now_ts()],
        )?;
        Ok(())
    }

    fn delete_term(&self, term: &str) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute("DELETE FROM glossary_terms WHERE term = ?1", params![term.trim().to_lowercase()])?;
        Ok(n > 0)
    }

    fn list_terms(&self) -> Result<Vec<GlossaryEntry>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT term, translation, source FROM glossary_terms ORDER BY term")?;
        let out = stmt
            .query_map([], |row| {
                Ok(GlossaryEntry {
                    term: row.get(0)?,
                    translation: row.get(1)?,
                    source: TermSource::parse(&row.get::<_, String>(2)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(out)
    }
}

impl SearchHistoryStore for SqliteStore {
    fn put_search_history(&self, entries: &[SearchHistoryEntry]) -> Result<usize> {
        let now = now_ts();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO search_history (term, candidates, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(term) DO UPDATE SET
                    candidates = excluded.candidates,
                    updated_at = excluded.updated_at",
            )?;
            for e in entries {
                let candidates = serde_json::to_string(&e.candidates).context("encoding search candidates")?;
                stmt.execute(params![e.term, candidates, now])?;
            }
        }
        tx.commit()?;
        counter!("persist_search_history_put_total", entries.len() as u64);
        debug!(terms = entries.len(), "search history saved");
        Ok(entries.len())
    }

    fn list_search_history(&self) -> Result<Vec<SearchHistoryEntry>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT term, candidates, updated_at FROM search_history ORDER BY updated_at DESC, term")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut out = Vec::with_capacity(rows.len());
        for (term, json, updated_at) in rows {
            match serde_json::from_str::<Vec<Candidate>>(&json) {
                Ok(candidates) => out.push(SearchHistoryEntry { term, candidates, updated_at }),
                Err(e) => warn!(term = %term, error = %e, "skipping unreadable search history entry"),
            }
        }
        Ok(out)
    }

    fn delete_search_history(&self, term: &str) -> Result<bool> {
        let db = self.conn()?;
        Ok(db.execute("DELETE FROM search_history WHERE term = ?1", params![term])? > 0)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".scrivener");
        let _ = std::fs::create_dir_all(&p);
        p.push("scrivener.db");
        return p.to_string_lossy().to_string();
    }
    "scrivener.db".to_string()
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}
