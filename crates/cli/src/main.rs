use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use scrivener_agent::{AgentConfig, CancellationToken, OpenAiClient, SessionDriver};
use scrivener_core::{StringRecord, TermLookup, TranslationStatus, WorkItem};
use scrivener_persist::{GlossaryStore, SearchHistoryEntry, SearchHistoryStore, SqliteStore, TranslationStore};
use scrivener_search::{Glossary, LocalLookup, ReferenceIndex, TermSource};
use scrivener_store::{EditorSink, EditorStore};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "scrivctl", version, about = "Scrivener: AI-assisted translation of game mod strings")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database (default: ~/.scrivener/scrivener.db)
    #[arg(long = "db", global = true, env = "SCRIV_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Translate untranslated rows of a JSON dump with the chat model
    Translate {
        /// JSON array of string records
        input: PathBuf,
        /// Where to write the updated rows (default: print to stdout)
        #[arg(long = "out")]
        out: Option<PathBuf>,
        /// Plugin name recorded with saved translations (default: input file stem)
        #[arg(long = "plugin")]
        plugin: Option<String>,
        /// Persist translated rows to the translation store when done
        #[arg(long = "save", action = ArgAction::SetTrue)]
        save: bool,
        /// Target language
        #[arg(long = "lang", env = "SCRIV_TARGET_LANG")]
        lang: Option<String>,
        #[command(flatten)]
        api: ApiArgs,
    },
    /// Run the search collaborators for one term
    Lookup {
        term: String,
        #[arg(long = "limit", default_value_t = 5)]
        limit: usize,
    },
    /// Mark glossary terms inline in a text
    Annotate { text: String },
    /// Manage glossary terms
    Glossary {
        #[command(subcommand)]
        command: GlossaryCommands,
    },
    /// Manage model API profiles
    Api {
        #[command(subcommand)]
        command: ApiCommands,
    },
    /// Terms earlier runs resolved with the search tool
    SearchHistory {
        #[command(subcommand)]
        command: SearchHistoryCommands,
    },
    /// Translation store statistics
    Stats {
        /// Delete every saved translation of this plugin
        #[arg(long = "clear-plugin")]
        clear_plugin: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
struct ApiArgs {
    /// OpenAI-compatible base URL; overrides the active profile
    #[arg(long = "endpoint", env = "SCRIV_API_ENDPOINT")]
    endpoint: Option<String>,
    #[arg(long = "api-key", env = "SCRIV_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long = "model", env = "SCRIV_MODEL")]
    model: Option<String>,
    #[arg(long = "max-tokens", env = "SCRIV_MAX_TOKENS")]
    max_tokens: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum GlossaryCommands {
    Add {
        term: String,
        translation: String,
        #[arg(long = "source", default_value = "manual")]
        source: String,
    },
    Rm { term: String },
    Ls,
}

#[derive(Subcommand, Debug)]
enum ApiCommands {
    Add {
        #[arg(long = "name")]
        name: String,
        #[arg(long = "endpoint")]
        endpoint: String,
        #[arg(long = "api-key")]
        api_key: String,
        #[arg(long = "model")]
        model: String,
        #[arg(long = "max-tokens", default_value_t = 4096)]
        max_tokens: i64,
        #[arg(long = "activate", action = ArgAction::SetTrue)]
        activate: bool,
    },
    /// Change fields of an existing profile
    Update {
        id: i64,
        #[arg(long = "name")]
        name: Option<String>,
        #[arg(long = "endpoint")]
        endpoint: Option<String>,
        #[arg(long = "api-key")]
        api_key: Option<String>,
        #[arg(long = "model")]
        model: Option<String>,
        #[arg(long = "max-tokens")]
        max_tokens: Option<i64>,
    },
    Ls,
    Activate { id: i64 },
    Rm { id: i64 },
}

#[derive(Subcommand, Debug)]
enum SearchHistoryCommands {
    Ls,
    Rm { term: String },
}

fn init_tracing() {
    let env = std::env::var("SCRIV_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SCRIV_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SCRIV_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_store(db: Option<&str>) -> Result<SqliteStore> {
    match db {
        Some(path) => SqliteStore::open(path),
        None => SqliteStore::open_default(),
    }
}

/// Glossary plus reference index, both loaded from the store. Terms resolved by
/// earlier runs join the reference pairs.
fn load_lookup(store: &SqliteStore) -> Result<LocalLookup> {
    let glossary = Glossary::from_entries(store.list_terms().context("loading glossary")?);
    let mut pairs = store.reference_pairs().context("loading reference translations")?;
    let history = store.list_search_history().context("loading search history")?;
    pairs.extend(history_pairs(&history));
    let references = ReferenceIndex::build(pairs);
    info!(terms = glossary.len(), references = references.len(), searched = history.len(), "lookup loaded");
    Ok(LocalLookup::new(glossary, references))
}

/// Explicit flags win; otherwise the active profile supplies what is missing.
fn build_client(store: &SqliteStore, api: ApiArgs) -> Result<OpenAiClient> {
    let active = store.current_api_config()?;
    let endpoint = api.endpoint.or_else(|| active.as_ref().map(|c| c.endpoint.clone()));
    let api_key = api.api_key.or_else(|| active.as_ref().map(|c| c.api_key.clone()));
    let model = api.model.or_else(|| active.as_ref().map(|c| c.model_name.clone()));
    let max_tokens = api.max_tokens.or_else(|| active.as_ref().and_then(|c| u32::try_from(c.max_tokens).ok()));
    let (Some(endpoint), Some(api_key), Some(model)) = (endpoint, api_key, model) else {
        return Err(anyhow!("no active API profile; run `scrivctl api add ... --activate` or pass --endpoint/--api-key/--model"));
    };
    let mut client = OpenAiClient::new(&endpoint, &api_key, &model)?.with_env_retries();
    if let Some(n) = max_tokens {
        client = client.with_max_tokens(n);
    }
    info!(endpoint = %endpoint, model = %model, "model client ready");
    Ok(client)
}

fn history_pairs(history: &[SearchHistoryEntry]) -> Vec<(String, String)> {
    history
        .iter()
        .flat_map(|e| e.candidates.iter().map(move |c| (e.term.clone(), c.target.clone())))
        .collect()
}

fn read_records(path: &Path) -> Result<Vec<StringRecord>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {} as a JSON array of records", path.display()))
}

fn mask_key(key: &str) -> String {
    let n = key.chars().count();
    if n <= 8 {
        return "*".repeat(n);
    }
    let head: String = key.chars().take(4).collect();
    let tail: String = key.chars().skip(n - 4).collect();
    format!("{}…{}", head, tail)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let store = open_store(cli.db.as_deref())?;

    match cli.command {
        Commands::Translate { input, out, plugin, save, lang, api } => {
            let started = Instant::now();
            let mut records = read_records(&input)?;
            let hydrated = store.hydrate_records(&mut records)?;
            let items: Vec<WorkItem> = records
                .iter()
                .enumerate()
                .filter(|(_, r)| r.translation_status == TranslationStatus::Untranslated && !r.original_text.trim().is_empty())
                .map(|(i, r)| WorkItem::from_record(i, r))
                .collect();
            info!(rows = records.len(), hydrated, queued = items.len(), "translate invoked");

            let lookup = Arc::new(load_lookup(&store)?);
            let mut config = AgentConfig::from_env();
            if let Some(lang) = lang {
                config.target_language = lang;
            }
            let driver = SessionDriver::new(Arc::new(build_client(&store, api)?), lookup.clone(), config).with_annotator(lookup);

            let session_id = uuid::Uuid::new_v4().to_string();
            let editor = Arc::new(Mutex::new(EditorStore::from_env()));
            editor.lock().map_err(|_| anyhow!("editor store lock poisoned"))?.open_session(&session_id, records)?;
            let mut sink = EditorSink::new(editor.clone(), session_id.clone());

            let cancel = CancellationToken::new();
            let ctrl_c = tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if signal::ctrl_c().await.is_ok() {
                        warn!("interrupt received; stopping after the current round");
                        cancel.cancel();
                    }
                }
            });
            let outcome = driver.run(items, &mut sink, &cancel).await;
            ctrl_c.abort();

            if !outcome.learned.is_empty() {
                let entries: Vec<SearchHistoryEntry> = outcome
                    .learned
                    .iter()
                    .map(|l| SearchHistoryEntry { term: l.term.clone(), candidates: l.candidates.clone(), updated_at: 0 })
                    .collect();
                // Losing the history must not lose the translated rows.
                match store.put_search_history(&entries) {
                    Ok(n) => info!(terms = n, "search history updated"),
                    Err(e) => warn!(error = %e, "failed to save search history"),
                }
            }

            let mut editor = editor.lock().map_err(|_| anyhow!("editor store lock poisoned"))?;
            let mut saved = 0usize;
            if save {
                let plugin = plugin
                    .or_else(|| input.file_stem().map(|s| s.to_string_lossy().to_string()))
                    .unwrap_or_else(|| "unknown".to_string());
                let pending = editor.pending_rows(&session_id)?;
                saved = store.save_records(&plugin, &pending)?;
                editor.mark_saved(&session_id)?;
                info!(plugin = %plugin, saved, "translations saved");
            }
            let rows = editor.close_session(&session_id).unwrap_or_default();
            drop(editor);

            let payload = serde_json::to_string_pretty(&rows)?;
            match &out {
                Some(path) => std::fs::write(path, payload).with_context(|| format!("writing {}", path.display()))?,
                None if cli.output == Output::Human => println!("{}", payload),
                None => {}
            }
            match cli.output {
                Output::Human => {
                    let state = match outcome.error() {
                        None => "done".to_string(),
                        Some(reason) => format!("stopped: {}", reason),
                    };
                    eprintln!(
                        "{} • {}/{} entries ({} translated, {} skipped) • {} rounds • {} saved • {:.1}s",
                        state,
                        outcome.completed,
                        outcome.total,
                        outcome.translated,
                        outcome.skipped,
                        outcome.rounds,
                        saved,
                        started.elapsed().as_secs_f64()
                    );
                }
                Output::Json => {
                    let mut v = serde_json::json!({ "outcome": outcome, "error": outcome.error(), "saved": saved });
                    if out.is_none() {
                        v["rows"] = serde_json::to_value(&rows)?;
                    }
                    println!("{}", serde_json::to_string_pretty(&v)?);
                }
            }
            if !outcome.success() {
                std::process::exit(2);
            }
        }
        Commands::Lookup { term, limit } => {
            let lookup = load_lookup(&store)?;
            let glossary = lookup.glossary(&term).await?;
            let references = lookup.references(&term, limit).await?;
            match cli.output {
                Output::Human => {
                    if glossary.is_empty() && references.is_empty() {
                        println!("no match for {}", term);
                    }
                    for c in &glossary {
                        println!("glossary   {} → {}", c.source, c.target);
                    }
                    for c in &references {
                        println!("reference  {} → {}", c.source, c.target);
                    }
                }
                Output::Json => {
                    println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "glossary": glossary, "references": references }))?)
                }
            }
        }
        Commands::Annotate { text } => {
            let glossary = Glossary::from_entries(store.list_terms()?);
            let annotated = glossary.annotate(&text);
            match cli.output {
                Output::Human => println!("{}", annotated),
                Output::Json => println!("{}", serde_json::json!({ "text": annotated })),
            }
        }
        Commands::Glossary { command } => match command {
            GlossaryCommands::Add { term, translation, source } => {
                let entry = scrivener_search::GlossaryEntry { term: term.trim().to_lowercase(), translation, source: TermSource::parse(&source) };
                if entry.term.is_empty() {
                    return Err(anyhow!("term must not be blank"));
                }
                store.put_term(&entry)?;
                info!(term = %entry.term, source = entry.source.as_str(), "glossary term saved");
            }
            GlossaryCommands::Rm { term } => {
                if !store.delete_term(&term)? {
                    eprintln!("no such term: {}", term);
                }
            }
            GlossaryCommands::Ls => {
                let terms = store.list_terms()?;
                match cli.output {
                    Output::Human => {
                        for t in terms {
                            println!("{:<32} {:<24} {}", t.term, t.translation, t.source.as_str());
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&terms)?),
                }
            }
        },
        Commands::Api { command } => match command {
            ApiCommands::Add { name, endpoint, api_key, model, max_tokens, activate } => {
                let id = store.create_api_config(&name, &endpoint, &api_key, &model, max_tokens)?;
                if activate {
                    store.activate_api_config(id)?;
                }
                println!("{}", id);
            }
            ApiCommands::Update { id, name, endpoint, api_key, model, max_tokens } => {
                let mut cfg = store.api_config(id)?.ok_or_else(|| anyhow!("no such api profile: {}", id))?;
                if let Some(v) = name {
                    cfg.name = v;
                }
                if let Some(v) = endpoint {
                    cfg.endpoint = v;
                }
                if let Some(v) = api_key {
                    cfg.api_key = v;
                }
                if let Some(v) = model {
                    cfg.model_name = v;
                }
                if let Some(v) = max_tokens {
                    cfg.max_tokens = v;
                }
                store.update_api_config(&cfg)?;
                info!(id, "api profile updated");
            }
            ApiCommands::Ls => {
                let configs = store.list_api_configs()?;
                match cli.output {
                    Output::Human => {
                        for c in configs {
                            let mark = if c.is_active { "*" } else { " " };
                            println!("{} {:<4} {:<16} {:<24} {:<40} {}", mark, c.id, c.name, c.model_name, c.endpoint, mask_key(&c.api_key));
                        }
                    }
                    Output::Json => {
                        let masked: Vec<_> = configs.into_iter().map(|mut c| { c.api_key = mask_key(&c.api_key); c }).collect();
                        println!("{}", serde_json::to_string_pretty(&masked)?);
                    }
                }
            }
            ApiCommands::Activate { id } => store.activate_api_config(id)?,
            ApiCommands::Rm { id } => {
                if !store.delete_api_config(id)? {
                    eprintln!("no such api profile: {}", id);
                }
            }
        },
        Commands::SearchHistory { command } => match command {
            SearchHistoryCommands::Ls => {
                let history = store.list_search_history()?;
                match cli.output {
                    Output::Human => {
                        for e in &history {
                            let targets: Vec<&str> = e.candidates.iter().map(|c| c.target.as_str()).collect();
                            println!("{:<32} {}", e.term, targets.join(", "));
                        }
                    }
                    Output::Json => println!("{}", serde_json::to_string_pretty(&history)?),
                }
            }
            SearchHistoryCommands::Rm { term } => {
                if !store.delete_search_history(&term)? {
                    eprintln!("no such term: {}", term);
                }
            }
        },
        Commands::Stats { clear_plugin } => {
            if let Some(plugin) = clear_plugin {
                let n = store.clear_plugin(&plugin)?;
                info!(plugin = %plugin, removed = n, "plugin translations cleared");
            }
            let stats = store.stats()?;
            match cli.output {
                Output::Human => {
                    println!("{} translations", stats.total_count);
                    for p in &stats.plugin_counts {
                        let name = if p.plugin_name.is_empty() { "-" } else { p.plugin_name.as_str() };
                        println!("  {:<40} {}", name, p.count);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
            }
        }
    }
    Ok(())
}
