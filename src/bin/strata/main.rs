//! Inspection CLI for Strata catalogs.
#![forbid(unsafe_code)]

mod config;
mod ui;

use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use strata::catalog::{
    Catalog, CatalogStats, Collection, CounterMetrics, DurableCatalog, MemoryDurableCatalog,
    OpContext, ViewStats,
};
use strata::{CollectionRef, DatabaseName, Timestamp};
use tracing_subscriber::EnvFilter;

use config::{CliConfig, ConfigError};
use ui::{Theme, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "strata",
    version,
    about = "Inspect a Strata collection catalog dump",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "STRATA_CONFIG",
        value_name = "FILE",
        help = "CLI config file (defaults to <config dir>/strata/strata.toml)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "Durable catalog dump (JSON)"
    )]
    dump: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "TS",
        help = "Open the catalog at this stable timestamp instead of the dump's"
    )]
    stable: Option<u64>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(long, global = true, value_enum, default_value_t = Theme::Auto)]
    theme: Theme,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List collections, optionally restricted to one database
    List {
        #[arg(long, value_name = "DB")]
        db: Option<String>,
    },
    /// Look up a collection by namespace (`db.coll`) or UUID
    Lookup {
        #[arg(value_name = "NS|UUID")]
        target: String,
    },
    /// Resolve a collection as of a past timestamp
    At {
        #[arg(value_name = "NS|UUID")]
        target: String,
        #[arg(long, value_name = "TS")]
        ts: u64,
    },
    /// Show catalog counters
    Stats,
    /// Load and list the views of a database
    Views {
        #[arg(value_name = "DB")]
        db: String,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("STRATA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn run() -> Result<i32, Box<dyn Error>> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.clone())?;
    let ui = Ui::new(cli.theme);

    let dump_path = cli
        .dump
        .clone()
        .or_else(|| config.default_dump().cloned())
        .ok_or(ConfigError::NoDump)?;
    let (durable, dump) = MemoryDurableCatalog::load_dump(&dump_path)?;
    let stable = cli.stable.map(Timestamp).or(dump.stable_timestamp);
    let metrics = Arc::new(CounterMetrics::default());
    let options = config.catalog().to_options()?.metrics(metrics.clone());
    let durable: Arc<dyn DurableCatalog> = Arc::new(durable);
    let catalog = Catalog::open(durable, options, stable)?;
    let ctx = OpContext::new();

    match cli.command {
        Command::List { db } => {
            let dbs = match db {
                Some(name) => vec![DatabaseName::new(name)?],
                None => catalog.all_database_names(&ctx),
            };
            let collections: Vec<CollectionReport> = dbs
                .iter()
                .flat_map(|db| catalog.iter_database(&ctx, db))
                .map(|collection| CollectionReport::from(collection.as_ref()))
                .collect();
            emit(cli.format, &collections, || {
                ui.list(
                    "Collections",
                    collections
                        .iter()
                        .map(|c| format!("{} ({}, {} indexes)", c.namespace, c.id, c.indexes.len())),
                )
            })?;
        }
        Command::Lookup { target } => {
            let target: CollectionRef = target.parse()?;
            let found = catalog
                .lookup(&ctx, &target)
                .map(|collection| CollectionReport::from(collection.as_ref()));
            emit(cli.format, &found, || match &found {
                Some(report) => print_collection(&ui, report),
                None => ui.warn(&format!("{target} not found")),
            })?;
            if found.is_none() {
                return Ok(2);
            }
        }
        Command::At { target, ts } => {
            let target: CollectionRef = target.parse()?;
            let ts = Timestamp(ts);
            let history = catalog
                .current(&ctx)
                .lookup_history(&target, Some(ts))
                .label();
            let found = catalog
                .establish_consistent_collection(&ctx, &target, Some(ts))?
                .map(|collection| CollectionReport::from(collection.as_ref()));
            let report = PointInTimeReport {
                target: target.to_string(),
                ts: ts.0,
                history,
                scans: metrics.scans.load(Ordering::Relaxed),
                collection: found,
            };
            emit(cli.format, &report, || {
                ui.section(
                    "Point-in-time",
                    [
                        ("target", report.target.clone()),
                        ("ts", report.ts.to_string()),
                        ("history", report.history.to_string()),
                        ("durable scans", report.scans.to_string()),
                    ],
                );
                match &report.collection {
                    Some(collection) => print_collection(&ui, collection),
                    None => ui.info(&format!("{} did not exist at {}", report.target, ts)),
                }
            })?;
            if report.collection.is_none() {
                return Ok(2);
            }
        }
        Command::Stats => {
            let version = catalog.current(&ctx);
            let report = StatsReport {
                collections: version.stats(),
                pending: version.registry().pending_len(),
                history_keys: version.history().key_count(),
                oldest_maintained: version.history().oldest_maintained().0,
                generation: catalog.manager().generation(),
                epoch: catalog.epoch(),
                versions_published: metrics.versions_published.load(Ordering::Relaxed),
                stable: stable.map(|ts| ts.0),
            };
            emit(cli.format, &report, || {
                ui.section(
                    "Collections",
                    [
                        ("user", report.collections.user_collections),
                        ("capped", report.collections.user_capped),
                        ("clustered", report.collections.user_clustered),
                        ("internal", report.collections.internal),
                        ("pending", report.pending),
                    ],
                );
                ui.section(
                    "History",
                    [
                        ("keys", report.history_keys.to_string()),
                        ("oldest maintained", report.oldest_maintained.to_string()),
                        (
                            "stable",
                            report.stable.map_or_else(|| "-".to_string(), |ts| ts.to_string()),
                        ),
                    ],
                );
                ui.section(
                    "Versions",
                    [
                        ("generation", report.generation),
                        ("epoch", report.epoch),
                        ("published", report.versions_published),
                    ],
                );
            })?;
        }
        Command::Views { db } => {
            let db = DatabaseName::new(db)?;
            let reload = catalog.open_database(&ctx, &db)?;
            let version = catalog.current(&ctx);
            let set = version.views().database(&db);
            let report = ViewsReport {
                db: db.to_string(),
                valid: set.is_some_and(|set| set.is_valid()),
                stats: catalog.view_stats(&ctx, &db).unwrap_or_default(),
                views: set
                    .map(|set| {
                        set.iter()
                            .map(|view| ViewReport {
                                name: view.name.to_string(),
                                view_on: view.view_on.to_string(),
                                stages: view.pipeline.len(),
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
                error: reload.and_then(|reload| reload.error.map(|err| err.to_string())),
            };
            emit(cli.format, &report, || {
                ui.list(
                    &format!("Views of {}", report.db),
                    report
                        .views
                        .iter()
                        .map(|v| format!("{} on {} ({} stages)", v.name, v.view_on, v.stages)),
                );
                if let Some(err) = &report.error {
                    ui.warn(&format!("view set is invalid: {err}"));
                }
            })?;
            if !report.valid {
                return Ok(2);
            }
        }
    }
    Ok(0)
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_collection(ui: &Ui, report: &CollectionReport) {
    ui.section(
        &report.namespace,
        [
            ("id", report.id.clone()),
            ("catalog id", report.catalog_id.to_string()),
            ("ident", report.ident.clone()),
            ("capped", report.capped.to_string()),
            ("clustered", report.clustered.to_string()),
            (
                "min valid",
                report
                    .min_valid
                    .map_or_else(|| "-".to_string(), |ts| ts.to_string()),
            ),
        ],
    );
    ui.list(
        "Indexes",
        report.indexes.iter().map(|index| {
            let mut line = format!("{} [{}]", index.name, index.ident);
            if index.multikey {
                line.push_str(" multikey");
            }
            if !index.ready {
                line.push_str(" building");
            }
            line
        }),
    );
}

#[derive(Serialize)]
struct CollectionReport {
    namespace: String,
    id: String,
    catalog_id: u64,
    ident: String,
    capped: bool,
    clustered: bool,
    min_valid: Option<u64>,
    indexes: Vec<IndexReport>,
}

impl From<&Collection> for CollectionReport {
    fn from(collection: &Collection) -> Self {
        let options = collection.options();
        Self {
            namespace: collection.namespace().to_string(),
            id: collection.id().to_string(),
            catalog_id: collection.catalog_id().0,
            ident: collection.ident().to_string(),
            capped: options.capped,
            clustered: options.clustered,
            min_valid: collection.min_valid().map(|ts| ts.0),
            indexes: collection
                .indexes()
                .iter()
                .map(|index| IndexReport {
                    name: index.name.clone(),
                    ident: index.ident.to_string(),
                    multikey: index.multikey,
                    ready: index.ready,
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct IndexReport {
    name: String,
    ident: String,
    multikey: bool,
    ready: bool,
}

#[derive(Serialize)]
struct PointInTimeReport {
    target: String,
    ts: u64,
    history: &'static str,
    scans: u64,
    collection: Option<CollectionReport>,
}

#[derive(Serialize)]
struct StatsReport {
    collections: CatalogStats,
    pending: usize,
    history_keys: usize,
    oldest_maintained: u64,
    generation: u64,
    epoch: u64,
    versions_published: u64,
    stable: Option<u64>,
}

#[derive(Serialize)]
struct ViewsReport {
    db: String,
    valid: bool,
    stats: ViewStats,
    views: Vec<ViewReport>,
    error: Option<String>,
}

#[derive(Serialize)]
struct ViewReport {
    name: String,
    view_on: String,
    stages: usize,
}
