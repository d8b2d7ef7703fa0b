//! Georoute CLI
//!
//! - `ask`: answer a geospatial question end to end
//! - `tables` / `hierarchy`: browse the taxonomy
//! - `schema`: show the columns of a physical table
//! - `validate`: run the read-only SQL checks on a statement

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use georoute_catalog::{SchemaCatalog, TaxonomyCatalog, TaxonomyNode, TaxonomySnapshot};
use georoute_resolver::{
    LlmClassifier, Pipeline, PipelineConfig, ResultEnvelope, UnifiedClient,
};
use georoute_sql::{feature_collection, validate, Dialect, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "georoute")]
#[command(author, version, about = "Georoute: natural-language questions over a geospatial table catalog")]
struct Cli {
    #[command(flatten)]
    sources: Sources,
    /// More logging (-v info, -vv debug). `RUST_LOG` wins when set.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Sources {
    /// SQLite database holding the taxonomy tables (and possibly the data)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Taxonomy as a JSON catalog file instead of database tables
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
    /// SQLite database with the physical tables, attached as the namespace
    #[arg(long, global = true)]
    data: Option<PathBuf>,
    /// Namespace of the physical tables (default from GEOROUTE_NAMESPACE)
    #[arg(long, global = true)]
    namespace: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question: category → card → table → SQL → rows.
    Ask {
        question: String,
        /// Maximum rows to return
        #[arg(long)]
        limit: Option<u32>,
        /// Per-stage classifier timeout in seconds
        #[arg(long)]
        stage_timeout: Option<u64>,
        /// Print the raw envelope as JSON
        #[arg(long)]
        json: bool,
        /// Print the rows as a GeoJSON FeatureCollection, taking geometry from this column
        #[arg(long, value_name = "COLUMN", conflicts_with = "json")]
        geojson: Option<String>,
    },
    /// List active tables, optionally filtered by keyword.
    Tables {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print the category → card → table tree.
    Hierarchy {
        #[arg(long)]
        json: bool,
    },
    /// Show the columns of a physical table.
    Schema {
        table: String,
        #[arg(long)]
        json: bool,
    },
    /// Check a statement against the read-only SQL rules.
    Validate { sql: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let mut config = PipelineConfig::from_env().context("invalid GEOROUTE_* configuration")?;
    // the only store the CLI opens is SQLite
    config.dialect = Dialect::Sqlite;
    if let Some(namespace) = &cli.sources.namespace {
        georoute_sql::quote_ident(namespace).context("invalid --namespace")?;
        config.namespace = namespace.clone();
    }

    match cli.command {
        Commands::Ask {
            question,
            limit,
            stage_timeout,
            json,
            geojson,
        } => {
            if let Some(secs) = stage_timeout {
                config.stage_timeout = Duration::from_secs(secs.max(1));
            }
            cmd_ask(&cli.sources, config, &question, limit, json, geojson.as_deref())
        }
        Commands::Tables { search, json } => cmd_tables(&cli.sources, &config, search.as_deref(), json),
        Commands::Hierarchy { json } => cmd_hierarchy(&cli.sources, &config, json),
        Commands::Schema { table, json } => cmd_schema(&cli.sources, &config, &table, json),
        Commands::Validate { sql } => cmd_validate(&sql),
    }
}

fn init_logging(verbose: u8) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        })
    })?;
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to install logger: {e}"))
}

// ============================================================================
// Sources
// ============================================================================

fn open_store(sources: &Sources, config: &PipelineConfig) -> Result<SqliteStore> {
    let store = match &sources.db {
        Some(path) => SqliteStore::open_read_only(path)
            .with_context(|| format!("failed to open database {}", path.display()))?,
        None => SqliteStore::open_in_memory().context("failed to open in-memory database")?,
    };
    match &sources.data {
        Some(path) => store
            .attach(&config.namespace, Some(path.as_path()))
            .with_context(|| format!("failed to attach {} as `{}`", path.display(), config.namespace)),
        None => Ok(store),
    }
}

fn load_taxonomy(sources: &Sources, store: &SqliteStore) -> Result<TaxonomySnapshot> {
    let snapshot = match (&sources.catalog, &sources.db) {
        (Some(path), _) => TaxonomySnapshot::from_path(path)
            .with_context(|| format!("failed to load catalog {}", path.display()))?,
        (None, Some(_)) => store
            .load_taxonomy()
            .context("failed to load taxonomy tables from the database")?,
        (None, None) => return Err(anyhow!("no taxonomy source; pass --catalog or --db")),
    };
    tracing::info!(tables = snapshot.active_table_count(), "taxonomy loaded");
    Ok(snapshot)
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_ask(
    sources: &Sources,
    config: PipelineConfig,
    question: &str,
    limit: Option<u32>,
    json: bool,
    geojson: Option<&str>,
) -> Result<()> {
    let store = open_store(sources, &config)?;
    let taxonomy = Arc::new(load_taxonomy(sources, &store)?);
    let client = UnifiedClient::from_env().context("failed to configure LLM provider")?;
    let classifier = Arc::new(LlmClassifier::new(Arc::new(client)));
    let pipeline = Pipeline::from_parts(taxonomy, Arc::new(store), classifier, config);

    let outcome = runtime()?.block_on(async {
        let cancel = async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        pipeline.run_until(question, limit, cancel).await
    });

    match outcome {
        Ok(envelope) => match geojson {
            Some(geom_field) => {
                let collection = feature_collection(&envelope.results, geom_field);
                println!("{}", serde_json::to_string_pretty(&collection)?);
            }
            None if json => println!("{}", serde_json::to_string_pretty(&envelope)?),
            None => print_answer(&envelope),
        },
        Err(envelope) if json => {
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            std::process::exit(1);
        }
        Err(envelope) => {
            for line in &envelope.reasoning {
                eprintln!("  {} {line}", "·".dimmed());
            }
            return Err(anyhow!("{}: {}", envelope.code, envelope.detail));
        }
    }
    Ok(())
}

fn print_answer(envelope: &ResultEnvelope) {
    println!("{}", "Reasoning".green().bold());
    for line in &envelope.reasoning {
        println!("  {} {line}", "·".dimmed());
    }
    println!("{} {}", "SQL".green().bold(), envelope.sql);
    if envelope.is_fallback {
        println!("{}", "(answered with the SELECT * fallback)".yellow());
    }
    println!(
        "{} {} row(s) via {}",
        "Results".green().bold(),
        envelope.results.len(),
        envelope.model_used
    );
    for row in &envelope.results {
        println!("  {}", serde_json::Value::Object(row.clone()));
    }
}

fn cmd_tables(sources: &Sources, config: &PipelineConfig, search: Option<&str>, json: bool) -> Result<()> {
    let store = open_store(sources, config)?;
    let taxonomy = load_taxonomy(sources, &store)?;
    let tables = match search {
        Some(keyword) => taxonomy.search_tables(keyword),
        None => taxonomy.all_tables(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&tables)?);
        return Ok(());
    }
    for table in &tables {
        print_table_line(table);
    }
    eprintln!("{} {} table(s)", "found".green().bold(), tables.len());
    Ok(())
}

fn print_table_line(table: &TaxonomyNode) {
    let physical = table.physical_name().unwrap_or("?");
    let summary = table
        .table
        .as_ref()
        .and_then(|detail| detail.summary.as_deref())
        .unwrap_or("");
    println!("{:>6}  {}  {}  {}", table.id, physical.bold(), table.name, summary.dimmed());
}

fn cmd_hierarchy(sources: &Sources, config: &PipelineConfig, json: bool) -> Result<()> {
    let store = open_store(sources, config)?;
    let taxonomy = load_taxonomy(sources, &store)?;
    let tree = taxonomy.hierarchy().context("failed to walk the taxonomy")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tree)?);
        return Ok(());
    }
    for branch in &tree {
        println!("{} {}", branch.category.name.green().bold(), format!("({})", branch.category.id).dimmed());
        for card in &branch.cards {
            println!("  {} {}", card.card.name.cyan(), format!("({})", card.card.id).dimmed());
            for table in &card.tables {
                println!(
                    "    {} {}",
                    table.physical_name().unwrap_or("?"),
                    format!("({})", table.name).dimmed()
                );
            }
        }
    }
    Ok(())
}

fn cmd_schema(sources: &Sources, config: &PipelineConfig, table: &str, json: bool) -> Result<()> {
    let store = Arc::new(open_store(sources, config)?);
    let schemas = SchemaCatalog::new(store).with_timeout(config.store_timeout);
    let schema = runtime()?
        .block_on(schemas.columns_of(table))
        .with_context(|| format!("failed to introspect `{table}`"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(schema.as_ref())?);
        return Ok(());
    }
    println!("{}", schema.table.bold());
    for column in &schema.columns {
        let marker = if column.is_geometry() { "◆".green() } else { " ".normal() };
        let null = if column.nullable { "" } else { " not null" };
        println!("  {marker} {:<24} {}{}", column.name, column.display_type(), null.dimmed());
    }
    Ok(())
}

fn cmd_validate(sql: &str) -> Result<()> {
    match validate(sql) {
        Ok(()) => {
            println!("{}", "Valid.".green());
            Ok(())
        }
        Err(rejected) => Err(anyhow!("rejected: {rejected}")),
    }
}
