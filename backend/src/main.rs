//! Onboard CLI - import affiliate member spreadsheets
//!
//! # Main Commands
//!
//! ```bash
//! onboard import members.csv --database-url postgres://...   # Run an import
//! onboard import members.csv --in-memory                     # Dry run against memory
//! onboard check members.csv                                  # Validate rows only
//! ```
//!
//! # Debug Commands
//!
//! ```bash
//! onboard parse members.csv        # Dump parsed rows as JSON
//! ```

use clap::{Parser, Subcommand};
use onboard::cleaner::WORK_EMAIL;
use onboard::{
    CancellationToken, CsvParser, DataCleaner, DomainBlacklist, ImportConfig, ImportError,
    ImportOrchestrator, MemoryStore, PgStore, RunOptions,
};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "onboard")]
#[command(about = "Bulk-onboard affiliate members from CSV", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a CSV file: upsert members, provision users, grant roles
    Import {
        /// Input CSV file
        input: PathBuf,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Default affiliate for rows without an affiliate_id
        #[arg(short, long)]
        affiliate: Option<Uuid>,

        /// Rows per chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Postgres URL (default: $DATABASE_URL)
        #[arg(long, conflicts_with = "in_memory")]
        database_url: Option<String>,

        /// Run against an in-memory store seeded with the mapped roles
        #[arg(long)]
        in_memory: bool,

        /// Report file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Include per-row results in the report
        #[arg(long)]
        results: bool,
    },

    /// Clean every row without writing anything and list the problems
    Check {
        /// Input CSV file
        input: PathBuf,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Parse a CSV file and output its rows as JSON
    Parse {
        /// Input CSV file
        input: PathBuf,

        /// CSV delimiter (auto-detect if not specified)
        #[arg(short, long)]
        delimiter: Option<char>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,onboard=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Import {
            input,
            config,
            affiliate,
            chunk_size,
            database_url,
            in_memory,
            output,
            results,
        } => {
            let config = load_config(config.as_deref(), affiliate, chunk_size);
            match config {
                Ok(config) => {
                    cmd_import(
                        &input,
                        &config,
                        database_url,
                        in_memory,
                        output.as_deref(),
                        results,
                    )
                    .await
                }
                Err(e) => Err(e.into()),
            }
        }

        Commands::Check { input, config } => cmd_check(&input, config.as_deref()),

        Commands::Parse {
            input,
            delimiter,
            output,
        } => cmd_parse(&input, delimiter, output.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("❌ Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(
    path: Option<&Path>,
    affiliate: Option<Uuid>,
    chunk_size: Option<usize>,
) -> Result<ImportConfig, ImportError> {
    let mut config = match path {
        Some(p) => ImportConfig::from_file(p)?,
        None => ImportConfig::default(),
    };
    config.apply_env()?;
    if let Some(affiliate) = affiliate {
        config.default_affiliate_id = affiliate;
    }
    if let Some(chunk_size) = chunk_size {
        config.chunk_size = chunk_size;
    }
    config.validate()?;
    Ok(config)
}

async fn cmd_import(
    input: &Path,
    config: &ImportConfig,
    database_url: Option<String>,
    in_memory: bool,
    output: Option<&Path>,
    with_results: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("📄 Importing: {}", input.display());

    let orchestrator = if in_memory {
        let store = Arc::new(MemoryStore::with_roles(config.role_map.all_role_names()));
        ImportOrchestrator::from_store(config, store)?
    } else {
        let url = database_url
            .or_else(|| env::var("DATABASE_URL").ok())
            .ok_or("DATABASE_URL is not set (use --database-url or --in-memory)")?;
        let store = PgStore::connect(&url).await?;
        store.migrate().await?;
        ImportOrchestrator::from_store(config, Arc::new(store))?
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("⚠️  Interrupted, stopping after the current chunk");
            on_signal.cancel();
        }
    });

    let file = fs::File::open(input)?;
    let options = RunOptions::new(config.chunk_size).with_cancel(cancel);
    let (summary, failure) = match orchestrator.run_with(file, options).await {
        Ok(summary) => (summary, None),
        Err(failure) => (failure.partial, Some(failure.error)),
    };

    eprintln!(
        "   Rows: {} (created {}, updated {}, skipped {}, failed {})",
        summary.total, summary.created, summary.updated, summary.skipped, summary.failed
    );

    let json = if with_results {
        serde_json::to_string_pretty(&summary)?
    } else {
        serde_json::to_string_pretty(&summary.report())?
    };
    write_output(&json, output)?;

    match failure {
        Some(error) => Err(error.into()),
        None => {
            eprintln!("✅ Done");
            Ok(())
        }
    }
}

fn cmd_check(input: &Path, config_path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("✔️  Checking: {}", input.display());

    let config = load_config(config_path, None, None)?;
    let parser = match config.delimiter {
        Some(d) => CsvParser::with_delimiter(d),
        None => CsvParser::new(),
    };
    let cleaner = DataCleaner::new(
        Arc::new(DomainBlacklist::new(&config.blacklisted_domains)),
        config.default_affiliate_id,
    );

    let rows = parser.open_path(input)?;
    if !rows.has_column(WORK_EMAIL) {
        return Err(ImportError::MissingColumn(WORK_EMAIL.to_string()).into());
    }

    let mut valid = 0;
    let mut invalid = 0;
    for row in rows {
        let cleaned = cleaner.clean(&row?);
        for warning in cleaned.warnings() {
            eprintln!("   ⚠️  line {}: {}", cleaned.line, warning);
        }
        if cleaned.has_blocking_errors() {
            invalid += 1;
            for err in cleaned.blocking_errors() {
                eprintln!("   ❌ line {}: {}", cleaned.line, err);
            }
        } else {
            valid += 1;
        }
    }

    eprintln!("\n📊 Results: {} valid, {} invalid", valid, invalid);

    if invalid > 0 {
        std::process::exit(1);
    }

    Ok(())
}

fn cmd_parse(
    input: &Path,
    delimiter: Option<char>,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("📄 Parsing CSV: {}", input.display());

    let parser = match delimiter {
        Some(d) => CsvParser::with_delimiter(d),
        None => CsvParser::new(),
    };
    let rows = parser.open_path(input)?;

    eprintln!(
        "   Delimiter: '{}'{}",
        rows.delimiter().escape_default(),
        if delimiter.is_none() { " (auto-detected)" } else { "" }
    );
    eprintln!("   Columns: {}", rows.headers().join(", "));

    let mut records = Vec::new();
    for row in rows {
        let row = row?;
        let values: serde_json::Map<String, serde_json::Value> = row
            .iter()
            .map(|(column, value)| (column.to_string(), value.into()))
            .collect();
        records.push(serde_json::json!({
            "line": row.line,
            "values": values,
            "warning": row.structural_warning,
        }));
    }
    eprintln!("✅ Parsed {} records", records.len());

    let json = serde_json::to_string_pretty(&records)?;
    write_output(&json, output)?;

    Ok(())
}

fn write_output(content: &str, path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    match path {
        Some(p) => {
            fs::write(p, content)?;
            eprintln!("💾 Output written to: {}", p.display());
        }
        None => {
            println!("{}", content);
        }
    }
    Ok(())
}
