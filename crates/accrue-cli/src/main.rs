use std::path::PathBuf;

use accrue_core::{KeySpec, Schema};
use accrue_merge::{
    archive_dataset, build_run_snapshot, run_merge, run_merge_for_dataset, write_run_snapshot,
    AccrueConfig, MergeRequest,
};
use accrue_storage::ArchiveRotator;
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "accrue")]
#[command(about = "Incremental, deduplicating accumulation of cleaned CSV batches")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge a clean batch into an accumulated dataset.
    Merge(MergeArgs),
    /// Copy a canonical raw snapshot to its date-stamped archive path.
    Archive(ArchiveArgs),
    /// Write the per-day run manifest for all registered canonical files.
    Snapshot {
        #[arg(long, default_value = "")]
        notes: String,
    },
}

#[derive(Debug, Args)]
struct MergeArgs {
    /// Registered dataset name from the registry file.
    #[arg(long, conflicts_with_all = ["new", "dest", "manifest", "key"])]
    dataset: Option<String>,
    /// New clean batch CSV.
    #[arg(long, required_unless_present = "dataset")]
    new: Option<PathBuf>,
    /// Accumulated CSV.
    #[arg(long, required_unless_present = "dataset")]
    dest: Option<PathBuf>,
    /// Manifest JSON.
    #[arg(long, required_unless_present = "dataset")]
    manifest: Option<PathBuf>,
    /// Key columns, comma separated.
    #[arg(long, required_unless_present = "dataset")]
    key: Option<String>,
    #[arg(long, conflicts_with = "dataset")]
    sort_by: Option<String>,
    /// Expected column set of every batch.
    #[arg(long, conflicts_with = "dataset")]
    columns: Option<String>,
    #[arg(long)]
    batch_id: Option<String>,
}

#[derive(Debug, Args)]
struct ArchiveArgs {
    #[arg(long, conflicts_with_all = ["path", "name", "archive_dir"])]
    dataset: Option<String>,
    /// Canonical raw file about to be overwritten.
    #[arg(long, required_unless_present = "dataset")]
    path: Option<PathBuf>,
    #[arg(long, required_unless_present = "dataset")]
    name: Option<String>,
    #[arg(long, required_unless_present = "dataset")]
    archive_dir: Option<PathBuf>,
    /// Archive date (YYYY-MM-DD); defaults to today in UTC.
    #[arg(long)]
    as_of: Option<NaiveDate>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AccrueConfig::from_env();
    tracing::debug!(
        root = %config.workspace_root.display(),
        registry = %config.registry_path.display(),
        "loaded configuration"
    );

    match cli.command {
        Commands::Merge(args) => {
            let report = match args.dataset.clone() {
                Some(name) if args.batch_id.is_none() => run_merge_for_dataset(&config, &name)?,
                Some(name) => {
                    let registry = config.load_registry()?;
                    let mut request = registry.get(&name)?.merge_request(&config)?;
                    request.batch_id = args.batch_id;
                    run_merge(&request, Utc::now()).with_context(|| format!("merging dataset `{name}`"))?
                }
                None => {
                    let request = explicit_merge_request(args)?;
                    run_merge(&request, Utc::now())?
                }
            };
            println!("{}", report.summary_line());
        }
        Commands::Archive(args) => {
            let as_of = args.as_of.unwrap_or_else(|| Utc::now().date_naive());
            let archived = match args.dataset {
                Some(name) => archive_dataset(&config, &name, as_of)?,
                None => {
                    let (Some(path), Some(name), Some(dir)) = (args.path, args.name, args.archive_dir) else {
                        return Err(anyhow!("--path, --name and --archive-dir are required without --dataset"));
                    };
                    ArchiveRotator::new(dir).preserve(&path, &name, as_of)?
                }
            };
            match archived {
                Some(snapshot) if snapshot.deduplicated => {
                    println!("ARCHIVE: unchanged {}", snapshot.archive_path.display())
                }
                Some(snapshot) => println!(
                    "ARCHIVE: wrote {} ({} bytes, sha256={})",
                    snapshot.archive_path.display(),
                    snapshot.byte_size,
                    snapshot.content_hash
                ),
                None => println!("ARCHIVE: no canonical file to preserve"),
            }
        }
        Commands::Snapshot { notes } => {
            let now = Utc::now();
            let registry = config.load_registry()?;
            let snapshot = build_run_snapshot(&config, &registry, &notes, now)?;
            let path = write_run_snapshot(&config, &snapshot, now)?;
            println!("SNAPSHOT: wrote {}", path.display());
        }
    }

    Ok(())
}

fn explicit_merge_request(args: MergeArgs) -> Result<MergeRequest> {
    let (Some(batch_path), Some(accumulated_path), Some(manifest_path), Some(key)) =
        (args.new, args.dest, args.manifest, args.key)
    else {
        return Err(anyhow!("--new, --dest, --manifest and --key are required without --dataset"));
    };
    let columns = column_list(args.columns.as_deref());
    let declared_schema = if columns.is_empty() {
        None
    } else {
        Some(
            Schema::new(columns)
                .map_err(|dup| anyhow!("--columns lists `{dup}` more than once"))?,
        )
    };
    Ok(MergeRequest {
        batch_path,
        accumulated_path,
        manifest_path,
        key: KeySpec::parse(&key)?,
        sort_by: column_list(args.sort_by.as_deref()),
        declared_schema,
        batch_id: args.batch_id,
    })
}

fn column_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}
