//! Accumulation pipeline: dedup-merge of clean batches into long-lived datasets.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;

use accrue_core::{
    bind_sort_columns, AccrueError, AccrueResult, Dataset, KeySpec, Manifest, Schema,
};
use accrue_storage::{
    file_sha256, is_plain_stem, read_batch, read_dataset, stage_dataset, sync_dir, write_atomic,
    ArchiveRotator, ArchivedSnapshot, ManifestStore, PriorGeneration,
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "accrue-merge";

#[derive(Debug, Clone)]
pub struct AccrueConfig {
    pub workspace_root: PathBuf,
    pub registry_path: PathBuf,
    pub snapshot_dir: PathBuf,
}

impl AccrueConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("ACCRUE_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let registry_path = std::env::var("ACCRUE_REGISTRY")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("datasets.yaml"));
        let snapshot_dir = std::env::var("ACCRUE_SNAPSHOT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/raw/snapshots"));
        Self::with_root(workspace_root, registry_path, snapshot_dir)
    }

    pub fn with_root(
        workspace_root: impl Into<PathBuf>,
        registry_path: impl AsRef<Path>,
        snapshot_dir: impl AsRef<Path>,
    ) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            registry_path: resolve_under(&workspace_root, registry_path.as_ref()),
            snapshot_dir: resolve_under(&workspace_root, snapshot_dir.as_ref()),
            workspace_root,
        }
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        resolve_under(&self.workspace_root, path)
    }

    pub fn load_registry(&self) -> Result<DatasetRegistry> {
        DatasetRegistry::load(&self.registry_path)
    }
}

fn resolve_under(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRegistry {
    pub datasets: Vec<DatasetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    pub key: Vec<String>,
    #[serde(default)]
    pub sort_by: Vec<String>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    pub batch: PathBuf,
    pub accumulated: PathBuf,
    pub manifest: PathBuf,
    #[serde(default)]
    pub canonical: Option<PathBuf>,
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
}

impl DatasetRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        let mut names = HashSet::new();
        for dataset in &registry.datasets {
            if !names.insert(dataset.name.as_str()) {
                bail!("dataset `{}` is registered more than once", dataset.name);
            }
            if !is_plain_stem(&dataset.name) {
                bail!("dataset name `{}` must be a plain file stem", dataset.name);
            }
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Result<&DatasetConfig> {
        self.datasets
            .iter()
            .find(|d| d.name == name)
            .with_context(|| {
                let known = self
                    .datasets
                    .iter()
                    .map(|d| d.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("no dataset named `{name}` (registered: {known})")
            })
    }
}

impl DatasetConfig {
    pub fn merge_request(&self, config: &AccrueConfig) -> Result<MergeRequest> {
        let key = KeySpec::new(self.key.clone())
            .with_context(|| format!("key for dataset `{}`", self.name))?;
        let declared_schema = match &self.columns {
            Some(columns) => Some(Schema::new(columns.clone()).map_err(|dup| {
                anyhow::anyhow!("dataset `{}` declares column `{dup}` twice", self.name)
            })?),
            None => None,
        };
        Ok(MergeRequest {
            batch_path: config.resolve(&self.batch),
            accumulated_path: config.resolve(&self.accumulated),
            manifest_path: config.resolve(&self.manifest),
            key,
            sort_by: self.sort_by.clone(),
            declared_schema,
            batch_id: None,
        })
    }

    pub fn canonical_path(&self, config: &AccrueConfig) -> Option<PathBuf> {
        self.canonical.as_deref().map(|p| config.resolve(p))
    }

    /// Archive location defaults to an `archive/` directory beside the canonical file.
    pub fn archive_rotator(&self, config: &AccrueConfig) -> Option<ArchiveRotator> {
        let dir = match (&self.archive_dir, self.canonical_path(config)) {
            (Some(dir), _) => config.resolve(dir),
            (None, Some(canonical)) => canonical
                .parent()
                .map(|p| p.join("archive"))
                .unwrap_or_else(|| PathBuf::from("archive")),
            (None, None) => return None,
        };
        Some(ArchiveRotator::new(dir))
    }
}

#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub batch_path: PathBuf,
    pub accumulated_path: PathBuf,
    pub manifest_path: PathBuf,
    pub key: KeySpec,
    pub sort_by: Vec<String>,
    pub declared_schema: Option<Schema>,
    /// Defaults to `{batch file name}@{sha256 prefix}`.
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub batch_id: String,
    pub rows_before: usize,
    pub rows_in_batch: usize,
    pub rows_added: usize,
    pub rows_skipped: usize,
    pub row_count: usize,
}

impl MergeReport {
    pub fn summary_line(&self) -> String {
        format!(
            "ACCUMULATE: before={} new={} added={} skipped={} after={}",
            self.rows_before, self.rows_in_batch, self.rows_added, self.rows_skipped, self.row_count
        )
    }
}

/// Accumulated dataset and manifest of one generation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Generation {
    pub dataset: Dataset,
    pub manifest: Manifest,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub report: MergeReport,
    /// `None` when the batch was empty and nothing needs committing.
    pub next: Option<Generation>,
}

/// First-write-wins dedup merge over in-memory generations.
#[derive(Debug, Clone)]
pub struct AccumulationEngine {
    key: KeySpec,
    sort_by: Vec<String>,
    declared_schema: Option<Schema>,
}

impl AccumulationEngine {
    pub fn new(key: KeySpec) -> Self {
        Self {
            key,
            sort_by: Vec::new(),
            declared_schema: None,
        }
    }

    pub fn with_sort_by(mut self, sort_by: Vec<String>) -> Self {
        self.sort_by = sort_by;
        self
    }

    pub fn with_declared_schema(mut self, schema: Option<Schema>) -> Self {
        self.declared_schema = schema;
        self
    }

    /// Pairs the loaded dataset and manifest, failing on any disagreement between them.
    pub fn open_generation(
        &self,
        dataset: Option<Dataset>,
        manifest: Option<Manifest>,
        dataset_path: &Path,
        manifest_path: &Path,
    ) -> AccrueResult<Generation> {
        let (dataset, manifest) = match (dataset, manifest) {
            (None, None) => return Ok(Generation::default()),
            (Some(_), None) => {
                return Err(AccrueError::manifest_corruption(
                    manifest_path,
                    format!(
                        "manifest is missing but accumulated dataset {} exists",
                        dataset_path.display()
                    ),
                ))
            }
            (None, Some(_)) => {
                return Err(AccrueError::manifest_corruption(
                    manifest_path,
                    format!(
                        "manifest exists but accumulated dataset {} is missing",
                        dataset_path.display()
                    ),
                ))
            }
            (Some(dataset), Some(manifest)) => (dataset, manifest),
        };

        if let Some(declared) = &self.declared_schema {
            declared.projection_from(dataset.schema(), dataset_path)?;
        }
        let key = self.key.bind(dataset.schema(), dataset_path)?;
        let dataset_keys = key
            .key_set(&dataset)
            .map_err(|reason| AccrueError::manifest_corruption(manifest_path, reason))?;
        manifest
            .check_consistency(&dataset_keys, dataset.len())
            .map_err(|reason| AccrueError::manifest_corruption(manifest_path, reason))?;

        Ok(Generation { dataset, manifest })
    }

    pub fn merge(
        &self,
        generation: Generation,
        batch: Dataset,
        batch_path: &Path,
        batch_id: &str,
        now: DateTime<Utc>,
    ) -> AccrueResult<MergeOutcome> {
        let Generation {
            dataset: mut accumulated,
            mut manifest,
        } = generation;
        let rows_before = accumulated.len();

        if batch.is_empty() {
            return Ok(MergeOutcome {
                report: MergeReport {
                    batch_id: batch_id.to_string(),
                    rows_before,
                    rows_in_batch: 0,
                    rows_added: 0,
                    rows_skipped: 0,
                    row_count: rows_before,
                },
                next: None,
            });
        }

        let established = if !accumulated.schema().is_empty() {
            accumulated.schema().clone()
        } else if let Some(declared) = &self.declared_schema {
            declared.clone()
        } else {
            batch.schema().clone()
        };
        if let Some(declared) = &self.declared_schema {
            declared.projection_from(batch.schema(), batch_path)?;
        }
        let projection = established.projection_from(batch.schema(), batch_path)?;
        let key = self.key.bind(&established, batch_path)?;
        let sort_indices = bind_sort_columns(&established, &self.sort_by, batch_path)?;

        if accumulated.schema().is_empty() {
            accumulated = Dataset::empty(established);
        }

        let (_, batch_records) = batch.into_parts();
        let rows_in_batch = batch_records.len();
        let mut rows_added = 0usize;
        let mut rows_skipped = 0usize;

        for record in batch_records {
            let record = record.project(&projection);
            let token = key.key_for(&record);
            if manifest.contains_key(&token) {
                rows_skipped += 1;
                continue;
            }
            manifest.keys_seen.insert(token);
            accumulated.push(record);
            rows_added += 1;
        }

        if !sort_indices.is_empty() {
            accumulated.sort_by_columns(&sort_indices);
        }

        manifest.row_count = accumulated.len() as u64;
        if !manifest.record_source(batch_id) {
            warn!(batch_id, "batch id already recorded in manifest sources");
        }
        manifest.last_updated = now;

        Ok(MergeOutcome {
            report: MergeReport {
                batch_id: batch_id.to_string(),
                rows_before,
                rows_in_batch,
                rows_added,
                rows_skipped,
                row_count: accumulated.len(),
            },
            next: Some(Generation {
                dataset: accumulated,
                manifest,
            }),
        })
    }
}

/// Stages both files, then renames the dataset first and the manifest last.
///
/// If the manifest rename fails the previous dataset is put back, so the pair on disk is
/// either entirely the new generation or entirely the old one.
pub fn commit_generation(
    generation: &Generation,
    dataset_path: &Path,
    manifest_store: &ManifestStore,
) -> AccrueResult<()> {
    let staged_dataset = stage_dataset(&generation.dataset, dataset_path)?;
    let staged_manifest = manifest_store.stage(&generation.manifest)?;
    let prior = PriorGeneration::hold(dataset_path)?;

    let dataset_dir = staged_dataset.persist()?;
    let manifest_dir = match staged_manifest.persist() {
        Ok(dir) => dir,
        Err(err) => {
            if let Err(restore_err) = prior.restore() {
                error!(
                    dataset = %dataset_path.display(),
                    error = %restore_err,
                    "could not restore prior dataset after failed manifest commit"
                );
            }
            return Err(err);
        }
    };
    drop(prior);

    sync_dir(&dataset_dir)?;
    if manifest_dir != dataset_dir {
        sync_dir(&manifest_dir)?;
    }
    Ok(())
}

pub fn default_batch_id(batch_path: &Path) -> AccrueResult<String> {
    let name = batch_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| batch_path.display().to_string());
    let hash = file_sha256(batch_path)?;
    Ok(format!("{name}@{}", &hash[..12]))
}

/// Load, merge and commit one batch. Any error leaves the previous generation in place.
pub fn run_merge(request: &MergeRequest, now: DateTime<Utc>) -> AccrueResult<MergeReport> {
    let run_id = Uuid::new_v4();
    let span = info_span!("merge", %run_id, batch = %request.batch_path.display());
    let _guard = span.enter();

    let engine = AccumulationEngine::new(request.key.clone())
        .with_sort_by(request.sort_by.clone())
        .with_declared_schema(request.declared_schema.clone());
    let manifest_store = ManifestStore::new(&request.manifest_path);

    let dataset = read_dataset(&request.accumulated_path)?;
    let manifest = manifest_store.load_existing()?;
    let generation = engine.open_generation(
        dataset,
        manifest,
        &request.accumulated_path,
        &request.manifest_path,
    )?;

    let batch = read_batch(&request.batch_path)?;
    let batch_id = match &request.batch_id {
        Some(id) => id.clone(),
        None => default_batch_id(&request.batch_path)?,
    };

    let outcome = engine.merge(generation, batch, &request.batch_path, &batch_id, now)?;
    match &outcome.next {
        Some(next) => commit_generation(next, &request.accumulated_path, &manifest_store)?,
        None => info!("empty batch; accumulated dataset left untouched"),
    }

    let report = outcome.report;
    info!(
        batch_id = %report.batch_id,
        rows_before = report.rows_before,
        rows_added = report.rows_added,
        rows_skipped = report.rows_skipped,
        row_count = report.row_count,
        "merge committed"
    );
    Ok(report)
}

pub fn run_merge_for_dataset(config: &AccrueConfig, name: &str) -> Result<MergeReport> {
    let registry = config.load_registry()?;
    let request = registry.get(name)?.merge_request(config)?;
    run_merge(&request, Utc::now()).with_context(|| format!("merging dataset `{name}`"))
}

/// Preserves a registered dataset's canonical raw file before ingestion overwrites it.
pub fn archive_dataset(
    config: &AccrueConfig,
    name: &str,
    as_of: NaiveDate,
) -> Result<Option<ArchivedSnapshot>> {
    let registry = config.load_registry()?;
    let dataset = registry.get(name)?;
    let (Some(canonical), Some(rotator)) =
        (dataset.canonical_path(config), dataset.archive_rotator(config))
    else {
        bail!("dataset `{name}` has no canonical raw file configured");
    };
    Ok(rotator.preserve(&canonical, &dataset.name, as_of)?)
}

/// Per-day summary of the canonical raw files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub timestamp: String,
    pub tickers_covered: Vec<String>,
    pub row_counts: BTreeMap<String, u64>,
    pub tool_version: String,
    pub git_commit: String,
    pub notes: String,
}

pub fn build_run_snapshot(
    config: &AccrueConfig,
    registry: &DatasetRegistry,
    notes: &str,
    now: DateTime<Utc>,
) -> Result<RunSnapshot> {
    let mut row_counts = BTreeMap::new();
    let mut tickers = BTreeSet::new();

    for entry in &registry.datasets {
        let Some(canonical) = entry.canonical_path(config) else {
            continue;
        };
        let dataset = read_dataset(&canonical)
            .with_context(|| format!("reading canonical file for `{}`", entry.name))?;
        let rows = dataset.as_ref().map(Dataset::len).unwrap_or(0);
        row_counts.insert(entry.name.clone(), rows as u64);

        if let Some(dataset) = &dataset {
            if let Some(idx) = dataset.schema().index_of("ticker") {
                tickers.extend(
                    dataset
                        .records()
                        .iter()
                        .filter_map(|r| r.get(idx))
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string),
                );
            }
        }
    }

    Ok(RunSnapshot {
        timestamp: now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        tickers_covered: tickers.into_iter().collect(),
        row_counts,
        tool_version: env!("CARGO_PKG_VERSION").to_string(),
        git_commit: git_commit_short(&config.workspace_root),
        notes: notes.to_string(),
    })
}

pub fn write_run_snapshot(
    config: &AccrueConfig,
    snapshot: &RunSnapshot,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    let path = config
        .snapshot_dir
        .join(format!("run_manifest_{}.json", now.format("%Y-%m-%d")));
    let bytes = serde_json::to_vec_pretty(snapshot).context("serializing run snapshot")?;
    write_atomic(&path, &bytes)?;
    Ok(path)
}

fn git_commit_short(root: &Path) -> String {
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .current_dir(root)
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use accrue_core::Record;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn dataset(cols: &[&str], rows: &[&[&str]]) -> Dataset {
        let schema = Schema::new(cols.iter().map(|c| c.to_string()).collect()).unwrap();
        let records = rows
            .iter()
            .map(|r| r.iter().copied().collect::<Record>())
            .collect();
        Dataset::new(schema, records)
    }

    fn column(ds: &Dataset, name: &str) -> Vec<String> {
        let idx = ds.schema().index_of(name).unwrap();
        ds.records().iter().map(|r| r.get(idx).unwrap().to_string()).collect()
    }

    fn url_engine() -> AccumulationEngine {
        AccumulationEngine::new(KeySpec::new(["url"]).unwrap())
    }

    #[test]
    fn within_batch_duplicates_keep_first_occurrence() {
        let batch = dataset(
            &["url", "title"],
            &[&["a", "first a"], &["b", "b"], &["a", "second a"]],
        );
        let out = url_engine()
            .merge(Generation::default(), batch, Path::new("b1.csv"), "b1", ts())
            .unwrap();
        assert_eq!(out.report.rows_added, 2);
        assert_eq!(out.report.rows_skipped, 1);

        let next = out.next.unwrap();
        assert_eq!(column(&next.dataset, "title"), vec!["first a", "b"]);
        assert_eq!(next.manifest.row_count, 2);
        assert_eq!(next.manifest.sources, vec!["b1".to_string()]);
        assert_eq!(next.manifest.last_updated, ts());
    }

    #[test]
    fn second_batch_only_adds_unseen_keys() {
        let engine = url_engine();
        let first = engine
            .merge(
                Generation::default(),
                dataset(&["url"], &[&["a"], &["b"], &["a"]]),
                Path::new("b1.csv"),
                "b1",
                ts(),
            )
            .unwrap();
        let second = engine
            .merge(
                first.next.unwrap(),
                dataset(&["url"], &[&["b"], &["c"]]),
                Path::new("b2.csv"),
                "b2",
                ts(),
            )
            .unwrap();

        assert_eq!(second.report.rows_before, 2);
        assert_eq!(second.report.rows_added, 1);
        assert_eq!(second.report.rows_skipped, 1);
        assert_eq!(second.report.row_count, 3);
        let next = second.next.unwrap();
        assert_eq!(column(&next.dataset, "url"), vec!["a", "b", "c"]);
        assert_eq!(next.manifest.sources, vec!["b1".to_string(), "b2".to_string()]);
    }

    #[test]
    fn accepted_rows_are_never_replaced_by_later_batches() {
        let engine = AccumulationEngine::new(KeySpec::parse("date,ticker").unwrap());
        let cols = ["date", "ticker", "close"];
        let first = engine
            .merge(
                Generation::default(),
                dataset(&cols, &[&["2026-02-24", "AAPL", "180.0"]]),
                Path::new("p1.csv"),
                "p1",
                ts(),
            )
            .unwrap();
        let second = engine
            .merge(
                first.next.unwrap(),
                dataset(&cols, &[&["2026-02-24", "AAPL", "181.5"], &["2026-02-24", "MSFT", "410.0"]]),
                Path::new("p2.csv"),
                "p2",
                ts(),
            )
            .unwrap();
        let next = second.next.unwrap();
        assert_eq!(column(&next.dataset, "close"), vec!["180.0", "410.0"]);
    }

    #[test]
    fn reordered_batch_columns_are_aligned_to_established_schema() {
        let engine = AccumulationEngine::new(KeySpec::parse("date,ticker").unwrap());
        let first = engine
            .merge(
                Generation::default(),
                dataset(&["date", "ticker", "close"], &[&["2026-02-24", "AAPL", "180.0"]]),
                Path::new("p1.csv"),
                "p1",
                ts(),
            )
            .unwrap();
        let second = engine
            .merge(
                first.next.unwrap(),
                dataset(&["close", "ticker", "date"], &[&["411.0", "MSFT", "2026-02-25"]]),
                Path::new("p2.csv"),
                "p2",
                ts(),
            )
            .unwrap();
        let next = second.next.unwrap();
        assert_eq!(next.dataset.schema().columns(), ["date", "ticker", "close"]);
        assert_eq!(next.dataset.records()[1].values(), ["2026-02-25", "MSFT", "411.0"]);
    }

    #[test]
    fn schema_drift_is_fatal() {
        let engine = url_engine();
        let first = engine
            .merge(
                Generation::default(),
                dataset(&["url", "title"], &[&["a", "t"]]),
                Path::new("b1.csv"),
                "b1",
                ts(),
            )
            .unwrap();
        let err = engine
            .merge(
                first.next.unwrap(),
                dataset(&["url", "title", "tone"], &[&["b", "t", "0.1"]]),
                Path::new("b2.csv"),
                "b2",
                ts(),
            )
            .unwrap_err();
        assert!(matches!(err, AccrueError::SchemaMismatch { .. }));
        assert!(err.to_string().contains("b2.csv"));
    }

    #[test]
    fn missing_key_column_in_first_batch_is_fatal() {
        let err = AccumulationEngine::new(KeySpec::parse("date,ticker").unwrap())
            .merge(
                Generation::default(),
                dataset(&["date", "close"], &[&["2026-02-24", "1.0"]]),
                Path::new("p1.csv"),
                "p1",
                ts(),
            )
            .unwrap_err();
        match err {
            AccrueError::MissingKeyColumn { missing, .. } => assert_eq!(missing, vec!["ticker"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn declared_schema_is_enforced_on_first_batch() {
        let declared = Schema::new(vec!["url".into(), "title".into()]).unwrap();
        let err = url_engine()
            .with_declared_schema(Some(declared))
            .merge(
                Generation::default(),
                dataset(&["url"], &[&["a"]]),
                Path::new("b1.csv"),
                "b1",
                ts(),
            )
            .unwrap_err();
        assert!(matches!(err, AccrueError::SchemaMismatch { .. }));
    }

    #[test]
    fn sort_columns_order_output_and_keep_ties_stable() {
        let engine = AccumulationEngine::new(KeySpec::new(["id"]).unwrap())
            .with_sort_by(vec!["date".into()]);
        let out = engine
            .merge(
                Generation::default(),
                dataset(
                    &["id", "date"],
                    &[&["x", "2026-02-25"], &["y", "2026-02-24"], &["z", "2026-02-25"], &["w", "2026-02-24"]],
                ),
                Path::new("b.csv"),
                "b",
                ts(),
            )
            .unwrap();
        assert_eq!(column(&out.next.unwrap().dataset, "id"), vec!["y", "w", "x", "z"]);
    }

    #[test]
    fn unknown_sort_column_is_fatal() {
        let err = url_engine()
            .with_sort_by(vec!["seendate".into()])
            .merge(
                Generation::default(),
                dataset(&["url"], &[&["a"]]),
                Path::new("b.csv"),
                "b",
                ts(),
            )
            .unwrap_err();
        assert!(matches!(err, AccrueError::MissingSortColumn { .. }));
    }

    #[test]
    fn empty_batch_is_a_noop() {
        let out = url_engine()
            .merge(
                Generation::default(),
                dataset(&["url"], &[]),
                Path::new("b.csv"),
                "b",
                ts(),
            )
            .unwrap();
        assert!(out.next.is_none());
        assert_eq!(out.report.row_count, 0);
    }

    #[test]
    fn open_generation_rejects_half_present_state() {
        let engine = url_engine();
        let ds = dataset(&["url"], &[&["a"]]);
        let err = engine
            .open_generation(Some(ds), None, Path::new("acc.csv"), Path::new("m.json"))
            .unwrap_err();
        assert!(err.to_string().contains("manifest is missing"));

        let err = engine
            .open_generation(None, Some(Manifest::default()), Path::new("acc.csv"), Path::new("m.json"))
            .unwrap_err();
        assert!(matches!(err, AccrueError::ManifestCorruption { .. }));
    }

    #[test]
    fn open_generation_rejects_duplicate_keys_on_disk() {
        let ds = dataset(&["url"], &[&["a"], &["a"]]);
        let manifest = Manifest {
            keys_seen: ["a".to_string()].into_iter().collect(),
            row_count: 2,
            ..Default::default()
        };
        let err = url_engine()
            .open_generation(Some(ds), Some(manifest), Path::new("acc.csv"), Path::new("m.json"))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate key `a`"));
    }

    #[test]
    fn registry_parses_and_rejects_duplicates() {
        let yaml = r#"
datasets:
  - name: prices_daily
    key: [date, ticker]
    sort_by: [date, ticker]
    batch: data/clean/prices_daily_clean.csv
    accumulated: data/accumulated/prices_daily.csv
    manifest: data/accumulated/prices_daily.manifest.json
    canonical: data/raw/prices_daily.csv
"#;
        let registry = DatasetRegistry::parse(yaml).unwrap();
        let config = AccrueConfig::with_root("/srv/pipeline", "datasets.yaml", "data/raw/snapshots");
        let entry = registry.get("prices_daily").unwrap();
        let request = entry.merge_request(&config).unwrap();
        assert_eq!(request.key.columns(), ["date", "ticker"]);
        assert_eq!(
            request.accumulated_path,
            PathBuf::from("/srv/pipeline/data/accumulated/prices_daily.csv")
        );
        assert_eq!(
            entry.archive_rotator(&config).unwrap().archive_dir(),
            Path::new("/srv/pipeline/data/raw/archive")
        );
        assert!(registry.get("gdelt_articles").is_err());

        let dup = format!("{yaml}{}", yaml.replace("datasets:\n", ""));
        assert!(DatasetRegistry::parse(&dup).is_err());
    }
}
