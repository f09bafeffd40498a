//! Core tabular model, key binding and manifest value for the accumulation engine.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "accrue-core";

/// Joins the cells of a composite key. Not expected to appear in cleaned CSV text.
pub const KEY_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Error)]
pub enum AccrueError {
    #[error(
        "schema mismatch in {}: expected columns [{}], found [{}]",
        .path.display(),
        .expected.join(", "),
        .found.join(", ")
    )]
    SchemaMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("missing key column(s) [{}] in {}", .missing.join(", "), .path.display())]
    MissingKeyColumn { path: PathBuf, missing: Vec<String> },
    #[error("missing sort column(s) [{}] in {}", .missing.join(", "), .path.display())]
    MissingSortColumn { path: PathBuf, missing: Vec<String> },
    #[error("manifest corruption at {}: {reason}", .path.display())]
    ManifestCorruption { path: PathBuf, reason: String },
    #[error("malformed dataset {}: {reason}", .path.display())]
    MalformedDataset { path: PathBuf, reason: String },
    #[error("invalid key specification: {reason}")]
    InvalidKey { reason: String },
    #[error("dataset name `{name}` must be a plain file stem")]
    InvalidDatasetName { name: String },
    #[error("i/o failure on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type AccrueResult<T> = Result<T, AccrueError>;

impl AccrueError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn manifest_corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ManifestCorruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedDataset {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Ordered, duplicate-free list of column names shared by every record of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<String>,
}

impl Schema {
    /// Fails with the first repeated column name.
    pub fn new(columns: Vec<String>) -> Result<Self, String> {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(column.clone());
            }
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Resolves `wanted` to column indices, or returns every name that is absent.
    pub fn require_columns(&self, wanted: &[String]) -> Result<Vec<usize>, Vec<String>> {
        let mut indices = Vec::with_capacity(wanted.len());
        let mut missing = Vec::new();
        for name in wanted {
            match self.index_of(name) {
                Some(idx) => indices.push(idx),
                None => missing.push(name.clone()),
            }
        }
        if missing.is_empty() {
            Ok(indices)
        } else {
            Err(missing)
        }
    }

    /// For each of `self`'s columns, the position of the same column in `found`.
    ///
    /// Column sets must be equal; order may differ.
    pub fn projection_from(&self, found: &Schema, path: &Path) -> AccrueResult<Vec<usize>> {
        let mismatch = || AccrueError::SchemaMismatch {
            path: path.to_path_buf(),
            expected: self.columns.clone(),
            found: found.columns.clone(),
        };
        // Both sides are duplicate-free, so equal length plus containment is set equality.
        if self.len() != found.len() {
            return Err(mismatch());
        }
        found.require_columns(&self.columns).map_err(|_| mismatch())
    }
}

/// One row of a dataset: cell text aligned to the owning schema's column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    values: Vec<String>,
}

impl Record {
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn get(&self, idx: usize) -> Option<&str> {
        self.values.get(idx).map(String::as_str)
    }

    /// Reorders cells so that output position `i` holds input cell `indices[i]`.
    pub fn project(self, indices: &[usize]) -> Self {
        let mut cells: Vec<Option<String>> = self.values.into_iter().map(Some).collect();
        let values = indices
            .iter()
            .map(|&idx| cells.get_mut(idx).and_then(Option::take).unwrap_or_default())
            .collect();
        Self { values }
    }
}

impl<S: Into<String>> FromIterator<S> for Record {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::new(iter.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dataset {
    schema: Schema,
    records: Vec<Record>,
}

impl Dataset {
    pub fn new(schema: Schema, records: Vec<Record>) -> Self {
        Self { schema, records }
    }

    pub fn empty(schema: Schema) -> Self {
        Self::new(schema, Vec::new())
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn into_parts(self) -> (Schema, Vec<Record>) {
        (self.schema, self.records)
    }

    /// Stable ascending sort on the given column indices.
    pub fn sort_by_columns(&mut self, indices: &[usize]) {
        self.records.sort_by(|a, b| {
            indices
                .iter()
                .map(|&idx| compare_cells(a.get(idx).unwrap_or(""), b.get(idx).unwrap_or("")))
                .find(|ord| ord.is_ne())
                .unwrap_or(Ordering::Equal)
        });
    }
}

/// Total order over cell text: finite numbers first (numerically), then text (bytewise).
pub fn compare_cells(a: &str, b: &str) -> Ordering {
    match (parse_number(a), parse_number(b)) {
        (Some(x), Some(y)) => x.total_cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn parse_number(cell: &str) -> Option<f64> {
    cell.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn bind_sort_columns(schema: &Schema, columns: &[String], path: &Path) -> AccrueResult<Vec<usize>> {
    schema
        .require_columns(columns)
        .map_err(|missing| AccrueError::MissingSortColumn {
            path: path.to_path_buf(),
            missing,
        })
}

/// Declared ordered column list whose values identify a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    columns: Vec<String>,
}

impl KeySpec {
    pub fn new<I, S>(columns: I) -> AccrueResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if columns.is_empty() {
            return Err(AccrueError::InvalidKey {
                reason: "at least one key column is required".to_string(),
            });
        }
        if let Err(dup) = Schema::new(columns.clone()) {
            return Err(AccrueError::InvalidKey {
                reason: format!("column `{dup}` listed twice"),
            });
        }
        Ok(Self { columns })
    }

    /// Parses a comma-separated column list such as `date,ticker`.
    pub fn parse(list: &str) -> AccrueResult<Self> {
        Self::new(list.split(',').map(str::trim).filter(|c| !c.is_empty()))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn bind(&self, schema: &Schema, path: &Path) -> AccrueResult<BoundKey> {
        let indices = schema
            .require_columns(&self.columns)
            .map_err(|missing| AccrueError::MissingKeyColumn {
                path: path.to_path_buf(),
                missing,
            })?;
        Ok(BoundKey { indices })
    }
}

/// A key specification resolved against one schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundKey {
    indices: Vec<usize>,
}

impl BoundKey {
    pub fn key_for(&self, record: &Record) -> String {
        let mut token = String::new();
        for (pos, &idx) in self.indices.iter().enumerate() {
            if pos > 0 {
                token.push(KEY_SEPARATOR);
            }
            token.push_str(record.get(idx).unwrap_or_default());
        }
        token
    }

    pub fn key_set(&self, dataset: &Dataset) -> Result<BTreeSet<String>, String> {
        let mut keys = BTreeSet::new();
        for record in dataset.records() {
            let key = self.key_for(record);
            if !keys.insert(key.clone()) {
                return Err(format!("duplicate key {} in accumulated dataset", display_key(&key)));
            }
        }
        Ok(keys)
    }
}

/// Renders a key token for messages, showing the separator as `|`.
pub fn display_key(token: &str) -> String {
    format!("`{}`", token.replace(KEY_SEPARATOR, "|"))
}

/// Persisted bookkeeping of merged keys and run metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Manifest {
    pub keys_seen: BTreeSet<String>,
    pub row_count: u64,
    pub sources: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

/// Wire shape of the manifest, validated into a [`Manifest`].
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestDocument {
    pub keys_seen: Vec<String>,
    pub row_count: u64,
    pub sources: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl TryFrom<ManifestDocument> for Manifest {
    type Error = String;

    fn try_from(doc: ManifestDocument) -> Result<Self, Self::Error> {
        let mut keys_seen = BTreeSet::new();
        for key in doc.keys_seen {
            if keys_seen.contains(&key) {
                return Err(format!("keys_seen lists {} more than once", display_key(&key)));
            }
            keys_seen.insert(key);
        }
        if keys_seen.len() as u64 != doc.row_count {
            return Err(format!(
                "row_count {} does not match {} entries in keys_seen",
                doc.row_count,
                keys_seen.len()
            ));
        }
        Ok(Self {
            keys_seen,
            row_count: doc.row_count,
            sources: doc.sources,
            last_updated: doc.last_updated,
        })
    }
}

impl Manifest {
    pub fn contains_key(&self, key: &str) -> bool {
        self.keys_seen.contains(key)
    }

    /// Appends `batch_id` unless an earlier run already recorded it.
    pub fn record_source(&mut self, batch_id: &str) -> bool {
        if self.sources.iter().any(|s| s == batch_id) {
            return false;
        }
        self.sources.push(batch_id.to_string());
        true
    }

    /// Cross-checks the manifest against the key set of the accumulated dataset.
    pub fn check_consistency(&self, dataset_keys: &BTreeSet<String>, rows: usize) -> Result<(), String> {
        if self.row_count != rows as u64 {
            return Err(format!(
                "row_count {} but accumulated dataset has {} rows",
                self.row_count, rows
            ));
        }
        if let Some(orphan) = self.keys_seen.difference(dataset_keys).next() {
            return Err(format!(
                "key {} recorded in manifest but absent from accumulated dataset",
                display_key(orphan)
            ));
        }
        if let Some(unrecorded) = dataset_keys.difference(&self.keys_seen).next() {
            return Err(format!(
                "key {} present in accumulated dataset but not recorded in manifest",
                display_key(unrecorded)
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(cols: &[&str]) -> Schema {
        Schema::new(cols.iter().map(|c| c.to_string()).collect()).unwrap()
    }

    #[test]
    fn schema_rejects_repeated_columns() {
        let err = Schema::new(vec!["url".into(), "title".into(), "url".into()]).unwrap_err();
        assert_eq!(err, "url");
    }

    #[test]
    fn composite_key_reads_declared_order() {
        let s = schema(&["ticker", "close", "date"]);
        let key = KeySpec::parse("date, ticker").unwrap().bind(&s, Path::new("prices.csv")).unwrap();
        let record: Record = ["AAPL", "189.5", "2026-02-24"].into_iter().collect();
        assert_eq!(key.key_for(&record), "2026-02-24\u{1f}AAPL");
    }

    #[test]
    fn single_column_key_is_the_cell_value() {
        let s = schema(&["url", "title"]);
        let key = KeySpec::new(["url"]).unwrap().bind(&s, Path::new("a.csv")).unwrap();
        let record: Record = ["https://x/1", "t"].into_iter().collect();
        assert_eq!(key.key_for(&record), "https://x/1");
    }

    #[test]
    fn separator_keeps_composite_keys_unambiguous() {
        let s = schema(&["a", "b"]);
        let key = KeySpec::new(["a", "b"]).unwrap().bind(&s, Path::new("x.csv")).unwrap();
        let left: Record = ["ab", "c"].into_iter().collect();
        let right: Record = ["a", "bc"].into_iter().collect();
        assert_ne!(key.key_for(&left), key.key_for(&right));
    }

    #[test]
    fn missing_key_columns_are_all_reported() {
        let s = schema(&["url"]);
        let err = KeySpec::new(["date", "url", "ticker"])
            .unwrap()
            .bind(&s, Path::new("batch.csv"))
            .unwrap_err();
        match err {
            AccrueError::MissingKeyColumn { path, missing } => {
                assert_eq!(path, PathBuf::from("batch.csv"));
                assert_eq!(missing, vec!["date".to_string(), "ticker".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_or_repeated_key_specs_are_rejected() {
        assert!(matches!(KeySpec::parse(" , "), Err(AccrueError::InvalidKey { .. })));
        assert!(matches!(KeySpec::parse("url,url"), Err(AccrueError::InvalidKey { .. })));
    }

    #[test]
    fn projection_aligns_reordered_columns() {
        let established = schema(&["date", "ticker", "close"]);
        let batch = schema(&["ticker", "close", "date"]);
        let proj = established.projection_from(&batch, Path::new("b.csv")).unwrap();
        let record: Record = ["MSFT", "410.2", "2026-02-24"].into_iter().collect();
        assert_eq!(record.project(&proj).values(), ["2026-02-24", "MSFT", "410.2"]);
    }

    #[test]
    fn projection_rejects_different_column_sets() {
        let established = schema(&["date", "ticker", "close"]);
        let batch = schema(&["date", "ticker", "open"]);
        let err = established.projection_from(&batch, Path::new("b.csv")).unwrap_err();
        assert!(matches!(err, AccrueError::SchemaMismatch { .. }));
        assert!(err.to_string().contains("expected columns [date, ticker, close]"));
    }

    #[test]
    fn cells_compare_numerically_then_textually() {
        assert_eq!(compare_cells("9", "10"), Ordering::Less);
        assert_eq!(compare_cells("10", "abc"), Ordering::Less);
        assert_eq!(compare_cells("", "a"), Ordering::Less);
        assert_eq!(compare_cells("2026-01-02", "2026-01-10"), Ordering::Less);
    }

    #[test]
    fn sort_is_stable_on_equal_keys() {
        let s = schema(&["date", "id"]);
        let rows = [("2", "first"), ("1", "x"), ("2", "second"), ("1", "y")]
            .into_iter()
            .map(|(d, i)| [d, i].into_iter().collect::<Record>())
            .collect();
        let mut ds = Dataset::new(s, rows);
        ds.sort_by_columns(&[0]);
        let ids: Vec<_> = ds.records().iter().map(|r| r.get(1).unwrap()).collect();
        assert_eq!(ids, vec!["x", "y", "first", "second"]);
    }

    #[test]
    fn manifest_document_rejects_count_drift_and_duplicates() {
        let doc = ManifestDocument {
            keys_seen: vec!["a".into(), "b".into()],
            row_count: 3,
            sources: vec![],
            last_updated: Utc::now(),
        };
        assert!(Manifest::try_from(doc).unwrap_err().contains("row_count 3"));

        let doc = ManifestDocument {
            keys_seen: vec!["a".into(), "a".into()],
            row_count: 2,
            sources: vec![],
            last_updated: Utc::now(),
        };
        assert!(Manifest::try_from(doc).unwrap_err().contains("more than once"));
    }

    #[test]
    fn consistency_check_names_the_divergent_key() {
        let manifest = Manifest {
            keys_seen: ["a".to_string(), "b".to_string()].into_iter().collect(),
            row_count: 2,
            ..Default::default()
        };
        let keys: BTreeSet<String> = ["a".to_string(), "c".to_string()].into_iter().collect();
        let reason = manifest.check_consistency(&keys, 2).unwrap_err();
        assert!(reason.contains("`b`"));
        assert!(manifest.check_consistency(&keys, 3).unwrap_err().contains("3 rows"));
    }

    #[test]
    fn sources_are_recorded_once() {
        let mut manifest = Manifest::default();
        assert!(manifest.record_source("batch_2026-02-24.csv"));
        assert!(!manifest.record_source("batch_2026-02-24.csv"));
        assert_eq!(manifest.sources.len(), 1);
    }
}
