//! Crash-safe file commits, CSV dataset codec, manifest store and raw snapshot archiving.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use accrue_core::{AccrueError, AccrueResult, Dataset, Manifest, ManifestDocument, Record, Schema};
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "accrue-storage";

/// A file being written beside its destination; becomes visible only on [`StagedFile::commit`].
///
/// Dropping an uncommitted stage removes the temp file and leaves the destination untouched.
#[derive(Debug)]
pub struct StagedFile {
    destination: PathBuf,
    temp_path: PathBuf,
    writer: Option<BufWriter<File>>,
    committed: bool,
}

impl StagedFile {
    pub fn create(destination: impl Into<PathBuf>) -> AccrueResult<Self> {
        let destination = destination.into();
        let parent = parent_dir(&destination);
        fs::create_dir_all(&parent).map_err(|e| AccrueError::io(&parent, e))?;

        let temp_path = sibling_path(&destination, "tmp");

        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .map_err(|e| AccrueError::io(&temp_path, e))?;

        Ok(Self {
            destination,
            temp_path,
            writer: Some(BufWriter::new(file)),
            committed: false,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// Flushes, fsyncs and renames onto the destination, then fsyncs the directory.
    pub fn commit(self) -> AccrueResult<()> {
        let dir = self.persist()?;
        sync_dir(&dir)
    }

    /// Flushes, fsyncs and renames onto the destination. The containing directory is
    /// returned unsynced so several renames can share one [`sync_dir`].
    pub fn persist(mut self) -> AccrueResult<PathBuf> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| AccrueError::io(&self.temp_path, closed_stage()))?;
        let file = writer
            .into_inner()
            .map_err(|e| AccrueError::io(&self.temp_path, e.into_error()))?;
        file.sync_all()
            .map_err(|e| AccrueError::io(&self.temp_path, e))?;
        drop(file);

        fs::rename(&self.temp_path, &self.destination).map_err(|e| AccrueError::io(&self.destination, e))?;
        self.committed = true;
        debug!(destination = %self.destination.display(), "committed staged file");
        Ok(parent_dir(&self.destination))
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer.as_mut().ok_or_else(closed_stage)
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        drop(self.writer.take());
        if !self.committed {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

/// The previous contents of a file about to be replaced, held as a hidden sibling link.
///
/// Dropping it discards the backup. [`PriorGeneration::restore`] puts it back, or removes
/// the file entirely when nothing existed before.
#[derive(Debug)]
pub struct PriorGeneration {
    path: PathBuf,
    backup: Option<PathBuf>,
}

impl PriorGeneration {
    pub fn hold(path: &Path) -> AccrueResult<Self> {
        let backup = sibling_path(path, "bak");
        let backup = match fs::hard_link(path, &backup) {
            Ok(()) => Some(backup),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(_) => match fs::copy(path, &backup) {
                Ok(_) => Some(backup),
                Err(err) if err.kind() == io::ErrorKind::NotFound => None,
                Err(err) => return Err(AccrueError::io(&backup, err)),
            },
        };
        Ok(Self {
            path: path.to_path_buf(),
            backup,
        })
    }

    pub fn restore(mut self) -> AccrueResult<()> {
        match self.backup.take() {
            Some(backup) => {
                fs::rename(&backup, &self.path).map_err(|e| AccrueError::io(&self.path, e))?
            }
            None => match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(AccrueError::io(&self.path, err)),
            },
        }
        warn!(path = %self.path.display(), "restored prior generation");
        sync_dir(&parent_dir(&self.path))
    }
}

impl Drop for PriorGeneration {
    fn drop(&mut self) {
        if let Some(backup) = self.backup.take() {
            let _ = fs::remove_file(backup);
        }
    }
}

fn sibling_path(destination: &Path, suffix: &str) -> PathBuf {
    let file_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "staged".to_string());
    parent_dir(destination).join(format!(".{file_name}.{}.{suffix}", Uuid::new_v4()))
}

fn closed_stage() -> io::Error {
    io::Error::other("staged file already closed")
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> AccrueResult<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| AccrueError::io(dir, e))
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> AccrueResult<()> {
    Ok(())
}

/// Replace `destination` with `bytes` via temp-file rename.
pub fn write_atomic(destination: &Path, bytes: &[u8]) -> AccrueResult<()> {
    let mut staged = StagedFile::create(destination)?;
    staged
        .write_all(bytes)
        .map_err(|e| AccrueError::io(staged.temp_path().to_path_buf(), e))?;
    staged.commit()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn file_sha256(path: &Path) -> AccrueResult<String> {
    let bytes = fs::read(path).map_err(|e| AccrueError::io(path, e))?;
    Ok(sha256_hex(&bytes))
}

fn csv_error(path: &Path, err: csv::Error) -> AccrueError {
    let reason = err.to_string();
    match err.into_kind() {
        csv::ErrorKind::Io(source) => AccrueError::io(path, source),
        _ => AccrueError::malformed(path, reason),
    }
}

/// Reads a headed CSV file. Returns `None` when nothing exists at `path`.
pub fn read_dataset(path: &Path) -> AccrueResult<Option<Dataset>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(AccrueError::io(path, err)),
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(file);

    let header = reader.headers().map_err(|e| csv_error(path, e))?;
    let schema = Schema::new(header.iter().map(str::to_string).collect())
        .map_err(|dup| AccrueError::malformed(path, format!("column `{dup}` appears twice in header")))?;

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| csv_error(path, e))?;
        records.push(row.iter().collect::<Record>());
    }

    debug!(path = %path.display(), rows = records.len(), columns = schema.len(), "read dataset");
    Ok(Some(Dataset::new(schema, records)))
}

/// Reads a batch file, which unlike the accumulated dataset must exist.
pub fn read_batch(path: &Path) -> AccrueResult<Dataset> {
    read_dataset(path)?.ok_or_else(|| {
        AccrueError::io(
            path,
            io::Error::new(io::ErrorKind::NotFound, "batch file does not exist"),
        )
    })
}

/// Serialises `dataset` into a staged (not yet visible) file at `destination`.
pub fn stage_dataset(dataset: &Dataset, destination: &Path) -> AccrueResult<StagedFile> {
    let mut staged = StagedFile::create(destination)?;
    let temp_path = staged.temp_path().to_path_buf();
    {
        let mut writer = csv::Writer::from_writer(&mut staged);
        writer
            .write_record(dataset.schema().columns())
            .map_err(|e| csv_error(&temp_path, e))?;
        for record in dataset.records() {
            writer
                .write_record(record.values())
                .map_err(|e| csv_error(&temp_path, e))?;
        }
        writer.flush().map_err(|e| AccrueError::io(&temp_path, e))?;
    }
    Ok(staged)
}

pub fn write_dataset(dataset: &Dataset, destination: &Path) -> AccrueResult<()> {
    stage_dataset(dataset, destination)?.commit()
}

/// JSON manifest persisted beside an accumulated dataset.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the manifest, or an empty one when the file is absent.
    pub fn load(&self) -> AccrueResult<Manifest> {
        Ok(self.load_existing()?.unwrap_or_default())
    }

    pub fn load_existing(&self) -> AccrueResult<Option<Manifest>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                return Err(AccrueError::manifest_corruption(&self.path, "not valid UTF-8"))
            }
            Err(err) => return Err(AccrueError::io(&self.path, err)),
        };
        let doc: ManifestDocument = serde_json::from_str(&text)
            .map_err(|e| AccrueError::manifest_corruption(&self.path, e.to_string()))?;
        let manifest =
            Manifest::try_from(doc).map_err(|reason| AccrueError::manifest_corruption(&self.path, reason))?;
        Ok(Some(manifest))
    }

    pub fn stage(&self, manifest: &Manifest) -> AccrueResult<StagedFile> {
        let mut bytes = serde_json::to_vec_pretty(manifest)
            .map_err(|e| AccrueError::manifest_corruption(&self.path, e.to_string()))?;
        bytes.push(b'\n');
        let mut staged = StagedFile::create(&self.path)?;
        staged
            .write_all(&bytes)
            .map_err(|e| AccrueError::io(staged.temp_path().to_path_buf(), e))?;
        Ok(staged)
    }

    pub fn save(&self, manifest: &Manifest) -> AccrueResult<()> {
        self.stage(manifest)?.commit()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedSnapshot {
    pub archive_path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    /// An archive with identical content already existed for this date.
    pub deduplicated: bool,
    /// A different archive for this date was replaced (latest of the day wins).
    pub replaced: bool,
}

/// Copies canonical raw snapshots to `{archive_dir}/{dataset}_{YYYY-MM-DD}.csv` before they are overwritten.
#[derive(Debug, Clone)]
pub struct ArchiveRotator {
    archive_dir: PathBuf,
}

impl ArchiveRotator {
    pub fn new(archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
        }
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Archive file for `dataset_name` on `as_of`. The name must be a plain file stem.
    pub fn archive_path_for(&self, dataset_name: &str, as_of: NaiveDate) -> AccrueResult<PathBuf> {
        if !is_plain_stem(dataset_name) {
            return Err(AccrueError::InvalidDatasetName {
                name: dataset_name.to_string(),
            });
        }
        Ok(self
            .archive_dir
            .join(format!("{dataset_name}_{}.csv", as_of.format("%Y-%m-%d"))))
    }

    /// Copies the file at `canonical`, if any, into the archive. The canonical file is left in place.
    pub fn preserve(
        &self,
        canonical: &Path,
        dataset_name: &str,
        as_of: NaiveDate,
    ) -> AccrueResult<Option<ArchivedSnapshot>> {
        let bytes = match fs::read(canonical) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(canonical = %canonical.display(), "no canonical snapshot to archive");
                return Ok(None);
            }
            Err(err) => return Err(AccrueError::io(canonical, err)),
        };

        let archive_path = self.archive_path_for(dataset_name, as_of)?;
        let content_hash = sha256_hex(&bytes);

        let existing = match fs::read(&archive_path) {
            Ok(existing) => Some(sha256_hex(&existing)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(AccrueError::io(&archive_path, err)),
        };

        if existing.as_deref() == Some(content_hash.as_str()) {
            return Ok(Some(ArchivedSnapshot {
                archive_path,
                content_hash,
                byte_size: bytes.len(),
                deduplicated: true,
                replaced: false,
            }));
        }

        write_atomic(&archive_path, &bytes)?;
        info!(
            dataset = dataset_name,
            archive = %archive_path.display(),
            bytes = bytes.len(),
            replaced = existing.is_some(),
            "archived canonical snapshot"
        );
        Ok(Some(ArchivedSnapshot {
            archive_path,
            content_hash,
            byte_size: bytes.len(),
            deduplicated: false,
            replaced: existing.is_some(),
        }))
    }

    /// Archives the current canonical file, then atomically replaces it with `bytes`.
    pub fn refresh_canonical(
        &self,
        canonical: &Path,
        dataset_name: &str,
        as_of: NaiveDate,
        bytes: &[u8],
    ) -> AccrueResult<Option<ArchivedSnapshot>> {
        let archived = self.preserve(canonical, dataset_name, as_of)?;
        write_atomic(canonical, bytes)?;
        Ok(archived)
    }
}

/// True for a non-empty name with no path separators that is not `.` or `..`.
pub fn is_plain_stem(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && name != "." && name != ".."
}
