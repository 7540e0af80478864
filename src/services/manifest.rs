use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{Datelike, Local, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::{BookMetadata, BookRequest, ChapterRecord, ChapterStatus, RunStatus};

pub const METADATA_FILE_NAME: &str = "metadata.json";
pub const STRUCTURE_FILE_NAME: &str = "estrutura.txt";
pub const COMPILED_FILE_NAME: &str = "livro_completo.txt";
pub const EPUB_FILE_NAME: &str = "livro_completo.epub";
const RUN_DIR_PREFIX: &str = "livro_";

static RUN_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{8}_\d{6}(_\d+)?$").expect("valid run id pattern"));

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid run id `{0}`")]
    InvalidId(String),
    #[error("run `{0}` not found")]
    NotFound(String),
    #[error("io error at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse manifest `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize manifest `{path}`: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest `{path}` is inconsistent: {reason}")]
    Inconsistent { path: PathBuf, reason: String },
}

impl ManifestError {
    fn io(path: &Path, source: io::Error) -> Self {
        ManifestError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub fn is_valid_run_id(id: &str) -> bool {
    RUN_ID_RE.is_match(id)
}

pub fn chapter_file_name(number: u32) -> String {
    format!("capitulo_{}.txt", number)
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:064x}", hasher.finalize())
}

/// Directory holding one `livro_<id>` folder per run.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

/// A loaded run: its directory and manifest.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub dir: PathBuf,
    pub metadata: BookMetadata,
}

impl RunHandle {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Persists the manifest. Called after every mutation.
    pub fn save(&mut self) -> Result<(), ManifestError> {
        self.metadata.updated_at = Utc::now();
        let path = self.path(METADATA_FILE_NAME);
        let json = serde_json::to_string_pretty(&self.metadata).map_err(|source| {
            ManifestError::Serialize {
                path: path.clone(),
                source,
            }
        })?;
        let tmp = self.path("metadata.json.tmp");
        fs::write(&tmp, json).map_err(|e| ManifestError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| ManifestError::io(&path, e))
    }

    pub fn read_text(&self, file_name: &str) -> Result<String, ManifestError> {
        let path = self.path(file_name);
        fs::read_to_string(&path).map_err(|e| ManifestError::io(&path, e))
    }

    pub fn write_text(&self, file_name: &str, content: &str) -> Result<PathBuf, ManifestError> {
        let path = self.path(file_name);
        fs::write(&path, content).map_err(|e| ManifestError::io(&path, e))?;
        Ok(path)
    }
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}{}", RUN_DIR_PREFIX, id))
    }

    /// Creates the run directory and its initial manifest with one pending
    /// record per chapter.
    pub fn create_run(
        &self,
        request: BookRequest,
        owner_id: Option<String>,
    ) -> Result<RunHandle, ManifestError> {
        fs::create_dir_all(&self.root).map_err(|e| ManifestError::io(&self.root, e))?;

        let now = Local::now();
        let base_id = now.format("%Y%m%d_%H%M%S").to_string();
        let (id, dir) = self.claim_dir(&base_id)?;

        let chapters = (1..=request.chapter_count)
            .map(ChapterRecord::pending)
            .collect();
        let created_at = Utc::now();
        let metadata = BookMetadata {
            id,
            owner_id,
            request,
            year: now.year(),
            created_at,
            updated_at: created_at,
            status: RunStatus::Planning,
            structure_file: None,
            compiled_file: None,
            chapters,
        };

        let mut handle = RunHandle { dir, metadata };
        handle.save()?;
        tracing::info!(run = %handle.id(), dir = %handle.dir.display(), "created run");
        Ok(handle)
    }

    fn claim_dir(&self, base_id: &str) -> Result<(String, PathBuf), ManifestError> {
        let mut suffix = 1u32;
        loop {
            let id = if suffix == 1 {
                base_id.to_string()
            } else {
                format!("{}_{}", base_id, suffix)
            };
            let dir = self.run_dir(&id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(ManifestError::io(&dir, e)),
            }
        }
    }

    /// Reads a run's manifest without touching it. Numbering is still checked.
    pub fn read_manifest(&self, id: &str) -> Result<BookMetadata, ManifestError> {
        if !is_valid_run_id(id) {
            return Err(ManifestError::InvalidId(id.to_string()));
        }
        let path = self.run_dir(id).join(METADATA_FILE_NAME);
        if !path.exists() {
            return Err(ManifestError::NotFound(id.to_string()));
        }

        let raw = fs::read_to_string(&path).map_err(|e| ManifestError::io(&path, e))?;
        let metadata: BookMetadata =
            serde_json::from_str(&raw).map_err(|source| ManifestError::Parse {
                path: path.clone(),
                source,
            })?;
        check_numbering(&metadata, &path)?;
        Ok(metadata)
    }

    /// Read-only handle on a run, for serving its files.
    pub fn view_run(&self, id: &str) -> Result<RunHandle, ManifestError> {
        let metadata = self.read_manifest(id)?;
        Ok(RunHandle {
            dir: self.run_dir(id),
            metadata,
        })
    }

    /// Loads a run for resumption, reconciling chapter statuses with the
    /// files on disk. The caller must make sure the run is not executing.
    pub fn load_run(&self, id: &str) -> Result<RunHandle, ManifestError> {
        let metadata = self.read_manifest(id)?;
        let mut handle = RunHandle {
            dir: self.run_dir(id),
            metadata,
        };
        if reconcile(&mut handle) {
            handle.save()?;
        }
        Ok(handle)
    }

    /// All readable runs, newest first. Unreadable manifests are skipped.
    pub fn list_runs(&self, owner_id: Option<&str>) -> Result<Vec<BookMetadata>, ManifestError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ManifestError::io(&self.root, e)),
        };

        let mut runs = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_prefix(RUN_DIR_PREFIX)) else {
                continue;
            };
            match self.read_manifest(id) {
                Ok(metadata) => {
                    if owner_id.is_none() || metadata.owner_id.as_deref() == owner_id {
                        runs.push(metadata);
                    }
                }
                Err(e) => tracing::warn!(run = %id, "skipping unreadable run: {}", e),
            }
        }

        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(runs)
    }

    /// Most recent run that has not completed, if any.
    pub fn latest_unfinished(
        &self,
        owner_id: Option<&str>,
    ) -> Result<Option<BookMetadata>, ManifestError> {
        Ok(self
            .list_runs(owner_id)?
            .into_iter()
            .find(|run| !run.status.is_finished()))
    }
}

fn check_numbering(metadata: &BookMetadata, path: &Path) -> Result<(), ManifestError> {
    let expected = metadata.request.chapter_count as usize;
    if metadata.chapters.len() != expected {
        return Err(ManifestError::Inconsistent {
            path: path.to_path_buf(),
            reason: format!(
                "expected {} chapter records, found {}",
                expected,
                metadata.chapters.len()
            ),
        });
    }
    for (idx, record) in metadata.chapters.iter().enumerate() {
        if record.number as usize != idx + 1 {
            return Err(ManifestError::Inconsistent {
                path: path.to_path_buf(),
                reason: format!(
                    "chapter numbers are not contiguous: position {} holds chapter {}",
                    idx + 1,
                    record.number
                ),
            });
        }
    }
    Ok(())
}

/// Demotes chapters whose state cannot be trusted back to pending.
/// Returns whether the manifest changed.
fn reconcile(handle: &mut RunHandle) -> bool {
    let mut changed = false;
    let dir = handle.dir.clone();
    let id = handle.metadata.id.clone();
    for record in handle.metadata.chapters.iter_mut() {
        match &record.status {
            ChapterStatus::InProgress => {
                tracing::warn!(run = %id, chapter = record.number, "chapter was interrupted, resetting");
                record.reset();
                changed = true;
            }
            ChapterStatus::Done => {
                if !chapter_file_matches(&dir, record) {
                    tracing::warn!(
                        run = %id,
                        chapter = record.number,
                        "chapter file missing or modified, resetting"
                    );
                    record.reset();
                    changed = true;
                }
            }
            ChapterStatus::Pending | ChapterStatus::Failed { .. } => {}
        }
    }

    if let Some(structure) = handle.metadata.structure_file.clone() {
        if !dir.join(&structure).exists() {
            tracing::warn!(run = %id, "structure file missing, run will be planned again");
            handle.metadata.structure_file = None;
            changed = true;
        }
    }

    changed
}

fn chapter_file_matches(dir: &Path, record: &ChapterRecord) -> bool {
    let Some(file) = &record.file else {
        return false;
    };
    let Ok(text) = fs::read_to_string(dir.join(file)) else {
        return false;
    };
    match &record.sha256 {
        Some(expected) => *expected == sha256_hex(&text),
        None => false,
    }
}
