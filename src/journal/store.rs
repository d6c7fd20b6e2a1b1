use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::journal::record::{JournalEvent, RunManifest};
use crate::model::RequestId;

const APP_DIR_NAME: &str = ".testrelay";
const EXECUTIONS_DIR_NAME: &str = "executions";
const MANIFEST_FILE_NAME: &str = "run.json";
const EVENTS_FILE_NAME: &str = "events.jsonl";

/// Errors that can occur during journal operations.
#[derive(Error, Debug)]
pub enum JournalError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request id unusable as a directory name.
    #[error("invalid request id '{0}'")]
    InvalidRequestId(String),
}

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// File-backed store of execution events.
#[derive(Debug, Clone)]
pub struct JournalStore {
    root_dir: PathBuf,
}

impl JournalStore {
    /// Create a store under `<base_dir>/.testrelay/executions`.
    pub fn new(base_dir: impl Into<PathBuf>) -> JournalResult<Self> {
        let root_dir = base_dir.into().join(APP_DIR_NAME).join(EXECUTIONS_DIR_NAME);
        fs::create_dir_all(&root_dir)?;
        Ok(Self { root_dir })
    }

    /// Directory holding one subdirectory per request.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Append one event and update the request's manifest.
    pub fn append(&self, event: &JournalEvent) -> JournalResult<()> {
        let request_dir = self.request_dir(&event.request_id)?;
        fs::create_dir_all(&request_dir)?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(request_dir.join(EVENTS_FILE_NAME))?;
        writeln!(file, "{}", serde_json::to_string(event)?)?;
        file.sync_all()?;

        let mut manifest = self
            .read_manifest(&request_dir)?
            .unwrap_or_else(|| RunManifest::new(event.request_id.clone(), event.recorded_at));
        manifest.record(event);
        self.write_manifest(&request_dir, &manifest)
    }

    /// All events of a request, oldest first.
    pub fn events(&self, request_id: &RequestId) -> JournalResult<Vec<JournalEvent>> {
        let path = self.request_dir(request_id)?.join(EVENTS_FILE_NAME);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(JournalError::Io(err)),
        };

        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    /// Manifest of a request, if it has any events.
    pub fn manifest(&self, request_id: &RequestId) -> JournalResult<Option<RunManifest>> {
        let request_dir = self.request_dir(request_id)?;
        self.read_manifest(&request_dir)
    }

    fn request_dir(&self, request_id: &RequestId) -> JournalResult<PathBuf> {
        let id = request_id.as_str();
        let valid = !id.trim().is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(JournalError::InvalidRequestId(id.to_string()));
        }
        Ok(self.root_dir.join(id))
    }

    fn read_manifest(&self, request_dir: &Path) -> JournalResult<Option<RunManifest>> {
        match fs::read_to_string(request_dir.join(MANIFEST_FILE_NAME)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(JournalError::Io(err)),
        }
    }

    fn write_manifest(&self, request_dir: &Path, manifest: &RunManifest) -> JournalResult<()> {
        let json = serde_json::to_string_pretty(manifest)?;
        let temp_path = request_dir.join(format!("{}.tmp", MANIFEST_FILE_NAME));

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, request_dir.join(MANIFEST_FILE_NAME))?;

        Ok(())
    }
}
