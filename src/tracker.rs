//! Durable per-upload state.
//!
//! Every mutation rewrites the whole state file while the tracker lock is
//! held, so what is on disk always matches some linearized point of the
//! in-memory map.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use chrono::{Local, Utc};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use crate::core::{
    InProgressSession,
    Result,
    StateFile,
    UploadRequest,
    UploadResult,
    UploadState,
    UploadSummary,
};
use crate::scanner;

/// Default state file name inside the log directory
pub const STATE_FILE_NAME: &str = "upload_state.json";

pub struct UploadTracker {
    log_dir: Option<PathBuf>,
    state_file: Option<PathBuf>,
    states: Mutex<HashMap<String, UploadState>>,
}

impl UploadTracker {
    /// Open a tracker, loading any state persisted by a previous run.
    ///
    /// With no `state_file`, state lives in `<log_dir>/upload_state.json`; with neither, in memory only.
    pub async fn open(log_dir: Option<PathBuf>, state_file: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = &log_dir {
            tokio::fs::create_dir_all(dir).await?;
        }

        let state_file = state_file.or_else(|| log_dir.as_ref().map(|dir| dir.join(STATE_FILE_NAME)));
        let states = match &state_file {
            Some(path) => load_state(path).await,
            None => HashMap::new(),
        };

        Ok(Self {
            log_dir,
            state_file,
            states: Mutex::new(states),
        })
    }

    pub fn state_file(&self) -> Option<&Path> {
        self.state_file.as_deref()
    }

    /// Create a fresh state for `request`, replacing any previous one
    pub async fn register_upload(&self, request: &UploadRequest) {
        {
            let mut states = self.states.lock().await;
            states.insert(request.upload_id().to_string(), UploadState::from_request(request));
            self.persist(&states).await;
        }

        self.log_upload_request(request).await;
    }

    pub async fn upload_state(&self, upload_id: &str) -> Option<UploadState> {
        self.states.lock().await.get(upload_id).cloned()
    }

    pub async fn upload_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.states.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn upload_states(&self) -> Vec<UploadState> {
        let mut states: Vec<_> = self.states.lock().await.values().cloned().collect();
        states.sort_by(|a, b| a.upload_id.cmp(&b.upload_id));
        states
    }

    /// Record the outcome of one file.
    ///
    /// The file always leaves the in-progress map. On success it joins the
    /// completed set and its current modification time is recorded, so a
    /// later re-upload of a modified file refreshes the baseline.
    pub async fn mark_file_complete(&self, upload_id: &str, file_path: &str, result: &UploadResult) {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(upload_id) else {
            warn!(upload_id, file_path, "mark_file_complete for unknown upload");
            return;
        };

        state.in_progress_files.remove(file_path);

        if result.success {
            state.completed_files.insert(file_path.to_string());
            match tokio::fs::metadata(file_path).await.and_then(|meta| meta.modified()) {
                Ok(modified) => {
                    state
                        .last_modified_times
                        .insert(file_path.to_string(), scanner::system_time_secs(modified));
                }
                Err(err) => {
                    warn!(upload_id, file_path, %err, "Completed file has no readable modification time");
                    state.last_modified_times.remove(file_path);
                }
            }
        }

        self.persist(&states).await;
    }

    /// Upsert the in-progress descriptor of a chunked transfer.
    ///
    /// A file being re-sent is no longer complete, so it leaves the completed set.
    pub async fn register_chunked_session(
        &self,
        upload_id: &str,
        file_path: &str,
        session_id: &str,
        part_number: u32,
        offset: u64,
    ) {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(upload_id) else {
            warn!(upload_id, file_path, "register_chunked_session for unknown upload");
            return;
        };

        state.completed_files.remove(file_path);
        state.in_progress_files.insert(
            file_path.to_string(),
            InProgressSession {
                session_id: session_id.to_string(),
                part_number,
                offset,
            },
        );

        self.persist(&states).await;
    }

    /// Files that still need attention: never completed, modified since
    /// completion, or interrupted mid-chunked-transfer.
    pub async fn incomplete_files(&self, upload_id: &str) -> BTreeSet<String> {
        let states = self.states.lock().await;
        let Some(state) = states.get(upload_id) else {
            return BTreeSet::new();
        };

        let mut incomplete = BTreeSet::new();
        match scanner::list_matching(Path::new(&state.source_folder), &state.pattern) {
            Ok(current_files) => {
                for path in current_files {
                    let key = path.to_string_lossy().into_owned();
                    let changed = match scanner::modified_secs(&path) {
                        Ok(mtime) => state.last_modified_times.get(&key) != Some(&mtime),
                        Err(_) => true,
                    };

                    if !state.completed_files.contains(&key) || changed {
                        incomplete.insert(key);
                    }
                }
            }
            Err(err) => {
                error!(upload_id, folder = %state.source_folder, %err, "Cannot rescan source folder");
            }
        }

        incomplete.extend(state.in_progress_files.keys().cloned());
        incomplete
    }

    pub async fn log_upload_request(&self, request: &UploadRequest) {
        let record = json!({
            "timestamp": Local::now().to_rfc3339(),
            "upload_id": request.upload_id(),
            "source_folder": request.source_folder().to_string_lossy(),
            "destination_bucket": request.destination_bucket(),
            "pattern": request.pattern(),
            "metadata": {
                "name": request.name(),
                "type": request.upload_type(),
                "description": request.description(),
            }
        });

        self.append_audit(request.upload_id(), &record).await;
        info!(upload_id = request.upload_id(), "Starting upload");
    }

    pub async fn log_upload_summary(&self, summary: &UploadSummary) {
        let results: Vec<_> = summary
            .results
            .iter()
            .map(|r| json!({
                "file_path": r.file_path.to_string_lossy(),
                "s3_key": r.s3_key,
                "success": r.success,
                "error": r.error,
                "size_bytes": r.size_bytes,
                "etag": r.etag,
            }))
            .collect();

        let record = json!({
            "timestamp": Local::now().to_rfc3339(),
            "upload_id": summary.upload_id,
            "total_files": summary.total_files,
            "successful_uploads": summary.successful_uploads,
            "failed_uploads": summary.failed_uploads,
            "results": results,
        });

        self.append_audit(&summary.upload_id, &record).await;
        info!(
            upload_id = %summary.upload_id,
            "Completed upload: {}/{} files uploaded successfully",
            summary.successful_uploads,
            summary.total_files
        );
    }

    /// Audit file for one event; names carry a millisecond timestamp and are only ever appended to
    fn audit_path(&self, upload_id: &str) -> Option<PathBuf> {
        let dir = self.log_dir.as_ref()?;
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
        Some(dir.join(format!("upload_{}_{}.json", sanitize(upload_id), timestamp)))
    }

    async fn append_audit(&self, upload_id: &str, record: &serde_json::Value) {
        let Some(path) = self.audit_path(upload_id) else {
            return;
        };

        let mut line = record.to_string();
        line.push('\n');

        let written = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(err) = written {
            error!(upload_id, path = %path.display(), %err, "Error writing audit record");
        }
    }

    async fn persist(&self, states: &HashMap<String, UploadState>) {
        let Some(path) = &self.state_file else {
            return;
        };

        let mut upload_states: Vec<_> = states.values().cloned().collect();
        upload_states.sort_by(|a, b| a.upload_id.cmp(&b.upload_id));

        let data = match serde_json::to_string_pretty(&StateFile { upload_states }) {
            Ok(data) => data,
            Err(err) => {
                error!(%err, "Error serializing state");
                return;
            }
        };

        match tokio::fs::write(path, data).await {
            Ok(()) => debug!(count = states.len(), path = %path.display(), "Saved upload states"),
            Err(err) => error!(path = %path.display(), %err, "Error saving state file"),
        }
    }
}

/// Read the state file; anything unreadable counts as "no prior state"
async fn load_state(path: &Path) -> HashMap<String, UploadState> {
    let data = match tokio::fs::read_to_string(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(err) => {
            error!(path = %path.display(), %err, "Error reading state file");
            return HashMap::new();
        }
    };

    match serde_json::from_str::<StateFile>(&data) {
        Ok(file) => {
            let states: HashMap<_, _> = file
                .upload_states
                .into_iter()
                .map(|state| (state.upload_id.clone(), state))
                .collect();
            info!(count = states.len(), path = %path.display(), "Loaded upload states");
            states
        }
        Err(err) => {
            error!(path = %path.display(), %err, "Error loading state file");
            HashMap::new()
        }
    }
}

fn sanitize(upload_id: &str) -> String {
    upload_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}
