//! Ties scanner, tracker, uploader and monitor together.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};
use crate::core::{
    ChangeHandler,
    MonitoredFolder,
    ObjectStore,
    PartObserver,
    Result,
    TransferError,
    UploadRequest,
    UploadSummary,
    UploaderConfig,
};
use crate::monitor::{FolderMonitor, DEFAULT_SCAN_INTERVAL};
use crate::scanner;
use crate::tracker::UploadTracker;
use crate::uploaders::S3Uploader;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub log_dir: Option<PathBuf>,
    pub state_file: Option<PathBuf>,
    pub scan_interval: Duration,
    pub uploader: UploaderConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            log_dir: Some(PathBuf::from("logs")),
            state_file: None,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            uploader: UploaderConfig::default(),
        }
    }
}

/// Transfer engine bound to one upload
#[derive(Clone)]
struct ActiveUpload {
    uploader: S3Uploader,
    bucket: String,
    metadata: HashMap<String, String>,
}

/// Records chunked-transfer progress in the tracker
struct SessionRecorder {
    tracker: Arc<UploadTracker>,
    upload_id: String,
}

#[async_trait]
impl PartObserver for SessionRecorder {
    async fn on_part_uploaded(&self, file_path: &Path, session_id: &str, part_number: u32, offset: u64) {
        self.tracker
            .register_chunked_session(
                &self.upload_id,
                &file_path.to_string_lossy(),
                session_id,
                part_number,
                offset,
            )
            .await;
    }
}

/// Everything the monitor callback needs; never refers back to the monitor
struct CoordinatorInner {
    tracker: Arc<UploadTracker>,
    store: Arc<dyn ObjectStore>,
    uploader_config: UploaderConfig,
    active_uploads: Mutex<HashMap<String, ActiveUpload>>,
}

impl CoordinatorInner {
    async fn activate(&self, upload_id: &str, source: &Path, bucket: &str, metadata: HashMap<String, String>) {
        let recorder = Arc::new(SessionRecorder {
            tracker: self.tracker.clone(),
            upload_id: upload_id.to_string(),
        });
        let uploader = S3Uploader::new(self.store.clone(), self.uploader_config.clone())
            .with_scope(upload_id, source)
            .with_observer(recorder);

        self.active_uploads.lock().await.insert(
            upload_id.to_string(),
            ActiveUpload {
                uploader,
                bucket: bucket.to_string(),
                metadata,
            },
        );
    }

    async fn process_files(&self, upload_id: &str, files: BTreeSet<PathBuf>) -> Option<UploadSummary> {
        if files.is_empty() {
            return None;
        }

        if self.tracker.upload_state(upload_id).await.is_none() {
            warn!(upload_id, "No tracked state for upload");
            return None;
        }

        let Some(active) = self.active_uploads.lock().await.get(upload_id).cloned() else {
            warn!(upload_id, "No active uploader");
            return None;
        };

        info!(upload_id, files = files.len(), bucket = %active.bucket, "Processing files");
        let summary = active.uploader.upload_files(files, &active.bucket, &active.metadata).await;

        for result in summary.results.iter().filter(|r| r.success) {
            self.tracker
                .mark_file_complete(upload_id, &result.file_path.to_string_lossy(), result)
                .await;
        }

        self.tracker.log_upload_summary(&summary).await;
        Some(summary)
    }
}

#[async_trait]
impl ChangeHandler for CoordinatorInner {
    async fn on_changes(&self, upload_id: &str, changed_files: BTreeSet<PathBuf>) -> Result<()> {
        info!(upload_id, changed = changed_files.len(), "Processing changed files");
        self.process_files(upload_id, changed_files).await;
        Ok(())
    }
}

/// Runs monitored uploads and resumes interrupted ones on construction
pub struct UploadCoordinator {
    inner: Arc<CoordinatorInner>,
    monitor: FolderMonitor,
}

impl UploadCoordinator {
    pub async fn new(config: CoordinatorConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let tracker = Arc::new(UploadTracker::open(config.log_dir, config.state_file).await?);
        let inner = Arc::new(CoordinatorInner {
            tracker,
            store,
            uploader_config: config.uploader,
            active_uploads: Mutex::new(HashMap::new()),
        });

        let monitor = FolderMonitor::new(config.scan_interval);
        monitor.register_callback(inner.clone()).await;

        let coordinator = Self { inner, monitor };
        coordinator.resume_uploads().await;
        Ok(coordinator)
    }

    pub fn tracker(&self) -> &Arc<UploadTracker> {
        &self.inner.tracker
    }

    pub fn monitor(&self) -> &FolderMonitor {
        &self.monitor
    }

    /// Upload ids with a live transfer engine
    pub async fn active_uploads(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.active_uploads.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Register, start watching, and push everything currently in the folder
    pub async fn start_upload(&self, request: UploadRequest) -> Result<Option<UploadSummary>> {
        if !request.source_folder().is_dir() {
            return Err(TransferError::invalid(format!(
                "Source folder does not exist: {}",
                request.source_folder().display()
            )));
        }

        let upload_id = request.upload_id().to_string();
        self.inner.tracker.register_upload(&request).await;
        self.inner
            .activate(
                &upload_id,
                request.source_folder(),
                request.destination_bucket(),
                request.metadata().clone(),
            )
            .await;

        self.monitor
            .register_folder(MonitoredFolder::new(
                upload_id.as_str(),
                request.source_folder(),
                request.destination_bucket(),
                request.pattern(),
            ))
            .await;

        let files: BTreeSet<_> = scanner::scan(&request).into_iter().collect();
        Ok(self.inner.process_files(&upload_id, files).await)
    }

    /// Stop watching an upload. Its tracked state stays on disk.
    pub async fn stop_upload(&self, upload_id: &str) {
        self.monitor.unregister_folder(upload_id).await;
        self.inner.active_uploads.lock().await.remove(upload_id);
        info!(upload_id, "Stopped upload");
    }

    pub async fn stop_all(&self) {
        self.monitor.stop_all().await;
        self.inner.active_uploads.lock().await.clear();
        info!("Stopped all uploads");
    }

    /// Send `files` for an active upload and record the outcome
    pub async fn process_files(&self, upload_id: &str, files: BTreeSet<PathBuf>) -> Option<UploadSummary> {
        self.inner.process_files(upload_id, files).await
    }

    async fn resume_uploads(&self) {
        for state in self.inner.tracker.upload_states().await {
            let source = PathBuf::from(&state.source_folder);
            info!(upload_id = %state.upload_id, source = %state.source_folder, "Resuming upload");

            self.inner
                .activate(&state.upload_id, &source, &state.destination_bucket, HashMap::new())
                .await;
            self.monitor
                .register_folder(MonitoredFolder::new(
                    state.upload_id.as_str(),
                    source,
                    state.destination_bucket.as_str(),
                    state.pattern.as_str(),
                ))
                .await;

            let incomplete: BTreeSet<_> = self
                .inner
                .tracker
                .incomplete_files(&state.upload_id)
                .await
                .into_iter()
                .map(PathBuf::from)
                .collect();
            self.inner.process_files(&state.upload_id, incomplete).await;
        }
    }
}
