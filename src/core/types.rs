use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use serde::{Deserialize, Serialize};
use crate::utils::retry::{RetryBuilder, RetryConfig, RetryStrategy};
use super::errors::{Result, TransferError};

/// Default chunk threshold and chunk size, 8 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Default width of the per-batch worker pool
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Default pattern when none is supplied
pub const DEFAULT_PATTERN: &str = "*";

/// One logical directory -> bucket synchronization task.
///
/// Only constructible through [`UploadRequest::new`], so an instance always
/// points at an existing directory and carries a non-empty id and bucket.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    upload_id: String,
    source_folder: PathBuf,
    destination_bucket: String,
    pattern: String,
    name: Option<String>,
    upload_type: Option<String>,
    description: Option<String>,
    metadata: HashMap<String, String>,
}

impl UploadRequest {
    pub fn new(
        upload_id: impl Into<String>,
        source_folder: impl Into<PathBuf>,
        destination_bucket: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Result<Self> {
        let upload_id = upload_id.into();
        let source_folder = source_folder.into();
        let destination_bucket = destination_bucket.into();
        let mut pattern = pattern.into();

        if upload_id.trim().is_empty() {
            return Err(TransferError::invalid("upload_id cannot be empty"));
        }
        if destination_bucket.trim().is_empty() {
            return Err(TransferError::invalid("destination_bucket cannot be empty"));
        }
        if !source_folder.exists() {
            return Err(TransferError::invalid(format!(
                "Source folder {} does not exist",
                source_folder.display()
            )));
        }
        if !source_folder.is_dir() {
            return Err(TransferError::invalid(format!(
                "{} is not a directory",
                source_folder.display()
            )));
        }
        if pattern.is_empty() {
            pattern = DEFAULT_PATTERN.to_string();
        }

        Ok(Self {
            upload_id,
            source_folder,
            destination_bucket,
            pattern,
            name: None,
            upload_type: None,
            description: None,
            metadata: HashMap::new(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_type(mut self, upload_type: impl Into<String>) -> Self {
        self.upload_type = Some(upload_type.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// User metadata attached to every uploaded object
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn source_folder(&self) -> &Path {
        &self.source_folder
    }

    pub fn destination_bucket(&self) -> &str {
        &self.destination_bucket
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn upload_type(&self) -> Option<&str> {
        self.upload_type.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

/// Outcome of transferring one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    pub file_path: PathBuf,
    pub s3_key: String,
    pub success: bool,
    pub error: Option<String>,
    pub size_bytes: Option<u64>,
    pub etag: Option<String>,
    /// Chunked session id, set only for multipart transfers
    pub multipart_upload_id: Option<String>,
    pub part_number: Option<u32>,
    pub offset: Option<u64>,
}

impl UploadResult {
    pub fn succeeded(file_path: PathBuf, s3_key: String, size_bytes: u64, etag: Option<String>) -> Self {
        Self {
            file_path,
            s3_key,
            success: true,
            error: None,
            size_bytes: Some(size_bytes),
            etag,
            multipart_upload_id: None,
            part_number: None,
            offset: None,
        }
    }

    pub fn failed(file_path: PathBuf, s3_key: String, size_bytes: Option<u64>, error: impl Into<String>) -> Self {
        Self {
            file_path,
            s3_key,
            success: false,
            error: Some(error.into()),
            size_bytes,
            etag: None,
            multipart_upload_id: None,
            part_number: None,
            offset: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>, part_number: u32, offset: u64) -> Self {
        self.multipart_upload_id = Some(session_id.into());
        self.part_number = Some(part_number);
        self.offset = Some(offset);
        self
    }
}

/// Aggregate of one transfer batch
#[derive(Debug, Clone)]
pub struct UploadSummary {
    pub upload_id: String,
    pub total_files: usize,
    pub successful_uploads: usize,
    pub failed_uploads: usize,
    pub results: Vec<UploadResult>,
}

impl UploadSummary {
    pub fn from_results(upload_id: impl Into<String>, results: Vec<UploadResult>) -> Self {
        let successful_uploads = results.iter().filter(|r| r.success).count();

        Self {
            upload_id: upload_id.into(),
            total_files: results.len(),
            successful_uploads,
            failed_uploads: results.len() - successful_uploads,
            results,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &UploadResult> {
        self.results.iter().filter(|r| !r.success)
    }

    pub fn total_bytes(&self) -> u64 {
        self.results
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.size_bytes)
            .sum()
    }
}

/// Descriptor of a chunked session still running (or interrupted) for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgressSession {
    #[serde(rename = "upload_id")]
    pub session_id: String,
    pub part_number: u32,
    pub offset: u64,
}

/// Durable record of one upload task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadState {
    pub upload_id: String,
    pub source_folder: String,
    pub destination_bucket: String,
    pub pattern: String,
    #[serde(default)]
    pub completed_files: BTreeSet<String>,
    #[serde(default)]
    pub in_progress_files: BTreeMap<String, InProgressSession>,
    /// Seconds since the UNIX epoch
    #[serde(default)]
    pub last_modified_times: BTreeMap<String, f64>,
}

impl UploadState {
    pub fn from_request(request: &UploadRequest) -> Self {
        Self {
            upload_id: request.upload_id().to_string(),
            source_folder: request.source_folder().to_string_lossy().into_owned(),
            destination_bucket: request.destination_bucket().to_string(),
            pattern: request.pattern().to_string(),
            completed_files: BTreeSet::new(),
            in_progress_files: BTreeMap::new(),
            last_modified_times: BTreeMap::new(),
        }
    }
}

/// On-disk layout of the state file
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub upload_states: Vec<UploadState>,
}

/// One watch target, owned by the monitor
#[derive(Debug, Clone)]
pub struct MonitoredFolder {
    pub upload_id: String,
    pub source_folder: PathBuf,
    pub destination_bucket: String,
    pub pattern: String,
    pub last_check: SystemTime,
    pub known_files: BTreeSet<PathBuf>,
}

impl MonitoredFolder {
    pub fn new(
        upload_id: impl Into<String>,
        source_folder: impl Into<PathBuf>,
        destination_bucket: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        Self {
            upload_id: upload_id.into(),
            source_folder: source_folder.into(),
            destination_bucket: destination_bucket.into(),
            pattern: pattern.into(),
            last_check: SystemTime::now(),
            known_files: BTreeSet::new(),
        }
    }
}

/// Part reference passed to the finalize call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Result of a metadata fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub etag: Option<String>,
    pub size: Option<u64>,
}

/// Transfer engine settings
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Files strictly larger than this go through the chunked path; also the part size
    pub chunk_size: u64,
    pub max_workers: usize,
    pub max_attempts: u32,
    pub backoff: RetryStrategy,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_workers: DEFAULT_MAX_WORKERS,
            max_attempts: 3,
            backoff: RetryStrategy::Exponential {
                initial: Duration::from_secs(1),
                multiplier: 2.0,
                max_delay: Duration::from_secs(10),
            },
        }
    }
}

impl UploaderConfig {
    /// Retry policy that only repeats transient errors
    pub fn retry_config(&self) -> RetryConfig {
        RetryBuilder::new()
            .max_attempts(self.max_attempts)
            .strategy(self.backoff.clone())
            .should_retry(TransferError::is_retryable)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        let dir = tempfile::tempdir().unwrap();

        let err = UploadRequest::new("", dir.path(), "bucket", "*").unwrap_err();
        assert!(matches!(err, TransferError::InvalidRequest(_)));

        let err = UploadRequest::new("id", dir.path(), "", "*").unwrap_err();
        assert!(err.to_string().contains("destination_bucket"));

        let err = UploadRequest::new("id", dir.path().join("missing"), "bucket", "*").unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        let file = dir.path().join("file.txt");
        std::fs::write(&file, b"x").unwrap();
        let err = UploadRequest::new("id", &file, "bucket", "*").unwrap_err();
        assert!(err.to_string().contains("not a directory"));

        let request = UploadRequest::new("id", dir.path(), "bucket", "")
            .unwrap()
            .with_name("nightly")
            .with_type("logs");
        assert_eq!(request.pattern(), "*");
        assert_eq!(request.name(), Some("nightly"));
        assert_eq!(request.upload_type(), Some("logs"));
        assert_eq!(request.description(), None);
    }

    #[test]
    fn test_summary_counts() {
        let results = vec![
            UploadResult::succeeded("a".into(), "a".into(), 10, None),
            UploadResult::failed("b".into(), "b".into(), Some(3), "boom"),
            UploadResult::succeeded("c".into(), "c".into(), 5, Some("etag".into())),
        ];
        let summary = UploadSummary::from_results("u1", results);

        assert_eq!(summary.total_files, 3);
        assert_eq!(summary.successful_uploads, 2);
        assert_eq!(summary.failed_uploads, 1);
        assert_eq!(summary.total_bytes(), 15);
        assert_eq!(summary.failures().count(), 1);
    }

    #[test]
    fn test_retry_config_follows_uploader_settings() {
        let config = UploaderConfig { max_attempts: 4, ..UploaderConfig::default() };
        let retry = config.retry_config();

        assert_eq!(retry.max_attempts, 4);
        assert!((retry.should_retry)(&TransferError::remote(Some(503), "SlowDown", "Reduce your request rate")));
        assert!(!(retry.should_retry)(&TransferError::remote(Some(403), "AccessDenied", "Access denied")));
    }

    #[test]
    fn test_state_json_shape() {
        let mut state = UploadState {
            upload_id: "u1".into(),
            source_folder: "/data".into(),
            destination_bucket: "bucket".into(),
            pattern: "*.txt".into(),
            completed_files: BTreeSet::new(),
            in_progress_files: BTreeMap::new(),
            last_modified_times: BTreeMap::new(),
        };
        state.in_progress_files.insert(
            "/data/big.bin".into(),
            InProgressSession { session_id: "mpu-1".into(), part_number: 2, offset: 1024 },
        );

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["in_progress_files"]["/data/big.bin"]["upload_id"], "mpu-1");
        assert_eq!(value["in_progress_files"]["/data/big.bin"]["part_number"], 2);
        assert!(value["completed_files"].as_array().unwrap().is_empty());
    }
}
