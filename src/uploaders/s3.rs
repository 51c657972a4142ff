use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use bytes::Bytes;
use futures::future::join_all;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use crate::core::{
    CompletedPart,
    ObjectStore,
    PartObserver,
    Result,
    UploadResult,
    UploadSummary,
    UploaderConfig,
};
use crate::scanner;
use crate::utils::retry::retry_with_config;

/// Upload id and source root a batch belongs to
#[derive(Debug, Clone)]
struct UploadScope {
    upload_id: String,
    root: PathBuf,
}

/// Transfers files to an object store.
///
/// Files up to `chunk_size` bytes go out in a single put; larger ones through a
/// multipart session with `chunk_size` parts. Failures never escape: they are
/// folded into the returned [`UploadResult`].
#[derive(Clone)]
pub struct S3Uploader {
    store: Arc<dyn ObjectStore>,
    config: UploaderConfig,
    scope: Option<UploadScope>,
    observer: Option<Arc<dyn PartObserver>>,
}

/// State of a multipart transfer after the session is open
struct Multipart {
    session_id: String,
    parts: Vec<CompletedPart>,
    offset: u64,
}

impl S3Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, config: UploaderConfig) -> Self {
        Self {
            store,
            config,
            scope: None,
            observer: None,
        }
    }

    /// Bind to an upload: summaries carry its id and keys are relative to `root`
    pub fn with_scope(mut self, upload_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.scope = Some(UploadScope {
            upload_id: upload_id.into(),
            root: root.into(),
        });
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PartObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.scope.as_ref().map(|scope| scope.upload_id.as_str())
    }

    /// Destination key for a file
    pub fn key_for(&self, file_path: &Path) -> String {
        match &self.scope {
            Some(scope) => scanner::object_key(file_path, &scope.root),
            None => file_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_path.to_string_lossy().into_owned()),
        }
    }

    /// Upload one file, picking simple or multipart by size
    pub async fn upload_file(
        &self,
        file_path: &Path,
        bucket: &str,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> UploadResult {
        let size = match tokio::fs::metadata(file_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                return UploadResult::failed(file_path.to_path_buf(), key.to_string(), None, "Not a regular file");
            }
            Err(err) => {
                error!(path = %file_path.display(), %err, "Cannot stat file");
                return UploadResult::failed(file_path.to_path_buf(), key.to_string(), None, err.to_string());
            }
        };

        if size > self.config.chunk_size {
            self.upload_multipart(file_path, bucket, key, size, metadata).await
        } else {
            self.upload_simple(file_path, bucket, key, size, metadata).await
        }
    }

    /// Upload a batch through a bounded worker pool.
    ///
    /// Results keep input order; a failing or panicking file never affects the others.
    pub async fn upload_files(
        &self,
        files: impl IntoIterator<Item = PathBuf>,
        bucket: &str,
        metadata: &HashMap<String, String>,
    ) -> UploadSummary {
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let metadata = Arc::new(metadata.clone());

        let tasks: Vec<_> = files
            .into_iter()
            .map(|file_path| {
                let key = self.key_for(&file_path);
                let uploader = self.clone();
                let semaphore = semaphore.clone();
                let metadata = metadata.clone();
                let bucket = bucket.to_string();
                let task_path = file_path.clone();
                let task_key = key.clone();

                let handle = tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return UploadResult::failed(task_path, task_key, None, "Worker pool closed");
                    };
                    uploader.upload_file(&task_path, &bucket, &task_key, &metadata).await
                });

                (file_path, key, handle)
            })
            .collect();

        let (meta, handles): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .map(|(path, key, handle)| ((path, key), handle))
            .unzip();

        let results = join_all(handles)
            .await
            .into_iter()
            .zip(meta)
            .map(|(joined, (path, key))| match joined {
                Ok(result) => result,
                Err(err) => {
                    error!(path = %path.display(), %err, "Upload task failed");
                    UploadResult::failed(path, key, None, err.to_string())
                }
            })
            .collect();

        let upload_id = match &self.scope {
            Some(scope) => scope.upload_id.clone(),
            None => Uuid::new_v4().to_string(),
        };
        UploadSummary::from_results(upload_id, results)
    }

    async fn upload_simple(
        &self,
        file_path: &Path,
        bucket: &str,
        key: &str,
        size: u64,
        metadata: &HashMap<String, String>,
    ) -> UploadResult {
        debug!(path = %file_path.display(), bucket, key, size, "Simple upload");
        let retry = self.config.retry_config();

        let outcome = retry_with_config(&retry, || async {
            let body = tokio::fs::read(file_path).await?;
            self.store.put_object(bucket, key, Bytes::from(body), metadata).await
        })
        .await;

        match outcome {
            Ok(etag) => {
                info!(path = %file_path.display(), bucket, key, "Successfully uploaded");
                UploadResult::succeeded(file_path.to_path_buf(), key.to_string(), size, etag)
            }
            Err(err) => {
                error!(path = %file_path.display(), bucket, key, %err, "Error uploading");
                UploadResult::failed(file_path.to_path_buf(), key.to_string(), Some(size), err.to_string())
            }
        }
    }

    async fn upload_multipart(
        &self,
        file_path: &Path,
        bucket: &str,
        key: &str,
        size: u64,
        metadata: &HashMap<String, String>,
    ) -> UploadResult {
        debug!(path = %file_path.display(), bucket, key, size, "Multipart upload");
        let retry = self.config.retry_config();

        let session_id = match retry_with_config(&retry, || self.store.create_multipart_upload(bucket, key, metadata)).await {
            Ok(session_id) => session_id,
            Err(err) => {
                error!(path = %file_path.display(), bucket, key, %err, "Cannot open multipart session");
                return UploadResult::failed(file_path.to_path_buf(), key.to_string(), Some(size), err.to_string());
            }
        };

        let mut transfer = Multipart {
            session_id,
            parts: Vec::new(),
            offset: 0,
        };

        match self.transfer_parts(file_path, bucket, key, &mut transfer).await {
            Ok(()) => {
                let last = transfer.parts.last();
                info!(
                    path = %file_path.display(),
                    bucket,
                    key,
                    session_id = %transfer.session_id,
                    parts = transfer.parts.len(),
                    "Successfully completed multipart upload"
                );
                UploadResult::succeeded(
                    file_path.to_path_buf(),
                    key.to_string(),
                    size,
                    last.map(|part| part.etag.clone()),
                )
                .with_session(
                    transfer.session_id.clone(),
                    last.map(|part| part.part_number).unwrap_or(0),
                    transfer.offset,
                )
            }
            Err(err) => {
                error!(
                    path = %file_path.display(),
                    bucket,
                    key,
                    session_id = %transfer.session_id,
                    %err,
                    "Multipart upload failed, aborting session"
                );
                if let Err(abort_err) = self.store.abort_multipart_upload(bucket, key, &transfer.session_id).await {
                    warn!(session_id = %transfer.session_id, %abort_err, "Abort failed");
                }

                let part_number = transfer.parts.last().map(|part| part.part_number).unwrap_or(0);
                UploadResult::failed(file_path.to_path_buf(), key.to_string(), Some(size), err.to_string())
                    .with_session(transfer.session_id.clone(), part_number, transfer.offset)
            }
        }
    }

    /// Stream the file part by part and finalize the session
    async fn transfer_parts(
        &self,
        file_path: &Path,
        bucket: &str,
        key: &str,
        transfer: &mut Multipart,
    ) -> Result<()> {
        let retry = self.config.retry_config();
        let mut file = File::open(file_path).await?;
        let mut part_number = 0u32;

        loop {
            let mut buffer = Vec::with_capacity(self.config.chunk_size as usize);
            (&mut file).take(self.config.chunk_size).read_to_end(&mut buffer).await?;
            if buffer.is_empty() {
                break;
            }

            part_number += 1;
            let len = buffer.len() as u64;
            let body = Bytes::from(buffer);
            let session_id = transfer.session_id.as_str();

            let etag = retry_with_config(&retry, || {
                self.store.upload_part(bucket, key, session_id, part_number, body.clone())
            })
            .await?;

            transfer.offset += len;
            transfer.parts.push(CompletedPart { part_number, etag });
            debug!(key, session_id, part_number, offset = transfer.offset, "Uploaded part");

            if let Some(observer) = &self.observer {
                observer
                    .on_part_uploaded(file_path, session_id, part_number, transfer.offset)
                    .await;
            }
        }

        let parts = transfer.parts.as_slice();
        let session_id = transfer.session_id.as_str();
        retry_with_config(&retry, || self.store.complete_multipart_upload(bucket, key, session_id, parts)).await?;
        Ok(())
    }
}
