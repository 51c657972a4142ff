use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use bytes::Bytes;
use super::types::{CompletedPart, ObjectHead};
use super::errors::Result;

/// Remote object store capability - everything the transfer engine needs from an S3-compatible API
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Single atomic put, returns the object's integrity tag
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        metadata: &HashMap<String, String>,
    ) -> Result<Option<String>>;

    /// Open a chunked session, returns its id
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String>;

    /// Upload one part, returns the part tag
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        session_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String>;

    /// Finalize a session from its ordered part list
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        session_id: &str,
        parts: &[CompletedPart],
    ) -> Result<Option<String>>;

    /// Drop a session and the parts already stored under it
    async fn abort_multipart_upload(&self, bucket: &str, key: &str, session_id: &str) -> Result<()>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead>;
}

/// Receives the files a monitor poll found new or modified
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn on_changes(&self, upload_id: &str, changed_files: BTreeSet<PathBuf>) -> Result<()>;
}

/// Notified after every part of a chunked transfer lands
#[async_trait]
pub trait PartObserver: Send + Sync {
    async fn on_part_uploaded(&self, file_path: &Path, session_id: &str, part_number: u32, offset: u64);
}
