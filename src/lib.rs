pub mod core;
pub mod scanner;
pub mod tracker;
pub mod uploaders;
pub mod store;
pub mod monitor;
pub mod coordinator;
pub mod utils;
pub mod config;
pub mod logging;

pub use self::core::{
    ChangeHandler,
    CompletedPart,
    InProgressSession,
    MonitoredFolder,
    ObjectHead,
    ObjectStore,
    PartObserver,
    Result,
    TransferError,
    UploadRequest,
    UploadResult,
    UploadState,
    UploadSummary,
    UploaderConfig,
};

pub use coordinator::{CoordinatorConfig, UploadCoordinator};
pub use monitor::FolderMonitor;
pub use store::{S3Client, S3ClientConfig};
pub use tracker::UploadTracker;
pub use uploaders::S3Uploader;
