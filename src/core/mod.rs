mod types;
mod traits;
mod errors;

pub use types::{
    CompletedPart,
    InProgressSession,
    MonitoredFolder,
    ObjectHead,
    StateFile,
    UploadRequest,
    UploadResult,
    UploadState,
    UploadSummary,
    UploaderConfig,
    DEFAULT_CHUNK_SIZE,
    DEFAULT_MAX_WORKERS,
    DEFAULT_PATTERN,
};
pub use traits::{ChangeHandler, ObjectStore, PartObserver};
pub use errors::{is_retryable_code, Result, TransferError};
