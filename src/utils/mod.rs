pub mod format;
pub mod retry;

pub use format::{format_bytes, format_duration};
pub use retry::{retry_with_config, RetryBuilder, RetryConfig, RetryStrategy};
