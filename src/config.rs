use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use crate::coordinator::CoordinatorConfig;
use crate::core::{Result, TransferError, UploaderConfig, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_WORKERS};
use crate::store::S3ClientConfig;

/// Looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "bucketsync.toml";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub log_dir: PathBuf,
    pub state_file: Option<PathBuf>,
    pub scan_interval_secs: u64,
    pub max_workers: usize,
    pub chunk_size: u64,
    pub max_attempts: u32,
    pub s3: S3Settings,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct S3Settings {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub path_style: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            state_file: None,
            scan_interval_secs: 30,
            max_workers: DEFAULT_MAX_WORKERS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_attempts: 3,
            s3: S3Settings::default(),
        }
    }
}

impl Config {
    /// Load `path`, or `bucketsync.toml` if present, or the defaults.
    ///
    /// Only an explicitly named file is required to exist.
    pub fn load_config(path: Option<&Path>) -> Result<Config> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    return Ok(Config::default());
                }
                default
            }
        };

        let config_str = fs::read_to_string(&path)
            .map_err(|err| TransferError::Config(format!("Cannot read {}: {}", path.display(), err)))?;
        Self::from_toml(&config_str)
            .map_err(|err| TransferError::Config(format!("Cannot load {}: {}", path.display(), err)))
    }

    pub fn from_toml(config_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(config_str).map_err(|err| TransferError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make every transfer fail or stall
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("chunk_size", self.chunk_size == 0),
            ("max_attempts", self.max_attempts == 0),
            ("max_workers", self.max_workers == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((name, _)) => Err(TransferError::Config(format!("{} must be greater than zero", name))),
            None => Ok(()),
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.log_dir.join(crate::tracker::STATE_FILE_NAME))
    }

    pub fn uploader_config(&self) -> UploaderConfig {
        UploaderConfig {
            chunk_size: self.chunk_size,
            max_workers: self.max_workers,
            max_attempts: self.max_attempts,
            ..UploaderConfig::default()
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            log_dir: Some(self.log_dir.clone()),
            state_file: Some(self.state_file()),
            scan_interval: Duration::from_secs(self.scan_interval_secs),
            uploader: self.uploader_config(),
        }
    }

    /// S3 client settings with unset fields filled from the standard AWS variables
    pub fn s3_client_config(&self) -> S3ClientConfig {
        self.s3_client_config_with(|name| std::env::var(name).ok())
    }

    pub fn s3_client_config_with(&self, env: impl Fn(&str) -> Option<String>) -> S3ClientConfig {
        let s3 = &self.s3;
        let defaults = S3ClientConfig::default();

        S3ClientConfig {
            endpoint: s3.endpoint.clone().or_else(|| env("S3_ENDPOINT")),
            region: s3
                .region
                .clone()
                .or_else(|| env("AWS_REGION"))
                .or_else(|| env("AWS_DEFAULT_REGION"))
                .unwrap_or(defaults.region),
            access_key_id: s3.access_key_id.clone().or_else(|| env("AWS_ACCESS_KEY_ID")).unwrap_or_default(),
            secret_access_key: s3
                .secret_access_key
                .clone()
                .or_else(|| env("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_default(),
            session_token: s3.session_token.clone().or_else(|| env("AWS_SESSION_TOKEN")),
            path_style: s3.path_style,
            timeout: defaults.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.state_file(), PathBuf::from("logs/upload_state.json"));
        assert_eq!(config.scan_interval_secs, 30);
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.chunk_size, 8 * 1024 * 1024);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_file_values() {
        let config = Config::from_toml(
            r#"
            log_dir = "/var/log/bucketsync"
            scan_interval_secs = 5
            max_workers = 2
            chunk_size = 1048576

            [s3]
            endpoint = "http://localhost:9000"
            region = "eu-west-1"
            path_style = true
            "#,
        )
        .unwrap();

        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.scan_interval, Duration::from_secs(5));
        assert_eq!(coordinator.uploader.max_workers, 2);
        assert_eq!(coordinator.uploader.chunk_size, 1048576);
        assert_eq!(coordinator.state_file, Some(PathBuf::from("/var/log/bucketsync/upload_state.json")));

        let s3 = config.s3_client_config_with(|_| None);
        assert_eq!(s3.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(s3.region, "eu-west-1");
        assert!(s3.path_style);
    }

    #[test]
    fn test_env_fallback() {
        let env = HashMap::from([
            ("AWS_ACCESS_KEY_ID", "AKID"),
            ("AWS_SECRET_ACCESS_KEY", "SECRET"),
            ("AWS_DEFAULT_REGION", "ap-south-1"),
        ]);
        let mut config = Config::default();
        config.s3.access_key_id = Some("FROMFILE".into());

        let s3 = config.s3_client_config_with(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(s3.access_key_id, "FROMFILE");
        assert_eq!(s3.secret_access_key, "SECRET");
        assert_eq!(s3.region, "ap-south-1");
        assert_eq!(s3.endpoint, None);
    }

    #[test]
    fn test_bad_config() {
        assert!(matches!(Config::from_toml("max_workers = \"many\""), Err(TransferError::Config(_))));
        assert!(Config::from_toml("chunk_size = 0").is_err());
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        for input in ["max_attempts = 0", "max_workers = 0"] {
            match Config::from_toml(input) {
                Err(TransferError::Config(message)) => assert!(message.contains("must be greater than zero")),
                other => panic!("{} accepted: {:?}", input, other.map(|c| c.max_workers)),
            }
        }

        let mut config = Config::default();
        assert!(config.validate().is_ok());
        config.max_workers = 0;
        assert!(matches!(config.validate(), Err(TransferError::Config(_))));
    }

    #[test]
    fn test_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
