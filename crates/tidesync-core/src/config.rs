use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::SyncError;

pub const MIB: u64 = 1024 * 1024;
/// Largest object a single PUT may carry, in MiB
pub const MAX_MULTIPART_THRESHOLD_MIB: u64 = 5 * 1024;

/// Top-level configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TidesyncConfig {
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub retry: RetryConfig,
    pub log: LogConfig,
}

impl TidesyncConfig {
    /// Load from `path`, or return defaults when the file does not exist
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(TidesyncConfig::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: TidesyncConfig = toml::from_str(&content)
            .map_err(|e| SyncError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no upload could honour
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.sync.multipart_threshold_mib > MAX_MULTIPART_THRESHOLD_MIB {
            return Err(SyncError::Config(format!(
                "sync.multipart_threshold_mib = {} exceeds the single-request limit of {MAX_MULTIPART_THRESHOLD_MIB} MiB",
                self.sync.multipart_threshold_mib
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Custom S3-compatible endpoint (default: AWS)
    pub endpoint: Option<String>,
    /// Region (falls back to AWS_REGION, then us-east-1)
    pub region: Option<String>,
    /// Shared-config profile name for credential loading
    pub profile: Option<String>,
    /// Enforce HTTPS for custom endpoints
    pub enforce_tls: bool,
    /// Timeout for non-IO operations (stat, delete, list) in seconds
    pub op_timeout_secs: u64,
    /// Timeout for IO operations (write, part upload) in seconds
    pub io_timeout_secs: u64,
    /// Concurrent part uploads inside one multipart session
    pub part_concurrency: usize,
    /// Use the native `x-amz-checksum-crc64nvme` field; turn off for
    /// S3-compatible stores that do not implement it
    pub native_checksums: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Concurrent execution workers
    pub concurrency: usize,
    /// Directory scan workers (capped at 32)
    pub scan_workers: usize,
    /// Concurrent fingerprint collection workers
    pub fingerprint_workers: usize,
    /// Files at or above this size use multipart upload (MiB)
    pub multipart_threshold_mib: u64,
    /// Exclude patterns applied in addition to --exclude
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Backoff base delay in milliseconds
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: None,
            profile: None,
            enforce_tls: false,
            op_timeout_secs: 60,
            io_timeout_secs: 300,
            part_concurrency: 4,
            native_checksums: true,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 32,
            scan_workers: 8,
            fingerprint_workers: 16,
            multipart_threshold_mib: 8,
            exclude_patterns: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Threshold in bytes, never above the 5 GiB single-request limit
    pub fn multipart_threshold_bytes(&self) -> u64 {
        self.multipart_threshold_mib
            .min(MAX_MULTIPART_THRESHOLD_MIB)
            .saturating_mul(MIB)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[storage]
endpoint = "https://minio.example.com:9000"
region = "eu-west-1"
profile = "backup"
enforce_tls = true
part_concurrency = 8

[sync]
concurrency = 64
scan_workers = 16
fingerprint_workers = 4
multipart_threshold_mib = 16
exclude_patterns = ["*.tmp", ".git/*"]

[retry]
max_retries = 3
base_delay_ms = 50
max_delay_ms = 5000

[log]
level = "debug"
format = "json"
"#;
        let config: TidesyncConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(
            config.storage.endpoint.as_deref(),
            Some("https://minio.example.com:9000")
        );
        assert_eq!(config.storage.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.storage.profile.as_deref(), Some("backup"));
        assert!(config.storage.enforce_tls);
        assert_eq!(config.storage.part_concurrency, 8);
        assert_eq!(config.sync.concurrency, 64);
        assert_eq!(config.sync.scan_workers, 16);
        assert_eq!(config.sync.multipart_threshold_bytes(), 16 * MIB);
        assert_eq!(config.sync.exclude_patterns, vec!["*.tmp", ".git/*"]);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config: TidesyncConfig = toml::from_str("").unwrap();

        assert!(config.storage.endpoint.is_none());
        assert_eq!(config.storage.op_timeout_secs, 60);
        assert_eq!(config.sync.concurrency, 32);
        assert_eq!(config.sync.scan_workers, 8);
        assert_eq!(config.sync.multipart_threshold_bytes(), 8 * MIB);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 100);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[sync]
concurrency = 4
"#;
        let config: TidesyncConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.sync.concurrency, 4);
        // Defaults
        assert_eq!(config.sync.fingerprint_workers, 16);
        assert_eq!(config.retry.max_retries, 5);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = TidesyncConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.sync.concurrency, 32);
    }

    #[test]
    fn test_load_invalid_file_is_config_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[sync]\nconcurrency = \"many\"\n").unwrap();
        let err = TidesyncConfig::load(&path).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)), "got {err:?}");
    }

    #[test]
    fn test_threshold_is_capped_without_overflow() {
        let mut sync = SyncConfig {
            multipart_threshold_mib: u64::MAX,
            ..Default::default()
        };
        assert_eq!(sync.multipart_threshold_bytes(), 5 * 1024 * MIB);

        sync.multipart_threshold_mib = MAX_MULTIPART_THRESHOLD_MIB;
        assert_eq!(sync.multipart_threshold_bytes(), 5 * 1024 * MIB);
        sync.multipart_threshold_mib = 64;
        assert_eq!(sync.multipart_threshold_bytes(), 64 * MIB);
    }

    #[test]
    fn test_load_rejects_oversized_threshold() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[sync]\nmultipart_threshold_mib = 17592186044416\n").unwrap();
        let err = TidesyncConfig::load(&path).unwrap_err();
        assert!(
            matches!(err, SyncError::Config(ref msg) if msg.contains("multipart_threshold_mib")),
            "got {err:?}"
        );

        std::fs::write(&path, "[sync]\nmultipart_threshold_mib = 5120\n").unwrap();
        assert!(TidesyncConfig::load(&path).is_ok());
    }

    #[test]
    fn test_native_checksums_default_on() {
        let config: TidesyncConfig = toml::from_str("").unwrap();
        assert!(config.storage.native_checksums);
        let config: TidesyncConfig =
            toml::from_str("[storage]\nnative_checksums = false\n").unwrap();
        assert!(!config.storage.native_checksums);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = TidesyncConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: TidesyncConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.sync.concurrency, parsed.sync.concurrency);
        assert_eq!(config.retry.max_delay_ms, parsed.retry.max_delay_ms);
    }
}
