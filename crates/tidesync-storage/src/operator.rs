//! OpenDAL Operator factory for the sync target

use anyhow::{Context, Result};
use opendal::layers::{LoggingLayer, TimeoutLayer};
use opendal::Operator;
use std::time::Duration;
use tidesync_core::config::StorageConfig;

const DEFAULT_REGION: &str = "us-east-1";

/// Everything needed to bind an operator to one bucket
#[derive(Debug, Clone)]
pub struct S3Options {
    pub bucket: String,
    pub region: String,
    /// Custom S3-compatible endpoint; `None` means AWS
    pub endpoint: Option<String>,
    pub op_timeout: Duration,
    pub io_timeout: Duration,
}

/// Build an OpenDAL S3 Operator bound to `opts.bucket`.
///
/// Credentials come from the standard AWS chain (environment, shared
/// config/credentials files honouring `AWS_PROFILE`, instance metadata).
/// Retries are not installed here; callers wrap the store in
/// [`RetryingStore`](crate::RetryingStore).
pub fn build_operator(opts: &S3Options) -> Result<Operator> {
    // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
    let mut builder = opendal::services::S3::default()
        .bucket(&opts.bucket)
        .region(&opts.region);
    if let Some(endpoint) = &opts.endpoint {
        builder = builder.endpoint(endpoint);
    }

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(LoggingLayer::default())
        .layer(
            TimeoutLayer::default()
                .with_timeout(opts.op_timeout)
                .with_io_timeout(opts.io_timeout),
        )
        .finish();

    Ok(op)
}

/// Resolve the region: explicit value, then `AWS_REGION`, then us-east-1
pub fn resolve_region(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var("AWS_REGION").ok().filter(|r| !r.is_empty()))
        .unwrap_or_else(|| DEFAULT_REGION.to_string())
}

/// Validate the `[storage]` section and resolve it into [`S3Options`].
///
/// If `enforce_tls` is true and the endpoint uses HTTP, this returns an error.
/// Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn s3_options(storage: &StorageConfig, bucket: &str) -> Result<S3Options> {
    if let Some(endpoint) = storage.endpoint.as_deref() {
        if endpoint.starts_with("http://") {
            if storage.enforce_tls {
                anyhow::bail!(
                    "S3 endpoint uses plaintext HTTP ({endpoint}), but enforce_tls is enabled. \
                     Use an HTTPS endpoint or set storage.enforce_tls = false."
                );
            }
            tracing::warn!(
                endpoint,
                "S3 endpoint uses plaintext HTTP, request signatures and data travel unencrypted"
            );
        }
    }

    Ok(S3Options {
        bucket: bucket.to_string(),
        region: resolve_region(storage.region.as_deref()),
        endpoint: storage.endpoint.clone(),
        op_timeout: Duration::from_secs(storage.op_timeout_secs),
        io_timeout: Duration::from_secs(storage.io_timeout_secs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_operator_valid() {
        let opts = S3Options {
            bucket: "test-bucket".to_string(),
            region: "us-east-1".to_string(),
            endpoint: Some("http://localhost:9000".to_string()),
            op_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
        };
        assert!(build_operator(&opts).is_ok(), "operator construction should succeed");
    }

    #[test]
    fn test_s3_options_http_warning() {
        let storage = StorageConfig {
            endpoint: Some("http://localhost:9000".into()),
            region: Some("eu-west-1".into()),
            enforce_tls: false,
            ..Default::default()
        };
        assert!(build_operator(&s3_options(&storage, "bucket").unwrap()).is_ok());
    }

    #[test]
    fn test_s3_options_http_enforce_tls() {
        let storage = StorageConfig {
            endpoint: Some("http://insecure:9000".into()),
            enforce_tls: true,
            ..Default::default()
        };
        let result = s3_options(&storage, "bucket");
        assert!(result.is_err(), "HTTP + enforce_tls must fail");
        assert!(result.unwrap_err().to_string().contains("enforce_tls"));
    }

    #[test]
    fn test_s3_options_default_endpoint() {
        let storage = StorageConfig {
            region: Some("us-west-2".into()),
            enforce_tls: true,
            ..Default::default()
        };
        assert!(build_operator(&s3_options(&storage, "bucket").unwrap()).is_ok());
    }

    #[test]
    fn test_s3_options_carry_timeouts() {
        let storage = StorageConfig {
            region: Some("eu-central-1".into()),
            op_timeout_secs: 7,
            io_timeout_secs: 70,
            ..Default::default()
        };
        let opts = s3_options(&storage, "bucket").unwrap();
        assert_eq!(opts.bucket, "bucket");
        assert_eq!(opts.region, "eu-central-1");
        assert_eq!(opts.op_timeout, Duration::from_secs(7));
        assert_eq!(opts.io_timeout, Duration::from_secs(70));
    }

    #[test]
    fn test_explicit_region_wins() {
        assert_eq!(resolve_region(Some("ap-south-1")), "ap-south-1");
    }
}
