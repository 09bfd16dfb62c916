//! Native S3 full-object CRC-64/NVME checksums
//!
//! OpenDAL's S3 service only negotiates CRC32C, so objects are read and
//! single-request writes are sent here with SigV4-signed requests that carry
//! the `x-amz-checksum-crc64nvme` header pair. S3 verifies the value on
//! upload and returns it from `HEAD` when checksum mode is enabled.

use bytes::Bytes;
use reqsign::{AwsConfig, AwsCredential, AwsDefaultLoader, AwsV4Signer};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Method, Request, StatusCode, Url};
use tidesync_core::StoreError;

use crate::operator::S3Options;
use crate::store::{ObjectHead, PutOptions};

pub const CHECKSUM_HEADER: &str = "x-amz-checksum-crc64nvme";
const CHECKSUM_MODE_HEADER: &str = "x-amz-checksum-mode";
/// User-metadata copy of the fingerprint, for stores that never checksummed
const METADATA_HEADER: &str = "x-amz-meta-crc64nvme";

/// Signed HEAD/PUT client bound to one bucket
pub struct NativeChecksums {
    client: Client,
    loader: AwsDefaultLoader,
    signer: AwsV4Signer,
    bucket_url: Url,
}

impl NativeChecksums {
    pub fn new(opts: &S3Options) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(opts.op_timeout)
            .timeout(opts.io_timeout)
            .build()?;
        let mut config = AwsConfig::default().from_profile().from_env();
        config.region = Some(opts.region.clone());
        let loader = AwsDefaultLoader::new(client.clone(), config);
        let signer = AwsV4Signer::new("s3", &opts.region);

        Ok(Self {
            client,
            loader,
            signer,
            bucket_url: bucket_url(opts)?,
        })
    }

    pub async fn head(&self, key: &str) -> Result<ObjectHead, StoreError> {
        let mut req = Request::new(Method::HEAD, object_url(&self.bucket_url, key)?);
        req.headers_mut()
            .insert(CHECKSUM_MODE_HEADER, HeaderValue::from_static("ENABLED"));
        let resp = self.send(req, key).await?;
        parse_head(resp.headers(), key)
    }

    /// Single-request upload; S3 rejects the body if it does not hash to the
    /// supplied fingerprint.
    pub async fn put(&self, key: &str, body: Bytes, opts: &PutOptions) -> Result<(), StoreError> {
        let mut req = Request::new(Method::PUT, object_url(&self.bucket_url, key)?);
        let headers = req.headers_mut();
        if let Some(ct) = opts.content_type.as_deref() {
            headers.insert(CONTENT_TYPE, header_value(ct, key)?);
        }
        if let Some(fp) = opts.fingerprint.as_deref() {
            headers.insert(CHECKSUM_HEADER, header_value(fp, key)?);
            headers.insert(METADATA_HEADER, header_value(fp, key)?);
        }
        *req.body_mut() = Some(body.into());

        self.send(req, key).await?;
        Ok(())
    }

    async fn credential(&self) -> Result<Option<AwsCredential>, StoreError> {
        self.loader
            .load()
            .await
            .map_err(|e| StoreError::Temporary(format!("loading AWS credentials: {e}")))
    }

    async fn send(&self, mut req: Request, key: &str) -> Result<reqwest::Response, StoreError> {
        // No credential means an anonymous request against a public bucket
        if let Some(cred) = self.credential().await? {
            self.signer
                .sign(&mut req, &cred)
                .map_err(|e| StoreError::InvalidRequest(format!("signing request for {key}: {e}")))?;
        }
        let resp = self
            .client
            .execute(req)
            .await
            .map_err(|e| map_transport_error(&e, key))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(map_status(status, &body, key))
    }
}

fn bucket_url(opts: &S3Options) -> anyhow::Result<Url> {
    let endpoint = match &opts.endpoint {
        Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
        None => format!("https://s3.{}.amazonaws.com", opts.region),
    };
    let mut url = Url::parse(&endpoint)?;
    url.path_segments_mut()
        .map_err(|()| anyhow::anyhow!("endpoint {endpoint} cannot carry a path"))?
        .pop_if_empty()
        .push(&opts.bucket);
    Ok(url)
}

/// Path-style URL of `key` under the bucket
fn object_url(bucket_url: &Url, key: &str) -> Result<Url, StoreError> {
    let mut url = bucket_url.clone();
    url.path_segments_mut()
        .map_err(|()| StoreError::InvalidRequest(format!("cannot address {key}")))?
        .extend(key.split('/'));
    Ok(url)
}

fn header_value(value: &str, key: &str) -> Result<HeaderValue, StoreError> {
    HeaderValue::from_str(value)
        .map_err(|_| StoreError::InvalidRequest(format!("{key}: header value {value:?} is not valid")))
}

/// Size and fingerprint from a checksum-mode HEAD response. The native
/// checksum wins; the metadata copy covers objects S3 never checksummed.
pub(crate) fn parse_head(headers: &HeaderMap, key: &str) -> Result<ObjectHead, StoreError> {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let size = text(CONTENT_LENGTH.as_str())
        .ok_or_else(|| StoreError::Other(format!("{key}: HEAD response has no content length")))?
        .parse::<u64>()
        .map_err(|e| StoreError::Other(format!("{key}: bad content length: {e}")))?;
    let fingerprint = text(CHECKSUM_HEADER)
        .or_else(|| text(METADATA_HEADER))
        .map(str::to_string);

    Ok(ObjectHead { size, fingerprint })
}

/// S3 error code from an XML error body, if there is one
fn error_code(body: &str) -> Option<&str> {
    let start = body.find("<Code>")? + "<Code>".len();
    let len = body[start..].find("</Code>")?;
    Some(body[start..start + len].trim()).filter(|c| !c.is_empty())
}

pub(crate) fn map_status(status: StatusCode, body: &str, key: &str) -> StoreError {
    if status == StatusCode::NOT_FOUND {
        return StoreError::NotFound(key.to_string());
    }
    let code = match error_code(body) {
        Some(code) => code.to_string(),
        None if status == StatusCode::TOO_MANY_REQUESTS => "TooManyRequests".to_string(),
        None if status == StatusCode::SERVICE_UNAVAILABLE => "ServiceUnavailable".to_string(),
        None => status
            .canonical_reason()
            .unwrap_or("UnknownError")
            .replace(' ', ""),
    };
    StoreError::api(code, status.as_u16(), key)
}

fn map_transport_error(err: &reqwest::Error, key: &str) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout(format!("{key}: {err}"))
    } else if err.is_connect() || err.is_request() || err.is_body() {
        StoreError::Temporary(format!("{key}: {err}"))
    } else {
        StoreError::Other(format!("{key}: {err}"))
    }
}
