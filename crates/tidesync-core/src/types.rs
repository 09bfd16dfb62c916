use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::error::SyncError;

/// Identity of one item on either side: relative path + byte size
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemRef {
    pub path: String,
    pub size: u64,
}

impl ItemRef {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        ItemRef {
            path: path.into(),
            size,
        }
    }
}

/// Metadata for a local file or a remote object.
///
/// `path` is relative to the sync root (local) or the remote prefix (remote),
/// always with forward slashes. Local scans leave `fingerprint` empty; the
/// remote lister fills it when the store recorded one at upload time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMetadata {
    pub path: String,
    pub size: u64,
    pub mod_time: Option<SystemTime>,
    pub fingerprint: Option<String>,
}

impl ItemMetadata {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        ItemMetadata {
            path: path.into(),
            size,
            mod_time: None,
            fingerprint: None,
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn item_ref(&self) -> ItemRef {
        ItemRef::new(self.path.clone(), self.size)
    }
}

/// Output of the pure comparison phase: five disjoint, path-sorted buckets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Phase1Result {
    /// Present locally, absent remotely
    pub new_items: Vec<ItemRef>,
    /// Present remotely only (populated only when deletion is enabled)
    pub deleted_items: Vec<ItemRef>,
    /// Same path, different size
    pub size_mismatch: Vec<ItemRef>,
    /// Same path and size, fingerprint unknown on at least one side
    pub need_fingerprint: Vec<ItemRef>,
    /// Same path, size, and non-empty matching fingerprints
    pub identical: Vec<ItemRef>,
}

impl Phase1Result {
    /// Number of paths across all five buckets
    pub fn total(&self) -> usize {
        self.new_items.len()
            + self.deleted_items.len()
            + self.size_mismatch.len()
            + self.need_fingerprint.len()
            + self.identical.len()
    }
}

/// Local and remote fingerprints for one ambiguous item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintData {
    pub item: ItemRef,
    pub source_fingerprint: String,
    pub dest_fingerprint: String,
}

impl FingerprintData {
    pub fn matches(&self) -> bool {
        self.source_fingerprint == self.dest_fingerprint
    }
}

/// Plan action. Variant order is the plan sort order (delete before upload).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    Delete,
    Upload,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Delete => "delete",
            Action::Upload => "upload",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a plan item exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    NewFile,
    SizeDiffers,
    ChecksumDiffers,
    DeletedLocally,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::NewFile => "new file",
            Reason::SizeDiffers => "size differs",
            Reason::ChecksumDiffers => "checksum differs",
            Reason::DeletedLocally => "deleted locally",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One proposed remote mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanItem {
    pub action: Action,
    /// Absolute or root-joined local path; `None` for deletions
    pub local_path: Option<PathBuf>,
    /// Bucket-relative object key
    pub remote_key: String,
    pub size: u64,
    pub reason: Reason,
    /// Full-object fingerprint when already known at planning time
    pub fingerprint: Option<String>,
}

impl PlanItem {
    /// True for uploads that create an object rather than replace one
    pub fn is_create(&self) -> bool {
        self.action == Action::Upload && self.reason == Reason::NewFile
    }
}

/// Outcome of executing one plan item
#[derive(Debug)]
pub struct ExecutionResult {
    pub item: PlanItem,
    pub error: Option<SyncError>,
}

impl ExecutionResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Target container + key prefix, parsed from `s3://bucket/prefix`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    pub bucket: String,
    /// Key prefix without leading or trailing slashes (may be empty)
    pub prefix: String,
}

impl RemoteLocation {
    pub fn new(bucket: impl Into<String>, prefix: impl AsRef<str>) -> Self {
        RemoteLocation {
            bucket: bucket.into(),
            prefix: prefix.as_ref().trim_matches('/').to_string(),
        }
    }

    /// Parse an `s3://bucket[/prefix]` URI
    pub fn parse(uri: &str) -> Result<Self, SyncError> {
        let rest = uri.strip_prefix("s3://").ok_or_else(|| {
            SyncError::InvalidLocation(format!("URI must start with s3:// (got {uri})"))
        })?;
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(SyncError::InvalidLocation(format!(
                "bucket name cannot be empty (got {uri})"
            )));
        }
        Ok(RemoteLocation::new(bucket, prefix))
    }

    /// Bucket-relative key for a root-relative path
    pub fn key_for(&self, rel_path: &str) -> String {
        if self.prefix.is_empty() {
            rel_path.to_string()
        } else {
            format!("{}/{}", self.prefix, rel_path)
        }
    }

    /// Display form of a key: `s3://bucket/key`
    pub fn target(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

impl fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "s3://{}", self.bucket)
        } else {
            write!(f, "s3://{}/{}", self.bucket, self.prefix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bucket_and_prefix() {
        let loc = RemoteLocation::parse("s3://my-bucket/some/prefix/").unwrap();
        assert_eq!(loc.bucket, "my-bucket");
        assert_eq!(loc.prefix, "some/prefix");
        assert_eq!(loc.key_for("a/b.txt"), "some/prefix/a/b.txt");
        assert_eq!(loc.to_string(), "s3://my-bucket/some/prefix");
    }

    #[test]
    fn parse_bucket_only() {
        let loc = RemoteLocation::parse("s3://my-bucket").unwrap();
        assert_eq!(loc.prefix, "");
        assert_eq!(loc.key_for("a.txt"), "a.txt");
        assert_eq!(loc.target("a.txt"), "s3://my-bucket/a.txt");
        assert_eq!(loc.to_string(), "s3://my-bucket");
    }

    #[test]
    fn parse_rejects_bad_uris() {
        assert!(RemoteLocation::parse("my-bucket/prefix").is_err());
        assert!(RemoteLocation::parse("s3://").is_err());
        assert!(RemoteLocation::parse("s3:///prefix").is_err());
    }

    #[test]
    fn delete_sorts_before_upload() {
        assert!(Action::Delete < Action::Upload);
        assert!(Action::Delete.as_str() < Action::Upload.as_str());
    }

    #[test]
    fn reason_vocabulary() {
        assert_eq!(Reason::NewFile.to_string(), "new file");
        assert_eq!(Reason::SizeDiffers.to_string(), "size differs");
        assert_eq!(Reason::ChecksumDiffers.to_string(), "checksum differs");
        assert_eq!(Reason::DeletedLocally.to_string(), "deleted locally");
    }
}
