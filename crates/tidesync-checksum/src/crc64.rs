//! CRC-64/NVME hashing, streaming and one-shot

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io::Read;
use std::path::Path;

const READ_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("invalid fingerprint encoding '{value}': {reason}")]
    Invalid { value: String, reason: String },
}

/// Incremental CRC-64/NVME hasher
pub struct Crc64Hasher {
    digest: crc64fast_nvme::Digest,
    len: u64,
}

impl Default for Crc64Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc64Hasher {
    pub fn new() -> Self {
        Crc64Hasher {
            digest: crc64fast_nvme::Digest::new(),
            len: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.write(data);
        self.len += data.len() as u64;
    }

    /// Bytes fed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn sum64(&self) -> u64 {
        self.digest.sum64()
    }

    /// Encoded fingerprint of everything fed so far
    pub fn finalize(&self) -> String {
        encode(self.sum64())
    }
}

/// Encode a raw digest as base64 of its big-endian bytes
pub fn encode(crc: u64) -> String {
    STANDARD.encode(crc.to_be_bytes())
}

/// Decode an encoded fingerprint back into the raw digest
pub fn decode(value: &str) -> Result<u64, FingerprintError> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| FingerprintError::Invalid {
            value: value.to_string(),
            reason: e.to_string(),
        })?;
    let raw: [u8; 8] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| FingerprintError::Invalid {
            value: value.to_string(),
            reason: format!("expected 8 bytes, got {}", bytes.len()),
        })?;
    Ok(u64::from_be_bytes(raw))
}

/// Fingerprint an in-memory buffer
pub fn fingerprint_bytes(data: &[u8]) -> String {
    let mut hasher = Crc64Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Fingerprint everything a reader yields, 64 KiB at a time
pub fn fingerprint_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Crc64Hasher::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Fingerprint a file from disk without loading it fully into memory
pub fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let file = std::fs::File::open(path)?;
    fingerprint_reader(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn check_value_matches_crc64_nvme() {
        let mut hasher = Crc64Hasher::new();
        hasher.update(b"123456789");
        assert_eq!(hasher.sum64(), 0xae8b_1486_0a79_9888);
        assert_eq!(hasher.finalize(), "rosUhgp5mIg=");
    }

    #[test]
    fn empty_input_encodes_zero() {
        assert_eq!(fingerprint_bytes(b""), "AAAAAAAAAAA=");
        assert!(Crc64Hasher::new().is_empty());
    }

    #[test]
    fn known_text_vector() {
        assert_eq!(fingerprint_bytes(b"hello world"), "jSnVw/bqjr4=");
    }

    #[test]
    fn file_fingerprint_matches_bytes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("data.bin");
        // Larger than the read buffer so several reads are chained
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(fingerprint_file(&path).unwrap(), fingerprint_bytes(&data));
    }

    #[test]
    fn missing_file_is_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = fingerprint_file(&tmp.path().join("nope")).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(decode("AAAA").is_err());
        assert!(decode("not base64!").is_err());
        assert_eq!(decode("rosUhgp5mIg=").unwrap(), 0xae8b_1486_0a79_9888);
    }

    proptest! {
        #[test]
        fn split_updates_equal_one_shot(
            data in proptest::collection::vec(any::<u8>(), 0..=4096),
            split in 0usize..=4096,
        ) {
            let split = split.min(data.len());
            let mut hasher = Crc64Hasher::new();
            hasher.update(&data[..split]);
            hasher.update(&data[split..]);
            prop_assert_eq!(hasher.finalize(), fingerprint_bytes(&data));
            prop_assert_eq!(hasher.len(), data.len() as u64);
        }

        #[test]
        fn encoding_is_twelve_chars(crc in any::<u64>()) {
            let value = encode(crc);
            prop_assert_eq!(value.len(), 12);
            prop_assert_eq!(decode(&value).unwrap(), crc);
        }
    }
}
