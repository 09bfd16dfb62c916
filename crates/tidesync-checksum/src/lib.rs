//! tidesync-checksum: content fingerprints for local files and byte buffers
//!
//! A fingerprint is the CRC-64/NVME of the full object content, encoded as
//! standard base64 of the 8 big-endian digest bytes. Object stores that
//! support full-object checksums report the same encoding, so a local value
//! can be compared to a remote one byte-for-byte.

pub mod crc64;

pub use crc64::{
    decode, encode, fingerprint_bytes, fingerprint_file, fingerprint_reader, Crc64Hasher,
    FingerprintError,
};
