//! Chunked upload sizing

/// 1 MiB
pub const MIB: u64 = 1024 * 1024;
/// Smallest part the store accepts (except the last one)
pub const MIN_PART_SIZE: u64 = 5 * MIB;
/// Largest part the store accepts
pub const MAX_PART_SIZE: u64 = 5 * 1024 * MIB;
pub const MAX_PARTS: u64 = 10_000;
/// Largest object a chunked upload can carry
pub const MAX_OBJECT_SIZE: u64 = MAX_PART_SIZE * MAX_PARTS;
/// Files at or above this size are uploaded in parts
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 8 * MIB;

/// Part size for an object of `size` bytes: `ceil(size / 10_000)` rounded
/// up to a whole MiB, clamped to [5 MiB, 5 GiB].
pub fn part_size(size: u64) -> u64 {
    let per_part = size.div_ceil(MAX_PARTS);
    let rounded = per_part.div_ceil(MIB).saturating_mul(MIB);
    rounded.clamp(MIN_PART_SIZE, MAX_PART_SIZE)
}

/// Number of parts `size` splits into; at least one
pub fn part_count(size: u64, part_size: u64) -> u64 {
    size.div_ceil(part_size.max(1)).max(1)
}
