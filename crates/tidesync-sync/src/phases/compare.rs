//! Phase 1: metadata-only comparison

use std::collections::HashMap;
use tidesync_core::{ItemMetadata, ItemRef, Phase1Result};

/// Partition `local` and `remote` into the five Phase 1 buckets.
///
/// A shared path lands in exactly one of size mismatch, identical (both
/// fingerprints known and equal), or need-fingerprint. Remote-only paths are
/// reported only when `delete_enabled`. Every bucket is sorted by path.
pub fn compare(
    local: &[ItemMetadata],
    remote: &[ItemMetadata],
    delete_enabled: bool,
) -> Phase1Result {
    let remote_by_path: HashMap<&str, &ItemMetadata> =
        remote.iter().map(|item| (item.path.as_str(), item)).collect();
    let mut result = Phase1Result::default();

    for src in local {
        let item = src.item_ref();
        let Some(dst) = remote_by_path.get(src.path.as_str()) else {
            result.new_items.push(item);
            continue;
        };

        if src.size != dst.size {
            result.size_mismatch.push(item);
        } else if fingerprints_match(src.fingerprint.as_deref(), dst.fingerprint.as_deref()) {
            result.identical.push(item);
        } else {
            result.need_fingerprint.push(item);
        }
    }

    if delete_enabled {
        let local_paths: std::collections::HashSet<&str> =
            local.iter().map(|item| item.path.as_str()).collect();
        result.deleted_items = remote
            .iter()
            .filter(|dst| !local_paths.contains(dst.path.as_str()))
            .map(ItemMetadata::item_ref)
            .collect();
    }

    for bucket in [
        &mut result.new_items,
        &mut result.deleted_items,
        &mut result.size_mismatch,
        &mut result.need_fingerprint,
        &mut result.identical,
    ] {
        bucket.sort_by(|a: &ItemRef, b: &ItemRef| a.path.cmp(&b.path));
    }
    result
}

fn fingerprints_match(src: Option<&str>, dst: Option<&str>) -> bool {
    matches!((src, dst), (Some(s), Some(d)) if !s.is_empty() && s == d)
}
