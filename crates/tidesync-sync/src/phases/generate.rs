//! Phase 3: plan generation

use std::collections::HashMap;
use std::path::Path;
use tidesync_core::{
    Action, FingerprintData, ItemRef, Phase1Result, PlanItem, Reason, RemoteLocation,
};

/// Build the ordered plan from Phase 1 buckets and Phase 2 fingerprints.
///
/// Emission order is new, size mismatch, checksum differs, deleted; the
/// result is then sorted by action (deletes first) and remote key. An
/// ambiguous item whose fingerprints match, or that has no fingerprint
/// record, produces nothing.
pub fn generate(
    phase1: &Phase1Result,
    fingerprints: &[FingerprintData],
    local_root: &Path,
    location: &RemoteLocation,
) -> Vec<PlanItem> {
    let upload = |item: &ItemRef, reason: Reason, fingerprint: Option<String>| PlanItem {
        action: Action::Upload,
        local_path: Some(local_root.join(&item.path)),
        remote_key: location.key_for(&item.path),
        size: item.size,
        reason,
        fingerprint,
    };

    let mut plan = Vec::with_capacity(
        phase1.new_items.len()
            + phase1.size_mismatch.len()
            + phase1.need_fingerprint.len()
            + phase1.deleted_items.len(),
    );

    plan.extend(
        phase1
            .new_items
            .iter()
            .map(|item| upload(item, Reason::NewFile, None)),
    );
    plan.extend(
        phase1
            .size_mismatch
            .iter()
            .map(|item| upload(item, Reason::SizeDiffers, None)),
    );

    let by_path: HashMap<&str, &FingerprintData> = fingerprints
        .iter()
        .map(|fp| (fp.item.path.as_str(), fp))
        .collect();
    for item in &phase1.need_fingerprint {
        match by_path.get(item.path.as_str()) {
            Some(fp) if !fp.matches() => plan.push(upload(
                item,
                Reason::ChecksumDiffers,
                Some(fp.source_fingerprint.clone()),
            )),
            _ => {}
        }
    }

    plan.extend(phase1.deleted_items.iter().map(|item| PlanItem {
        action: Action::Delete,
        local_path: None,
        remote_key: location.key_for(&item.path),
        size: item.size,
        reason: Reason::DeletedLocally,
        fingerprint: None,
    }));

    plan.sort_by(|a, b| {
        a.action
            .cmp(&b.action)
            .then_with(|| a.remote_key.cmp(&b.remote_key))
    });
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn refs(paths: &[(&str, u64)]) -> Vec<ItemRef> {
        paths.iter().map(|(p, s)| ItemRef::new(*p, *s)).collect()
    }

    fn fp(path: &str, size: u64, src: &str, dst: &str) -> FingerprintData {
        FingerprintData {
            item: ItemRef::new(path, size),
            source_fingerprint: src.into(),
            dest_fingerprint: dst.into(),
        }
    }

    fn location() -> RemoteLocation {
        RemoteLocation::new("bucket", "prefix")
    }

    #[test]
    fn new_file_becomes_create() {
        let phase1 = Phase1Result {
            new_items: refs(&[("a.txt", 10)]),
            ..Default::default()
        };
        let plan = generate(&phase1, &[], Path::new("/local"), &location());

        assert_eq!(plan.len(), 1);
        let item = &plan[0];
        assert_eq!(item.action, Action::Upload);
        assert_eq!(item.reason, Reason::NewFile);
        assert_eq!(item.remote_key, "prefix/a.txt");
        assert_eq!(item.local_path.as_deref(), Some(Path::new("/local/a.txt")));
        assert_eq!(item.size, 10);
        assert!(item.is_create());
    }

    #[test]
    fn fingerprint_outcomes() {
        let phase1 = Phase1Result {
            need_fingerprint: refs(&[("b.txt", 10), ("c.txt", 10), ("d.txt", 10)]),
            ..Default::default()
        };
        let fps = vec![fp("b.txt", 10, "X", "Y"), fp("c.txt", 10, "X", "X")];

        let plan = generate(&phase1, &fps, Path::new("/local"), &location());

        assert_eq!(plan.len(), 1, "matching and missing records emit nothing");
        assert_eq!(plan[0].remote_key, "prefix/b.txt");
        assert_eq!(plan[0].reason, Reason::ChecksumDiffers);
        assert_eq!(plan[0].fingerprint.as_deref(), Some("X"));
    }

    #[test]
    fn deletes_sort_first_then_by_key() {
        let phase1 = Phase1Result {
            new_items: refs(&[("z.txt", 1)]),
            size_mismatch: refs(&[("a.txt", 2)]),
            deleted_items: refs(&[("m.txt", 3), ("b.txt", 4)]),
            ..Default::default()
        };
        let plan = generate(&phase1, &[], Path::new("/l"), &RemoteLocation::new("b", ""));

        let order: Vec<(Action, &str)> = plan
            .iter()
            .map(|i| (i.action, i.remote_key.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (Action::Delete, "b.txt"),
                (Action::Delete, "m.txt"),
                (Action::Upload, "a.txt"),
                (Action::Upload, "z.txt"),
            ]
        );
        assert!(plan[0].local_path.is_none());
        assert_eq!(plan[0].reason, Reason::DeletedLocally);
        assert_eq!(plan[2].reason, Reason::SizeDiffers);
    }

    #[test]
    fn identical_items_are_never_planned() {
        let phase1 = Phase1Result {
            identical: refs(&[("same.txt", 5)]),
            ..Default::default()
        };
        assert!(generate(&phase1, &[], Path::new("/l"), &location()).is_empty());
    }

    proptest! {
        #[test]
        fn plan_is_deterministic_and_sorted(
            new in proptest::collection::btree_set("[a-f]{1,3}", 0..8),
            deleted in proptest::collection::btree_set("[g-m]{1,3}", 0..8),
            ambiguous in proptest::collection::btree_set("[n-z]{1,3}", 0..8),
            differs in any::<bool>(),
        ) {
            let to_refs = |set: &std::collections::BTreeSet<String>| {
                set.iter().map(|p| ItemRef::new(p.clone(), 1)).collect::<Vec<_>>()
            };
            let phase1 = Phase1Result {
                new_items: to_refs(&new),
                deleted_items: to_refs(&deleted),
                need_fingerprint: to_refs(&ambiguous),
                ..Default::default()
            };
            let fps: Vec<FingerprintData> = ambiguous
                .iter()
                .map(|p| fp(p, 1, "S", if differs { "D" } else { "S" }))
                .collect();

            let a = generate(&phase1, &fps, Path::new("/l"), &location());
            let b = generate(&phase1, &fps, Path::new("/l"), &location());
            prop_assert_eq!(&a, &b);

            let expected = new.len() + deleted.len() + if differs { ambiguous.len() } else { 0 };
            prop_assert_eq!(a.len(), expected);
            let sorted = a
                .windows(2)
                .all(|w| (w[0].action, &w[0].remote_key) <= (w[1].action, &w[1].remote_key));
            prop_assert!(sorted);
        }
    }
}
