// Property tests for the retention engine and the artifact codec

use backup_warden::backup::compression::{compress_bytes, decompress_bytes};
use backup_warden::backup::{ArtifactName, BackupArtifact, DatabaseKind};
use backup_warden::retention::{apply, RetentionPolicy};
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::path::PathBuf;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 15, 3, 30, 0).unwrap()
}

fn artifacts_from(offsets: &BTreeSet<i64>) -> Vec<BackupArtifact> {
    offsets
        .iter()
        .map(|secs| {
            let name = ArtifactName::new(DatabaseKind::Sqlite, now() - Duration::seconds(*secs));
            BackupArtifact::local(&name, PathBuf::from("/backups").join(name.file_name()), 64)
        })
        .collect()
}

fn policy_strategy() -> impl Strategy<Value = RetentionPolicy> {
    (0u32..15, 0u32..8, 0u32..14).prop_map(|(daily_days, weekly_weeks, monthly_months)| RetentionPolicy {
        daily_days,
        weekly_weeks,
        monthly_months,
    })
}

// Up to about 400 days back, one-second resolution so names stay unique
fn offsets_strategy() -> impl Strategy<Value = BTreeSet<i64>> {
    proptest::collection::btree_set(0i64..400 * 86_400, 0..60)
}

fn names(decisions: &[backup_warden::retention::RetentionDecision]) -> BTreeSet<String> {
    decisions.iter().map(|d| d.artifact.name.clone()).collect()
}

proptest! {
    #[test]
    fn keep_and_delete_partition_the_input(policy in policy_strategy(), offsets in offsets_strategy()) {
        let artifacts = artifacts_from(&offsets);
        let outcome = apply(&policy, now(), &artifacts);

        prop_assert_eq!(outcome.keep.len() + outcome.delete.len(), artifacts.len());
        let kept = names(&outcome.keep);
        let deleted = names(&outcome.delete);
        prop_assert!(kept.is_disjoint(&deleted));
        let all: BTreeSet<String> = artifacts.iter().map(|a| a.name.clone()).collect();
        prop_assert_eq!(kept.union(&deleted).cloned().collect::<BTreeSet<_>>(), all);
    }

    #[test]
    fn a_second_pass_deletes_nothing(policy in policy_strategy(), offsets in offsets_strategy()) {
        let artifacts = artifacts_from(&offsets);
        let first = apply(&policy, now(), &artifacts);
        let survivors: Vec<BackupArtifact> = first.keep.iter().map(|d| d.artifact.clone()).collect();

        let second = apply(&policy, now(), &survivors);
        prop_assert!(second.delete.is_empty());
    }

    #[test]
    fn everything_inside_the_daily_window_is_kept(policy in policy_strategy(), offsets in offsets_strategy()) {
        let artifacts = artifacts_from(&offsets);
        let outcome = apply(&policy, now(), &artifacts);
        let cutoff = now() - Duration::days(i64::from(policy.daily_days));

        for decision in &outcome.delete {
            prop_assert!(decision.artifact.created_at < cutoff);
        }
    }

    #[test]
    fn a_more_generous_policy_never_keeps_less(
        policy in policy_strategy(),
        extra in (0u32..5, 0u32..5, 0u32..5),
        offsets in offsets_strategy(),
    ) {
        let artifacts = artifacts_from(&offsets);
        let wider = RetentionPolicy {
            daily_days: policy.daily_days + extra.0,
            weekly_weeks: policy.weekly_weeks + extra.1,
            monthly_months: policy.monthly_months + extra.2,
        };

        let narrow_kept = names(&apply(&policy, now(), &artifacts).keep);
        let wide_kept = names(&apply(&wider, now(), &artifacts).keep);
        prop_assert!(narrow_kept.is_subset(&wide_kept));
    }

    #[test]
    fn input_order_does_not_change_the_verdict(policy in policy_strategy(), offsets in offsets_strategy()) {
        let artifacts = artifacts_from(&offsets);
        let mut reversed = artifacts.clone();
        reversed.reverse();

        let forward = names(&apply(&policy, now(), &artifacts).keep);
        let backward = names(&apply(&policy, now(), &reversed).keep);
        prop_assert_eq!(forward, backward);
    }

    #[test]
    fn gzip_restores_the_exact_bytes(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let compressed = compress_bytes(&data).unwrap();
        prop_assert_eq!(decompress_bytes(&compressed).unwrap(), data);
    }
}

#[test]
fn empty_input_is_an_empty_partition() {
    let outcome = apply(&RetentionPolicy::default(), now(), &[]);
    assert!(outcome.keep.is_empty());
    assert!(outcome.delete.is_empty());
}
