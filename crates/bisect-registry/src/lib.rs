//! # bisect-registry
//!
//! The time-bounded metadata rewriter: a pure function over a parsed
//! registry package-metadata document and a cutoff instant. This is the
//! core of `npm-bisect` — everything else exists to get a document to this
//! function and a rewritten document back out to a waiting package manager.
//!
//! ## Algorithm
//!
//! 1. Walk `time`, skipping [`RESERVED_TIME_KEYS`]. Any entry whose
//!    timestamp parses and is strictly after the cutoff is deleted from
//!    both `time` and `versions`.
//! 2. If `dist-tags.latest` pointed at a deleted version, repoint it at the
//!    preserved version with the latest remaining publish time. If nothing
//!    survived, the `latest` tag is removed outright — the package manager
//!    will then fail resolution with its own "no matching version" error,
//!    which is the desired signal rather than something this crate should
//!    paper over.
//!
//! Malformed timestamps are never treated as deletions: a value this crate
//! cannot parse is assumed to predate the cutoff (preserved), so a
//! corrupted document never causes the rewriter to fabricate a deletion.

use std::collections::BTreeSet;

use bisect_types::{Cutoff, PackageMetadataDocument, RESERVED_TIME_KEYS};
use chrono::{DateTime, Utc};

/// Rewrites `doc` in place so that no surviving version was published
/// strictly after `cutoff`. Returns `true` iff anything was removed.
pub fn rewrite(doc: &mut PackageMetadataDocument, cutoff: Cutoff) -> bool {
    if doc.time.is_empty() || doc.versions.is_empty() {
        return false;
    }

    let mut deleted: BTreeSet<String> = BTreeSet::new();
    let mut newest_preserved: Option<(String, DateTime<Utc>)> = None;

    let candidate_versions: Vec<String> = doc
        .time
        .keys()
        .filter(|k| !RESERVED_TIME_KEYS.contains(&k.as_str()))
        .cloned()
        .collect();

    for version in candidate_versions {
        let raw = doc.time.get(&version).cloned().unwrap_or_default();
        let parsed = DateTime::parse_from_rfc3339(&raw).map(|dt| dt.with_timezone(&Utc));

        match parsed {
            Ok(t) if t > cutoff.as_datetime() => {
                doc.time.remove(&version);
                doc.versions.remove(&version);
                deleted.insert(version);
            }
            Ok(t) => {
                let replace = match &newest_preserved {
                    None => true,
                    Some((best_version, best_time)) => {
                        t > *best_time || (t == *best_time && version > *best_version)
                    }
                };
                if replace {
                    newest_preserved = Some((version, t));
                }
            }
            Err(_) => {
                // Unparsable: treated as "not newer than cutoff", so it is
                // preserved and never considered for the `latest` repoint.
            }
        }
    }

    let changed = !deleted.is_empty();

    if changed {
        if let Some(latest) = doc.dist_tags.get("latest").cloned() {
            if deleted.contains(&latest) {
                match newest_preserved {
                    Some((version, _)) => {
                        doc.dist_tags.insert("latest".to_string(), version);
                    }
                    None => {
                        doc.dist_tags.remove("latest");
                    }
                }
            }
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(versions: &[(&str, &str)], latest: Option<&str>) -> PackageMetadataDocument {
        let mut time = std::collections::BTreeMap::new();
        let mut vmap = std::collections::BTreeMap::new();
        time.insert("created".to_string(), "2018-01-01T00:00:00Z".to_string());
        time.insert("modified".to_string(), "2020-01-04T00:00:00Z".to_string());
        for (v, t) in versions {
            time.insert(v.to_string(), t.to_string());
            vmap.insert(v.to_string(), json!({ "name": "left-pad", "version": v }));
        }
        let mut dist_tags = std::collections::BTreeMap::new();
        if let Some(l) = latest {
            dist_tags.insert("latest".to_string(), l.to_string());
        }
        PackageMetadataDocument {
            name: Some("left-pad".to_string()),
            versions: vmap,
            time,
            dist_tags,
            extra: Default::default(),
        }
    }

    fn cutoff(s: &str) -> Cutoff {
        Cutoff::new(DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc))
    }

    #[test]
    fn hides_versions_published_after_cutoff() {
        let mut d = doc(
            &[
                ("1.0.0", "2020-01-01T00:00:00Z"),
                ("1.0.1", "2020-01-02T00:00:00Z"),
                ("1.0.2", "2020-01-03T00:00:00Z"),
            ],
            Some("1.0.2"),
        );
        let changed = rewrite(&mut d, cutoff("2020-01-01T12:00:00Z"));
        assert!(changed);
        assert_eq!(d.versions.len(), 1);
        assert!(d.versions.contains_key("1.0.0"));
        assert_eq!(d.dist_tags.get("latest"), Some(&"1.0.0".to_string()));
    }

    #[test]
    fn no_op_when_nothing_is_newer_than_cutoff() {
        let mut d = doc(&[("1.0.0", "2020-01-01T00:00:00Z")], Some("1.0.0"));
        let changed = rewrite(&mut d, cutoff("2030-01-01T00:00:00Z"));
        assert!(!changed);
        assert_eq!(d.versions.len(), 1);
    }

    #[test]
    fn latest_missing_when_no_versions_survive() {
        let mut d = doc(&[("1.0.0", "2020-01-05T00:00:00Z")], Some("1.0.0"));
        let changed = rewrite(&mut d, cutoff("2019-01-01T00:00:00Z"));
        assert!(changed);
        assert!(d.versions.is_empty());
        assert!(d.dist_tags.get("latest").is_none());
    }

    #[test]
    fn latest_untouched_when_it_already_points_at_a_preserved_version() {
        let mut d = doc(
            &[
                ("1.0.0", "2020-01-01T00:00:00Z"),
                ("1.0.1", "2020-01-02T00:00:00Z"),
            ],
            Some("1.0.0"),
        );
        let changed = rewrite(&mut d, cutoff("2020-01-01T12:00:00Z"));
        assert!(changed);
        assert_eq!(d.dist_tags.get("latest"), Some(&"1.0.0".to_string()));
    }

    #[test]
    fn reserved_keys_are_never_treated_as_versions() {
        let mut d = doc(&[("1.0.0", "2020-01-01T00:00:00Z")], Some("1.0.0"));
        assert!(d.time.contains_key("created"));
        assert!(d.time.contains_key("modified"));
        let changed = rewrite(&mut d, cutoff("1999-01-01T00:00:00Z"));
        assert!(changed);
        // `created`/`modified` survive even though they are chronologically
        // "after" the cutoff and are not versions, so must never be deleted.
        assert!(d.time.contains_key("created"));
        assert!(d.time.contains_key("modified"));
    }

    #[test]
    fn malformed_timestamp_is_preserved_not_deleted() {
        let mut d = doc(&[("1.0.0", "not-a-timestamp")], Some("1.0.0"));
        let changed = rewrite(&mut d, cutoff("2000-01-01T00:00:00Z"));
        assert!(!changed);
        assert!(d.versions.contains_key("1.0.0"));
    }

    #[test]
    fn idempotent_on_a_second_pass() {
        let mut d = doc(
            &[
                ("1.0.0", "2020-01-01T00:00:00Z"),
                ("1.0.1", "2020-01-02T00:00:00Z"),
            ],
            Some("1.0.1"),
        );
        let c = cutoff("2020-01-01T12:00:00Z");
        assert!(rewrite(&mut d, c));
        let before = d.clone();
        let changed_again = rewrite(&mut d, c);
        assert!(!changed_again);
        assert_eq!(before.versions, d.versions);
        assert_eq!(before.dist_tags, d.dist_tags);
    }

    // Property tests covering the rewrite's core invariants.
    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_version() -> impl Strategy<Value = String> {
            (0u64..6, 0u64..6, 0u64..6).prop_map(|(a, b, c)| format!("{a}.{b}.{c}"))
        }

        fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
            (2019i32..2022, 1u32..=12, 1u32..=28, 0u32..24).prop_map(|(y, m, d, h)| {
                chrono::NaiveDate::from_ymd_opt(y, m, d)
                    .unwrap()
                    .and_hms_opt(h, 0, 0)
                    .unwrap()
                    .and_utc()
            })
        }

        fn arb_doc() -> impl Strategy<Value = (PackageMetadataDocument, Option<String>)> {
            prop::collection::btree_map(arb_version(), arb_timestamp(), 0..8).prop_flat_map(
                |pairs| {
                    let versions: Vec<String> = pairs.keys().cloned().collect();
                    let latest_choice = if versions.is_empty() {
                        Just(None).boxed()
                    } else {
                        prop::sample::select(versions).prop_map(Some).boxed()
                    };
                    latest_choice.prop_map(move |latest| {
                        let mut time = std::collections::BTreeMap::new();
                        let mut vmap = std::collections::BTreeMap::new();
                        for (v, t) in &pairs {
                            time.insert(v.clone(), t.to_rfc3339());
                            vmap.insert(v.clone(), json!({}));
                        }
                        let mut dist_tags = std::collections::BTreeMap::new();
                        if let Some(l) = &latest {
                            dist_tags.insert("latest".to_string(), l.clone());
                        }
                        let d = PackageMetadataDocument {
                            name: Some("pkg".to_string()),
                            versions: vmap,
                            time,
                            dist_tags,
                            extra: Default::default(),
                        };
                        (d, latest)
                    })
                },
            )
        }

        proptest! {
            #[test]
            fn preserved_versions_are_never_newer_than_cutoff(
                (mut doc, _latest) in arb_doc(), cutoff_time in arb_timestamp(),
            ) {
                let cutoff = Cutoff::new(cutoff_time);
                rewrite(&mut doc, cutoff);
                for (v, t) in &doc.time {
                    if bisect_types::RESERVED_TIME_KEYS.contains(&v.as_str()) {
                        continue;
                    }
                    let parsed = DateTime::parse_from_rfc3339(t).unwrap().with_timezone(&Utc);
                    prop_assert!(parsed <= cutoff.as_datetime());
                }
            }

            #[test]
            fn versions_and_time_keys_stay_in_lockstep(
                (mut doc, _latest) in arb_doc(), cutoff_time in arb_timestamp(),
            ) {
                prop_assert!(doc.keys_consistent());
                let cutoff = Cutoff::new(cutoff_time);
                rewrite(&mut doc, cutoff);
                prop_assert!(doc.keys_consistent());
            }

            #[test]
            fn latest_still_names_a_surviving_version_when_any_survive(
                (mut doc, latest) in arb_doc(), cutoff_time in arb_timestamp(),
            ) {
                let had_latest_in_versions = latest
                    .as_ref()
                    .map(|l| doc.versions.contains_key(l))
                    .unwrap_or(false);
                let cutoff = Cutoff::new(cutoff_time);
                rewrite(&mut doc, cutoff);
                if had_latest_in_versions && !doc.versions.is_empty() {
                    if let Some(new_latest) = doc.dist_tags.get("latest") {
                        prop_assert!(doc.versions.contains_key(new_latest));
                    }
                }
            }

            #[test]
            fn rewriting_twice_is_idempotent(
                (mut doc, _latest) in arb_doc(), cutoff_time in arb_timestamp(),
            ) {
                let cutoff = Cutoff::new(cutoff_time);
                rewrite(&mut doc, cutoff);
                let snapshot = doc.clone();
                let changed_again = rewrite(&mut doc, cutoff);
                prop_assert!(!changed_again);
                prop_assert_eq!(snapshot.versions, doc.versions);
                prop_assert_eq!(snapshot.time, doc.time);
                prop_assert_eq!(snapshot.dist_tags, doc.dist_tags);
            }

            #[test]
            fn tighter_cutoffs_preserve_a_subset_of_versions(
                (doc, _latest) in arb_doc(), a in arb_timestamp(), b in arb_timestamp(),
            ) {
                let (earlier, later) = if a <= b { (a, b) } else { (b, a) };
                let mut doc_early = doc.clone();
                let mut doc_late = doc;
                rewrite(&mut doc_early, Cutoff::new(earlier));
                rewrite(&mut doc_late, Cutoff::new(later));
                let early_keys: BTreeSet<&String> = doc_early.versions.keys().collect();
                let late_keys: BTreeSet<&String> = doc_late.versions.keys().collect();
                prop_assert!(early_keys.is_subset(&late_keys));
            }
        }
    }
}
