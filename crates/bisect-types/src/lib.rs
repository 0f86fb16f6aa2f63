//! # bisect-types
//!
//! Shared domain types for `npm-bisect`, the tool that binary-searches
//! registry publications for the release that introduced a regression.
//!
//! This crate has no I/O of its own: it defines the data that flows between
//! the rewriter, the proxy, the probe runner, and the bisection driver.
//!
//! ## Key Types
//!
//! - [`Cutoff`] — the exclusive upper bound on kept publications for a probe.
//! - [`PackageMetadataDocument`] — a parsed registry metadata document.
//! - [`TimelineEvent`] — one `(package, version, publish-time)` observation.
//! - [`ProbeRequest`] — what a single reinstall cycle should do.
//! - [`FilterSpec`] — an `--ignore`/`--only` filter entry.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use semver::VersionReq;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved keys in a registry `time` map that do not name a published
/// version. Both spellings seen in the wild (`created`/`modified` and
/// `created`/`changed`) are tolerated; anything that fails to parse as an
/// instant is treated the same way — preserved rather than guessed at.
pub const RESERVED_TIME_KEYS: [&str; 3] = ["modified", "created", "changed"];

/// Which package manager is driving a probe. All three speak the same
/// npm registry protocol, just with different cache/registry env vars
/// and install argv; `--package-manager` is the general form, `--yarn`
/// is shorthand for [`PackageManager::Yarn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    #[default]
    Npm,
    Yarn,
    Pnpm,
}

impl FromStr for PackageManager {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "npm" => Ok(Self::Npm),
            "yarn" => Ok(Self::Yarn),
            "pnpm" => Ok(Self::Pnpm),
            other => Err(ParseError::UnknownPackageManager(other.to_string())),
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Npm => "npm",
            Self::Yarn => "yarn",
            Self::Pnpm => "pnpm",
        };
        f.write_str(s)
    }
}

/// Errors raised parsing user-supplied strings into domain types.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unrecognized package manager: {0}")]
    UnknownPackageManager(String),

    #[error("could not parse `{0}` as a date-time")]
    InvalidInstant(String),

    #[error("invalid filter `{raw}`: {reason}")]
    InvalidFilter { raw: String, reason: String },
}

/// An instant in time. All comparisons used by the rewriter are strict:
/// a version published strictly after the cutoff is hidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cutoff(pub DateTime<Utc>);

impl Cutoff {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    /// One millisecond before `time`, so that hiding this cutoff strictly
    /// excludes a publication made at exactly `time`.
    pub fn just_before(time: DateTime<Utc>) -> Self {
        Self(time - chrono::Duration::milliseconds(1))
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// RFC 3339 form, as passed to the child through
    /// `NPM_BISECT_IGNORE_NEWER_THAN`.
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }
}

impl FromStr for Cutoff {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_instant(s)
            .map(Cutoff)
            .ok_or_else(|| ParseError::InvalidInstant(s.to_string()))
    }
}

impl fmt::Display for Cutoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Parses a calendar date-time the way the CLI's `--good`/`--bad` flags and
/// the registry's `time` map values both need to: RFC 3339 first (what the
/// registry emits), then a bare date (what a user is most likely to type).
pub fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    None
}

/// One `(package, version, publish-time)` observation made during a probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub package_name: String,
    pub version: String,
    pub time: DateTime<Utc>,
}

impl TimelineEvent {
    pub fn new(package_name: impl Into<String>, version: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            package_name: package_name.into(),
            version: version.into(),
            time,
        }
    }

    fn dedup_key(&self) -> (&str, &str) {
        (&self.package_name, &self.version)
    }
}

impl PartialOrd for TimelineEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimelineEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.package_name.cmp(&other.package_name))
            .then_with(|| self.version.cmp(&other.version))
    }
}

/// Sorts by time ascending and de-duplicates by `(package_name, version)`,
/// keeping the first (earliest-timed) occurrence of each pair.
pub fn sort_and_dedup_timeline(mut events: Vec<TimelineEvent>) -> Vec<TimelineEvent> {
    events.sort();
    let mut seen = std::collections::HashSet::new();
    events.retain(|event| seen.insert(event.dedup_key().0.to_string() + "@" + event.dedup_key().1));
    events
}

/// What a single probe should do: hide everything published after
/// `cutoff`, and optionally record the timeline of every publication the
/// resolver looked at while doing so.
#[derive(Debug, Clone, Copy)]
pub struct ProbeRequest {
    pub cutoff: Cutoff,
    pub compute_timeline: bool,
}

/// An `--ignore`/`--only` filter entry: `name` or `name@range`.
#[derive(Debug, Clone)]
pub struct FilterSpec {
    pub name: String,
    pub range: Option<VersionReq>,
}

impl FilterSpec {
    pub fn matches(&self, package_name: &str, version: &str) -> bool {
        if self.name != package_name {
            return false;
        }
        match &self.range {
            None => true,
            Some(req) => semver::Version::parse(version)
                .map(|v| req.matches(&v))
                .unwrap_or(false),
        }
    }
}

impl FromStr for FilterSpec {
    type Err = ParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.split_once('@') {
            None => Ok(FilterSpec {
                name: raw.to_string(),
                range: None,
            }),
            Some((name, range)) => {
                if name.is_empty() {
                    return Err(ParseError::InvalidFilter {
                        raw: raw.to_string(),
                        reason: "package name is empty".to_string(),
                    });
                }
                let req = VersionReq::parse(range).map_err(|e| ParseError::InvalidFilter {
                    raw: raw.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(FilterSpec {
                    name: name.to_string(),
                    range: Some(req),
                })
            }
        }
    }
}

/// A parsed registry package-metadata document. Per-version payloads are
/// kept as opaque JSON so the rewriter never has to understand (or risk
/// dropping) fields it doesn't need, such as `dist` URLs or `dependencies`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMetadataDocument {
    pub name: Option<String>,

    #[serde(default)]
    pub versions: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub time: BTreeMap<String, String>,

    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,

    /// Every other top-level field (`_id`, `readme`, `users`, ...),
    /// preserved byte-for-byte across a rewrite.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PackageMetadataDocument {
    /// True once every non-reserved key of `time` also names a key of
    /// `versions`, and vice versa. Checked by tests rather than enforced
    /// at construction, since a document straight off the wire may not
    /// satisfy it until the rewriter has run.
    pub fn keys_consistent(&self) -> bool {
        let version_keys: std::collections::HashSet<&str> =
            self.versions.keys().map(String::as_str).collect();
        let time_keys: std::collections::HashSet<&str> = self
            .time
            .keys()
            .map(String::as_str)
            .filter(|k| !RESERVED_TIME_KEYS.contains(k))
            .collect();
        version_keys == time_keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_just_before_subtracts_one_millisecond() {
        let t = DateTime::parse_from_rfc3339("2020-01-02T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let cutoff = Cutoff::just_before(t);
        assert!(cutoff.as_datetime() < t);
        assert_eq!((t - cutoff.as_datetime()).num_milliseconds(), 1);
    }

    #[test]
    fn parse_instant_accepts_rfc3339_and_bare_date() {
        assert!(parse_instant("2020-01-02T00:00:00Z").is_some());
        assert!(parse_instant("2020-01-02").is_some());
        assert!(parse_instant("not a date").is_none());
    }

    #[test]
    fn filter_spec_parses_name_only() {
        let f: FilterSpec = "left-pad".parse().unwrap();
        assert_eq!(f.name, "left-pad");
        assert!(f.range.is_none());
        assert!(f.matches("left-pad", "1.2.3"));
        assert!(!f.matches("right-pad", "1.2.3"));
    }

    #[test]
    fn filter_spec_parses_name_and_range() {
        let f: FilterSpec = "left-pad@^1.0.0".parse().unwrap();
        assert!(f.matches("left-pad", "1.2.3"));
        assert!(!f.matches("left-pad", "2.0.0"));
    }

    #[test]
    fn filter_spec_rejects_empty_name() {
        assert!("@^1.0.0".parse::<FilterSpec>().is_err());
    }

    #[test]
    fn filter_spec_rejects_invalid_range() {
        assert!("left-pad@not-a-range".parse::<FilterSpec>().is_err());
    }

    #[test]
    fn sort_and_dedup_timeline_orders_by_time_and_drops_duplicates() {
        let t1 = DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let t2 = DateTime::parse_from_rfc3339("2020-01-02T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let events = vec![
            TimelineEvent::new("b", "2.0.0", t2),
            TimelineEvent::new("a", "1.0.0", t1),
            TimelineEvent::new("a", "1.0.0", t1),
        ];
        let deduped = sort_and_dedup_timeline(events);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].package_name, "a");
        assert_eq!(deduped[1].package_name, "b");
    }

    #[test]
    fn package_manager_round_trips_through_str() {
        assert_eq!("npm".parse::<PackageManager>().unwrap(), PackageManager::Npm);
        assert_eq!("yarn".parse::<PackageManager>().unwrap(), PackageManager::Yarn);
        assert!("bun".parse::<PackageManager>().is_err());
    }

    #[test]
    fn metadata_document_keys_consistent_ignores_reserved_keys() {
        let doc: PackageMetadataDocument = serde_json::from_value(serde_json::json!({
            "name": "left-pad",
            "versions": {"1.0.0": {}},
            "time": {"1.0.0": "2020-01-01T00:00:00Z", "created": "2019-01-01T00:00:00Z", "modified": "2020-01-01T00:00:00Z"},
            "dist-tags": {"latest": "1.0.0"}
        }))
        .unwrap();
        assert!(doc.keys_consistent());
    }
}
