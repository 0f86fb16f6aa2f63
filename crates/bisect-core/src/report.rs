//! Final-report formatting. Pure formatting functions so the human and
//! `--json` output paths can both be snapshot-tested without touching a
//! terminal or a registry.

use bisect_types::{PackageManager, TimelineEvent};
use serde::Serialize;

/// The final report: `name@version` plus its publish time and a couple of
/// copyable hints for filing an upstream issue.
#[derive(Debug, Clone, Serialize)]
pub struct CulpritReport {
    pub package_name: String,
    pub version: String,
    pub published_at: String,
    pub why_command: String,
    pub registry_url: String,
}

impl CulpritReport {
    pub fn new(culprit: &TimelineEvent, package_manager: PackageManager, registry_base: &str) -> Self {
        let why_command = match package_manager {
            PackageManager::Npm | PackageManager::Pnpm => {
                format!("npm why {}@{}", culprit.package_name, culprit.version)
            }
            PackageManager::Yarn => format!("yarn why {}", culprit.package_name),
        };

        Self {
            package_name: culprit.package_name.clone(),
            version: culprit.version.clone(),
            published_at: culprit.time.to_rfc3339(),
            why_command,
            registry_url: format!(
                "{}/{}/v/{}",
                registry_base.trim_end_matches('/'),
                culprit.package_name,
                culprit.version
            ),
        }
    }

    pub fn to_human(&self) -> String {
        format!(
            "Culprit found: {}@{}\n  published: {}\n  repro:     {}\n  registry:  {}\n",
            self.package_name, self.version, self.published_at, self.why_command, self.registry_url
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Reported when the filtered candidate set turns out to be empty.
pub const NO_CANDIDATES_MESSAGE: &str =
    "No relevant packages were published between --good and --bad; nothing to bisect.";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn culprit() -> TimelineEvent {
        TimelineEvent::new(
            "left-pad",
            "1.0.1",
            DateTime::parse_from_rfc3339("2020-01-02T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        )
    }

    #[test]
    fn npm_why_command_uses_name_at_version() {
        let report = CulpritReport::new(&culprit(), PackageManager::Npm, "https://registry.npmjs.org");
        assert_eq!(report.why_command, "npm why left-pad@1.0.1");
        assert_eq!(
            report.registry_url,
            "https://registry.npmjs.org/left-pad/v/1.0.1"
        );
    }

    #[test]
    fn yarn_why_command_omits_the_version() {
        let report = CulpritReport::new(&culprit(), PackageManager::Yarn, "https://registry.npmjs.org");
        assert_eq!(report.why_command, "yarn why left-pad");
    }

    #[test]
    fn human_report_matches_its_expected_layout() {
        let report = CulpritReport::new(&culprit(), PackageManager::Npm, "https://registry.npmjs.org");
        insta::assert_snapshot!(report.to_human(), @r###"
        Culprit found: left-pad@1.0.1
          published: 2020-01-02T00:00:00+00:00
          repro:     npm why left-pad@1.0.1
          registry:  https://registry.npmjs.org/left-pad/v/1.0.1
        "###);
    }

    #[test]
    fn json_report_round_trips_through_serde() {
        let report = CulpritReport::new(&culprit(), PackageManager::Npm, "https://registry.npmjs.org");
        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["package_name"], "left-pad");
        assert_eq!(value["version"], "1.0.1");
    }
}
