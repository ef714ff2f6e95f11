use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use boardsync_adapters::ColumnParseError;
use boardsync_core::{EntityKind, Partition};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::merge::MergeOutcome;
use crate::resolve::Unresolved;
use crate::upsert::ProjectOutcome;

pub const REPORT_JSON_FILE: &str = "sync_report.json";
pub const REPORT_SUMMARY_FILE: &str = "sync_summary.md";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Inserts that found the row already created by a concurrent writer.
    pub already_present: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ProjectCounts {
    pub fn record(&mut self, outcome: ProjectOutcome) {
        match outcome {
            ProjectOutcome::Inserted => self.inserted += 1,
            ProjectOutcome::Updated => self.updated += 1,
            ProjectOutcome::Unchanged => self.unchanged += 1,
            ProjectOutcome::AlreadyPresent => self.already_present += 1,
            ProjectOutcome::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssignmentCounts {
    pub inserted: usize,
    pub updated_dates: usize,
    pub unchanged: usize,
    pub skipped_unresolved_developer: usize,
    pub skipped_no_project: usize,
    pub failed: usize,
}

impl AssignmentCounts {
    pub fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::UpdatedDates => self.updated_dates += 1,
            MergeOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedEntry {
    pub kind: EntityKind,
    pub name: String,
    pub reason: String,
    pub occurrences: usize,
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionFailure {
    pub partition: Partition,
    pub last_cursor: Option<String>,
    pub pages_fetched: usize,
    pub items_kept: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordIssue {
    pub external_id: String,
    pub name: String,
    pub detail: String,
}

/// Accumulated outcome of one sync run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub board_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub partitions_walked: usize,
    /// Partitions that failed mid-walk and completed on a resumed walk.
    pub partitions_resumed: usize,
    pub pages_fetched: usize,
    pub items_fetched: usize,
    pub duplicate_items: usize,
    pub projects: ProjectCounts,
    pub assignments: AssignmentCounts,
    pub unresolved: Vec<UnresolvedEntry>,
    pub failed_partitions: Vec<PartitionFailure>,
    pub skipped_records: Vec<RecordIssue>,
    pub unmatched_assignments: Vec<RecordIssue>,
    pub store_failures: Vec<RecordIssue>,
    pub degraded_columns: Vec<ColumnParseError>,
    #[serde(skip)]
    unresolved_index: BTreeMap<(EntityKind, String), usize>,
}

impl RunReport {
    pub fn new(run_id: Uuid, board_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            board_id: board_id.into(),
            started_at,
            finished_at: started_at,
            partitions_walked: 0,
            partitions_resumed: 0,
            pages_fetched: 0,
            items_fetched: 0,
            duplicate_items: 0,
            projects: ProjectCounts::default(),
            assignments: AssignmentCounts::default(),
            unresolved: Vec::new(),
            failed_partitions: Vec::new(),
            skipped_records: Vec::new(),
            unmatched_assignments: Vec::new(),
            store_failures: Vec::new(),
            degraded_columns: Vec::new(),
            unresolved_index: BTreeMap::new(),
        }
    }

    /// True when a partition walk aborted or a record failed to persist.
    pub fn is_partial(&self) -> bool {
        !self.failed_partitions.is_empty() || !self.store_failures.is_empty()
    }

    /// Row writes this run performed. Zero on a repeat run against an unchanged board.
    pub fn writes(&self) -> usize {
        self.projects.inserted
            + self.projects.updated
            + self.assignments.inserted
            + self.assignments.updated_dates
    }

    /// Counts one more sighting of a name; the first sighting fixes reason and suggestion.
    pub fn record_unresolved(&mut self, unresolved: &Unresolved, suggestion: Option<String>) {
        let key = (unresolved.kind, unresolved.name.clone());
        if let Some(&index) = self.unresolved_index.get(&key) {
            self.unresolved[index].occurrences += 1;
            return;
        }
        self.unresolved_index.insert(key, self.unresolved.len());
        self.unresolved.push(UnresolvedEntry {
            kind: unresolved.kind,
            name: unresolved.name.clone(),
            reason: unresolved.reason.to_string(),
            occurrences: 1,
            suggestion,
        });
    }

    pub fn unresolved_names(&self, kind: EntityKind) -> Vec<&str> {
        self.unresolved
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.name.as_str())
            .collect()
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# Board Sync Summary".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Board: `{}`", self.board_id),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!(
                "- Status: {}",
                if self.is_partial() { "partial" } else { "complete" }
            ),
            format!(
                "- Partitions: {} walked, {} resumed, {} failed",
                self.partitions_walked,
                self.partitions_resumed,
                self.failed_partitions.len()
            ),
            format!(
                "- Items: {} fetched over {} pages, {} duplicates dropped",
                self.items_fetched, self.pages_fetched, self.duplicate_items
            ),
            String::new(),
            "## Projects".to_string(),
            format!("- inserted: {}", self.projects.inserted),
            format!("- updated: {}", self.projects.updated),
            format!("- unchanged: {}", self.projects.unchanged),
            format!(
                "- already present (concurrent insert): {}",
                self.projects.already_present
            ),
            format!("- skipped: {}", self.projects.skipped),
            format!("- failed: {}", self.projects.failed),
            String::new(),
            "## Assignments".to_string(),
            format!("- inserted: {}", self.assignments.inserted),
            format!("- dates filled: {}", self.assignments.updated_dates),
            format!("- unchanged: {}", self.assignments.unchanged),
            format!(
                "- skipped (unresolved developer): {}",
                self.assignments.skipped_unresolved_developer
            ),
            format!(
                "- skipped (no persisted project): {}",
                self.assignments.skipped_no_project
            ),
            format!("- failed: {}", self.assignments.failed),
        ];

        if !self.failed_partitions.is_empty() {
            lines.push(String::new());
            lines.push("## Failed Partitions".to_string());
            for failure in &self.failed_partitions {
                lines.push(format!(
                    "- {}: resume at `{}` after {} items ({})",
                    failure.partition,
                    failure.last_cursor.as_deref().unwrap_or("<start>"),
                    failure.items_kept,
                    failure.error
                ));
            }
        }

        if !self.unresolved.is_empty() {
            lines.push(String::new());
            lines.push("## Unresolved Names".to_string());
            for entry in &self.unresolved {
                let hint = entry
                    .suggestion
                    .as_deref()
                    .map(|s| format!(" (closest: {s})"))
                    .unwrap_or_default();
                lines.push(format!(
                    "- {} `{}` x{}: {}{}",
                    entry.kind, entry.name, entry.occurrences, entry.reason, hint
                ));
            }
        }

        push_issues(&mut lines, "Skipped Records", &self.skipped_records);
        push_issues(
            &mut lines,
            "Assignments Without A Project",
            &self.unmatched_assignments,
        );
        push_issues(&mut lines, "Store Failures", &self.store_failures);

        if !self.degraded_columns.is_empty() {
            lines.push(String::new());
            lines.push("## Degraded Columns".to_string());
            for degraded in &self.degraded_columns {
                lines.push(format!("- {degraded}"));
            }
        }

        lines.push(String::new());
        lines.join("\n")
    }

    /// Writes `sync_report.json` and `sync_summary.md` under `<reports_root>/<run_id>/`.
    pub async fn write_to(&self, reports_root: &Path) -> Result<PathBuf> {
        let reports_dir = reports_root.join(self.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(self).context("serializing run report")?;
        fs::write(reports_dir.join(REPORT_JSON_FILE), json)
            .await
            .with_context(|| format!("writing {REPORT_JSON_FILE}"))?;
        fs::write(reports_dir.join(REPORT_SUMMARY_FILE), self.to_markdown())
            .await
            .with_context(|| format!("writing {REPORT_SUMMARY_FILE}"))?;

        Ok(reports_dir)
    }
}

fn push_issues(lines: &mut Vec<String>, heading: &str, issues: &[RecordIssue]) {
    if issues.is_empty() {
        return;
    }
    lines.push(String::new());
    lines.push(format!("## {heading}"));
    for issue in issues {
        lines.push(format!(
            "- `{}` {:?}: {}",
            issue.external_id, issue.name, issue.detail
        ));
    }
}

/// Summarizes the most recent written reports, newest first.
pub fn recent_reports_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join(REPORT_JSON_FILE).is_file())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Board Sync Reports".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let report_path = dir.path().join(REPORT_JSON_FILE);
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&report_path)
                .with_context(|| format!("reading {}", report_path.display()))?,
        )
        .with_context(|| format!("parsing {}", report_path.display()))?;

        let count = |section: &str, field: &str| {
            value
                .get(section)
                .and_then(|v| v.get(field))
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0)
        };
        let len = |field: &str| {
            value
                .get(field)
                .and_then(serde_json::Value::as_array)
                .map(Vec::len)
                .unwrap_or(0)
        };

        lines.push(format!("## Run `{}`", dir.file_name().to_string_lossy()));
        if let Some(finished) = value.get("finished_at").and_then(serde_json::Value::as_str) {
            lines.push(format!("- finished: {finished}"));
        }
        lines.push(format!(
            "- projects: {} inserted, {} updated, {} unchanged, {} skipped",
            count("projects", "inserted"),
            count("projects", "updated"),
            count("projects", "unchanged"),
            count("projects", "skipped"),
        ));
        lines.push(format!(
            "- assignments: {} inserted, {} dates filled, {} unchanged",
            count("assignments", "inserted"),
            count("assignments", "updated_dates"),
            count("assignments", "unchanged"),
        ));
        lines.push(format!(
            "- unresolved names: {}, failed partitions: {}",
            len("unresolved"),
            len("failed_partitions")
        ));
        lines.push(format!("- report: `{}`", report_path.display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::resolve::UnresolvedReason;

    fn report() -> RunReport {
        let started = Utc.with_ymd_and_hms(2024, 6, 3, 7, 30, 0).single().unwrap();
        RunReport::new(Uuid::new_v4(), "1290045511", started)
    }

    fn unresolved(name: &str) -> Unresolved {
        Unresolved {
            kind: EntityKind::Developer,
            name: name.into(),
            reason: UnresolvedReason::NoMapping,
        }
    }

    #[test]
    fn repeated_unresolved_names_are_counted_once() {
        let mut report = report();
        report.record_unresolved(&unresolved("Tariq Islam"), None);
        report.record_unresolved(&unresolved("Tariq Islam"), None);
        report.record_unresolved(&unresolved("Romal Pattel"), Some("ROMAL PATEL".into()));

        assert_eq!(report.unresolved.len(), 2);
        assert_eq!(report.unresolved[0].occurrences, 2);
        assert_eq!(
            report.unresolved_names(EntityKind::Developer),
            vec!["Tariq Islam", "Romal Pattel"]
        );
        assert!(report.to_markdown().contains("(closest: ROMAL PATEL)"));
    }

    #[test]
    fn lost_insert_races_are_counted_apart_from_unchanged_rows() {
        let mut counts = ProjectCounts::default();
        counts.record(ProjectOutcome::Unchanged);
        counts.record(ProjectOutcome::AlreadyPresent);
        counts.record(ProjectOutcome::AlreadyPresent);
        counts.record(ProjectOutcome::Inserted);

        assert_eq!(counts.unchanged, 1);
        assert_eq!(counts.already_present, 2);
        assert_eq!(counts.inserted, 1);

        let mut report = report();
        report.projects = counts;
        assert_eq!(report.writes(), 1);
        let summary = report.to_markdown();
        assert!(summary.contains("- unchanged: 1"));
        assert!(summary.contains("- already present (concurrent insert): 2"));
    }

    #[test]
    fn failed_partition_marks_the_run_partial() {
        let mut report = report();
        assert!(!report.is_partial());
        report.failed_partitions.push(PartitionFailure {
            partition: Partition::new("topics", "In Progress/Scheduled"),
            last_cursor: Some("MSwxMjkw".into()),
            pages_fetched: 2,
            items_kept: 3,
            error: "HTTP status 502".into(),
        });
        assert!(report.is_partial());
        let summary = report.to_markdown();
        assert!(summary.contains("Status: partial"));
        assert!(summary.contains("resume at `MSwxMjkw`"));
    }

    #[tokio::test]
    async fn written_reports_are_listed_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = report();
        report.projects.inserted = 4;
        let written = report.write_to(dir.path()).await.unwrap();

        assert!(written.join(REPORT_JSON_FILE).is_file());
        assert!(written.join(REPORT_SUMMARY_FILE).is_file());

        let listing = recent_reports_markdown(5, dir.path()).unwrap();
        assert!(listing.contains(&report.run_id.to_string()));
        assert!(listing.contains("projects: 4 inserted"));
    }
}
