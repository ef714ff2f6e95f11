use async_trait::async_trait;
use boardsync_core::{CanonicalEntity, PersistedAssignment, PersistedProject};
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connecting to store: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("reading {what}: {source}")]
    Read {
        what: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("writing {what}: {source}")]
    Write {
        what: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("store rejected write to {what}: {reason}")]
    Rejected { what: &'static str, reason: String },
}

impl StoreError {
    pub(crate) fn read(what: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Read { what, source }
    }

    pub(crate) fn write(what: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Write { what, source }
    }
}

/// Row values for a project the store has never seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewProject {
    pub external_id: String,
    pub name: String,
    pub status: String,
    pub level: String,
    pub team_id: i32,
    pub app_id: i32,
    pub prj_number: Option<String>,
}

/// Partial project update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProjectPatch {
    pub external_id: Option<String>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub team_id: Option<i32>,
    pub prj_number: Option<String>,
}

impl ProjectPatch {
    pub fn is_empty(&self) -> bool {
        self.external_id.is_none()
            && self.name.is_none()
            && self.status.is_none()
            && self.team_id.is_none()
            && self.prj_number.is_none()
    }

    pub fn changed_columns(&self) -> Vec<&'static str> {
        let mut columns = Vec::new();
        if self.external_id.is_some() {
            columns.push("external_id");
        }
        if self.name.is_some() {
            columns.push("project_name");
        }
        if self.status.is_some() {
            columns.push("status");
        }
        if self.team_id.is_some() {
            columns.push("primary_team_id");
        }
        if self.prj_number.is_some() {
            columns.push("prj_number");
        }
        columns
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewAssignment {
    pub project_id: i32,
    pub developer_id: i32,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub ratio: f64,
}

/// Dates to write into columns that are currently NULL. Populated columns are never touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DateFill {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl DateFill {
    pub fn is_empty(&self) -> bool {
        self.start_date.is_none() && self.end_date.is_none()
    }
}

/// Outcome of a guarded insert: either a fresh row or the row that already held the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i32),
    AlreadyPresent(i32),
}

impl InsertOutcome {
    pub fn id(self) -> i32 {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::AlreadyPresent(id) => id,
        }
    }
}

pub fn canonical_developer_name(first_name: &str, last_name: &str) -> String {
    format!("{} {}", first_name.trim(), last_name.trim())
        .trim()
        .to_uppercase()
}

/// Everything the reconciliation engine reads from or writes to the relational store.
///
/// Each write is its own unit of work; no method spans more than one logical row.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn load_developers(&self) -> Result<Vec<CanonicalEntity>, StoreError>;

    async fn load_teams(&self) -> Result<Vec<CanonicalEntity>, StoreError>;

    /// `(board team name, teams_id)` rows of the `team_name_map` table.
    async fn load_team_name_map(&self) -> Result<Vec<(String, i32)>, StoreError>;

    async fn find_project_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<PersistedProject>, StoreError>;

    /// Lowest-id project with this exact name and no external id.
    async fn find_legacy_project_by_name(
        &self,
        name: &str,
    ) -> Result<Option<PersistedProject>, StoreError>;

    /// Inserts unless a row with the same external id already exists.
    async fn insert_project(&self, project: &NewProject) -> Result<InsertOutcome, StoreError>;

    async fn update_project(&self, project_id: i32, patch: &ProjectPatch)
        -> Result<(), StoreError>;

    async fn find_assignment(
        &self,
        project_id: i32,
        developer_id: i32,
    ) -> Result<Option<PersistedAssignment>, StoreError>;

    /// Inserts unless the (project, developer) pair already has a row.
    async fn insert_assignment(
        &self,
        assignment: &NewAssignment,
    ) -> Result<InsertOutcome, StoreError>;

    async fn fill_assignment_dates(
        &self,
        assignment_id: i32,
        fill: &DateFill,
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn developer_names_are_upper_cased_and_trimmed() {
        assert_eq!(
            canonical_developer_name(" Harishkumar ", "Gundameedi"),
            "HARISHKUMAR GUNDAMEEDI"
        );
        assert_eq!(canonical_developer_name("Cher", ""), "CHER");
    }

    #[test]
    fn empty_patch_reports_no_columns() {
        let patch = ProjectPatch::default();
        assert!(patch.is_empty());
        assert!(patch.changed_columns().is_empty());

        let patch = ProjectPatch {
            status: Some("Backlog".into()),
            prj_number: Some("PRJ0012345".into()),
            ..Default::default()
        };
        assert!(!patch.is_empty());
        assert_eq!(patch.changed_columns(), vec!["status", "prj_number"]);
    }
}
