//! Core domain model shared by every board sync stage.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "boardsync-core";

/// Aux key holding the truncated project number taken from the link column.
pub const AUX_PRJ_NUMBER: &str = "prj_number";

/// Ratio written on every newly created assignment row.
pub const DEFAULT_ASSIGNMENT_RATIO: f64 = 1.0;

/// One group of the board, fetched as its own cursor walk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub id: String,
    pub label: String,
}

impl Partition {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.id)
    }
}

/// Column attribute as delivered by the board: display text plus a JSON-encoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawColumn {
    pub text: Option<String>,
    pub value: Option<String>,
}

impl RawColumn {
    pub fn text(&self) -> Option<&str> {
        non_blank(self.text.as_deref())
    }

    pub fn value(&self) -> Option<&str> {
        non_blank(self.value.as_deref())
    }
}

fn non_blank(input: Option<&str>) -> Option<&str> {
    input.map(str::trim).filter(|s| !s.is_empty())
}

/// Raw board item. Immutable once the paginator has yielded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalItem {
    pub external_id: String,
    pub display_name: String,
    pub group_label: String,
    #[serde(default)]
    pub raw_columns: BTreeMap<String, RawColumn>,
}

impl ExternalItem {
    pub fn column(&self, column_id: &str) -> Option<&RawColumn> {
        self.raw_columns.get(column_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

/// Item after column extraction; the input of reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub external_id: String,
    pub name: String,
    pub status_group: String,
    pub team_label: Option<String>,
    pub developer_names: Vec<String>,
    pub timeline: Option<Timeline>,
    pub aux: BTreeMap<String, String>,
}

impl NormalizedRecord {
    pub fn new(
        external_id: impl Into<String>,
        name: impl Into<String>,
        status_group: impl Into<String>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            name: name.into(),
            status_group: status_group.into(),
            team_label: None,
            developer_names: Vec::new(),
            timeline: None,
            aux: BTreeMap::new(),
        }
    }

    pub fn prj_number(&self) -> Option<&str> {
        self.aux.get(AUX_PRJ_NUMBER).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Developer,
    Team,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Developer => f.write_str("developer"),
            EntityKind::Team => f.write_str("team"),
        }
    }
}

/// Developer or team row as the store knows it. `internal_id` is the store's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub internal_id: i32,
    pub canonical_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedProject {
    pub internal_id: i32,
    pub external_id: Option<String>,
    pub name: String,
    pub status: String,
    pub team_id: Option<i32>,
    pub prj_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedAssignment {
    pub internal_id: i32,
    pub project_id: i32,
    pub developer_id: i32,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub ratio: f64,
}
