use boardsync_core::{EntityKind, NormalizedRecord, PersistedProject};
use boardsync_storage::{ProjectPatch, ProjectStore, StoreError};
use serde::Serialize;

use crate::resolve::{IdentityResolver, Unresolved};

/// Board group label to stored project status. Labels not listed pass through unchanged.
const STATUS_BY_GROUP: &[(&str, &str)] = &[
    ("In Progress/Scheduled", "In Progress"),
    ("Backlog", "Backlog"),
    ("Pending Authorization", "Pending Authorization"),
    ("Internal Tracking", "Internal Tracking"),
    ("Closed", "Closed"),
    ("Removed/Cancelled/Duplicate", "Removed"),
];

pub fn status_for_group(group_label: &str) -> String {
    let label = group_label.trim();
    STATUS_BY_GROUP
        .iter()
        .find(|(group, _)| *group == label)
        .map(|(_, status)| (*status).to_string())
        .unwrap_or_else(|| label.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKey {
    ExternalId,
    LegacyName,
}

/// Project row values for an insert, before placeholders fill the unresolved ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectInsert {
    pub external_id: String,
    pub name: String,
    pub status: String,
    pub team_id: Option<i32>,
    pub prj_number: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingName,
    MissingExternalId,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::MissingName => "item has no usable name",
            SkipReason::MissingExternalId => "item has no external id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Insert(ProjectInsert),
    /// `patch` holds only the columns that differ from the persisted row.
    Update {
        project_id: i32,
        matched_by: MatchKey,
        patch: ProjectPatch,
    },
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub decision: Decision,
    pub unresolved_team: Option<Unresolved>,
}

/// Looks up the persisted row for a record: external id first, then a legacy row by exact name.
pub async fn find_existing(
    store: &dyn ProjectStore,
    record: &NormalizedRecord,
) -> Result<Option<PersistedProject>, StoreError> {
    if !record.external_id.is_empty() {
        if let Some(project) = store.find_project_by_external_id(&record.external_id).await? {
            return Ok(Some(project));
        }
    }
    if record.name.is_empty() {
        return Ok(None);
    }
    store.find_legacy_project_by_name(&record.name).await
}

pub struct Reconciler<'a> {
    resolver: &'a IdentityResolver,
}

impl<'a> Reconciler<'a> {
    pub fn new(resolver: &'a IdentityResolver) -> Self {
        Self { resolver }
    }

    pub fn reconcile(
        &self,
        record: &NormalizedRecord,
        existing: Option<&PersistedProject>,
    ) -> Reconciliation {
        if record.name.trim().is_empty() {
            return skip(SkipReason::MissingName);
        }
        if record.external_id.trim().is_empty() {
            return skip(SkipReason::MissingExternalId);
        }

        let (team_id, unresolved_team) = match record.team_label.as_deref() {
            Some(label) => match self.resolver.resolve(label, EntityKind::Team) {
                Ok(id) => (Some(id), None),
                Err(unresolved) => (None, Some(unresolved)),
            },
            None => (None, None),
        };
        let status = status_for_group(&record.status_group);
        let prj_number = record.prj_number().map(str::to_string);

        let decision = match existing {
            None => Decision::Insert(ProjectInsert {
                external_id: record.external_id.clone(),
                name: record.name.clone(),
                status,
                team_id,
                prj_number,
            }),
            Some(project) => {
                let matched_by = if project.external_id.as_deref() == Some(record.external_id.as_str()) {
                    MatchKey::ExternalId
                } else {
                    MatchKey::LegacyName
                };
                let patch = ProjectPatch {
                    external_id: project
                        .external_id
                        .is_none()
                        .then(|| record.external_id.clone()),
                    name: (project.name != record.name).then(|| record.name.clone()),
                    status: (project.status != status).then_some(status),
                    team_id: team_id.filter(|id| project.team_id != Some(*id)),
                    prj_number: prj_number
                        .filter(|number| project.prj_number.as_deref() != Some(number.as_str())),
                };
                Decision::Update {
                    project_id: project.internal_id,
                    matched_by,
                    patch,
                }
            }
        };

        Reconciliation {
            decision,
            unresolved_team,
        }
    }
}

fn skip(reason: SkipReason) -> Reconciliation {
    Reconciliation {
        decision: Decision::Skip(reason),
        unresolved_team: None,
    }
}

#[cfg(test)]
mod tests {
    use boardsync_core::CanonicalEntity;
    use boardsync_storage::MemoryStore;

    use super::*;
    use crate::resolve::{AliasTable, ReferenceData};
    use crate::upsert::{ProjectOutcome, UpsertExecutor};

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(
            AliasTable::default(),
            &ReferenceData {
                developers: vec![],
                teams: vec![CanonicalEntity {
                    internal_id: 3,
                    canonical_name: "Payments".into(),
                }],
                team_name_map: vec![],
            },
        )
    }

    fn record(external_id: &str, name: &str) -> NormalizedRecord {
        let mut record = NormalizedRecord::new(external_id, name, "In Progress/Scheduled");
        record.team_label = Some("Payments".into());
        record
    }

    fn legacy(id: i32, name: &str) -> PersistedProject {
        PersistedProject {
            internal_id: id,
            external_id: None,
            name: name.into(),
            status: "Backlog".into(),
            team_id: None,
            prj_number: None,
        }
    }

    #[test]
    fn status_table_maps_known_groups_and_passes_others_through() {
        assert_eq!(status_for_group("In Progress/Scheduled"), "In Progress");
        assert_eq!(status_for_group("Removed/Cancelled/Duplicate"), "Removed");
        assert_eq!(status_for_group("Closed"), "Closed");
        assert_eq!(status_for_group("Parking Lot"), "Parking Lot");
    }

    #[tokio::test]
    async fn legacy_row_matched_by_name_is_updated_not_inserted() {
        let store = MemoryStore::new().with_project(legacy(40, "Provider directory sync"));
        let record = record("999", "Provider directory sync");

        let existing = find_existing(&store, &record).await.unwrap();
        assert_eq!(existing.as_ref().map(|p| p.internal_id), Some(40));

        let resolver = resolver();
        let reconciliation = Reconciler::new(&resolver).reconcile(&record, existing.as_ref());
        match reconciliation.decision {
            Decision::Update {
                project_id,
                matched_by,
                patch,
            } => {
                assert_eq!(project_id, 40);
                assert_eq!(matched_by, MatchKey::LegacyName);
                assert_eq!(patch.external_id.as_deref(), Some("999"));
                assert_eq!(patch.status.as_deref(), Some("In Progress"));
                assert_eq!(patch.team_id, Some(3));
                assert_eq!(patch.name, None);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn unchanged_row_produces_an_empty_patch() {
        let resolver = resolver();
        let existing = PersistedProject {
            internal_id: 7,
            external_id: Some("1819420915".into()),
            name: "Claims intake redesign".into(),
            status: "In Progress".into(),
            team_id: Some(3),
            prj_number: None,
        };
        let reconciliation = Reconciler::new(&resolver)
            .reconcile(&record("1819420915", "Claims intake redesign"), Some(&existing));
        assert!(matches!(
            reconciliation.decision,
            Decision::Update { matched_by: MatchKey::ExternalId, ref patch, .. } if patch.is_empty()
        ));
    }

    #[test]
    fn unresolved_team_is_recorded_and_the_decision_proceeds() {
        let resolver = resolver();
        let mut record = record("1819421101", "Claims audit dashboard");
        record.team_label = Some("Analytics Guild".into());

        let reconciliation = Reconciler::new(&resolver).reconcile(&record, None);
        let unresolved = reconciliation.unresolved_team.expect("team should be unresolved");
        assert_eq!(unresolved.name, "Analytics Guild");
        assert!(matches!(
            reconciliation.decision,
            Decision::Insert(ProjectInsert { team_id: None, .. })
        ));
    }

    #[tokio::test]
    async fn unresolved_team_keeps_the_stored_team_on_update() {
        let existing = PersistedProject {
            internal_id: 12,
            external_id: Some("1819421101".into()),
            name: "Claims audit dashboard".into(),
            status: "Backlog".into(),
            team_id: Some(7),
            prj_number: None,
        };
        let store = MemoryStore::new().with_project(existing.clone());
        let mut record = record("1819421101", "Claims audit dashboard");
        record.team_label = Some("Analytics Guild".into());

        let resolver = resolver();
        let reconciliation = Reconciler::new(&resolver).reconcile(&record, Some(&existing));
        assert_eq!(
            reconciliation.unresolved_team.map(|u| u.name).as_deref(),
            Some("Analytics Guild")
        );
        match &reconciliation.decision {
            Decision::Update { project_id, patch, .. } => {
                assert_eq!(*project_id, 12);
                assert_eq!(patch.status.as_deref(), Some("In Progress"));
                assert_eq!(patch.team_id, None);
            }
            other => panic!("expected update, got {other:?}"),
        }

        let applied = UpsertExecutor::default()
            .apply(&reconciliation.decision, &store)
            .await
            .unwrap();
        assert_eq!(applied.outcome, ProjectOutcome::Updated);
        let stored = store.project(12).await.unwrap();
        assert_eq!(stored.status, "In Progress");
        assert_eq!(stored.team_id, Some(7));
    }

    #[test]
    fn records_without_a_name_are_skipped() {
        let resolver = resolver();
        let reconciliation = Reconciler::new(&resolver).reconcile(&record("1819421063", ""), None);
        assert_eq!(reconciliation.decision, Decision::Skip(SkipReason::MissingName));
    }

    #[test]
    fn records_without_an_external_id_are_skipped_even_when_a_name_matches() {
        let resolver = resolver();
        let existing = legacy(40, "Provider directory sync");
        let reconciliation = Reconciler::new(&resolver)
            .reconcile(&record("", "Provider directory sync"), Some(&existing));
        assert_eq!(reconciliation.decision, Decision::Skip(SkipReason::MissingExternalId));
        assert!(reconciliation.unresolved_team.is_none());
    }

    #[tokio::test]
    async fn rows_with_an_external_id_are_not_name_matched() {
        let store = MemoryStore::new().with_project(PersistedProject {
            external_id: Some("1".into()),
            ..legacy(40, "Provider directory sync")
        });
        let existing = find_existing(&store, &record("999", "Provider directory sync"))
            .await
            .unwrap();
        assert!(existing.is_none());
    }
}
