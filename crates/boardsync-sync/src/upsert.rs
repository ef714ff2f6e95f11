use boardsync_storage::{InsertOutcome, NewProject, ProjectStore, StoreError};
use serde::Serialize;
use tracing::debug;

use crate::config::InsertDefaults;
use crate::reconcile::{Decision, ProjectInsert};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectOutcome {
    Inserted,
    /// Insert lost to a row that already carried the external id.
    AlreadyPresent,
    Updated,
    Unchanged,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub project_id: Option<i32>,
    pub outcome: ProjectOutcome,
}

/// Turns reconciliation decisions into store writes.
#[derive(Debug, Clone, Default)]
pub struct UpsertExecutor {
    defaults: InsertDefaults,
}

impl UpsertExecutor {
    pub fn new(defaults: InsertDefaults) -> Self {
        Self { defaults }
    }

    pub fn new_project(&self, insert: &ProjectInsert) -> NewProject {
        NewProject {
            external_id: insert.external_id.clone(),
            name: insert.name.clone(),
            status: insert.status.clone(),
            level: self.defaults.level.clone(),
            team_id: insert.team_id.unwrap_or(self.defaults.team_id),
            app_id: self.defaults.app_id,
            prj_number: insert.prj_number.clone(),
        }
    }

    pub async fn apply(
        &self,
        decision: &Decision,
        store: &dyn ProjectStore,
    ) -> Result<Applied, StoreError> {
        match decision {
            Decision::Insert(insert) => {
                let outcome = store.insert_project(&self.new_project(insert)).await?;
                let applied = match outcome {
                    InsertOutcome::Inserted(id) => Applied {
                        project_id: Some(id),
                        outcome: ProjectOutcome::Inserted,
                    },
                    InsertOutcome::AlreadyPresent(id) => Applied {
                        project_id: Some(id),
                        outcome: ProjectOutcome::AlreadyPresent,
                    },
                };
                debug!(external_id = %insert.external_id, ?applied, "project insert applied");
                Ok(applied)
            }
            Decision::Update {
                project_id,
                patch,
                ..
            } => {
                if patch.is_empty() {
                    return Ok(Applied {
                        project_id: Some(*project_id),
                        outcome: ProjectOutcome::Unchanged,
                    });
                }
                store.update_project(*project_id, patch).await?;
                debug!(
                    project_id,
                    columns = ?patch.changed_columns(),
                    "project updated"
                );
                Ok(Applied {
                    project_id: Some(*project_id),
                    outcome: ProjectOutcome::Updated,
                })
            }
            Decision::Skip(_) => Ok(Applied {
                project_id: None,
                outcome: ProjectOutcome::Skipped,
            }),
        }
    }
}
