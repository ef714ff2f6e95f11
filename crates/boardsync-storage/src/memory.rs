use async_trait::async_trait;
use boardsync_core::{CanonicalEntity, PersistedAssignment, PersistedProject};
use tokio::sync::Mutex;

use crate::store::{
    canonical_developer_name, DateFill, InsertOutcome, NewAssignment, NewProject, ProjectPatch,
    ProjectStore, StoreError,
};

/// In-process store with the same contract as [`crate::PgStore`].
///
/// Backs the engine's tests. Counts every row write so callers can assert that a repeated
/// run touched nothing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    developers: Vec<CanonicalEntity>,
    teams: Vec<CanonicalEntity>,
    team_name_map: Vec<(String, i32)>,
    projects: Vec<StoredProject>,
    assignments: Vec<PersistedAssignment>,
    next_project_id: i32,
    next_assignment_id: i32,
    row_writes: usize,
}

#[derive(Debug, Clone)]
struct StoredProject {
    row: PersistedProject,
    level: String,
    app_id: i32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_developer(mut self, id: i32, first_name: &str, last_name: &str) -> Self {
        self.state.get_mut().developers.push(CanonicalEntity {
            internal_id: id,
            canonical_name: canonical_developer_name(first_name, last_name),
        });
        self
    }

    pub fn with_team(mut self, id: i32, name: &str) -> Self {
        self.state.get_mut().teams.push(CanonicalEntity {
            internal_id: id,
            canonical_name: name.to_string(),
        });
        self
    }

    pub fn with_team_name_mapping(mut self, board_name: &str, team_id: i32) -> Self {
        self.state
            .get_mut()
            .team_name_map
            .push((board_name.to_string(), team_id));
        self
    }

    pub fn with_project(mut self, project: PersistedProject) -> Self {
        let state = self.state.get_mut();
        state.next_project_id = state.next_project_id.max(project.internal_id);
        state.projects.push(StoredProject {
            row: project,
            level: "TBD".to_string(),
            app_id: 0,
        });
        self
    }

    pub fn with_assignment(mut self, assignment: PersistedAssignment) -> Self {
        let state = self.state.get_mut();
        state.next_assignment_id = state.next_assignment_id.max(assignment.internal_id);
        state.assignments.push(assignment);
        self
    }

    pub async fn projects(&self) -> Vec<PersistedProject> {
        let state = self.state.lock().await;
        state.projects.iter().map(|p| p.row.clone()).collect()
    }

    pub async fn project(&self, project_id: i32) -> Option<PersistedProject> {
        let state = self.state.lock().await;
        state
            .projects
            .iter()
            .find(|p| p.row.internal_id == project_id)
            .map(|p| p.row.clone())
    }

    /// `(level, primary_app_id)` placeholders recorded for a project row.
    pub async fn project_placeholders(&self, project_id: i32) -> Option<(String, i32)> {
        let state = self.state.lock().await;
        state
            .projects
            .iter()
            .find(|p| p.row.internal_id == project_id)
            .map(|p| (p.level.clone(), p.app_id))
    }

    pub async fn assignments(&self) -> Vec<PersistedAssignment> {
        self.state.lock().await.assignments.clone()
    }

    /// Number of INSERT/UPDATE row writes performed since construction.
    pub async fn row_writes(&self) -> usize {
        self.state.lock().await.row_writes
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn load_developers(&self) -> Result<Vec<CanonicalEntity>, StoreError> {
        Ok(self.state.lock().await.developers.clone())
    }

    async fn load_teams(&self) -> Result<Vec<CanonicalEntity>, StoreError> {
        Ok(self.state.lock().await.teams.clone())
    }

    async fn load_team_name_map(&self) -> Result<Vec<(String, i32)>, StoreError> {
        Ok(self.state.lock().await.team_name_map.clone())
    }

    async fn find_project_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<PersistedProject>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .projects
            .iter()
            .filter(|p| p.row.external_id.as_deref() == Some(external_id))
            .min_by_key(|p| p.row.internal_id)
            .map(|p| p.row.clone()))
    }

    async fn find_legacy_project_by_name(
        &self,
        name: &str,
    ) -> Result<Option<PersistedProject>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .projects
            .iter()
            .filter(|p| p.row.external_id.is_none() && p.row.name == name)
            .min_by_key(|p| p.row.internal_id)
            .map(|p| p.row.clone()))
    }

    async fn insert_project(&self, project: &NewProject) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .projects
            .iter()
            .find(|p| p.row.external_id.as_deref() == Some(project.external_id.as_str()))
        {
            return Ok(InsertOutcome::AlreadyPresent(existing.row.internal_id));
        }

        state.next_project_id += 1;
        let id = state.next_project_id;
        state.projects.push(StoredProject {
            row: PersistedProject {
                internal_id: id,
                external_id: Some(project.external_id.clone()),
                name: project.name.clone(),
                status: project.status.clone(),
                team_id: Some(project.team_id),
                prj_number: project.prj_number.clone(),
            },
            level: project.level.clone(),
            app_id: project.app_id,
        });
        state.row_writes += 1;
        Ok(InsertOutcome::Inserted(id))
    }

    async fn update_project(
        &self,
        project_id: i32,
        patch: &ProjectPatch,
    ) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let Some(stored) = state
            .projects
            .iter_mut()
            .find(|p| p.row.internal_id == project_id)
        else {
            return Err(StoreError::Rejected {
                what: "projects",
                reason: format!("no project row with id {project_id}"),
            });
        };

        let row = &mut stored.row;
        if let Some(external_id) = &patch.external_id {
            row.external_id = Some(external_id.clone());
        }
        if let Some(name) = &patch.name {
            row.name = name.clone();
        }
        if let Some(status) = &patch.status {
            row.status = status.clone();
        }
        if let Some(team_id) = patch.team_id {
            row.team_id = Some(team_id);
        }
        if let Some(prj_number) = &patch.prj_number {
            row.prj_number = Some(prj_number.clone());
        }
        state.row_writes += 1;
        Ok(())
    }

    async fn find_assignment(
        &self,
        project_id: i32,
        developer_id: i32,
    ) -> Result<Option<PersistedAssignment>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .assignments
            .iter()
            .filter(|a| a.project_id == project_id && a.developer_id == developer_id)
            .min_by_key(|a| a.internal_id)
            .cloned())
    }

    async fn insert_assignment(
        &self,
        assignment: &NewAssignment,
    ) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.assignments.iter().find(|a| {
            a.project_id == assignment.project_id && a.developer_id == assignment.developer_id
        }) {
            return Ok(InsertOutcome::AlreadyPresent(existing.internal_id));
        }

        state.next_assignment_id += 1;
        let id = state.next_assignment_id;
        state.assignments.push(PersistedAssignment {
            internal_id: id,
            project_id: assignment.project_id,
            developer_id: assignment.developer_id,
            start_date: assignment.start_date,
            end_date: assignment.end_date,
            ratio: assignment.ratio,
        });
        state.row_writes += 1;
        Ok(InsertOutcome::Inserted(id))
    }

    async fn fill_assignment_dates(
        &self,
        assignment_id: i32,
        fill: &DateFill,
    ) -> Result<(), StoreError> {
        if fill.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let Some(row) = state
            .assignments
            .iter_mut()
            .find(|a| a.internal_id == assignment_id)
        else {
            return Err(StoreError::Rejected {
                what: "assignments",
                reason: format!("no assignment row with id {assignment_id}"),
            });
        };
        if row.start_date.is_none() {
            row.start_date = fill.start_date;
        }
        if row.end_date.is_none() {
            row.end_date = fill.end_date;
        }
        state.row_writes += 1;
        Ok(())
    }
}
