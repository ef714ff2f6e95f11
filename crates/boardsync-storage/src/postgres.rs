use std::time::Duration;

use async_trait::async_trait;
use boardsync_core::{CanonicalEntity, PersistedAssignment, PersistedProject};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use crate::store::{
    canonical_developer_name, DateFill, InsertOutcome, NewAssignment, NewProject, ProjectPatch,
    ProjectStore, StoreError,
};

const PROJECT_COLUMNS: &str =
    "projects_id, external_id, project_name, status, primary_team_id, prj_number";

/// Postgres-backed store. Holds a single connection for the whole run.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(StoreError::Connect)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `Some(id)` when this call created the row, `None` when the external id was taken.
    ///
    /// The advisory lock serializes writers of one external id across sessions, so the
    /// `NOT EXISTS` check cannot be raced even without a unique index on `external_id`.
    async fn try_insert_project(&self, project: &NewProject) -> Result<Option<i32>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('projects:' || $1::text))")
            .bind(&project.external_id)
            .execute(&mut *tx)
            .await?;

        let inserted: Option<i32> = sqlx::query_scalar(
            r#"
            INSERT INTO projects
                   (external_id, project_name, status, level, primary_team_id, primary_app_id, prj_number)
            SELECT $1::text, $2::text, $3::text, $4::text, $5::int4, $6::int4, $7::text
             WHERE NOT EXISTS (SELECT 1 FROM projects WHERE external_id = $1::text)
            RETURNING projects_id
            "#,
        )
        .bind(&project.external_id)
        .bind(&project.name)
        .bind(&project.status)
        .bind(&project.level)
        .bind(project.team_id)
        .bind(project.app_id)
        .bind(project.prj_number.as_deref())
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn existing_project_id(&self, external_id: &str) -> Result<InsertOutcome, StoreError> {
        let id: Option<i32> = sqlx::query_scalar(
            "SELECT projects_id FROM projects WHERE external_id = $1 ORDER BY projects_id LIMIT 1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::read("projects"))?;
        id.map(InsertOutcome::AlreadyPresent)
            .ok_or_else(|| StoreError::Rejected {
                what: "projects",
                reason: format!("insert of external id {external_id} was refused but no row holds it"),
            })
    }

    async fn try_insert_assignment(
        &self,
        assignment: &NewAssignment,
    ) -> Result<Option<i32>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        // Two-key lock space, so it never collides with the project locks above.
        sqlx::query("SELECT pg_advisory_xact_lock($1::int4, $2::int4)")
            .bind(assignment.project_id)
            .bind(assignment.developer_id)
            .execute(&mut *tx)
            .await?;

        let inserted: Option<i32> = sqlx::query_scalar(
            r#"
            INSERT INTO assignments (projects_id, developers_id, start_date, end_date, ratio)
            SELECT $1::int4, $2::int4, $3::date, $4::date, $5::float8
             WHERE NOT EXISTS (
                   SELECT 1 FROM assignments
                    WHERE projects_id = $1::int4 AND developers_id = $2::int4)
            RETURNING assignments_id
            "#,
        )
        .bind(assignment.project_id)
        .bind(assignment.developer_id)
        .bind(assignment.start_date)
        .bind(assignment.end_date)
        .bind(assignment.ratio)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn existing_assignment_id(
        &self,
        project_id: i32,
        developer_id: i32,
    ) -> Result<InsertOutcome, StoreError> {
        let id: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT assignments_id FROM assignments
             WHERE projects_id = $1 AND developers_id = $2
             ORDER BY assignments_id LIMIT 1
            "#,
        )
        .bind(project_id)
        .bind(developer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::read("assignments"))?;
        id.map(InsertOutcome::AlreadyPresent)
            .ok_or_else(|| StoreError::Rejected {
                what: "assignments",
                reason: format!(
                    "insert of project {project_id} / developer {developer_id} was refused but no row holds it"
                ),
            })
    }
}

const UNIQUE_VIOLATION: &str = "23505";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

fn project_from_row(row: &PgRow) -> Result<PersistedProject, sqlx::Error> {
    Ok(PersistedProject {
        internal_id: row.try_get("projects_id")?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("project_name")?,
        status: row
            .try_get::<Option<String>, _>("status")?
            .unwrap_or_default(),
        team_id: row.try_get("primary_team_id")?,
        prj_number: row.try_get("prj_number")?,
    })
}

fn assignment_from_row(row: &PgRow) -> Result<PersistedAssignment, sqlx::Error> {
    Ok(PersistedAssignment {
        internal_id: row.try_get("assignments_id")?,
        project_id: row.try_get("projects_id")?,
        developer_id: row.try_get("developers_id")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        ratio: row
            .try_get::<Option<f64>, _>("ratio")?
            .unwrap_or(boardsync_core::DEFAULT_ASSIGNMENT_RATIO),
    })
}

#[async_trait]
impl ProjectStore for PgStore {
    async fn load_developers(&self) -> Result<Vec<CanonicalEntity>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT developers_id, first_name, last_name
              FROM developers
             ORDER BY last_name, first_name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::read("developers"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let first: Option<String> = row
                .try_get("first_name")
                .map_err(StoreError::read("developers"))?;
            let last: Option<String> = row
                .try_get("last_name")
                .map_err(StoreError::read("developers"))?;
            out.push(CanonicalEntity {
                internal_id: row
                    .try_get("developers_id")
                    .map_err(StoreError::read("developers"))?,
                canonical_name: canonical_developer_name(
                    first.as_deref().unwrap_or_default(),
                    last.as_deref().unwrap_or_default(),
                ),
            });
        }
        Ok(out)
    }

    async fn load_teams(&self) -> Result<Vec<CanonicalEntity>, StoreError> {
        let rows = sqlx::query("SELECT team_id, team_name FROM teams ORDER BY team_id")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::read("teams"))?;

        rows.iter()
            .map(|row| {
                Ok(CanonicalEntity {
                    internal_id: row.try_get("team_id")?,
                    canonical_name: row.try_get("team_name")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::read("teams"))
    }

    async fn load_team_name_map(&self) -> Result<Vec<(String, i32)>, StoreError> {
        let rows = sqlx::query("SELECT monday_team_name, teams_id FROM team_name_map")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::read("team_name_map"))?;

        rows.iter()
            .map(|row| Ok((row.try_get("monday_team_name")?, row.try_get("teams_id")?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::read("team_name_map"))
    }

    async fn find_project_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<PersistedProject>, StoreError> {
        let sql = format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE external_id = $1 ORDER BY projects_id LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::read("projects"))?;
        row.as_ref()
            .map(project_from_row)
            .transpose()
            .map_err(StoreError::read("projects"))
    }

    async fn find_legacy_project_by_name(
        &self,
        name: &str,
    ) -> Result<Option<PersistedProject>, StoreError> {
        let sql = format!(
            "SELECT {PROJECT_COLUMNS} FROM projects \
             WHERE project_name = $1 AND external_id IS NULL \
             ORDER BY projects_id LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::read("projects"))?;
        row.as_ref()
            .map(project_from_row)
            .transpose()
            .map_err(StoreError::read("projects"))
    }

    async fn insert_project(&self, project: &NewProject) -> Result<InsertOutcome, StoreError> {
        match self.try_insert_project(project).await {
            Ok(Some(id)) => Ok(InsertOutcome::Inserted(id)),
            Ok(None) => self.existing_project_id(&project.external_id).await,
            // A writer outside this engine won the race against a unique index.
            Err(err) if is_unique_violation(&err) => {
                self.existing_project_id(&project.external_id).await
            }
            Err(err) => Err(StoreError::Write {
                what: "projects",
                source: err,
            }),
        }
    }

    async fn update_project(
        &self,
        project_id: i32,
        patch: &ProjectPatch,
    ) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("UPDATE projects SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(external_id) = &patch.external_id {
                set.push("external_id = ");
                set.push_bind_unseparated(external_id.clone());
            }
            if let Some(name) = &patch.name {
                set.push("project_name = ");
                set.push_bind_unseparated(name.clone());
            }
            if let Some(status) = &patch.status {
                set.push("status = ");
                set.push_bind_unseparated(status.clone());
            }
            if let Some(team_id) = patch.team_id {
                set.push("primary_team_id = ");
                set.push_bind_unseparated(team_id);
            }
            if let Some(prj_number) = &patch.prj_number {
                set.push("prj_number = ");
                set.push_bind_unseparated(prj_number.clone());
            }
        }
        qb.push(" WHERE projects_id = ");
        qb.push_bind(project_id);

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(StoreError::write("projects"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Rejected {
                what: "projects",
                reason: format!("no project row with id {project_id}"),
            });
        }
        Ok(())
    }

    async fn find_assignment(
        &self,
        project_id: i32,
        developer_id: i32,
    ) -> Result<Option<PersistedAssignment>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT assignments_id, projects_id, developers_id, start_date, end_date,
                   ratio::float8 AS ratio
              FROM assignments
             WHERE projects_id = $1 AND developers_id = $2
             ORDER BY assignments_id
             LIMIT 1
            "#,
        )
        .bind(project_id)
        .bind(developer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::read("assignments"))?;
        row.as_ref()
            .map(assignment_from_row)
            .transpose()
            .map_err(StoreError::read("assignments"))
    }

    async fn insert_assignment(
        &self,
        assignment: &NewAssignment,
    ) -> Result<InsertOutcome, StoreError> {
        match self.try_insert_assignment(assignment).await {
            Ok(Some(id)) => Ok(InsertOutcome::Inserted(id)),
            Ok(None) => {
                self.existing_assignment_id(assignment.project_id, assignment.developer_id)
                    .await
            }
            Err(err) if is_unique_violation(&err) => {
                self.existing_assignment_id(assignment.project_id, assignment.developer_id)
                    .await
            }
            Err(err) => Err(StoreError::Write {
                what: "assignments",
                source: err,
            }),
        }
    }

    async fn fill_assignment_dates(
        &self,
        assignment_id: i32,
        fill: &DateFill,
    ) -> Result<(), StoreError> {
        if fill.is_empty() {
            return Ok(());
        }
        // COALESCE keeps the fill-only rule even if the row changed since it was read.
        sqlx::query(
            r#"
            UPDATE assignments
               SET start_date = COALESCE(start_date, $2),
                   end_date = COALESCE(end_date, $3)
             WHERE assignments_id = $1
            "#,
        )
        .bind(assignment_id)
        .bind(fill.start_date)
        .bind(fill.end_date)
        .execute(&self.pool)
        .await
        .map_err(StoreError::write("assignments"))?;
        Ok(())
    }
}
