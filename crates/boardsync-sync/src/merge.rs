use boardsync_core::{PersistedAssignment, Timeline, DEFAULT_ASSIGNMENT_RATIO};
use boardsync_storage::{DateFill, InsertOutcome, NewAssignment, ProjectStore, StoreError};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Inserted,
    UpdatedDates,
    Unchanged,
}

/// Dates the incoming timeline may write: only into columns that are still NULL.
pub fn fill_only(existing: &PersistedAssignment, incoming: Option<&Timeline>) -> DateFill {
    let Some(timeline) = incoming else {
        return DateFill::default();
    };
    DateFill {
        start_date: existing
            .start_date
            .is_none()
            .then_some(timeline.start_date),
        end_date: existing.end_date.is_none().then_some(timeline.end_date),
    }
}

pub struct AssignmentMerger<'a> {
    store: &'a dyn ProjectStore,
}

impl<'a> AssignmentMerger<'a> {
    pub fn new(store: &'a dyn ProjectStore) -> Self {
        Self { store }
    }

    pub async fn merge(
        &self,
        project_id: i32,
        developer_id: i32,
        timeline: Option<&Timeline>,
    ) -> Result<MergeOutcome, StoreError> {
        let existing = match self.store.find_assignment(project_id, developer_id).await? {
            Some(row) => row,
            None => {
                let outcome = self
                    .store
                    .insert_assignment(&NewAssignment {
                        project_id,
                        developer_id,
                        start_date: timeline.map(|t| t.start_date),
                        end_date: timeline.map(|t| t.end_date),
                        ratio: DEFAULT_ASSIGNMENT_RATIO,
                    })
                    .await?;
                match outcome {
                    InsertOutcome::Inserted(_) => return Ok(MergeOutcome::Inserted),
                    // Another writer created the row between our read and insert.
                    InsertOutcome::AlreadyPresent(_) => {
                        match self.store.find_assignment(project_id, developer_id).await? {
                            Some(row) => row,
                            None => return Ok(MergeOutcome::Unchanged),
                        }
                    }
                }
            }
        };

        let fill = fill_only(&existing, timeline);
        if fill.is_empty() {
            return Ok(MergeOutcome::Unchanged);
        }
        self.store
            .fill_assignment_dates(existing.internal_id, &fill)
            .await?;
        Ok(MergeOutcome::UpdatedDates)
    }
}

#[cfg(test)]
mod tests {
    use boardsync_storage::MemoryStore;
    use chrono::NaiveDate;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn timeline() -> Timeline {
        Timeline {
            start_date: date(2024, 2, 1),
            end_date: date(2024, 3, 1),
        }
    }

    fn assignment(start: Option<NaiveDate>, end: Option<NaiveDate>) -> PersistedAssignment {
        PersistedAssignment {
            internal_id: 1,
            project_id: 10,
            developer_id: 20,
            start_date: start,
            end_date: end,
            ratio: 1.0,
        }
    }

    #[test]
    fn fill_only_keeps_populated_dates() {
        let fill = fill_only(&assignment(Some(date(2024, 1, 1)), None), Some(&timeline()));
        assert_eq!(
            fill,
            DateFill {
                start_date: None,
                end_date: Some(date(2024, 3, 1)),
            }
        );
        assert!(fill_only(&assignment(None, None), None).is_empty());
        assert!(fill_only(
            &assignment(Some(date(2023, 1, 1)), Some(date(2023, 6, 1))),
            Some(&timeline())
        )
        .is_empty());
    }

    #[tokio::test]
    async fn existing_row_gets_only_its_missing_end_date() {
        let store = MemoryStore::new().with_assignment(assignment(Some(date(2024, 1, 1)), None));
        let outcome = AssignmentMerger::new(&store)
            .merge(10, 20, Some(&timeline()))
            .await
            .unwrap();

        assert_eq!(outcome, MergeOutcome::UpdatedDates);
        let row = &store.assignments().await[0];
        assert_eq!(row.start_date, Some(date(2024, 1, 1)));
        assert_eq!(row.end_date, Some(date(2024, 3, 1)));
    }

    #[tokio::test]
    async fn missing_row_is_inserted_with_ratio_one() {
        let store = MemoryStore::new();
        let merger = AssignmentMerger::new(&store);

        assert_eq!(merger.merge(10, 21, None).await.unwrap(), MergeOutcome::Inserted);
        assert_eq!(
            merger.merge(10, 21, None).await.unwrap(),
            MergeOutcome::Unchanged
        );

        let rows = store.assignments().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ratio, 1.0);
        assert_eq!(rows[0].start_date, None);
        assert_eq!(store.row_writes().await, 1);
    }

    #[tokio::test]
    async fn later_timeline_fills_a_dateless_row() {
        let store = MemoryStore::new();
        let merger = AssignmentMerger::new(&store);
        merger.merge(10, 22, None).await.unwrap();

        let outcome = merger.merge(10, 22, Some(&timeline())).await.unwrap();
        assert_eq!(outcome, MergeOutcome::UpdatedDates);
        let row = &store.assignments().await[0];
        assert_eq!(row.start_date, Some(date(2024, 2, 1)));
        assert_eq!(row.end_date, Some(date(2024, 3, 1)));
    }
}
