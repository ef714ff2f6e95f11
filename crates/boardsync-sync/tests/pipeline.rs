use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use boardsync_adapters::{BoardSource, FixtureBoardSource, ItemsPage};
use boardsync_core::{EntityKind, Partition, PersistedProject};
use boardsync_storage::{FetchError, MemoryStore};
use boardsync_sync::{AliasTable, BoardConfig, SyncOptions, SyncPipeline};

const BOARD_ID: &str = "1290045511";
const SECOND_PAGE_CURSOR: &str = "MSwxMjkwMDQ1NTExLGFfMQ";

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/board/sample_pages.json")
}

fn board() -> BoardConfig {
    BoardConfig::new(
        BOARD_ID,
        vec![
            Partition::new("topics", "In Progress/Scheduled"),
            Partition::new("new_group", "Backlog"),
        ],
    )
}

fn aliases() -> AliasTable {
    AliasTable::default().with_alias(
        EntityKind::Developer,
        "Harish Gundameedi",
        "HARISHKUMAR GUNDAMEEDI",
    )
}

fn store() -> Arc<MemoryStore> {
    Arc::new(
        MemoryStore::new()
            .with_developer(11, "Harishkumar", "Gundameedi")
            .with_developer(12, "Romal", "Patel")
            .with_developer(13, "Yash", "Patel")
            .with_team(3, "Payments")
            .with_team(4, "Core Platform")
            .with_team(5, "Data Services")
            .with_team_name_mapping("Digital Front Door", 5)
            .with_project(PersistedProject {
                internal_id: 40,
                external_id: None,
                name: "Provider directory sync".into(),
                status: "Backlog".into(),
                team_id: None,
                prj_number: None,
            }),
    )
}

fn pipeline(source: Box<dyn BoardSource>, store: Arc<MemoryStore>) -> SyncPipeline {
    SyncPipeline::new(board(), aliases(), source, store)
}

fn fixture_source() -> Box<dyn BoardSource> {
    Box::new(FixtureBoardSource::load(fixture_path()).expect("load fixture board"))
}

#[tokio::test]
async fn first_run_reconciles_the_recorded_board() {
    let store = store();
    let report = pipeline(fixture_source(), store.clone())
        .run_once()
        .await
        .unwrap();

    assert!(!report.is_partial());
    assert_eq!(report.partitions_walked, 2);
    assert_eq!(report.pages_fetched, 4);
    assert_eq!(report.items_fetched, 6);

    assert_eq!(report.projects.inserted, 4);
    assert_eq!(report.projects.updated, 1);
    assert_eq!(report.projects.skipped, 1);
    assert_eq!(report.skipped_records[0].external_id, "1819421063");

    assert_eq!(report.assignments.inserted, 5);
    assert_eq!(report.assignments.skipped_unresolved_developer, 1);
    assert_eq!(report.unresolved_names(EntityKind::Developer), vec!["Tariq Islam"]);
    assert_eq!(report.unresolved_names(EntityKind::Team), vec!["Analytics Guild"]);
    assert_eq!(report.degraded_columns.len(), 1);

    let legacy = store.project(40).await.unwrap();
    assert_eq!(legacy.external_id.as_deref(), Some("1819420977"));
    assert_eq!(legacy.status, "In Progress");
    assert_eq!(legacy.team_id, Some(5));

    let projects = store.projects().await;
    assert_eq!(projects.len(), 5);
    let claims = projects
        .iter()
        .find(|p| p.external_id.as_deref() == Some("1819420915"))
        .unwrap();
    assert_eq!(claims.team_id, Some(3));
    assert_eq!(claims.prj_number.as_deref(), Some("PRJ0012345"));
    let audit = projects
        .iter()
        .find(|p| p.external_id.as_deref() == Some("1819421101"))
        .unwrap();
    assert_eq!(audit.status, "Backlog");
    assert_eq!(audit.team_id, Some(0));
}

#[tokio::test]
async fn second_run_against_an_unchanged_board_writes_nothing() {
    let store = store();
    let pipeline = pipeline(fixture_source(), store.clone());

    let first = pipeline.run_once().await.unwrap();
    assert!(first.writes() > 0);
    let writes_after_first = store.row_writes().await;

    let second = pipeline.run_once().await.unwrap();
    assert_eq!(second.writes(), 0);
    assert_eq!(second.projects.unchanged, 5);
    assert_eq!(second.assignments.unchanged, 5);
    assert_eq!(store.row_writes().await, writes_after_first);
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn alias_and_canonical_spellings_resolve_to_one_developer() {
    let store = store();
    pipeline(fixture_source(), store.clone())
        .run_once()
        .await
        .unwrap();

    let harish = store
        .assignments()
        .await
        .into_iter()
        .filter(|a| a.developer_id == 11)
        .count();
    // "Harish Gundameedi" on one item, "Harishkumar Gundameedi" on another.
    assert_eq!(harish, 2);
}

#[tokio::test]
async fn projects_only_leaves_assignments_alone() {
    let store = store();
    let report = pipeline(fixture_source(), store.clone())
        .with_options(SyncOptions {
            projects_only: true,
        })
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.projects.inserted, 4);
    assert_eq!(report.assignments.inserted, 0);
    assert!(store.assignments().await.is_empty());
}

/// Serves the recorded board but fails requests for one cursor until `failures_left` runs out.
struct FlakySource {
    inner: FixtureBoardSource,
    failing_cursor: &'static str,
    failures_left: AtomicUsize,
}

impl FlakySource {
    fn new(failures: usize) -> Self {
        Self {
            inner: FixtureBoardSource::load(fixture_path()).unwrap(),
            failing_cursor: SECOND_PAGE_CURSOR,
            failures_left: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl BoardSource for FlakySource {
    fn board_id(&self) -> &str {
        self.inner.board_id()
    }

    async fn fetch_page(
        &self,
        partition: &Partition,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<ItemsPage, FetchError> {
        let fail = cursor == Some(self.failing_cursor)
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if fail {
            return Err(FetchError::HttpStatus {
                status: 503,
                url: "https://api.monday.com/v2".into(),
            });
        }
        self.inner.fetch_page(partition, cursor, limit).await
    }
}

#[tokio::test]
async fn failed_partition_keeps_fetched_items_and_other_partitions() {
    let store = store();
    let report = pipeline(Box::new(FlakySource::new(usize::MAX)), store.clone())
        .run_once()
        .await
        .unwrap();

    assert!(report.is_partial());
    assert_eq!(report.partitions_resumed, 0);
    assert_eq!(report.failed_partitions.len(), 1);
    let failure = &report.failed_partitions[0];
    assert_eq!(failure.partition.id, "topics");
    assert_eq!(failure.last_cursor.as_deref(), Some(SECOND_PAGE_CURSOR));
    assert_eq!(failure.items_kept, 3);

    // Three items from the first page plus the backlog item.
    assert_eq!(report.items_fetched, 4);
    assert_eq!(report.projects.inserted, 3);
    assert_eq!(report.projects.updated, 1);
    assert!(report.to_markdown().contains("Status: partial"));
}

#[tokio::test]
async fn transient_failure_resumes_at_the_failed_cursor() {
    let store = store();
    let source = FlakySource::new(1);

    let report = pipeline(Box::new(source), store.clone())
        .run_once()
        .await
        .unwrap();

    assert!(!report.is_partial());
    assert!(report.failed_partitions.is_empty());
    assert_eq!(report.partitions_resumed, 1);
    assert_eq!(report.pages_fetched, 4);
    assert_eq!(report.items_fetched, 6);
    assert_eq!(report.duplicate_items, 0);
    assert_eq!(report.projects.inserted, 4);
    assert_eq!(report.projects.updated, 1);
    assert!(report.to_markdown().contains("1 resumed"));
}

#[tokio::test]
async fn no_resume_attempts_leaves_the_partition_failed() {
    let store = store();
    let mut board = board();
    board.resume_attempts = 0;

    let report = SyncPipeline::new(board, aliases(), Box::new(FlakySource::new(1)), store)
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.failed_partitions.len(), 1);
    assert_eq!(report.items_fetched, 4);
}

#[tokio::test]
async fn unknown_partition_fails_alone_against_an_empty_store() {
    let store = Arc::new(MemoryStore::new());
    let mut board = board();
    board.partitions.push(Partition::new("closed", "Closed"));

    let report = SyncPipeline::new(board, AliasTable::default(), fixture_source(), store.clone())
        .run_once()
        .await
        .unwrap();

    assert_eq!(report.failed_partitions.len(), 1);
    assert_eq!(report.failed_partitions[0].last_cursor, None);
    assert_eq!(report.projects.inserted, 5);
    assert_eq!(report.unresolved_names(EntityKind::Team).len(), 5);
}
