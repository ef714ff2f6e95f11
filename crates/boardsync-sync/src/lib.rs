//! Board-to-store reconciliation: one run fetches every partition, reconciles projects,
//! then merges developer assignments.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use boardsync_adapters::{
    BoardSource, FieldExtractor, FixtureBoardSource, MondayBoardSource, Paginator, PartitionFetch,
};
use boardsync_core::{EntityKind, ExternalItem, NormalizedRecord, Partition};
use boardsync_storage::{FetchError, HttpClientConfig, HttpFetcher, PgStore, ProjectStore};
use chrono::Utc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod merge;
mod reconcile;
mod report;
mod resolve;
mod upsert;

pub use config::{BoardConfig, InsertDefaults, SyncConfig, ALIASES_FILE, BOARD_CONFIG_FILE};
pub use merge::{fill_only, AssignmentMerger, MergeOutcome};
pub use reconcile::{
    find_existing, status_for_group, Decision, MatchKey, ProjectInsert, Reconciler,
    Reconciliation, SkipReason,
};
pub use report::{
    recent_reports_markdown, AssignmentCounts, PartitionFailure, ProjectCounts, RecordIssue,
    RunReport, UnresolvedEntry, REPORT_JSON_FILE, REPORT_SUMMARY_FILE,
};
pub use resolve::{
    name_key, AliasTable, IdentityResolver, ReferenceData, Unresolved, UnresolvedReason,
    SUGGESTION_THRESHOLD,
};
pub use upsert::{Applied, ProjectOutcome, UpsertExecutor};

pub const CRATE_NAME: &str = "boardsync-sync";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Reconcile projects only; leave assignments untouched.
    pub projects_only: bool,
}

pub struct SyncPipeline {
    board: BoardConfig,
    aliases: AliasTable,
    source: Box<dyn BoardSource>,
    store: Arc<dyn ProjectStore>,
    options: SyncOptions,
}

impl SyncPipeline {
    pub fn new(
        board: BoardConfig,
        aliases: AliasTable,
        source: Box<dyn BoardSource>,
        store: Arc<dyn ProjectStore>,
    ) -> Self {
        Self {
            board,
            aliases,
            source,
            store,
            options: SyncOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Runs one full pass. Only a failure to load reference data aborts the run, and it
    /// happens before any write; everything later is recorded in the report instead.
    pub async fn run_once(&self) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, board = %self.source.board_id());
        self.run(run_id).instrument(span).await
    }

    async fn run(&self, run_id: Uuid) -> Result<RunReport> {
        let mut report = RunReport::new(run_id, self.source.board_id(), Utc::now());

        let reference = ReferenceData::load(self.store.as_ref())
            .await
            .context("loading developers, teams and team_name_map")?;
        let resolver = IdentityResolver::new(self.aliases.clone(), &reference);
        info!(
            developers = resolver.entity_count(EntityKind::Developer),
            teams = resolver.entity_count(EntityKind::Team),
            aliases = self.aliases.len(),
            "reference data loaded"
        );

        let items = self.fetch_items(&mut report).await;
        let records = self.extract(items, &mut report);
        let project_ids = self.reconcile_projects(&records, &resolver, &mut report).await;
        if !self.options.projects_only {
            self.merge_assignments(&records, &project_ids, &resolver, &mut report)
                .await;
        }

        report.finished_at = Utc::now();
        info!(
            inserted = report.projects.inserted,
            updated = report.projects.updated,
            unchanged = report.projects.unchanged,
            assignments_inserted = report.assignments.inserted,
            assignments_filled = report.assignments.updated_dates,
            unresolved = report.unresolved.len(),
            partial = report.is_partial(),
            "sync run finished"
        );
        Ok(report)
    }

    async fn fetch_items(&self, report: &mut RunReport) -> Vec<ExternalItem> {
        let mut seen = HashSet::new();
        let mut items = Vec::new();

        for partition in &self.board.partitions {
            let fetch = self.walk_partition(partition, report).await;
            report.partitions_walked += 1;
            report.pages_fetched += fetch.pages;

            if let Some(err) = fetch.error {
                report.failed_partitions.push(PartitionFailure {
                    partition: err.partition.clone(),
                    last_cursor: err.last_cursor.clone(),
                    pages_fetched: fetch.pages,
                    items_kept: fetch.items.len(),
                    error: format!("{:#}", anyhow::Error::new(err.source)),
                });
            }

            for item in fetch.items {
                report.items_fetched += 1;
                // An item moved between groups mid-run shows up twice; the first sighting wins.
                if !seen.insert(item.external_id.clone()) {
                    report.duplicate_items += 1;
                    warn!(external_id = %item.external_id, partition = %partition.id, "item already fetched from another partition");
                    continue;
                }
                items.push(item);
            }
        }

        items
    }

    /// Walks one partition, re-walking from the failed cursor up to `resume_attempts` times.
    /// Only the error of the last walk survives.
    async fn walk_partition(
        &self,
        partition: &Partition,
        report: &mut RunReport,
    ) -> PartitionFetch {
        let source = self.source.as_ref();
        let limit = self.board.page_limit;
        let mut fetch = Paginator::new(source, partition.clone(), limit)
            .collect_all()
            .await;
        let mut seen = fetch
            .items
            .iter()
            .map(|item| item.external_id.clone())
            .collect::<HashSet<_>>();

        let mut attempt = 0;
        while attempt < self.board.resume_attempts {
            let Some(err) = fetch.error.take() else {
                break;
            };
            if matches!(err.source, FetchError::CursorLoop { .. }) {
                fetch.error = Some(err);
                break;
            }
            attempt += 1;
            warn!(
                partition = %partition.id,
                attempt,
                cursor = err.last_cursor.as_deref().unwrap_or("<start>"),
                "resuming failed partition"
            );

            let paginator = Paginator::new(source, partition.clone(), limit);
            let paginator = match err.last_cursor {
                Some(cursor) => paginator.resume_from(cursor),
                None => paginator,
            };
            let resumed = paginator.collect_all().await;
            fetch.pages += resumed.pages;
            let fresh = resumed
                .items
                .into_iter()
                .filter(|item| seen.insert(item.external_id.clone()));
            fetch.items.extend(fresh);
            fetch.error = resumed.error;
        }

        if attempt > 0 && fetch.error.is_none() {
            report.partitions_resumed += 1;
        }
        fetch
    }

    fn extract(&self, items: Vec<ExternalItem>, report: &mut RunReport) -> Vec<NormalizedRecord> {
        let extractor = FieldExtractor::new(&self.board.columns);
        items
            .iter()
            .map(|item| {
                let extraction = extractor.extract(item);
                for degraded in &extraction.degraded {
                    warn!(error = %degraded, "column degraded to unset");
                }
                report.degraded_columns.extend(extraction.degraded);
                extraction.record
            })
            .collect()
    }

    async fn reconcile_projects(
        &self,
        records: &[NormalizedRecord],
        resolver: &IdentityResolver,
        report: &mut RunReport,
    ) -> Vec<Option<i32>> {
        let store = self.store.as_ref();
        let reconciler = Reconciler::new(resolver);
        let executor = UpsertExecutor::new(self.board.insert_defaults.clone());
        let mut project_ids = Vec::with_capacity(records.len());

        for record in records {
            let existing = match find_existing(store, record).await {
                Ok(existing) => existing,
                Err(err) => {
                    report.projects.failed += 1;
                    report.store_failures.push(issue(record, format!("{:#}", anyhow::Error::new(err))));
                    project_ids.push(None);
                    continue;
                }
            };

            let reconciliation = reconciler.reconcile(record, existing.as_ref());
            if let Some(unresolved) = &reconciliation.unresolved_team {
                warn!(external_id = %record.external_id, error = %unresolved, "team not resolved");
                report.record_unresolved(unresolved, resolver.suggest(&unresolved.name, EntityKind::Team));
            }
            if let Decision::Skip(reason) = &reconciliation.decision {
                warn!(external_id = %record.external_id, reason = reason.as_str(), "record skipped");
                report.skipped_records.push(issue(record, reason.as_str().to_string()));
            }

            match executor.apply(&reconciliation.decision, store).await {
                Ok(applied) => {
                    report.projects.record(applied.outcome);
                    project_ids.push(applied.project_id);
                }
                Err(err) => {
                    warn!(external_id = %record.external_id, error = %err, "project write failed");
                    report.projects.failed += 1;
                    report.store_failures.push(issue(record, format!("{:#}", anyhow::Error::new(err))));
                    project_ids.push(None);
                }
            }
        }

        project_ids
    }

    async fn merge_assignments(
        &self,
        records: &[NormalizedRecord],
        project_ids: &[Option<i32>],
        resolver: &IdentityResolver,
        report: &mut RunReport,
    ) {
        let merger = AssignmentMerger::new(self.store.as_ref());

        for (record, project_id) in records.iter().zip(project_ids) {
            if record.developer_names.is_empty() {
                continue;
            }
            let Some(project_id) = *project_id else {
                report.assignments.skipped_no_project += 1;
                report
                    .unmatched_assignments
                    .push(issue(record, "no persisted project for this item".to_string()));
                continue;
            };

            let mut merged = HashSet::new();
            for name in &record.developer_names {
                let developer_id = match resolver.resolve(name, EntityKind::Developer) {
                    Ok(id) => id,
                    Err(unresolved) => {
                        warn!(external_id = %record.external_id, error = %unresolved, "developer skipped");
                        report.assignments.skipped_unresolved_developer += 1;
                        report.record_unresolved(
                            &unresolved,
                            resolver.suggest(name, EntityKind::Developer),
                        );
                        continue;
                    }
                };
                if !merged.insert(developer_id) {
                    continue;
                }

                match merger
                    .merge(project_id, developer_id, record.timeline.as_ref())
                    .await
                {
                    Ok(outcome) => report.assignments.record(outcome),
                    Err(err) => {
                        warn!(project_id, developer_id, error = %err, "assignment write failed");
                        report.assignments.failed += 1;
                        report.store_failures.push(issue(
                            record,
                            format!("developer {name}: {:#}", anyhow::Error::new(err)),
                        ));
                    }
                }
            }
        }
    }
}

fn issue(record: &NormalizedRecord, detail: String) -> RecordIssue {
    RecordIssue {
        external_id: record.external_id.clone(),
        name: record.name.clone(),
        detail,
    }
}

/// Where a run reads its board pages from.
#[derive(Debug, Clone)]
pub enum BoardInput {
    Live,
    Fixture(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub report: RunReport,
    pub reports_dir: Option<PathBuf>,
}

fn board_source(
    config: &SyncConfig,
    board: &BoardConfig,
    input: &BoardInput,
) -> Result<Box<dyn BoardSource>> {
    match input {
        BoardInput::Fixture(path) => Ok(Box::new(FixtureBoardSource::load(path)?)),
        BoardInput::Live => {
            let token = config.require_api_token()?;
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })?;
            Ok(Box::new(MondayBoardSource::new(
                http,
                config.api_url.clone(),
                token,
                board.board_id.clone(),
            )))
        }
    }
}

pub async fn run_sync_once(
    config: &SyncConfig,
    input: BoardInput,
    options: SyncOptions,
) -> Result<SyncOutcome> {
    let board = BoardConfig::from_workspace_root(&config.workspace_root)?;
    let aliases = AliasTable::from_workspace_root(&config.workspace_root)?;
    let source = board_source(config, &board, &input)?;
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to the project store")?;

    let pipeline =
        SyncPipeline::new(board, aliases, source, Arc::new(store)).with_options(options);
    let report = pipeline.run_once().await?;

    let reports_dir = if config.write_reports {
        Some(report.write_to(&config.reports_root()).await?)
    } else {
        None
    };
    Ok(SyncOutcome {
        report,
        reports_dir,
    })
}

pub async fn run_sync_once_from_env() -> Result<SyncOutcome> {
    let config = SyncConfig::from_env();
    run_sync_once(&config, BoardInput::Live, SyncOptions::default()).await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCheck {
    pub board_id: String,
    pub partitions: usize,
    pub developers: usize,
    pub teams: usize,
    pub team_name_mappings: usize,
    pub aliases: usize,
}

/// Loads configuration and reference data without writing anything.
pub async fn check_store(config: &SyncConfig) -> Result<StoreCheck> {
    let board = BoardConfig::from_workspace_root(&config.workspace_root)?;
    let aliases = AliasTable::from_workspace_root(&config.workspace_root)?;
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to the project store")?;
    let reference = ReferenceData::load(&store)
        .await
        .context("loading developers, teams and team_name_map")?;

    Ok(StoreCheck {
        board_id: board.board_id,
        partitions: board.partitions.len(),
        developers: reference.developers.len(),
        teams: reference.teams.len(),
        team_name_mappings: reference.team_name_map.len(),
        aliases: aliases.len(),
    })
}

pub fn report_recent_markdown(runs: usize, workspace_root: Option<&Path>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| Path::new("."));
    recent_reports_markdown(runs, &root.join("reports"))
}
