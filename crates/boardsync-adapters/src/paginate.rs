use std::collections::HashSet;

use boardsync_core::{ExternalItem, Partition};
use boardsync_storage::FetchError;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

use crate::BoardSource;

/// Pagination of one partition stopped early. `last_cursor` resumes the walk at the
/// page that failed; `None` means the first page failed and the walk must restart.
#[derive(Debug, Error)]
#[error(
    "fetching partition {partition} failed (resume cursor: {}): {source}",
    .last_cursor.as_deref().unwrap_or("<start>")
)]
pub struct PaginationError {
    pub partition: Partition,
    pub last_cursor: Option<String>,
    #[source]
    pub source: FetchError,
}

/// Everything one partition walk produced, including items fetched before a failure.
#[derive(Debug)]
pub struct PartitionFetch {
    pub partition: Partition,
    pub items: Vec<ExternalItem>,
    pub pages: usize,
    pub error: Option<PaginationError>,
}

/// Cursor walk over one partition.
///
/// A page without a cursor ends the walk. An empty page that still carries a cursor does
/// not: the board can return empty pages mid-walk, so the cursor is always followed.
pub struct Paginator<'a> {
    source: &'a dyn BoardSource,
    partition: Partition,
    limit: u32,
    next_cursor: Option<String>,
    seen: HashSet<String>,
    pages: usize,
    finished: bool,
}

impl<'a> Paginator<'a> {
    pub fn new(source: &'a dyn BoardSource, partition: Partition, limit: u32) -> Self {
        Self {
            source,
            partition,
            limit: limit.max(1),
            next_cursor: None,
            seen: HashSet::new(),
            pages: 0,
            finished: false,
        }
    }

    /// Starts the walk at a cursor recorded by an earlier failed walk.
    pub fn resume_from(mut self, cursor: impl Into<String>) -> Self {
        self.next_cursor = Some(cursor.into());
        self
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn last_cursor(&self) -> Option<&str> {
        self.next_cursor.as_deref()
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    /// Fetches the next page. `Ok(None)` once the partition is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<ExternalItem>>, PaginationError> {
        if self.finished {
            return Ok(None);
        }

        let requested = self.next_cursor.clone();
        let page = match self
            .source
            .fetch_page(&self.partition, requested.as_deref(), self.limit)
            .await
        {
            Ok(page) => page,
            Err(source) => return Err(self.fail(source)),
        };
        self.pages += 1;

        match page.cursor {
            Some(cursor) if requested.as_deref() == Some(cursor.as_str()) => {
                return Err(self.fail(FetchError::CursorLoop { cursor }));
            }
            Some(cursor) => self.next_cursor = Some(cursor),
            None => self.finished = true,
        }

        let fetched = page.items.len();
        let items = page
            .items
            .into_iter()
            .filter(|item| self.seen.insert(item.external_id.clone()))
            .collect::<Vec<_>>();
        if items.len() < fetched {
            debug!(
                partition = %self.partition.id,
                dropped = fetched - items.len(),
                "dropped items already yielded by this walk"
            );
        }
        Ok(Some(items))
    }

    /// Walks the partition to the end, keeping whatever was fetched before a failure.
    pub async fn collect_all(mut self) -> PartitionFetch {
        let span = info_span!("paginate", partition = %self.partition.id);
        let mut items = Vec::new();
        let error = async {
            loop {
                match self.next_page().await {
                    Ok(Some(page)) => items.extend(page),
                    Ok(None) => return None,
                    Err(err) => {
                        warn!(error = %err, "partition pagination aborted");
                        return Some(err);
                    }
                }
            }
        }
        .instrument(span)
        .await;

        PartitionFetch {
            partition: self.partition,
            items,
            pages: self.pages,
            error,
        }
    }

    fn fail(&mut self, source: FetchError) -> PaginationError {
        self.finished = true;
        PaginationError {
            partition: self.partition.clone(),
            last_cursor: self.next_cursor.clone(),
            source,
        }
    }
}
