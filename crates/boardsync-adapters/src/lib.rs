//! Board source contracts, the GraphQL board client, and fixture-first sources.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use boardsync_core::{ExternalItem, Partition, RawColumn};
use boardsync_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

mod extract;
mod paginate;

pub use extract::{ColumnIds, ColumnParseError, ColumnParser, ColumnRule, Extraction, FieldExtractor};
pub use paginate::{PaginationError, Paginator, PartitionFetch};

pub const CRATE_NAME: &str = "boardsync-adapters";

pub const DEFAULT_API_URL: &str = "https://api.monday.com/v2";

/// One page of a partition walk. `cursor == None` means the partition is exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemsPage {
    pub cursor: Option<String>,
    pub items: Vec<ExternalItem>,
}

#[async_trait]
pub trait BoardSource: Send + Sync {
    fn board_id(&self) -> &str;

    async fn fetch_page(
        &self,
        partition: &Partition,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<ItemsPage, FetchError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireItemsPage {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub items: Vec<WireItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub column_values: Vec<WireColumnValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireColumnValue {
    pub id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

impl WireItem {
    pub fn into_external(self, group_label: &str) -> ExternalItem {
        let raw_columns = self
            .column_values
            .into_iter()
            .map(|col| {
                (
                    col.id,
                    RawColumn {
                        text: col.text,
                        value: col.value,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();
        ExternalItem {
            external_id: self.id,
            display_name: self.name,
            group_label: group_label.to_string(),
            raw_columns,
        }
    }
}

impl WireItemsPage {
    pub fn into_page(self, group_label: &str) -> ItemsPage {
        ItemsPage {
            cursor: self.cursor.filter(|c| !c.trim().is_empty()),
            items: self
                .items
                .into_iter()
                .map(|item| item.into_external(group_label))
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: Option<BoardsData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct BoardsData {
    #[serde(default)]
    boards: Vec<WireBoard>,
}

#[derive(Debug, Deserialize)]
struct WireBoard {
    #[serde(default)]
    groups: Vec<WireGroup>,
}

#[derive(Debug, Deserialize)]
struct WireGroup {
    id: String,
    title: String,
    items_page: Option<WireItemsPage>,
}

const ITEMS_PAGE_QUERY: &str = r#"
query ($boardId: ID!, $groupId: String!, $limit: Int!, $cursor: String) {
  boards(ids: [$boardId]) {
    groups(ids: [$groupId]) {
      id
      title
      items_page(limit: $limit, cursor: $cursor) {
        cursor
        items {
          id
          name
          column_values {
            id
            text
            value
          }
        }
      }
    }
  }
}
"#;

/// Decodes a GraphQL items-page response for one partition.
pub fn parse_items_page_response(body: &[u8], partition: &Partition) -> Result<ItemsPage, FetchError> {
    let response: GraphqlResponse = serde_json::from_slice(body)?;
    if !response.errors.is_empty() {
        let messages = response
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(FetchError::Api(messages));
    }

    let board = response
        .data
        .and_then(|data| data.boards.into_iter().next())
        .ok_or_else(|| FetchError::Api("response carried no board".to_string()))?;

    let group = board
        .groups
        .into_iter()
        .find(|g| g.id == partition.id || g.title == partition.label)
        .ok_or_else(|| FetchError::Api(format!("group {} not found on board", partition.id)))?;

    Ok(group
        .items_page
        .map(|page| page.into_page(&partition.label))
        .unwrap_or_default())
}

/// Live board client speaking the GraphQL items-page query.
#[derive(Debug)]
pub struct MondayBoardSource {
    http: HttpFetcher,
    api_url: String,
    api_token: String,
    board_id: String,
}

impl MondayBoardSource {
    pub fn new(
        http: HttpFetcher,
        api_url: impl Into<String>,
        api_token: impl Into<String>,
        board_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_url: api_url.into(),
            api_token: api_token.into(),
            board_id: board_id.into(),
        }
    }
}

#[async_trait]
impl BoardSource for MondayBoardSource {
    fn board_id(&self) -> &str {
        &self.board_id
    }

    async fn fetch_page(
        &self,
        partition: &Partition,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<ItemsPage, FetchError> {
        let body = json!({
            "query": ITEMS_PAGE_QUERY,
            "variables": {
                "boardId": self.board_id,
                "groupId": partition.id,
                "limit": limit,
                "cursor": cursor,
            }
        });
        let response = self
            .http
            .post_json(&self.api_url, Some(&self.api_token), &body)
            .await?;
        debug!(
            partition = %partition.id,
            bytes = response.body.len(),
            "received items page"
        );
        parse_items_page_response(&response.body, partition)
    }
}

/// Recorded board pages, replayed in order. Page `n` answers the cursor returned by page `n - 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBoard {
    pub board_id: String,
    pub partitions: Vec<FixturePartition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePartition {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub pages: Vec<WireItemsPage>,
}

#[derive(Debug, Clone)]
pub struct FixtureBoardSource {
    board: FixtureBoard,
}

impl FixtureBoardSource {
    pub fn new(board: FixtureBoard) -> Self {
        Self { board }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let board: FixtureBoard =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(board))
    }

    pub fn partitions(&self) -> Vec<Partition> {
        self.board
            .partitions
            .iter()
            .map(|p| Partition::new(p.id.clone(), p.label.clone()))
            .collect()
    }
}

#[async_trait]
impl BoardSource for FixtureBoardSource {
    fn board_id(&self) -> &str {
        &self.board.board_id
    }

    async fn fetch_page(
        &self,
        partition: &Partition,
        cursor: Option<&str>,
        _limit: u32,
    ) -> Result<ItemsPage, FetchError> {
        let recorded = self
            .board
            .partitions
            .iter()
            .find(|p| p.id == partition.id)
            .ok_or_else(|| FetchError::Api(format!("group {} not found on board", partition.id)))?;

        let index = match cursor {
            None => 0,
            Some(cursor) => {
                recorded
                    .pages
                    .iter()
                    .position(|page| page.cursor.as_deref() == Some(cursor))
                    .ok_or_else(|| FetchError::Api(format!("unknown cursor {cursor}")))?
                    + 1
            }
        };

        Ok(recorded
            .pages
            .get(index)
            .cloned()
            .map(|page| page.into_page(&partition.label))
            .unwrap_or_default())
    }
}
