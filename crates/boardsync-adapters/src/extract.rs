use boardsync_core::{ExternalItem, NormalizedRecord, RawColumn, Timeline, AUX_PRJ_NUMBER};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest project number kept from the link column.
const PRJ_NUMBER_MAX_CHARS: usize = 10;

/// Board column ids the extractor reads. Board revisions disagree on the team column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnIds {
    pub team: String,
    pub people: String,
    pub timeline: String,
    pub project_link: String,
}

impl Default for ColumnIds {
    fn default() -> Self {
        Self {
            team: "status_150".to_string(),
            people: "people".to_string(),
            timeline: "timeline_1__1".to_string(),
            project_link: "link_to_item__1".to_string(),
        }
    }
}

/// Parses one column into the record. On `Err` the parser must leave the record untouched.
pub type ColumnParser = fn(&RawColumn, &mut NormalizedRecord) -> Result<(), String>;

#[derive(Debug, Clone)]
pub struct ColumnRule {
    pub column_id: String,
    pub field: &'static str,
    pub parser: ColumnParser,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("column {column_id} ({field}) of item {external_id}: {reason}")]
pub struct ColumnParseError {
    pub external_id: String,
    pub column_id: String,
    pub field: &'static str,
    pub reason: String,
}

/// A normalized record plus the columns that degraded to unset while producing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub record: NormalizedRecord,
    pub degraded: Vec<ColumnParseError>,
}

#[derive(Debug, Clone)]
pub struct FieldExtractor {
    rules: Vec<ColumnRule>,
}

impl FieldExtractor {
    pub fn new(columns: &ColumnIds) -> Self {
        Self {
            rules: vec![
                ColumnRule {
                    column_id: columns.team.clone(),
                    field: "team_label",
                    parser: parse_team,
                },
                ColumnRule {
                    column_id: columns.people.clone(),
                    field: "developer_names",
                    parser: parse_people,
                },
                ColumnRule {
                    column_id: columns.timeline.clone(),
                    field: "timeline",
                    parser: parse_timeline,
                },
                ColumnRule {
                    column_id: columns.project_link.clone(),
                    field: AUX_PRJ_NUMBER,
                    parser: parse_project_link,
                },
            ],
        }
    }

    pub fn rules(&self) -> &[ColumnRule] {
        &self.rules
    }

    pub fn extract(&self, item: &ExternalItem) -> Extraction {
        let mut record = NormalizedRecord::new(
            item.external_id.trim(),
            item.display_name.trim(),
            item.group_label.as_str(),
        );
        let mut degraded = Vec::new();

        for rule in &self.rules {
            let Some(column) = item.column(&rule.column_id) else {
                continue;
            };
            if let Err(reason) = (rule.parser)(column, &mut record) {
                degraded.push(ColumnParseError {
                    external_id: item.external_id.clone(),
                    column_id: rule.column_id.clone(),
                    field: rule.field,
                    reason,
                });
            }
        }

        Extraction { record, degraded }
    }
}

/// Multi-team values collapse to the first listed team.
fn parse_team(column: &RawColumn, record: &mut NormalizedRecord) -> Result<(), String> {
    record.team_label = column
        .text()
        .and_then(|text| text.split(',').next())
        .map(str::trim)
        .filter(|team| !team.is_empty())
        .map(str::to_string);
    Ok(())
}

fn parse_people(column: &RawColumn, record: &mut NormalizedRecord) -> Result<(), String> {
    record.developer_names = column
        .text()
        .map(|text| {
            text.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TimelineValue {
    from: Option<String>,
    to: Option<String>,
}

fn parse_timeline(column: &RawColumn, record: &mut NormalizedRecord) -> Result<(), String> {
    let Some(raw) = column.value() else {
        return Ok(());
    };
    let value: Option<TimelineValue> =
        serde_json::from_str(raw).map_err(|err| format!("malformed timeline value: {err}"))?;
    let Some(value) = value else {
        return Ok(());
    };

    let (Some(from), Some(to)) = (value.from, value.to) else {
        return Err("timeline value is missing `from` or `to`".to_string());
    };
    let start_date = parse_iso_date(&from)?;
    let end_date = parse_iso_date(&to)?;
    record.timeline = Some(Timeline {
        start_date,
        end_date,
    });
    Ok(())
}

fn parse_iso_date(input: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|err| format!("invalid date {input:?}: {err}"))
}

fn parse_project_link(column: &RawColumn, record: &mut NormalizedRecord) -> Result<(), String> {
    if let Some(text) = column.text() {
        let prj_number = text.chars().take(PRJ_NUMBER_MAX_CHARS).collect::<String>();
        record.aux.insert(AUX_PRJ_NUMBER.to_string(), prj_number);
    }
    Ok(())
}
