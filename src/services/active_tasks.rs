//! Active-task extraction for resume prompts.
//!
//! Activity state is opaque, but several activities store unfinished work (crops growing,
//! quiz rounds in progress) as objects carrying a progress percentage. The extractor walks
//! the state blob and turns every such object that is neither finished nor flagged completed
//! into an [`ActiveTaskRecord`].

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{Map, Value};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use utoipa::ToSchema;

use crate::dto::progress::Snapshot;

const PROGRESS_KEYS: [&str; 2] = ["progressPercent", "progress"];
const ID_KEYS: [&str; 2] = ["taskId", "id"];
const TYPE_KEYS: [&str; 2] = ["taskType", "type"];
const STARTED_KEYS: [&str; 2] = ["startedAt", "plantedAt"];
const ESTIMATE_KEYS: [&str; 2] = ["estimatedCompletionAt", "readyAt"];
const COMPLETED_KEYS: [&str; 2] = ["isCompleted", "completed"];

/// Epoch values above this are read as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Unfinished sub-activity found in a snapshot. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTaskRecord {
    /// Task identifier, or its path in the state when it has none.
    pub task_id: String,
    /// Task kind, used for de-duplication.
    pub task_type: String,
    /// Completion in percent, 0 to 100.
    pub progress_percent: u8,
    /// When the task started.
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub started_at: OffsetDateTime,
    /// Expected completion, when the task reports one.
    #[serde(with = "time::serde::rfc3339::option")]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub estimated_completion_at: Option<OffsetDateTime>,
    /// Always `false` for extracted records.
    pub is_completed: bool,
}

/// Every in-progress task found in `snapshot.state`, in document order.
pub fn extract(snapshot: &Snapshot) -> Vec<ActiveTaskRecord> {
    let mut found = Vec::new();
    walk(
        &snapshot.state,
        &snapshot.activity_type,
        "",
        snapshot.saved_at,
        &mut found,
    );
    found
}

/// Keep at most one record per task type: the most progressed one, the earliest started on
/// ties. Types keep the order of their first appearance.
pub fn dedupe_by_type(records: Vec<ActiveTaskRecord>) -> Vec<ActiveTaskRecord> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<ActiveTaskRecord> = Vec::new();

    for record in records {
        match slots.get(&record.task_type) {
            Some(&index) => {
                let current = &kept[index];
                let better = record.progress_percent > current.progress_percent
                    || (record.progress_percent == current.progress_percent
                        && record.started_at < current.started_at);
                if better {
                    kept[index] = record;
                }
            }
            None => {
                slots.insert(record.task_type.clone(), kept.len());
                kept.push(record);
            }
        }
    }

    kept
}

fn walk(
    value: &Value,
    parent_key: &str,
    path: &str,
    fallback_start: OffsetDateTime,
    found: &mut Vec<ActiveTaskRecord>,
) {
    match value {
        Value::Object(fields) => {
            if let Some(record) = as_task(fields, parent_key, path, fallback_start) {
                if record.progress_percent < 100 && !record.is_completed {
                    found.push(record);
                }
                return;
            }
            for (key, child) in fields {
                walk(child, key, &join(path, key), fallback_start, found);
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                walk(item, parent_key, &join(path, &index.to_string()), fallback_start, found);
            }
        }
        _ => {}
    }
}

fn as_task(
    fields: &Map<String, Value>,
    parent_key: &str,
    path: &str,
    fallback_start: OffsetDateTime,
) -> Option<ActiveTaskRecord> {
    let progress = first(fields, &PROGRESS_KEYS)?.as_f64()?;
    let progress_percent = progress.clamp(0.0, 100.0).round() as u8;

    let task_id = first(fields, &ID_KEYS)
        .and_then(scalar_to_string)
        .unwrap_or_else(|| path.to_owned());
    let task_type = first(fields, &TYPE_KEYS)
        .and_then(Value::as_str)
        .unwrap_or(parent_key)
        .to_owned();
    let started_at = first(fields, &STARTED_KEYS)
        .and_then(parse_timestamp)
        .unwrap_or(fallback_start);
    let estimated_completion_at = first(fields, &ESTIMATE_KEYS).and_then(parse_timestamp);
    let is_completed = first(fields, &COMPLETED_KEYS)
        .and_then(Value::as_bool)
        .unwrap_or(false);

    Some(ActiveTaskRecord {
        task_id,
        task_type,
        progress_percent,
        started_at,
        estimated_completion_at,
        is_completed,
    })
}

fn first<'a>(fields: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| fields.get(*key))
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// RFC 3339 string, or Unix epoch in seconds or milliseconds.
fn parse_timestamp(value: &Value) -> Option<OffsetDateTime> {
    match value {
        Value::String(text) => OffsetDateTime::parse(text, &Rfc3339).ok(),
        Value::Number(number) => {
            let raw = number.as_i64()?;
            if raw.abs() >= EPOCH_MILLIS_THRESHOLD {
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(raw) * 1_000_000).ok()
            } else {
                OffsetDateTime::from_unix_timestamp(raw).ok()
            }
        }
        _ => None,
    }
}

fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_owned()
    } else {
        format!("{path}/{segment}")
    }
}
