//! Domain payload types shared by the change sources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Why a file needs re-scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeReason {
	Create,
	Modify,
	Delete,
	Rename,
	/// Frontmatter/metadata changed without a content write.
	Frontmatter,
}

/// Counters attached to a batch update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
	pub total: usize,
	pub changed: usize,
}

/// A task record converted from an external calendar event.
///
/// Parsing and field semantics live outside this crate; the dataflow core
/// only moves these records around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
	pub id: String,
	pub content: String,
	#[serde(default)]
	pub due: Option<DateTime<Utc>>,
	/// Calendar source this task came from, when known.
	#[serde(default)]
	pub source_id: Option<String>,
}

/// A raw item fetched from the external calendar feed, before conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
	pub uid: String,
	pub summary: String,
	#[serde(default)]
	pub start: Option<DateTime<Utc>>,
	#[serde(default)]
	pub end: Option<DateTime<Utc>>,
	pub source_id: String,
}

/// Per-source counters for a calendar snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStats {
	pub total: usize,
	pub sources: HashMap<String, usize>,
}

impl SnapshotStats {
	/// Count tasks per calendar source; tasks without one fall under
	/// `"unknown"`.
	pub fn from_tasks(tasks: &[Task]) -> Self {
		let mut sources: HashMap<String, usize> = HashMap::new();
		for task in tasks {
			let source_id = task.source_id.as_deref().unwrap_or("unknown");
			*sources.entry(source_id.to_string()).or_insert(0) += 1;
		}
		Self {
			total: tasks.len(),
			sources,
		}
	}
}

/// Full replacement snapshot of external calendar state.
///
/// Consumers must replace their derived state with every snapshot, never
/// merge. A snapshot carrying an `error` means "treat the cache as empty
/// until the next successful load", and `destroyed` means the source went
/// away and derived state should be cleared for good.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalendarSnapshot {
	pub events: Vec<Task>,
	pub stats: SnapshotStats,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub destroyed: bool,
}

impl CalendarSnapshot {
	/// Snapshot replacing all previous state with `events`.
	pub fn replace(events: Vec<Task>) -> Self {
		Self {
			stats: SnapshotStats::from_tasks(&events),
			events,
			error: None,
			destroyed: false,
		}
	}

	/// Empty snapshot carrying a load error.
	pub fn error(message: impl Into<String>) -> Self {
		Self {
			error: Some(message.into()),
			..Self::default()
		}
	}

	/// Final empty snapshot emitted when the source is destroyed.
	pub fn destroyed() -> Self {
		Self {
			destroyed: true,
			..Self::default()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn task(id: &str, source: Option<&str>) -> Task {
		Task {
			id: id.to_string(),
			content: format!("task {id}"),
			due: None,
			source_id: source.map(str::to_string),
		}
	}

	#[test]
	fn snapshot_stats_count_per_source() {
		let tasks = vec![
			task("1", Some("work")),
			task("2", Some("work")),
			task("3", Some("home")),
			task("4", None),
		];
		let stats = SnapshotStats::from_tasks(&tasks);

		assert_eq!(stats.total, 4);
		assert_eq!(stats.sources.get("work"), Some(&2));
		assert_eq!(stats.sources.get("home"), Some(&1));
		assert_eq!(stats.sources.get("unknown"), Some(&1));
	}

	#[test]
	fn error_snapshot_is_empty() {
		let snapshot = CalendarSnapshot::error("feed unavailable");
		assert!(snapshot.events.is_empty());
		assert_eq!(snapshot.stats.total, 0);
		assert_eq!(snapshot.error.as_deref(), Some("feed unavailable"));
		assert!(!snapshot.destroyed);
	}

	#[test]
	fn snapshot_wire_shape_omits_defaults() {
		let json = serde_json::to_value(CalendarSnapshot::replace(vec![])).unwrap();
		assert!(json.get("error").is_none());
		assert!(json.get("destroyed").is_none());

		let json = serde_json::to_value(CalendarSnapshot::destroyed()).unwrap();
		assert_eq!(json["destroyed"], serde_json::json!(true));
	}

	#[test]
	fn change_reason_names_are_snake_case() {
		assert_eq!(ChangeReason::Frontmatter.as_ref(), "frontmatter");
		assert_eq!(
			serde_json::to_value(ChangeReason::Create).unwrap(),
			serde_json::json!("create")
		);
	}
}
