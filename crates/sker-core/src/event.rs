//! File change events and the batches the debouncer emits

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Kind of filesystem change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Change,
    Unlink,
}

impl ChangeType {
    /// Resolve two successive changes on the same file into one.
    ///
    /// `Unlink` then `Add` is a net add, `Add` then `Unlink` signals removal,
    /// anything else takes the newer kind.
    pub fn merge(self, newer: ChangeType) -> ChangeType {
        match (self, newer) {
            (ChangeType::Unlink, ChangeType::Add) => ChangeType::Add,
            (ChangeType::Add, ChangeType::Unlink) => ChangeType::Unlink,
            (_, newer) => newer,
        }
    }
}

/// Raw change notification for one file in one project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeEvent {
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub path: String,
    /// Milliseconds since the unix epoch
    pub timestamp: i64,
    pub project_id: String,
}

impl FileChangeEvent {
    /// Create an event stamped with the current time
    pub fn new(
        change_type: ChangeType,
        path: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            change_type,
            path: path.into(),
            timestamp: now_millis(),
            project_id: project_id.into(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Key under which pending changes are coalesced
    pub fn key(&self) -> (String, String) {
        (self.project_id.clone(), self.path.clone())
    }
}

/// One coalesced set of changes, created once per flush
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebouncedBatch {
    pub id: String,
    pub timestamp: i64,
    pub changes: Vec<FileChangeEvent>,
    pub total_changes: usize,
    pub unique_files: usize,
    pub project_ids: BTreeSet<String>,
}

impl DebouncedBatch {
    /// Build a batch from already-merged changes
    pub fn from_changes(changes: Vec<FileChangeEvent>) -> Self {
        let unique_files = changes
            .iter()
            .map(|c| c.path.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        let project_ids = changes.iter().map(|c| c.project_id.clone()).collect();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            total_changes: changes.len(),
            unique_files,
            project_ids,
            changes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Changes belonging to a single project
    pub fn changes_for<'a>(
        &'a self,
        project_id: &'a str,
    ) -> impl Iterator<Item = &'a FileChangeEvent> + 'a {
        self.changes.iter().filter(move |c| c.project_id == project_id)
    }
}

/// Current wall-clock time in milliseconds since the unix epoch
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_transitions() {
        assert_eq!(ChangeType::Unlink.merge(ChangeType::Add), ChangeType::Add);
        assert_eq!(ChangeType::Add.merge(ChangeType::Unlink), ChangeType::Unlink);
        assert_eq!(ChangeType::Add.merge(ChangeType::Change), ChangeType::Change);
        assert_eq!(ChangeType::Change.merge(ChangeType::Unlink), ChangeType::Unlink);
        assert_eq!(ChangeType::Unlink.merge(ChangeType::Change), ChangeType::Change);
    }

    #[test]
    fn test_batch_counts_distinct_paths_and_projects() {
        let batch = DebouncedBatch::from_changes(vec![
            FileChangeEvent::new(ChangeType::Add, "src/a.rs", "web"),
            FileChangeEvent::new(ChangeType::Change, "src/a.rs", "api"),
            FileChangeEvent::new(ChangeType::Unlink, "src/b.rs", "api"),
        ]);

        assert_eq!(batch.total_changes, 3);
        assert_eq!(batch.unique_files, 2);
        assert_eq!(batch.project_ids.len(), 2);
        assert_eq!(batch.changes_for("api").count(), 2);
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = FileChangeEvent::new(ChangeType::Unlink, "x.txt", "p").with_timestamp(42);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"unlink\""));
        assert!(json.contains("\"projectId\":\"p\""));
    }
}
