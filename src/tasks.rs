// src/tasks.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Kinds of singleton background jobs. One slot exists per kind: starting a
/// task while its slot is occupied fails with `TaskInProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ImportKeys,
    DeleteKeys,
    ValidateGroup,
}

impl TaskKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ImportKeys => "import_keys",
            Self::DeleteKeys => "delete_keys",
            Self::ValidateGroup => "validate_group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "import_keys" => Some(Self::ImportKeys),
            "delete_keys" => Some(Self::DeleteKeys),
            "validate_group" => Some(Self::ValidateGroup),
            _ => None,
        }
    }
}

/// Observable state of one task slot.
#[derive(Debug, Clone, Serialize)]
pub struct TaskState {
    pub id: Uuid,
    pub kind: TaskKind,
    pub group_id: i64,
    pub total: usize,
    pub processed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Arbitrary summary set by the worker on completion.
    pub result: Option<serde_json::Value>,
}

impl TaskState {
    pub fn is_running(&self) -> bool {
        self.finished_at.is_none()
    }
}

/// Single-slot registry for long-running admin jobs. The finished summary of
/// the previous task stays readable until the next one of the same kind
/// starts, and is persisted to the database when one is attached.
#[derive(Clone, Default)]
pub struct TaskManager {
    slots: Arc<Mutex<HashMap<TaskKind, TaskState>>>,
    db: Option<crate::db::Database>,
}

/// Progress handle owned by the running worker.
#[derive(Clone)]
pub struct TaskHandle {
    id: Uuid,
    kind: TaskKind,
    slots: Arc<Mutex<HashMap<TaskKind, TaskState>>>,
    db: Option<crate::db::Database>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_db(db: crate::db::Database) -> Self {
        Self {
            slots: Arc::default(),
            db: Some(db),
        }
    }

    /// Claims the slot for `kind`. Fails with `TaskInProgress` when a task of
    /// that kind is still running.
    pub fn start(&self, kind: TaskKind, group_id: i64, total: usize) -> Result<TaskHandle> {
        let mut slots = self.slots.lock().expect("task slots lock poisoned");
        if let Some(existing) = slots.get(&kind) {
            if existing.is_running() {
                return Err(AppError::TaskInProgress);
            }
        }

        let state = TaskState {
            id: Uuid::new_v4(),
            kind,
            group_id,
            total,
            processed: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            result: None,
        };
        let handle = TaskHandle {
            id: state.id,
            kind,
            slots: self.slots.clone(),
            db: self.db.clone(),
        };
        slots.insert(kind, state);
        Ok(handle)
    }

    pub fn status(&self, kind: TaskKind) -> Option<TaskState> {
        self.slots
            .lock()
            .expect("task slots lock poisoned")
            .get(&kind)
            .cloned()
    }
}

impl TaskHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Updates the processed counter; stale handles (superseded slot) no-op.
    pub fn progress(&self, processed: usize) {
        let mut slots = self.slots.lock().expect("task slots lock poisoned");
        if let Some(state) = slots.get_mut(&self.kind) {
            if state.id == self.id {
                state.processed = processed;
            }
        }
    }

    pub fn set_total(&self, total: usize) {
        let mut slots = self.slots.lock().expect("task slots lock poisoned");
        if let Some(state) = slots.get_mut(&self.kind) {
            if state.id == self.id {
                state.total = total;
            }
        }
    }

    /// Records the final summary and frees the slot.
    pub fn finish(&self, result: serde_json::Value) {
        self.complete(Some(result), None);
    }

    pub fn fail(&self, error: String) {
        self.complete(None, Some(error));
    }

    fn complete(&self, result: Option<serde_json::Value>, error: Option<String>) {
        let summary = {
            let mut slots = self.slots.lock().expect("task slots lock poisoned");
            match slots.get_mut(&self.kind) {
                Some(state) if state.id == self.id => {
                    state.finished_at = Some(Utc::now());
                    state.result = result;
                    state.error = error;
                    Some(state.clone())
                }
                _ => None,
            }
        };

        if let (Some(db), Some(summary)) = (self.db.clone(), summary) {
            tokio::spawn(async move {
                if let Err(e) = db.insert_task_summary(&summary).await {
                    tracing::warn!(task_id = %summary.id, error = %e, "failed to persist task summary");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_exclusive_while_running() {
        let manager = TaskManager::new();
        let handle = manager.start(TaskKind::ImportKeys, 1, 10).unwrap();

        assert!(matches!(
            manager.start(TaskKind::ImportKeys, 1, 5),
            Err(AppError::TaskInProgress)
        ));
        // A different kind is an independent slot.
        assert!(manager.start(TaskKind::DeleteKeys, 1, 5).is_ok());

        handle.finish(serde_json::json!({"added": 10}));
        assert!(manager.start(TaskKind::ImportKeys, 2, 3).is_ok());
    }

    #[test]
    fn progress_and_summary_are_observable() {
        let manager = TaskManager::new();
        let handle = manager.start(TaskKind::ValidateGroup, 7, 100).unwrap();

        handle.progress(40);
        let state = manager.status(TaskKind::ValidateGroup).unwrap();
        assert_eq!(state.processed, 40);
        assert_eq!(state.group_id, 7);
        assert!(state.is_running());

        handle.finish(serde_json::json!({"valid": 90, "invalid": 10}));
        let state = manager.status(TaskKind::ValidateGroup).unwrap();
        assert!(!state.is_running());
        assert_eq!(state.result.unwrap()["valid"], 90);
    }

    #[test]
    fn stale_handle_cannot_touch_new_slot() {
        let manager = TaskManager::new();
        let old = manager.start(TaskKind::ImportKeys, 1, 10).unwrap();
        old.finish(serde_json::json!({}));

        let _new = manager.start(TaskKind::ImportKeys, 2, 20).unwrap();
        old.progress(99);
        old.fail("stale".into());

        let state = manager.status(TaskKind::ImportKeys).unwrap();
        assert_eq!(state.processed, 0);
        assert!(state.is_running());
        assert_eq!(state.group_id, 2);
    }

    #[test]
    fn kind_parses_from_wire_names() {
        assert_eq!(TaskKind::parse("import_keys"), Some(TaskKind::ImportKeys));
        assert_eq!(TaskKind::parse("validate_group"), Some(TaskKind::ValidateGroup));
        assert_eq!(TaskKind::parse("bogus"), None);
    }
}
