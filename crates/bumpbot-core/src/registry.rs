use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Lightweight view of a live run, shared through the registry.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub id: u64,
    pub title: String,
    pub start_time: DateTime<Utc>,
}

/// Process-wide set of currently executing runs. Injected, not global, so
/// tests get clean isolation. Entries are added when a run starts and
/// removed when it terminates, successfully or not.
#[derive(Default)]
pub struct RunRegistry {
    live: Mutex<HashMap<u64, RunSnapshot>>,
}

impl RunRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, RunSnapshot>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, snapshot: RunSnapshot) {
        self.lock().insert(snapshot.id, snapshot);
    }

    pub fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of live runs, most recently started first.
    pub fn live(&self) -> Vec<RunSnapshot> {
        let mut runs: Vec<RunSnapshot> = self.lock().values().cloned().collect();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        runs
    }
}
