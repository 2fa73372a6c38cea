use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;
use tracing::warn;

/// Another active task already claiming files this one wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeOverlap {
    pub task_id: String,
    pub files: Vec<String>,
}

/// Bidirectional view of in-flight scope claims: task -> files and
/// file -> tasks. Overlap is logged and surfaced to the planner, never fatal.
#[derive(Default)]
pub struct ScopeTracker {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_task: HashMap<String, HashSet<String>>,
    by_file: HashMap<String, HashSet<String>>,
}

impl ScopeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate the files with the task, returning any overlaps with other
    /// active claims. Overlapping files stay multiply-claimed.
    pub fn register(&self, task_id: &str, files: &[String]) -> Vec<ScopeOverlap> {
        let overlaps = self.overlaps_for(task_id, files);
        for overlap in &overlaps {
            warn!(
                task_id = %task_id,
                other = %overlap.task_id,
                files = ?overlap.files,
                "Scope overlap with active task"
            );
        }

        let mut inner = self.inner.write();
        let claim = inner.by_task.entry(task_id.to_string()).or_default();
        let mut added: Vec<String> = Vec::new();
        for file in files {
            if claim.insert(file.clone()) {
                added.push(file.clone());
            }
        }
        for file in added {
            inner
                .by_file
                .entry(file)
                .or_default()
                .insert(task_id.to_string());
        }

        overlaps
    }

    /// Overlapping claims without registering; used for pre-dispatch warnings.
    pub fn overlaps_for(&self, task_id: &str, files: &[String]) -> Vec<ScopeOverlap> {
        let inner = self.inner.read();
        let mut by_other: HashMap<&str, Vec<String>> = HashMap::new();

        for file in files {
            if let Some(owners) = inner.by_file.get(file) {
                for owner in owners {
                    if owner != task_id {
                        by_other.entry(owner).or_default().push(file.clone());
                    }
                }
            }
        }

        let mut overlaps: Vec<ScopeOverlap> = by_other
            .into_iter()
            .map(|(task_id, files)| ScopeOverlap {
                task_id: task_id.to_string(),
                files,
            })
            .collect();
        overlaps.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        overlaps
    }

    /// Drop every claim held by the task.
    pub fn release(&self, task_id: &str) {
        let mut inner = self.inner.write();
        if let Some(files) = inner.by_task.remove(task_id) {
            for file in files {
                if let Some(owners) = inner.by_file.get_mut(&file) {
                    owners.remove(task_id);
                    if owners.is_empty() {
                        inner.by_file.remove(&file);
                    }
                }
            }
        }
    }

    /// Sorted snapshot of currently locked files; fed into planner prompts
    /// to steer future tasks away from active work.
    pub fn locked_files(&self) -> Vec<String> {
        let inner = self.inner.read();
        let set: BTreeSet<&String> = inner.by_file.keys().collect();
        set.into_iter().cloned().collect()
    }

    pub fn files_for(&self, task_id: &str) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .by_task
            .get(task_id)
            .map(|files| {
                let mut v: Vec<String> = files.iter().cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }

    pub fn active_claim_count(&self) -> usize {
        self.inner.read().by_task.len()
    }
}
