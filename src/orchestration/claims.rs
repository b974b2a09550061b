//! Exclusive file claims.
//!
//! A task claims the paths it is about to write before generation starts.
//! Claims are all-or-nothing and first claimer wins. A directory claim
//! covers everything beneath it. Claims are released when the returned
//! [`ClaimGuard`] drops, on every exit path.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default time to wait for a contended claim.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval while waiting on a contended claim.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(25);

type ClaimMap = HashMap<PathBuf, TaskId>;

/// Registry of claimed paths, shared by all workers.
#[derive(Debug, Clone, Default)]
pub struct FileClaims {
    inner: Arc<Mutex<ClaimMap>>,
}

impl FileClaims {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClaimMap> {
        // Holders never panic while holding the lock, so a poisoned map is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim every path in `paths` for `task`, or none of them.
    ///
    /// # Errors
    /// [`Error::ClaimConflict`] naming the first conflicting path and its holder.
    pub fn try_claim(&self, task: &TaskId, paths: &[PathBuf]) -> Result<ClaimGuard> {
        let wanted: Vec<PathBuf> = paths.iter().map(|p| normalize(p)).collect();
        let mut map = self.lock();

        for path in &wanted {
            if let Some((held, holder)) = map.iter().find(|(held, _)| overlaps(path, held)) {
                return Err(Error::ClaimConflict {
                    path: display(held),
                    holder: holder.clone(),
                });
            }
        }

        for path in &wanted {
            map.insert(path.clone(), task.clone());
        }
        tracing::debug!(task_id = %task, paths = wanted.len(), "claimed");

        Ok(ClaimGuard {
            claims: self.inner.clone(),
            task: task.clone(),
            paths: wanted,
        })
    }

    /// Like [`try_claim`](Self::try_claim), retrying until `timeout` elapses.
    pub async fn claim_with_wait(
        &self,
        task: &TaskId,
        paths: &[PathBuf],
        timeout: Duration,
    ) -> Result<ClaimGuard> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.try_claim(task, paths) {
                Ok(guard) => return Ok(guard),
                Err(e) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        tracing::warn!(task_id = %task, error = %e, "claim wait timed out");
                        return Err(e);
                    }
                    tokio::time::sleep(CLAIM_POLL_INTERVAL.min(deadline - now)).await;
                }
            }
        }
    }

    /// Current holder of exactly `path`.
    pub fn holder(&self, path: &Path) -> Option<TaskId> {
        self.lock().get(&normalize(path)).cloned()
    }

    pub fn is_claimed(&self, path: &Path) -> bool {
        let path = normalize(path);
        self.lock().keys().any(|held| overlaps(&path, held))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every claim. Outstanding guards become no-ops.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Releases its claims when dropped.
#[derive(Debug)]
#[must_use = "claims are released as soon as the guard is dropped"]
pub struct ClaimGuard {
    claims: Arc<Mutex<ClaimMap>>,
    task: TaskId,
    paths: Vec<PathBuf>,
}

impl ClaimGuard {
    pub fn task(&self) -> &TaskId {
        &self.task
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut map = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        for path in &self.paths {
            if map.get(path) == Some(&self.task) {
                map.remove(path);
            }
        }
        tracing::debug!(task_id = %self.task, "released claims");
    }
}

/// Strip `.` components so `./src/a.ts` and `src/a.ts` are the same claim.
/// The project root normalizes to the empty path.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

fn display(path: &Path) -> String {
    if path.as_os_str().is_empty() {
        ".".to_string()
    } else {
        path.display().to_string()
    }
}
