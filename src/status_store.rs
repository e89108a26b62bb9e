//! Per-(bot, remote, change, patchset) status marker and counter store.
//!
//! The wire format is opaque (spec: `{root}/{bot}/{remote}/{gerrit_number}
//! [/{patch_number}]`, counters at `{...}/{status}`); [`StatusBackend`] is
//! the async seam a concrete HTTP/object-store client implements, the same
//! way [`crate::helper_pool::ReviewClient`] seams off the review server.
//! `StatusStore` itself only owns the per-process counter cache and the
//! concurrency guarantees layered on top.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::change::Remote;
use crate::errors::CqError;

/// Which verifier wrote a status: the full Commit Queue or the
/// pre-submit staging verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bot {
    Pre,
    Cq,
}

/// Identity of a status record: a change, optionally pinned to one
/// patchset. `patch_number: None` addresses the latest-patchset-only
/// marker and the aggregate (all-patchset) counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusKey {
    pub bot: Bot,
    pub remote: Remote,
    pub gerrit_number: u64,
    pub patch_number: Option<u32>,
}

impl StatusKey {
    pub fn new(bot: Bot, remote: Remote, gerrit_number: u64) -> Self {
        Self {
            bot,
            remote,
            gerrit_number,
            patch_number: None,
        }
    }

    pub fn with_patch_number(mut self, patch_number: u32) -> Self {
        self.patch_number = Some(patch_number);
        self
    }

    fn latest(&self) -> Self {
        Self {
            patch_number: None,
            ..self.clone()
        }
    }
}

/// Verification status of a change as tracked across a CQ run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Launching,
    Waiting,
    Inflight,
    Passed,
    Failed,
    ReadyToSubmit,
}

/// The async seam to the backing object store. A concrete implementation
/// speaks whatever wire protocol the deployment uses; tests supply an
/// in-memory double.
#[async_trait]
pub trait StatusBackend: Send + Sync {
    async fn write_status(&self, key: &StatusKey, status: Status) -> Result<(), CqError>;

    /// `Ok(None)` when the backend has no record for `key` ("no such
    /// key" is not an error).
    async fn read_status(&self, key: &StatusKey) -> Result<Option<Status>, CqError>;

    async fn increment_counter(&self, key: &StatusKey, status: Status) -> Result<(), CqError>;

    async fn read_counter(&self, key: &StatusKey, status: Status) -> Result<i64, CqError>;
}

/// Per-(bot, change, patchset) status counter and last-status lookup,
/// layered over a [`StatusBackend`] with a per-process counter cache.
/// Safe for concurrent use by the Submitter and the notification
/// pipeline.
pub struct StatusStore {
    backend: Arc<dyn StatusBackend>,
    counters: DashMap<(StatusKey, Status), i64>,
}

impl StatusStore {
    pub fn new(backend: Arc<dyn StatusBackend>) -> Self {
        Self {
            backend,
            counters: DashMap::new(),
        }
    }

    /// Writes both the latest-patchset-only marker and, when `key`
    /// carries a patch number, the per-patchset marker too; increments
    /// the aggregate counter for `(key, status)`.
    pub async fn set_status(&self, key: &StatusKey, status: Status) -> Result<(), CqError> {
        let latest = key.latest();
        self.backend.write_status(&latest, status).await?;
        if key.patch_number.is_some() {
            self.backend.write_status(key, status).await?;
        }
        self.backend.increment_counter(&latest, status).await?;
        self.counters
            .entry((latest, status))
            .and_modify(|n| *n += 1)
            .or_insert(1);
        Ok(())
    }

    /// The latest-patchset marker for `key`, or `None` if never set.
    pub async fn get_status(&self, key: &StatusKey) -> Result<Option<Status>, CqError> {
        self.backend.read_status(&key.latest()).await
    }

    /// Cached per process: the first call for a given `(key, status)`
    /// pair hits the backend; subsequent calls (including those from
    /// [`StatusStore::set_status`] in this process) are served locally.
    /// `latest_only` selects whether `key`'s own patch number (if any)
    /// is honored or stripped before the lookup.
    pub async fn count(
        &self,
        key: &StatusKey,
        status: Status,
        latest_only: bool,
    ) -> Result<i64, CqError> {
        let lookup_key = if latest_only { key.latest() } else { key.clone() };
        if let Some(cached) = self.counters.get(&(lookup_key.clone(), status)) {
            return Ok(*cached);
        }
        let value = self.backend.read_counter(&lookup_key, status).await?;
        self.counters.insert((lookup_key, status), value);
        Ok(value)
    }

    /// Parallel fill of the counter cache for every `(key, status)` pair
    /// in the cross product of `keys` and `statuses`.
    pub async fn prefetch(&self, keys: &[StatusKey], statuses: &[Status]) -> Result<(), CqError> {
        use futures::future::join_all;

        let tasks = keys.iter().flat_map(|key| {
            statuses.iter().map(move |status| async move {
                let value = self.backend.read_counter(&key.latest(), *status).await?;
                Ok::<_, CqError>((key.latest(), *status, value))
            })
        });

        for result in join_all(tasks).await {
            let (key, status, value) = result?;
            self.counters.insert((key, status), value);
        }
        Ok(())
    }
}

/// In-memory [`StatusBackend`] used by tests and by single-process
/// deployments without a real wire store.
#[derive(Default)]
pub struct InMemoryStatusBackend {
    statuses: DashMap<StatusKey, Status>,
    counters: DashMap<(StatusKey, Status), i64>,
}

impl InMemoryStatusBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusBackend for InMemoryStatusBackend {
    async fn write_status(&self, key: &StatusKey, status: Status) -> Result<(), CqError> {
        self.statuses.insert(key.clone(), status);
        Ok(())
    }

    async fn read_status(&self, key: &StatusKey) -> Result<Option<Status>, CqError> {
        Ok(self.statuses.get(key).map(|v| *v))
    }

    async fn increment_counter(&self, key: &StatusKey, status: Status) -> Result<(), CqError> {
        self.counters
            .entry((key.clone(), status))
            .and_modify(|n| *n += 1)
            .or_insert(1);
        Ok(())
    }

    async fn read_counter(&self, key: &StatusKey, status: Status) -> Result<i64, CqError> {
        Ok(self
            .counters
            .get(&(key.clone(), status))
            .map(|v| *v)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> StatusKey {
        StatusKey::new(Bot::Cq, Remote::External, 100)
    }

    #[tokio::test]
    async fn set_then_get_returns_same_status_within_process() {
        let store = StatusStore::new(Arc::new(InMemoryStatusBackend::new()));
        store.set_status(&key(), Status::Passed).await.unwrap();
        assert_eq!(store.get_status(&key()).await.unwrap(), Some(Status::Passed));
        assert_eq!(store.count(&key(), Status::Passed, true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_key_returns_none_not_error() {
        let store = StatusStore::new(Arc::new(InMemoryStatusBackend::new()));
        assert_eq!(store.get_status(&key()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn per_patchset_marker_written_alongside_latest() {
        let backend = Arc::new(InMemoryStatusBackend::new());
        let store = StatusStore::new(backend.clone());
        let pinned = key().with_patch_number(3);

        store.set_status(&pinned, Status::Inflight).await.unwrap();
        assert_eq!(
            backend.read_status(&pinned).await.unwrap(),
            Some(Status::Inflight)
        );
        assert_eq!(
            backend.read_status(&key()).await.unwrap(),
            Some(Status::Inflight)
        );
    }

    #[tokio::test]
    async fn prefetch_fills_counter_cache() {
        let backend = Arc::new(InMemoryStatusBackend::new());
        backend.increment_counter(&key(), Status::Failed).await.unwrap();
        backend.increment_counter(&key(), Status::Failed).await.unwrap();

        let store = StatusStore::new(backend);
        store.prefetch(&[key()], &[Status::Failed, Status::Passed]).await.unwrap();

        assert_eq!(store.count(&key(), Status::Failed, true).await.unwrap(), 2);
        assert_eq!(store.count(&key(), Status::Passed, true).await.unwrap(), 0);
    }
}
