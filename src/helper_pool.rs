//! Routes a change to the review-server client responsible for its
//! remote, and defines the [`ReviewClient`] capability every other
//! component depends on.
//!
//! Mirrors the teacher's `RepositoryAccess` / `AuthenticationService`
//! split in `protocol/core.rs`: an `async_trait` at the I/O seam, with
//! the orchestrator coded entirely against the trait so a test can
//! supply an in-memory double.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::change::{Change, ChangeKey, PatchQuery, Remote};
use crate::errors::CqError;

/// A single failure from [`ReviewClient::apply_to_checkout`].
///
/// The `inflight` flag is the crux of `ApplyEngine`'s tot/inflight
/// classification (spec.md §4.5): `true` means the conflict was
/// introduced by another change already applied earlier in this run;
/// `false` means the change conflicts with the tree's base state.
#[derive(Debug, Clone)]
pub struct ApplyError {
    pub change: ChangeKey,
    pub inflight: bool,
    pub message: String,
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "apply failed for {} ({}): {}",
            self.change,
            if self.inflight { "inflight" } else { "tot" },
            self.message
        )
    }
}

impl std::error::Error for ApplyError {}

/// Sort order for [`ReviewClient::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySort {
    LastUpdated,
    Priority,
}

/// The capability every remote's client must provide: query, fetch,
/// apply, submit, status, and comment-posting. One instance is
/// registered per [`Remote`] in a [`HelperPool`].
#[async_trait]
pub trait ReviewClient: Send + Sync {
    /// Run a query (the "ready" query or the stricter "priority-ready"
    /// query — the caller selects which text to pass).
    async fn query(&self, query_text: &str, sort: Option<QuerySort>) -> Result<Vec<Change>, CqError>;

    /// Run a query expected to match at most one change.
    async fn query_one(&self, query_text: &str, must_match: bool) -> Result<Option<Change>, CqError>;

    /// Re-fetch a change's full content into the local working tree.
    async fn fetch(&self, change: &PatchQuery, local_repo: &str) -> Result<(), CqError>;

    /// Apply a change against the working tree described by `manifest`.
    /// Fails with an [`ApplyError`] carrying the tot/inflight flag.
    async fn apply_to_checkout(
        &self,
        change: &Change,
        manifest: &str,
        strict_trivial: bool,
    ) -> Result<(), ApplyError>;

    /// Submit a change to the review server.
    async fn submit(&self, change: &Change, dry_run: bool) -> Result<(), CqError>;

    /// Current server-side status of a change.
    async fn get_status(&self, change: &Change) -> Result<crate::change::ChangeStatus, CqError>;

    /// Clear the commit-ready flag.
    async fn remove_commit_ready_flag(&self, change: &Change, dry_run: bool) -> Result<(), CqError>;

    /// Post a comment. The review server enforces a hard maximum of
    /// 32000 bytes per comment body.
    async fn post_comment(&self, host: &str, change_rev: &str, body: &str) -> Result<(), CqError>;
}

/// Maximum comment body size accepted by the review server (bytes).
pub const MAX_COMMENT_BYTES: usize = 32_000;

/// A fixed, immutable-after-construction mapping from [`Remote`] to its
/// [`ReviewClient`].
#[derive(Clone)]
pub struct HelperPool {
    clients: HashMap<Remote, Arc<dyn ReviewClient>>,
}

impl HelperPool {
    pub fn new(clients: HashMap<Remote, Arc<dyn ReviewClient>>) -> Self {
        Self { clients }
    }

    pub fn for_change(&self, key: &ChangeKey) -> Result<Arc<dyn ReviewClient>, CqError> {
        self.clients
            .get(&key.remote)
            .cloned()
            .ok_or_else(|| CqError::HelperUnavailable(key.clone()))
    }

    /// The client for `remote` directly, for callers iterating
    /// `remotes()` rather than resolving off a specific change.
    pub fn client_for(&self, remote: Remote) -> Result<Arc<dyn ReviewClient>, CqError> {
        self.clients
            .get(&remote)
            .cloned()
            .ok_or(CqError::HelperUnavailable(ChangeKey::new(remote, 0)))
    }

    /// All configured remotes, in the order `Acquire` should query them.
    pub fn remotes(&self) -> Vec<Remote> {
        let mut remotes: Vec<Remote> = self.clients.keys().copied().collect();
        remotes.sort();
        remotes
    }

    pub fn is_allowed(&self, remote: Remote) -> bool {
        self.clients.contains_key(&remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeStatus;

    struct StubClient;

    #[async_trait]
    impl ReviewClient for StubClient {
        async fn query(&self, _: &str, _: Option<QuerySort>) -> Result<Vec<Change>, CqError> {
            Ok(Vec::new())
        }
        async fn query_one(&self, _: &str, _: bool) -> Result<Option<Change>, CqError> {
            Ok(None)
        }
        async fn fetch(&self, _: &PatchQuery, _: &str) -> Result<(), CqError> {
            Ok(())
        }
        async fn apply_to_checkout(&self, _: &Change, _: &str, _: bool) -> Result<(), ApplyError> {
            Ok(())
        }
        async fn submit(&self, _: &Change, _: bool) -> Result<(), CqError> {
            Ok(())
        }
        async fn get_status(&self, _: &Change) -> Result<ChangeStatus, CqError> {
            Ok(ChangeStatus::New)
        }
        async fn remove_commit_ready_flag(&self, _: &Change, _: bool) -> Result<(), CqError> {
            Ok(())
        }
        async fn post_comment(&self, _: &str, _: &str, _: &str) -> Result<(), CqError> {
            Ok(())
        }
    }

    #[test]
    fn unconfigured_remote_is_helper_unavailable() {
        let pool = HelperPool::new(HashMap::new());
        let key = ChangeKey::new(Remote::External, 1);
        let err = pool.for_change(&key).unwrap_err();
        assert!(matches!(err, CqError::HelperUnavailable(_)));
    }

    #[test]
    fn configured_remote_resolves() {
        let mut clients: HashMap<Remote, Arc<dyn ReviewClient>> = HashMap::new();
        clients.insert(Remote::External, Arc::new(StubClient));
        let pool = HelperPool::new(clients);
        assert!(pool.is_allowed(Remote::External));
        assert!(!pool.is_allowed(Remote::Internal));
        assert_eq!(pool.remotes(), vec![Remote::External]);
    }
}
