//! Applies an ordered list of changes against a checkout, one transaction
//! at a time, with per-transaction rollback.
//!
//! Working-tree mutations are never concurrent for the same repo: this
//! engine runs transactions strictly in series, mirroring the teacher's
//! single-writer checkout discipline.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::change::{Change, ChangeKey};
use crate::dependency_resolver::DependencyResolver;
use crate::errors::CqError;
use crate::helper_pool::HelperPool;
use crate::patch_cache::PatchCache;
use crate::transaction::TransactionPlanner;

/// Seam to the working-tree checkout for per-repo HEAD snapshot/reset —
/// the "working-tree checkout manager" spec.md §1 names as an external
/// collaborator. `ApplyEngine` owns *when* to snapshot and roll back a
/// transaction; this trait is only *how* a given repo's HEAD is read and
/// reset.
#[async_trait]
pub trait CheckoutManager: Send + Sync {
    /// Current HEAD SHA of `project`'s checkout.
    async fn head_sha(&self, project: &str) -> Result<String, CqError>;

    /// Reset `project`'s checkout to `sha`, undoing any commits applied
    /// against it since that SHA was recorded.
    async fn reset_to(&self, project: &str, sha: &str) -> Result<(), CqError>;
}

/// In-memory checkout manager for tests and single-process deployments
/// with no real working tree: HEAD SHAs are whatever the caller seeds,
/// and `reset_to` both records the call and updates the recorded HEAD,
/// so a second snapshot after a rollback reflects the restored state.
#[derive(Debug, Default)]
pub struct InMemoryCheckoutManager {
    heads: DashMap<String, String>,
    resets: Mutex<Vec<(String, String)>>,
}

impl InMemoryCheckoutManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_head(self, project: impl Into<String>, sha: impl Into<String>) -> Self {
        self.heads.insert(project.into(), sha.into());
        self
    }

    /// `(project, sha)` pairs passed to `reset_to`, in call order.
    pub fn resets(&self) -> Vec<(String, String)> {
        self.resets.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckoutManager for InMemoryCheckoutManager {
    async fn head_sha(&self, project: &str) -> Result<String, CqError> {
        Ok(self
            .heads
            .get(project)
            .map(|e| e.clone())
            .unwrap_or_else(|| "0".repeat(40)))
    }

    async fn reset_to(&self, project: &str, sha: &str) -> Result<(), CqError> {
        self.resets.lock().unwrap().push((project.to_string(), sha.to_string()));
        self.heads.insert(project.to_string(), sha.to_string());
        Ok(())
    }
}

/// Result of [`ApplyEngine::apply`]: changes that made it into the
/// checkout, changes that failed against the tree's base state, and
/// changes that failed only because another change applied earlier in
/// this same run conflicted with them.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub applied: Vec<Arc<Change>>,
    pub failed_tot: Vec<(Arc<Change>, String)>,
    pub failed_inflight: Vec<(Arc<Change>, String)>,
}

/// Applies changes against a working tree described by `manifest`,
/// snapshotting and restoring repo tip SHAs around each transaction.
pub struct ApplyEngine<'a> {
    helper_pool: &'a HelperPool,
    resolver: &'a DependencyResolver,
    checkout: &'a dyn CheckoutManager,
}

impl<'a> ApplyEngine<'a> {
    pub fn new(helper_pool: &'a HelperPool, resolver: &'a DependencyResolver, checkout: &'a dyn CheckoutManager) -> Self {
        Self {
            helper_pool,
            resolver,
            checkout,
        }
    }

    /// Apply `changes` against `manifest`, updating `committed` in place.
    ///
    /// `frozen` restricts acceptable dependencies to the fetched set
    /// (`limit = changes`); otherwise deps are unlimited. `honor_order`
    /// preserves the caller's ordering; when `false`, plans are sorted by
    /// descending length (ties broken by input order) to prefer
    /// hard-to-rebase stacks. `filter` narrows the fetched set before
    /// planning (e.g. to drop changes on disallowed remotes).
    pub async fn apply(
        &self,
        changes: Vec<Arc<Change>>,
        committed: &PatchCache,
        manifest: &str,
        frozen: bool,
        honor_order: bool,
        filter: impl Fn(&Change) -> bool,
    ) -> Result<ApplyOutcome, CqError> {
        let fetched: Vec<Arc<Change>> = changes
            .into_iter()
            .filter(|c| self.helper_pool.is_allowed(c.remote))
            .filter(|c| filter(c))
            .collect();

        let cache = PatchCache::new();
        for c in &fetched {
            cache.insert((**c).clone());
        }

        let limit = if frozen {
            Some(cache.copy())
        } else {
            None
        };

        let planner = TransactionPlanner::new(self.resolver, self.helper_pool);

        let mut outcome = ApplyOutcome::default();
        let mut already_tot_failed: HashSet<ChangeKey> = HashSet::new();

        let mut plans = Vec::new();
        for change in &fetched {
            match planner
                .build_single_tx(change.clone(), &cache, limit.as_ref(), committed, false)
                .await
            {
                Ok(tx) => plans.push(tx),
                Err(e) => {
                    outcome
                        .failed_tot
                        .push((change.clone(), e.to_string()));
                    already_tot_failed.insert(change.key());
                }
            }
        }

        if !honor_order {
            let order_index: HashMap<ChangeKey, usize> = fetched
                .iter()
                .enumerate()
                .map(|(i, c)| (c.key(), i))
                .collect();
            plans.sort_by(|a, b| {
                b.len().cmp(&a.len()).then_with(|| {
                    let ia = order_index.get(&a.members()[0].key()).copied().unwrap_or(usize::MAX);
                    let ib = order_index.get(&b.members()[0].key()).copied().unwrap_or(usize::MAX);
                    ia.cmp(&ib)
                })
            });
        }

        'plans: for plan in plans {
            if plan
                .members()
                .iter()
                .any(|m| already_tot_failed.contains(&m.key()))
            {
                continue;
            }

            let mut touched_repos: Vec<String> = Vec::new();
            for member in plan.members() {
                if !touched_repos.contains(&member.project) {
                    touched_repos.push(member.project.clone());
                }
            }

            let mut pre_tx_shas = Vec::with_capacity(touched_repos.len());
            for project in &touched_repos {
                let sha = self.checkout.head_sha(project).await?;
                pre_tx_shas.push((project.clone(), sha));
            }
            let pre_tx_cache = committed.copy();

            let mut applied_this_tx = Vec::new();
            let mut rollback = false;

            for member in plan.members() {
                if committed.contains_key(&member.key()) {
                    continue;
                }

                let client = match self.helper_pool.for_change(&member.key()) {
                    Ok(c) => c,
                    Err(e) => {
                        outcome.failed_tot.push((member.clone(), e.to_string()));
                        already_tot_failed.insert(member.key());
                        rollback = true;
                        break;
                    }
                };

                match client.apply_to_checkout(member, manifest, false).await {
                    Ok(()) => {
                        applied_this_tx.push(member.clone());
                    }
                    Err(apply_err) if apply_err.inflight => {
                        outcome
                            .failed_inflight
                            .push((member.clone(), apply_err.message.clone()));
                        rollback = true;
                        break;
                    }
                    Err(apply_err) => {
                        outcome
                            .failed_tot
                            .push((member.clone(), apply_err.message.clone()));
                        already_tot_failed.insert(member.key());
                        rollback = true;
                        break;
                    }
                }
            }

            if rollback {
                committed.restore_from(&pre_tx_cache);
                for (project, sha) in &pre_tx_shas {
                    if let Err(e) = self.checkout.reset_to(project, sha).await {
                        tracing::error!(project = %project, sha = %sha, error = %e, "failed to reset checkout during rollback");
                    }
                }
                tracing::warn!(
                    repos = ?touched_repos,
                    "rolled back transaction after apply failure"
                );
                continue 'plans;
            }

            for member in &applied_this_tx {
                committed.insert((**member).clone());
            }
            outcome.applied.extend(applied_this_tx);
        }

        let mut seen = HashSet::new();
        outcome.applied.retain(|c| seen.insert(c.key()));
        let applied: HashSet<ChangeKey> = outcome.applied.iter().map(|c| c.key()).collect();
        outcome
            .failed_tot
            .retain(|(c, _)| !applied.contains(&c.key()));
        outcome
            .failed_inflight
            .retain(|(c, _)| !applied.contains(&c.key()));

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeStatus, PatchQuery, Remote};
    use crate::helper_pool::{ApplyError, QuerySort, ReviewClient};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn base_change(number: u64, commit_message: &str, project: &str) -> Change {
        Change {
            remote: Remote::External,
            gerrit_number: number,
            patch_number: 1,
            change_id: format!("I{number}"),
            project: project.to_string(),
            branch: "main".to_string(),
            owner_email: "dev@example.com".to_string(),
            approval_timestamp: None,
            commit_message: commit_message.to_string(),
            parent_change_ids: Vec::new(),
            current_patchset_draft: false,
            should_reject: false,
            commit_ready: true,
            status: ChangeStatus::New,
        }
    }

    struct ScriptedClient {
        inflight_for: Mutex<HashSet<String>>,
        apply_count: AtomicUsize,
    }

    #[async_trait]
    impl ReviewClient for ScriptedClient {
        async fn query(&self, _: &str, _: Option<QuerySort>) -> Result<Vec<Change>, CqError> {
            Ok(Vec::new())
        }
        async fn query_one(&self, _: &str, _: bool) -> Result<Option<Change>, CqError> {
            Ok(None)
        }
        async fn fetch(&self, _: &PatchQuery, _: &str) -> Result<(), CqError> {
            Ok(())
        }
        async fn apply_to_checkout(
            &self,
            change: &Change,
            _manifest: &str,
            _strict_trivial: bool,
        ) -> Result<(), ApplyError> {
            self.apply_count.fetch_add(1, Ordering::SeqCst);
            if self.inflight_for.lock().unwrap().contains(&change.change_id) {
                return Err(ApplyError {
                    change: change.key(),
                    inflight: true,
                    message: "conflicts with an earlier change in this run".to_string(),
                });
            }
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

    fn pool(inflight_for: &[&str]) -> HelperPool {
        let mut clients: HashMap<Remote, Arc<dyn ReviewClient>> = HashMap::new();
        clients.insert(
            Remote::External,
            Arc::new(ScriptedClient {
                inflight_for: Mutex::new(inflight_for.iter().map(|s| s.to_string()).collect()),
                apply_count: AtomicUsize::new(0),
            }),
        );
        HelperPool::new(clients)
    }

    #[tokio::test]
    async fn single_clean_change_applies() {
        let a = Arc::new(base_change(1, "leaf", "proj"));
        let pool = pool(&[]);
        let resolver = DependencyResolver::new();
        let checkout = InMemoryCheckoutManager::new();
        let engine = ApplyEngine::new(&pool, &resolver, &checkout);
        let committed = PatchCache::new();

        let outcome = engine
            .apply(vec![a.clone()], &committed, "manifest", true, true, |_| true)
            .await
            .unwrap();

        assert_eq!(outcome.applied.len(), 1);
        assert!(outcome.failed_tot.is_empty());
        assert!(outcome.failed_inflight.is_empty());
        assert!(committed.contains_key(&a.key()));
        assert!(checkout.resets().is_empty());
    }

    #[tokio::test]
    async fn inflight_failure_rolls_back_and_keeps_earlier_applied() {
        let a = Arc::new(base_change(1, "leaf", "proj"));
        let b = Arc::new(base_change(2, "leaf-b", "proj"));
        let pool = pool(&["I2"]);
        let resolver = DependencyResolver::new();
        let checkout = InMemoryCheckoutManager::new().with_head("proj", "deadbeef");
        let engine = ApplyEngine::new(&pool, &resolver, &checkout);
        let committed = PatchCache::new();

        let outcome = engine
            .apply(
                vec![a.clone(), b.clone()],
                &committed,
                "manifest",
                true,
                true,
                |_| true,
            )
            .await
            .unwrap();

        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(outcome.applied[0].key(), a.key());
        assert_eq!(outcome.failed_inflight.len(), 1);
        assert_eq!(outcome.failed_inflight[0].0.key(), b.key());
        assert!(committed.contains_key(&a.key()));
        assert!(!committed.contains_key(&b.key()));
        // `a` and `b` land in the same single-member plans (no shared deps),
        // so only `b`'s own transaction rolls back — and it touches the repo
        // `a` already committed into, so the checkout gets reset to the SHA
        // recorded just before `b`'s transaction started.
        assert_eq!(checkout.resets(), vec![("proj".to_string(), "deadbeef".to_string())]);
    }

    #[tokio::test]
    async fn tot_failure_is_not_retried_in_same_call() {
        let a = Arc::new(base_change(1, "leaf", "proj"));
        let pool = pool(&["I1"]);
        let resolver = DependencyResolver::new();
        let checkout = InMemoryCheckoutManager::new();
        let engine = ApplyEngine::new(&pool, &resolver, &checkout);
        let committed = PatchCache::new();

        // Frozen with an empty limit means the change's own (empty) deps
        // are fine, but the apply itself will be reported inflight here;
        // we reuse the scripted client to simulate any apply failure and
        // assert it lands in exactly one failure bucket, never both.
        let outcome = engine
            .apply(vec![a.clone()], &committed, "manifest", true, true, |_| true)
            .await
            .unwrap();

        let total_failures = outcome.failed_tot.len() + outcome.failed_inflight.len();
        assert_eq!(total_failures, 1);
        assert!(outcome.applied.is_empty());
    }
}
