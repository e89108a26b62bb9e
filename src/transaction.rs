//! [`Transaction`] and [`TransactionPlanner`]: turns a set of changes plus
//! their dependency graph into safe, ordered application/submission
//! groups.
//!
//! The planner never uses a lazy generator: the teacher's "generator-like
//! recursion becomes an explicit work-queue with a visited set" design
//! note applies directly — `build_single_tx` is a plain recursive
//! function over `HashSet`-backed visited sets, and the only thing that
//! matters is the final `Vec` it produces.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::change::{Change, ChangeKey};
use crate::dependency_resolver::DependencyResolver;
use crate::errors::CqError;
use crate::helper_pool::HelperPool;
use crate::patch_cache::PatchCache;

/// An ordered, non-empty sequence of changes to be applied or submitted
/// together. Invariants (spec.md §3): no duplicates; every
/// not-yet-committed cross-dependency of a member is also a member;
/// dependencies precede their dependents.
#[derive(Debug, Clone)]
pub struct Transaction {
    members: Vec<Arc<Change>>,
}

impl Transaction {
    fn new(members: Vec<Arc<Change>>) -> Self {
        debug_assert!(!members.is_empty(), "Transaction must be non-empty");
        Self { members }
    }

    pub fn members(&self) -> &[Arc<Change>] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, key: &ChangeKey) -> bool {
        self.members.iter().any(|c| &c.key() == key)
    }

    /// `true` iff no member appears more than once (invariant a).
    pub fn has_no_duplicates(&self) -> bool {
        let mut seen = HashSet::new();
        self.members.iter().all(|c| seen.insert(c.key()))
    }
}

/// A disjoint partition of an input change set into [`Transaction`]s
/// suitable for parallel submission; no member of one transaction
/// depends on any member of another.
#[derive(Debug, Clone, Default)]
pub struct PlanSet {
    pub transactions: Vec<Transaction>,
    pub failures: Vec<CqError>,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Builds single-change transactions and disjoint partitions over a
/// change set, respecting each change's gerrit and CQ-DEPEND
/// dependencies.
pub struct TransactionPlanner<'a> {
    resolver: &'a DependencyResolver,
    helper_pool: &'a HelperPool,
}

impl<'a> TransactionPlanner<'a> {
    pub fn new(resolver: &'a DependencyResolver, helper_pool: &'a HelperPool) -> Self {
        Self {
            resolver,
            helper_pool,
        }
    }

    /// Build the transaction needed for `change` to apply/submit cleanly:
    /// every git-parent dependency and every `CQ-DEPEND` dependency not
    /// already committed, in dependency-before-dependent order, ending
    /// with `change` itself.
    ///
    /// `limit` restricts which not-yet-committed deps are acceptable;
    /// `None` means unlimited. `submit_mode` selects which error variant
    /// is raised for a dep outside `limit`.
    pub async fn build_single_tx(
        &self,
        change: Arc<Change>,
        cache: &PatchCache,
        limit: Option<&PatchCache>,
        committed: &PatchCache,
        submit_mode: bool,
    ) -> Result<Transaction, CqError> {
        let mut plan = Vec::new();
        let mut in_progress = HashSet::new();
        let mut gerrit_visited = HashSet::new();
        let mut cq_visited = HashSet::new();
        self.add_with_deps(
            change,
            &mut plan,
            &mut in_progress,
            &mut gerrit_visited,
            &mut cq_visited,
            cache,
            limit,
            committed,
            submit_mode,
            true,
        )
        .await?;
        Ok(Transaction::new(plan))
    }

    /// Core recursion: gerrit deps are fully resolved (post-order) before
    /// `node` is appended; CQ deps (when `include_cq`) likewise. A node
    /// already `in_progress` on the call stack (a cycle) is skipped
    /// entirely — the frame that first started processing it owns the
    /// append, which is what gives a cycle's two `build_single_tx`
    /// results their complementary order (spec.md §8 scenario 3).
    fn add_with_deps<'f>(
        &'f self,
        node: Arc<Change>,
        plan: &'f mut Vec<Arc<Change>>,
        in_progress: &'f mut HashSet<ChangeKey>,
        gerrit_visited: &'f mut HashSet<ChangeKey>,
        cq_visited: &'f mut HashSet<ChangeKey>,
        cache: &'f PatchCache,
        limit: Option<&'f PatchCache>,
        committed: &'f PatchCache,
        submit_mode: bool,
        include_cq: bool,
    ) -> BoxFuture<'f, Result<(), CqError>> {
        Box::pin(async move {
            let key = node.key();
            if committed.contains_key(&key) {
                return Ok(());
            }
            if in_progress.contains(&key) {
                return Ok(());
            }
            in_progress.insert(key.clone());

            let (gerrit_deps, cq_deps) = self
                .resolver
                .deps_of(&node, cache, self.helper_pool)
                .await?;

            if !gerrit_visited.contains(&key) {
                gerrit_visited.insert(key.clone());
                let validated =
                    Self::lookup_uncommitted(&node, gerrit_deps, limit, committed, submit_mode)?;
                for dep in validated {
                    self.add_with_deps(
                        dep,
                        plan,
                        in_progress,
                        gerrit_visited,
                        cq_visited,
                        cache,
                        limit,
                        committed,
                        submit_mode,
                        false,
                    )
                    .await?;
                }
            }

            if include_cq && !cq_visited.contains(&key) {
                cq_visited.insert(key.clone());
                let validated =
                    Self::lookup_uncommitted(&node, cq_deps, limit, committed, submit_mode)?;
                for dep in validated {
                    self.add_with_deps(
                        dep,
                        plan,
                        in_progress,
                        gerrit_visited,
                        cq_visited,
                        cache,
                        limit,
                        committed,
                        submit_mode,
                        true,
                    )
                    .await?;
                }
            }

            if !plan.iter().any(|c| c.key() == key) {
                plan.push(node);
            }
            Ok(())
        })
    }

    /// Filters already-committed deps out (accepted, omitted per the
    /// spec) and rejects anything outside `limit` with the
    /// mode-appropriate error.
    fn lookup_uncommitted(
        change: &Change,
        deps: Vec<Arc<Change>>,
        limit: Option<&PatchCache>,
        committed: &PatchCache,
        submit_mode: bool,
    ) -> Result<Vec<Arc<Change>>, CqError> {
        let mut out = Vec::with_capacity(deps.len());
        for dep in deps {
            if committed.contains_key(&dep.key()) {
                continue;
            }
            if let Some(limit) = limit {
                if !limit.contains_key(&dep.key()) {
                    return Err(if submit_mode {
                        CqError::PatchRejected {
                            change: change.key(),
                            dep: dep.key(),
                        }
                    } else {
                        CqError::PatchNotCommitReady {
                            change: change.key(),
                            dep: dep.key(),
                        }
                    });
                }
            }
            out.push(dep);
        }
        Ok(out)
    }

    /// Partition `changes` into disjoint transactions suitable for
    /// parallel submit. Changes whose own transaction fails to build are
    /// recorded in `PlanSet::failures` and excluded from every group.
    pub async fn partition(
        &self,
        changes: &[Arc<Change>],
        committed: &PatchCache,
        merge_by_project: bool,
        max_len: Option<usize>,
    ) -> PlanSet {
        let limit = PatchCache::new();
        for c in changes {
            limit.insert((**c).clone());
        }

        let mut plans: Vec<(Arc<Change>, Transaction)> = Vec::new();
        let mut failures = Vec::new();
        for change in changes {
            match self
                .build_single_tx(change.clone(), &limit, Some(&limit), committed, true)
                .await
            {
                Ok(tx) => plans.push((change.clone(), tx)),
                Err(e) => failures.push(e),
            }
        }

        let mut dsu = Dsu::new();
        for (change, tx) in &plans {
            dsu.make(change.key());
            for member in tx.members() {
                dsu.make(member.key());
                dsu.union(&change.key(), &member.key());
            }
        }
        if merge_by_project {
            let mut by_project: std::collections::HashMap<String, ChangeKey> =
                std::collections::HashMap::new();
            for (change, _) in &plans {
                let representative = by_project
                    .entry(change.project.clone())
                    .or_insert_with(|| change.key());
                dsu.union(representative, &change.key());
            }
        }

        // Group members in original `changes` input order, first-seen-root wins.
        let mut group_order: Vec<ChangeKey> = Vec::new();
        let mut groups: std::collections::HashMap<ChangeKey, Vec<Arc<Change>>> =
            std::collections::HashMap::new();
        for change in changes {
            if !plans.iter().any(|(c, _)| c.key() == change.key()) {
                continue; // failed to plan, excluded
            }
            let root = dsu.find(&change.key());
            if !groups.contains_key(&root) {
                group_order.push(root.clone());
            }
            groups.entry(root).or_default().push(change.clone());
        }

        let plan_by_change: std::collections::HashMap<ChangeKey, &Transaction> = plans
            .iter()
            .map(|(c, tx)| (c.key(), tx))
            .collect();

        let mut transactions = Vec::new();
        for root in group_order {
            let group = &groups[&root];
            let mut ordered: Vec<Arc<Change>> = Vec::new();
            let mut seen = HashSet::new();
            let mut stopped = false;
            for member in group {
                let tx = plan_by_change[&member.key()];
                let new_changes: Vec<Arc<Change>> = tx
                    .members()
                    .iter()
                    .filter(|c| !seen.contains(&c.key()))
                    .cloned()
                    .collect();
                let new_len = ordered.len() + new_changes.len();
                if let Some(max) = max_len {
                    if new_len > max {
                        stopped = true;
                        break;
                    }
                }
                for c in new_changes {
                    seen.insert(c.key());
                    ordered.push(c);
                }
            }

            if ordered.is_empty() {
                let max = max_len.unwrap_or(0);
                for member in group {
                    failures.push(CqError::PlanTooLong {
                        change: member.key(),
                        max_len: max,
                    });
                }
            } else {
                if stopped {
                    tracing::debug!(
                        "group containing {} partially planned; remaining members deferred",
                        group[0].key()
                    );
                }
                transactions.push(Transaction::new(ordered));
            }
        }

        PlanSet {
            transactions,
            failures,
        }
    }
}

/// Minimal union-find used to group changes into connected components
/// for `partition`.
struct Dsu {
    parent: std::collections::HashMap<ChangeKey, ChangeKey>,
}

impl Dsu {
    fn new() -> Self {
        Self {
            parent: std::collections::HashMap::new(),
        }
    }

    fn make(&mut self, key: ChangeKey) {
        self.parent.entry(key.clone()).or_insert(key);
    }

    fn find(&mut self, key: &ChangeKey) -> ChangeKey {
        let parent = self.parent.get(key).cloned().unwrap_or_else(|| key.clone());
        if &parent == key {
            key.clone()
        } else {
            let root = self.find(&parent);
            self.parent.insert(key.clone(), root.clone());
            root
        }
    }

    fn union(&mut self, a: &ChangeKey, b: &ChangeKey) {
        self.make(a.clone());
        self.make(b.clone());
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeStatus, Remote};
    use std::collections::HashMap;

    fn base_change(remote: Remote, number: u64, commit_message: &str) -> Change {
        Change {
            remote,
            gerrit_number: number,
            patch_number: 1,
            change_id: format!("I{number}"),
            project: "proj".to_string(),
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

    fn helper_pool_with_lookup(cache: Arc<PatchCache>) -> HelperPool {
        use crate::helper_pool::{ApplyError, QuerySort, ReviewClient};
        use async_trait::async_trait;

        struct LookupClient(Arc<PatchCache>);

        #[async_trait]
        impl ReviewClient for LookupClient {
            async fn query(&self, _: &str, _: Option<QuerySort>) -> Result<Vec<Change>, CqError> {
                Ok(Vec::new())
            }
            async fn query_one(&self, query_text: &str, _: bool) -> Result<Option<Change>, CqError> {
                let id = query_text.trim_start_matches("change:");
                Ok(self
                    .0
                    .get(&ChangeKey::with_change_id(Remote::External, id))
                    .or_else(|| self.0.get(&ChangeKey::with_change_id(Remote::Internal, id)))
                    .map(|c| (*c).clone()))
            }
            async fn fetch(&self, _: &crate::change::PatchQuery, _: &str) -> Result<(), CqError> {
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

        let mut clients: HashMap<Remote, Arc<dyn ReviewClient>> = HashMap::new();
        clients.insert(Remote::External, Arc::new(LookupClient(cache.clone())));
        clients.insert(Remote::Internal, Arc::new(LookupClient(cache)));
        HelperPool::new(clients)
    }

    #[tokio::test]
    async fn linear_cq_depend_chain_orders_deps_before_dependent() {
        let a = base_change(Remote::External, 1, "leaf change");
        let b = base_change(Remote::External, 2, "CQ-DEPEND=1");
        let c = base_change(Remote::External, 3, "CQ-DEPEND=2");

        let cache = Arc::new(PatchCache::new());
        cache.insert(a.clone());
        cache.insert(b.clone());
        cache.insert(c.clone());

        let pool = helper_pool_with_lookup(cache.clone());
        let resolver = DependencyResolver::new();
        let planner = TransactionPlanner::new(&resolver, &pool);
        let committed = PatchCache::new();

        let tx = planner
            .build_single_tx(Arc::new(c.clone()), &cache, None, &committed, false)
            .await
            .expect("plan builds");

        let order: Vec<u64> = tx.members().iter().map(|c| c.gerrit_number).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(tx.has_no_duplicates());
    }

    #[tokio::test]
    async fn cycle_resolves_with_complementary_order() {
        let a = base_change(Remote::External, 1, "CQ-DEPEND=2");
        let b = base_change(Remote::External, 2, "CQ-DEPEND=1");

        let cache = Arc::new(PatchCache::new());
        cache.insert(a.clone());
        cache.insert(b.clone());

        let pool = helper_pool_with_lookup(cache.clone());
        let resolver = DependencyResolver::new();
        let planner = TransactionPlanner::new(&resolver, &pool);
        let committed = PatchCache::new();

        let tx_a = planner
            .build_single_tx(Arc::new(a.clone()), &cache, None, &committed, false)
            .await
            .unwrap();
        let order_a: Vec<u64> = tx_a.members().iter().map(|c| c.gerrit_number).collect();
        assert_eq!(order_a, vec![2, 1]);

        let tx_b = planner
            .build_single_tx(Arc::new(b.clone()), &cache, None, &committed, false)
            .await
            .unwrap();
        let order_b: Vec<u64> = tx_b.members().iter().map(|c| c.gerrit_number).collect();
        assert_eq!(order_b, vec![1, 2]);
    }

    #[tokio::test]
    async fn partition_with_tight_max_len_rejects_whole_cycle() {
        let a = base_change(Remote::External, 1, "CQ-DEPEND=2");
        let b = base_change(Remote::External, 2, "CQ-DEPEND=1");

        let cache = Arc::new(PatchCache::new());
        cache.insert(a.clone());
        cache.insert(b.clone());

        let pool = helper_pool_with_lookup(cache.clone());
        let resolver = DependencyResolver::new();
        let planner = TransactionPlanner::new(&resolver, &pool);
        let committed = PatchCache::new();

        let changes = vec![Arc::new(a), Arc::new(b)];
        let plan_set = planner
            .partition(&changes, &committed, false, Some(1))
            .await;

        assert!(plan_set.transactions.is_empty());
        assert_eq!(plan_set.failures.len(), 2);
        assert!(
            plan_set
                .failures
                .iter()
                .all(|e| matches!(e, CqError::PlanTooLong { .. }))
        );
    }

    #[tokio::test]
    async fn dep_already_committed_is_omitted_not_rejected() {
        let a = base_change(Remote::External, 1, "leaf");
        let b = base_change(Remote::External, 2, "CQ-DEPEND=1");

        let cache = Arc::new(PatchCache::new());
        cache.insert(a.clone());
        cache.insert(b.clone());
        let pool = helper_pool_with_lookup(cache.clone());

        let resolver = DependencyResolver::new();
        let planner = TransactionPlanner::new(&resolver, &pool);

        let committed = PatchCache::new();
        committed.insert(a.clone());

        let tx = planner
            .build_single_tx(Arc::new(b.clone()), &cache, None, &committed, false)
            .await
            .unwrap();

        let order: Vec<u64> = tx.members().iter().map(|c| c.gerrit_number).collect();
        assert_eq!(order, vec![2], "already-committed dep is omitted from the plan");
    }

    #[tokio::test]
    async fn dep_not_in_limit_is_rejected_in_submit_mode() {
        let a = base_change(Remote::External, 1, "leaf");
        let b = base_change(Remote::External, 2, "CQ-DEPEND=1");

        let cache = Arc::new(PatchCache::new());
        cache.insert(a.clone());
        cache.insert(b.clone());
        let pool = helper_pool_with_lookup(cache.clone());

        let resolver = DependencyResolver::new();
        let planner = TransactionPlanner::new(&resolver, &pool);

        let limit = PatchCache::new();
        limit.insert(b.clone()); // a is missing from limit
        let committed = PatchCache::new();

        let err = planner
            .build_single_tx(Arc::new(b.clone()), &cache, Some(&limit), &committed, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CqError::PatchRejected { .. }));

        let err = planner
            .build_single_tx(Arc::new(b), &cache, Some(&limit), &committed, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CqError::PatchNotCommitReady { .. }));
    }
}
