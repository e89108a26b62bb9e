//! Per-transaction submit, with per-change conflict / modified / not-ready
//! detection, run in parallel across disjoint groups.
//!
//! Grounded in `ValidationPool.SubmitChanges` / `_SubmitChangeWithDeps` /
//! `_SubmitChange` in the source: reload-and-filter, partition by project,
//! then a bounded worker pool drains each plan serially while plans run
//! concurrently. The shared error map is a `DashMap` rather than the
//! source's `multiprocessing.Manager().dict()` — same contract, native
//! concurrency primitive. Plans run via `for_each_concurrent` rather than
//! `tokio::spawn` so each task can borrow `HelperPool` directly instead of
//! needing `'static` ownership.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};

use crate::change::{Change, ChangeKey, ChangeStatus};
use crate::dependency_resolver::DependencyResolver;
use crate::errors::CqError;
use crate::helper_pool::HelperPool;
use crate::patch_cache::PatchCache;
use crate::transaction::{Transaction, TransactionPlanner};

/// How long to wait for a `submitted` status to settle to `merged` before
/// treating it as stuck (spec.md §4.9 step 5; `SUBMITTED_WAIT_TIMEOUT` in
/// the source, 3 minutes).
const DEFAULT_SUBMITTED_WAIT: Duration = Duration::from_secs(180);
const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(1);
/// Bounded worker count across disjoint submit plans (spec.md §4.9 step 5).
const DEFAULT_MAX_PARALLEL_PLANS: usize = 4;

/// Submits changes to the review server, one disjoint group at a time in
/// parallel, respecting per-change dependency order within each group.
pub struct Submitter<'a> {
    helper_pool: &'a HelperPool,
    resolver: &'a DependencyResolver,
    dry_run: bool,
    /// Open Question (spec.md §9): whether a `submitted` status stuck past
    /// the wait ceiling is treated as merged (`true`, matching the source's
    /// common-path fallback) or as a hard submit failure (`false`).
    pub eventual_merge_ok: bool,
    pub submitted_wait: Duration,
    pub poll_period: Duration,
    pub max_parallel_plans: usize,
}

impl<'a> Submitter<'a> {
    pub fn new(helper_pool: &'a HelperPool, resolver: &'a DependencyResolver, dry_run: bool) -> Self {
        Self {
            helper_pool,
            resolver,
            dry_run,
            eventual_merge_ok: true,
            submitted_wait: DEFAULT_SUBMITTED_WAIT,
            poll_period: DEFAULT_POLL_PERIOD,
            max_parallel_plans: DEFAULT_MAX_PARALLEL_PLANS,
        }
    }

    /// Submit `changes`, returning every failure keyed by the change it
    /// blocked. An empty map means every change submitted cleanly. Updates
    /// `committed` in place with every change that successfully submits, so
    /// later plan members (and later callers) never re-submit it.
    pub async fn submit_changes(
        &self,
        changes: Vec<Arc<Change>>,
        committed: &PatchCache,
    ) -> Result<HashMap<ChangeKey, CqError>, CqError> {
        let errors: DashMap<ChangeKey, CqError> = DashMap::new();

        let mut unmodified = Vec::new();
        for change in changes {
            let client = match self.helper_pool.for_change(&change.key()) {
                Ok(c) => c,
                Err(e) => {
                    errors.insert(change.key(), e);
                    continue;
                }
            };
            let query_text = format!("change:{}", change.change_id);
            let reloaded = match client.query_one(&query_text, true).await {
                Ok(Some(r)) => r,
                Ok(None) => (*change).clone(),
                Err(e) => {
                    errors.insert(change.key(), e);
                    continue;
                }
            };

            if reloaded.status == ChangeStatus::Merged {
                tracing::warn!(
                    change = %change.key(),
                    "already merged, most likely chumped during this run"
                );
                continue;
            }
            if reloaded.patch_number != change.patch_number {
                errors.insert(change.key(), CqError::PatchModified(change.key()));
                continue;
            }
            unmodified.push(Arc::new(reloaded));
        }

        let mut filtered = Vec::new();
        for change in unmodified {
            if change.is_ready() {
                filtered.push(change);
            } else {
                errors.insert(
                    change.key(),
                    CqError::PatchNotCommitReady {
                        change: change.key(),
                        dep: change.key(),
                    },
                );
            }
        }

        let planner = TransactionPlanner::new(self.resolver, self.helper_pool);
        let plan_set = planner.partition(&filtered, committed, true, None).await;
        for failure in plan_set.failures {
            if let Some(change) = failure.change() {
                errors.insert(change.clone(), failure);
            }
        }

        let errors = &errors;
        stream::iter(plan_set.transactions)
            .for_each_concurrent(self.max_parallel_plans.max(1), |plan| async move {
                self.submit_plan(&plan, committed, errors).await;
            })
            .await;

        Ok(errors.iter().map(|e| (e.key().clone(), e.value().clone())).collect())
    }

    /// Drain one disjoint plan's members in order, stopping at the first
    /// failure and reporting every later member as blocked by it.
    async fn submit_plan(&self, plan: &Transaction, committed: &PatchCache, errors: &DashMap<ChangeKey, CqError>) {
        let mut blocking_failure: Option<ChangeKey> = None;
        let mut submitted_this_plan: Vec<ChangeKey> = Vec::new();

        for member in plan.members() {
            if let Some(cause) = &blocking_failure {
                errors.insert(
                    member.key(),
                    CqError::DependencyError {
                        change: member.key(),
                        cause: cause.clone(),
                    },
                );
                continue;
            }

            match self.submit_one(member, committed).await {
                Ok(()) => {
                    submitted_this_plan.push(member.key());
                    committed.insert((**member).clone());
                }
                Err(e) => {
                    blocking_failure = Some(member.key());
                    errors.insert(member.key(), e);
                }
            }
        }

        // Cycle collapse: a cycle's two halves can each consider the other
        // "already committed", letting an earlier member submit before a
        // later member in the same plan is discovered to have failed.
        if let Some(cause) = &blocking_failure {
            for submitted_key in &submitted_this_plan {
                if errors.contains_key(submitted_key) {
                    continue;
                }
                tracing::error!(
                    change = %submitted_key,
                    cause = %cause,
                    "change was submitted without all of its dependencies"
                );
                errors.insert(
                    submitted_key.clone(),
                    CqError::PatchSubmittedWithoutDeps(submitted_key.clone()),
                );
            }
        }
    }

    async fn submit_one(&self, change: &Arc<Change>, _committed: &PatchCache) -> Result<(), CqError> {
        let client = self.helper_pool.for_change(&change.key())?;

        match client.submit(change, self.dry_run).await {
            Ok(()) => {}
            Err(CqError::PatchConflict(key)) => return Err(CqError::PatchConflict(key)),
            Err(e) => return Err(e),
        }

        if self.dry_run {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + self.submitted_wait;
        loop {
            let status = client.get_status(change).await?;
            match status {
                ChangeStatus::Merged => return Ok(()),
                ChangeStatus::Submitted => {
                    if tokio::time::Instant::now() >= deadline {
                        if self.eventual_merge_ok {
                            tracing::warn!(
                                change = %change.key(),
                                "timed out waiting for merge; status still submitted, treating as merged"
                            );
                            return Ok(());
                        }
                        return Err(CqError::PatchFailedToSubmit {
                            change: change.key(),
                            reason: "stuck in submitted state past the wait ceiling".to_string(),
                        });
                    }
                    tokio::time::sleep(self.poll_period).await;
                }
                other => {
                    return Err(CqError::PatchFailedToSubmit {
                        change: change.key(),
                        reason: format!("gerrit reports unexpected status {other:?} after submit"),
                    });
                }
            }
        }
    }
}
