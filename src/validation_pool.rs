//! Top-level orchestrator: acquires ready changes from the review server,
//! drives the apply/submit pipeline, and handles the terminal outcomes of
//! a verification run.
//!
//! Grounded in `ValidationPool` in the source: `Acquire` (tree-gating poll
//! loop, per-remote queries, draft/should-reject filtering, manifest
//! split), `ApplyPool`, `SubmitPool`, `HandleValidationFailure`,
//! `HandleValidationTimeout`, `HandlePreCQSuccess`, and
//! `_FilterDependencyErrors`. The master/slave and cq/pre-cq toggles
//! collapse into two enums (`Role`, carried on `PoolState`) rather than
//! the source's classmethod-factory pattern.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::action_recorder::{ActionRecorder, ClAction, NullActionRecorder};
use crate::apply_engine::{ApplyEngine, ApplyOutcome, CheckoutManager};
use crate::change::{Change, ChangeKey};
use crate::config::ProjectConfig;
use crate::dependency_resolver::DependencyResolver;
use crate::errors::CqError;
use crate::helper_pool::HelperPool;
use crate::manifest::Manifest;
use crate::notifier::{Notifier, Queue};
use crate::patch_cache::PatchCache;
use crate::status_store::{Bot, Status, StatusKey, StatusStore};
use crate::suspect_analyzer::{FailureMessage, NoOverlayInfo, OverlayResolver, SuspectAnalyzer};
use crate::submitter::Submitter;
use crate::tree_status::{TreeState, TreeStatusSource};

/// Whether this pool drives the pipeline end to end (queries, applies,
/// submits) or only applies a batch handed to it by a master (spec.md
/// §4.8/§9: the source's master/slave classmethod split).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// Grace period before a swallowed `DependencyError`/not-ready error is
/// surfaced to the change's owner (spec.md §7, default 30 minutes).
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30 * 60);

const READY_QUERY: &str = "status:open label:Commit-Queue=+2";
const PRIORITY_READY_QUERY: &str = "status:open label:Commit-Queue=+2 label:Verified=+1";

/// Run-scoped state, spec.md §3 `PoolState`.
#[derive(Debug, Clone, Default)]
pub struct PoolState {
    pub dry_run: bool,
    pub pre_cq: bool,
    pub tree_state: Option<TreeState>,
    pub accepted: Vec<Arc<Change>>,
    pub non_tree: Vec<Arc<Change>>,
    pub deferred: Vec<(Arc<Change>, String)>,
    pub build_url: String,
}

pub struct ValidationPool<'a> {
    helper_pool: &'a HelperPool,
    resolver: &'a DependencyResolver,
    status_store: &'a StatusStore,
    action_recorder: &'a dyn ActionRecorder,
    tree_status: &'a dyn TreeStatusSource,
    overlays: &'a dyn OverlayResolver,
    checkout: &'a dyn CheckoutManager,
    role: Role,
    infra_project: String,
    grace_period: Duration,
    /// `for_single_repo`: restricts acquire/apply to exactly one project.
    only_project: Option<String>,
    /// Process-local committed-cache, shared across `apply_pool` and
    /// `submit_pool` for the lifetime of one run.
    committed: PatchCache,
    pub state: PoolState,
}

impl<'a> ValidationPool<'a> {
    pub fn new(
        helper_pool: &'a HelperPool,
        resolver: &'a DependencyResolver,
        status_store: &'a StatusStore,
        action_recorder: &'a dyn ActionRecorder,
        tree_status: &'a dyn TreeStatusSource,
        checkout: &'a dyn CheckoutManager,
        build_url: impl Into<String>,
        dry_run: bool,
    ) -> Self {
        Self {
            helper_pool,
            resolver,
            status_store,
            action_recorder,
            tree_status,
            overlays: &NoOverlayInfo,
            checkout,
            role: Role::Master,
            infra_project: String::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
            only_project: None,
            committed: PatchCache::new(),
            state: PoolState {
                dry_run,
                build_url: build_url.into(),
                ..PoolState::default()
            },
        }
    }

    /// Pre-CQ master: same pipeline, `pre_cq` toggled so notifications
    /// read "A trybot" and `HandlePreCQSuccess` applies.
    pub fn for_pre_cq(
        helper_pool: &'a HelperPool,
        resolver: &'a DependencyResolver,
        status_store: &'a StatusStore,
        action_recorder: &'a dyn ActionRecorder,
        tree_status: &'a dyn TreeStatusSource,
        checkout: &'a dyn CheckoutManager,
        build_url: impl Into<String>,
        dry_run: bool,
    ) -> Self {
        let mut pool = Self::new(
            helper_pool,
            resolver,
            status_store,
            action_recorder,
            tree_status,
            checkout,
            build_url,
            dry_run,
        );
        pool.role = Role::Slave;
        pool.state.pre_cq = true;
        pool
    }

    /// `WorkOnSingleRepo`: slave role narrowed to a single project, for
    /// pre-CQ verification of one change's stack.
    pub fn for_single_repo(
        helper_pool: &'a HelperPool,
        resolver: &'a DependencyResolver,
        status_store: &'a StatusStore,
        action_recorder: &'a dyn ActionRecorder,
        tree_status: &'a dyn TreeStatusSource,
        checkout: &'a dyn CheckoutManager,
        build_url: impl Into<String>,
        dry_run: bool,
        project: impl Into<String>,
    ) -> Self {
        let mut pool = Self::for_pre_cq(
            helper_pool,
            resolver,
            status_store,
            action_recorder,
            tree_status,
            checkout,
            build_url,
            dry_run,
        );
        pool.only_project = Some(project.into());
        pool
    }

    pub fn with_infra_project(mut self, infra_project: impl Into<String>) -> Self {
        self.infra_project = infra_project.into();
        self
    }

    pub fn with_overlays(mut self, overlays: &'a dyn OverlayResolver) -> Self {
        self.overlays = overlays;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    fn queue(&self) -> Queue {
        if self.state.pre_cq {
            Queue::Trybot
        } else {
            Queue::CommitQueue
        }
    }

    fn notifier(&self) -> Notifier<'a> {
        Notifier::new(self.helper_pool, self.state.build_url.as_str(), self.queue(), self.state.dry_run)
    }

    /// Master-role acquire: tree-gated poll loop, per-remote queries,
    /// draft/should-reject filtering, manifest split, and a caller filter
    /// hook. See spec.md §4.8.
    #[allow(clippy::too_many_arguments)]
    pub async fn acquire(
        &mut self,
        project_in_manifest: impl Fn(&str) -> bool,
        filter: impl Fn(Vec<Arc<Change>>, Vec<Arc<Change>>) -> (Vec<Arc<Change>>, Vec<Arc<Change>>),
        check_tree: bool,
        throttled_ok: bool,
        timeout: Duration,
        poll_period: Duration,
        should_exit_early: impl Fn() -> bool,
    ) -> Result<(), CqError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if check_tree {
                let tree_state = self.tree_status.current().await;
                self.state.tree_state = Some(tree_state);
                if !tree_state.accepts(throttled_ok) {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(CqError::TreeClosed);
                    }
                    tokio::time::sleep(poll_period).await;
                    continue;
                }
            }

            let throttled = matches!(self.state.tree_state, Some(TreeState::Throttled));
            let query_text = if throttled { PRIORITY_READY_QUERY } else { READY_QUERY };

            let mut gathered = Vec::new();
            for remote in self.helper_pool.remotes() {
                let client = self.helper_pool.client_for(remote)?;
                let results = client.query(query_text, None).await?;
                gathered.extend(results.into_iter().map(Arc::new));
            }

            if let Some(project) = &self.only_project {
                gathered.retain(|c: &Arc<Change>| &c.project == project);
            }

            let mut ready = Vec::new();
            for change in gathered {
                if change.current_patchset_draft {
                    self.handle_draft_change(&change).await?;
                    continue;
                }
                if change.should_reject {
                    tracing::debug!(change = %change.key(), "should-reject flag set, excluded from acquire");
                    continue;
                }
                if !change.is_ready() {
                    continue;
                }
                ready.push(change);
            }

            let (in_manifest, non_manifest): (Vec<_>, Vec<_>) =
                ready.into_iter().partition(|c| project_in_manifest(&c.project));
            let (accepted, non_manifest) = filter(in_manifest, non_manifest);

            let exit_now = !accepted.is_empty()
                || self.state.dry_run
                || should_exit_early()
                || tokio::time::Instant::now() >= deadline;

            if exit_now {
                self.state.accepted = accepted;
                self.state.non_tree = non_manifest;
                break;
            }
            tokio::time::sleep(poll_period).await;
        }

        for change in &self.state.accepted {
            tracing::info!(change = %change.key(), gerrit_number = change.gerrit_number, "picked up change");
            self.action_recorder.record(&change.key(), ClAction::PickedUp, now()).await;
        }
        Ok(())
    }

    /// Acquire changes already vetted by a master and handed down via an
    /// XML manifest (`AcquireFromManifest`, spec.md §3). No tree gating:
    /// the manifest already reflects the master's decision.
    pub async fn acquire_from_manifest(&mut self, xml: &str) -> Result<(), CqError> {
        let manifest = Manifest::parse(xml)?;
        let mut accepted = Vec::new();
        for pending in &manifest.pending_commits {
            if let Some(project) = &self.only_project {
                if &pending.project != project {
                    continue;
                }
            }
            accepted.push(Arc::new(pending.to_change()?));
        }

        for change in &accepted {
            tracing::info!(change = %change.key(), "picked up change from manifest");
            self.action_recorder.record(&change.key(), ClAction::PickedUp, now()).await;
        }
        self.state.accepted = accepted;
        Ok(())
    }

    async fn handle_draft_change(&self, change: &Change) -> Result<(), CqError> {
        tracing::info!(change = %change.key(), "latest patch set is a draft, kicking out");
        self.notifier().draft_change(change).await?;
        if !self.state.dry_run {
            let client = self.helper_pool.for_change(&change.key())?;
            client.remove_commit_ready_flag(change, self.state.dry_run).await?;
        }
        self.action_recorder.record(&change.key(), ClAction::KickedOut, now()).await;
        Ok(())
    }

    /// Applies `self.state.accepted` against `manifest`. Master role runs
    /// frozen with grace-period-filtered tot-failure handling; slave role
    /// applies in manifest order and hard-stops on the first failure.
    pub async fn apply_pool(&mut self, manifest: &str) -> Result<ApplyOutcome, CqError> {
        let engine = ApplyEngine::new(self.helper_pool, self.resolver, self.checkout);
        let changes = self.state.accepted.clone();

        match self.role {
            Role::Master => {
                let outcome = engine
                    .apply(changes, &self.committed, manifest, true, false, |_| true)
                    .await?;

                let now_ts = now();
                let grace = chrono::Duration::from_std(self.grace_period).unwrap_or(chrono::Duration::zero());
                for (change, reason) in &outcome.failed_tot {
                    let past_grace = match change.approval_timestamp {
                        Some(ts) => now_ts.signed_duration_since(ts) >= grace,
                        None => {
                            tracing::warn!(change = %change.key(), "no approval timestamp; surfacing tot failure instead of swallowing it");
                            true
                        }
                    };
                    if past_grace {
                        self.notifier().could_not_apply(change, reason).await?;
                        if !self.state.dry_run {
                            let client = self.helper_pool.for_change(&change.key())?;
                            client.remove_commit_ready_flag(change, self.state.dry_run).await?;
                        }
                        self.status_store
                            .set_status(&StatusKey::new(Bot::Cq, change.remote, change.gerrit_number), Status::Failed)
                            .await?;
                    } else {
                        tracing::debug!(change = %change.key(), "tot failure within grace period, deferring silently");
                        self.state.deferred.push((change.clone(), reason.clone()));
                    }
                }
                for (change, reason) in &outcome.failed_inflight {
                    self.state.deferred.push((change.clone(), reason.clone()));
                }
                Ok(outcome)
            }
            Role::Slave => {
                let outcome = engine
                    .apply(changes, &self.committed, manifest, true, true, |_| true)
                    .await?;
                if !outcome.failed_tot.is_empty() || !outcome.failed_inflight.is_empty() {
                    let (change, reason) = outcome
                        .failed_tot
                        .first()
                        .or_else(|| outcome.failed_inflight.first())
                        .expect("non-empty failure list");
                    return Err(CqError::InternalError(format!(
                        "slave apply hard-stopped on {}: {}",
                        change.key(),
                        reason
                    )));
                }
                Ok(outcome)
            }
        }
    }

    /// Submits `self.state.accepted`, recording terminal status and
    /// notifying on both success and failure.
    pub async fn submit_pool(&mut self, check_tree: bool, throttled_ok: bool) -> Result<HashMap<ChangeKey, CqError>, CqError> {
        if check_tree {
            let tree_state = self.tree_status.current().await;
            if !tree_state.accepts(throttled_ok) {
                return Err(CqError::TreeClosed);
            }
        }

        let submitter = Submitter::new(self.helper_pool, self.resolver, self.state.dry_run);
        let changes = self.state.accepted.clone();
        let errors = submitter.submit_changes(changes.clone(), &self.committed).await?;

        for change in &changes {
            let key = StatusKey::new(Bot::Cq, change.remote, change.gerrit_number);
            match errors.get(&change.key()) {
                None => {
                    self.status_store.set_status(&key, Status::Passed).await?;
                    self.action_recorder.record(&change.key(), ClAction::Submitted, now()).await;
                }
                Some(err) => {
                    self.status_store.set_status(&key, Status::Failed).await?;
                    self.action_recorder.record(&change.key(), ClAction::SubmitFailed, now()).await;
                    self.notifier().could_not_submit(change, &err.to_string()).await?;
                }
            }
        }

        Ok(errors)
    }

    /// `HandleValidationFailure`: notify every candidate, and for those
    /// in the computed suspect set under `sane` conditions, clear
    /// commit-ready and mark status failed.
    pub async fn handle_validation_failure(
        &self,
        messages: &[FailureMessage],
        changes: &[Arc<Change>],
        sane: bool,
        no_stat: &[String],
    ) -> Result<(), CqError> {
        let analyzer = SuspectAnalyzer::new(&self.infra_project);
        let lab_only = SuspectAnalyzer::only_lab_failures(messages, no_stat);
        let infra_only = SuspectAnalyzer::only_infra_failures(messages, no_stat);

        let suspects = if sane {
            analyzer.find_suspects(self.overlays, changes, messages, infra_only, lab_only)
        } else {
            Default::default()
        };

        let details = build_failure_details(messages);
        for change in changes {
            self.notifier().validation_failure(change, &details).await?;
            if sane && suspects.contains(&change.key()) {
                if !self.state.dry_run {
                    let client = self.helper_pool.for_change(&change.key())?;
                    client.remove_commit_ready_flag(change, self.state.dry_run).await?;
                }
                self.status_store
                    .set_status(&StatusKey::new(Bot::Cq, change.remote, change.gerrit_number), Status::Failed)
                    .await?;
            }
        }
        Ok(())
    }

    /// `HandleValidationTimeout`: notify every change; clear commit-ready
    /// when `sane`.
    pub async fn handle_validation_timeout(&self, changes: &[Arc<Change>], sane: bool) -> Result<(), CqError> {
        for change in changes {
            self.notifier().validation_timeout(change, sane).await?;
            if sane && !self.state.dry_run {
                let client = self.helper_pool.for_change(&change.key())?;
                client.remove_commit_ready_flag(change, self.state.dry_run).await?;
            }
        }
        Ok(())
    }

    /// `HandlePreCQSuccess`: notify and advance status for changes not
    /// already terminal, honoring per-project `submit-in-pre-cq`.
    pub async fn handle_pre_cq_success(
        &self,
        changes: &[Arc<Change>],
        project_configs: &HashMap<String, ProjectConfig>,
    ) -> Result<(), CqError> {
        for change in changes {
            let key = StatusKey::new(Bot::Pre, change.remote, change.gerrit_number);
            let current = self.status_store.get_status(&key).await?;
            if matches!(current, Some(Status::Passed) | Some(Status::ReadyToSubmit)) {
                continue;
            }
            self.notifier().pre_cq_success(change).await?;
            let config = project_configs.get(&change.project).cloned().unwrap_or_default();
            let new_status = if crate::config::should_submit_in_pre_cq(&config) {
                Status::ReadyToSubmit
            } else {
                Status::Passed
            };
            self.status_store.set_status(&key, new_status).await?;
        }
        Ok(())
    }
}

fn build_failure_details(messages: &[FailureMessage]) -> String {
    if messages.is_empty() {
        return "Your change caused a build failure.".to_string();
    }
    messages
        .iter()
        .map(|m| format!("{}: {}", m.builder, m.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `_FilterDependencyErrors`: grace-period policy for `DependencyError`
/// and dep-not-ready errors (spec.md §7). Errors of other kinds are
/// always surfaced. A change with no `approval_timestamp` degrades to
/// always-surface (Open Question #2 in the expanded spec).
pub fn filter_dependency_errors(
    errors: &HashMap<ChangeKey, CqError>,
    changes: &[Arc<Change>],
    grace_period: Duration,
) -> HashMap<ChangeKey, CqError> {
    let by_key: HashMap<ChangeKey, &Arc<Change>> = changes.iter().map(|c| (c.key(), c)).collect();
    let grace = chrono::Duration::from_std(grace_period).unwrap_or(chrono::Duration::zero());
    let now_ts = now();

    errors
        .iter()
        .filter(|(key, err)| {
            if !matches!(
                err,
                CqError::DependencyError { .. } | CqError::PatchNotCommitReady { .. } | CqError::PatchRejected { .. }
            ) {
                return true;
            }
            match by_key.get(*key).and_then(|c| c.approval_timestamp) {
                Some(ts) => now_ts.signed_duration_since(ts) >= grace,
                None => {
                    tracing::warn!(change = %key, "no approval timestamp; surfacing dependency error instead of swallowing it");
                    true
                }
            }
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeStatus, PatchQuery, Remote};
    use crate::helper_pool::{ApplyError, QuerySort, ReviewClient};
    use crate::status_store::InMemoryStatusBackend;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    fn base_change(number: u64, draft: bool, should_reject: bool) -> Change {
        Change {
            remote: Remote::External,
            gerrit_number: number,
            patch_number: 1,
            change_id: format!("I{number}"),
            project: "proj".to_string(),
            branch: "main".to_string(),
            owner_email: "dev@example.com".to_string(),
            approval_timestamp: None,
            commit_message: String::new(),
            parent_change_ids: Vec::new(),
            current_patchset_draft: draft,
            should_reject,
            commit_ready: true,
            status: ChangeStatus::New,
        }
    }

    struct ScriptedClient {
        ready: Vec<Change>,
        flags_cleared: Mutex<Vec<ChangeKey>>,
        comments: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReviewClient for ScriptedClient {
        async fn query(&self, _: &str, _: Option<QuerySort>) -> Result<Vec<Change>, CqError> {
            Ok(self.ready.clone())
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
        async fn remove_commit_ready_flag(&self, change: &Change, _: bool) -> Result<(), CqError> {
            self.flags_cleared.lock().unwrap().push(change.key());
            Ok(())
        }
        async fn post_comment(&self, _: &str, _: &str, body: &str) -> Result<(), CqError> {
            self.comments.lock().unwrap().push(body.to_string());
            Ok(())
        }
    }

    fn pool_with(client: Arc<ScriptedClient>) -> HelperPool {
        let mut clients: StdHashMap<Remote, Arc<dyn ReviewClient>> = StdHashMap::new();
        clients.insert(Remote::External, client);
        HelperPool::new(clients)
    }

    #[tokio::test]
    async fn acquire_accepts_ready_change_and_records_picked_up() {
        let a = base_change(1, false, false);
        let client = Arc::new(ScriptedClient {
            ready: vec![a.clone()],
            flags_cleared: Mutex::new(Vec::new()),
            comments: Mutex::new(Vec::new()),
        });
        let helper_pool = pool_with(client.clone());
        let resolver = DependencyResolver::new();
        let status_store = StatusStore::new(Arc::new(InMemoryStatusBackend::new()));
        let recorder = NullActionRecorder;
        let tree = crate::tree_status::FixedTreeStatus(TreeState::Open);
        let checkout = crate::apply_engine::InMemoryCheckoutManager::new();

        let mut vp = ValidationPool::new(&helper_pool, &resolver, &status_store, &recorder, &tree, &checkout, "http://build/1", false);

        vp.acquire(
            |_project| true,
            |accepted, non_manifest| (accepted, non_manifest),
            true,
            false,
            Duration::from_millis(50),
            Duration::from_millis(5),
            || false,
        )
        .await
        .unwrap();

        assert_eq!(vp.state.accepted.len(), 1);
        assert_eq!(vp.state.accepted[0].key(), a.key());
    }

    #[tokio::test]
    async fn draft_change_is_kicked_out_not_accepted() {
        let draft = base_change(1, true, false);
        let client = Arc::new(ScriptedClient {
            ready: vec![draft.clone()],
            flags_cleared: Mutex::new(Vec::new()),
            comments: Mutex::new(Vec::new()),
        });
        let helper_pool = pool_with(client.clone());
        let resolver = DependencyResolver::new();
        let status_store = StatusStore::new(Arc::new(InMemoryStatusBackend::new()));
        let recorder = NullActionRecorder;
        let tree = crate::tree_status::FixedTreeStatus(TreeState::Open);
        let checkout = crate::apply_engine::InMemoryCheckoutManager::new();

        let mut vp = ValidationPool::new(&helper_pool, &resolver, &status_store, &recorder, &tree, &checkout, "http://build/1", false);

        vp.acquire(
            |_| true,
            |accepted, non_manifest| (accepted, non_manifest),
            true,
            false,
            Duration::from_millis(50),
            Duration::from_millis(5),
            || false,
        )
        .await
        .unwrap();

        assert!(vp.state.accepted.is_empty());
        assert_eq!(client.flags_cleared.lock().unwrap().len(), 1);
        assert_eq!(client.comments.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_tree_times_out_with_tree_closed_error() {
        let client = Arc::new(ScriptedClient {
            ready: Vec::new(),
            flags_cleared: Mutex::new(Vec::new()),
            comments: Mutex::new(Vec::new()),
        });
        let helper_pool = pool_with(client);
        let resolver = DependencyResolver::new();
        let status_store = StatusStore::new(Arc::new(InMemoryStatusBackend::new()));
        let recorder = NullActionRecorder;
        let tree = crate::tree_status::FixedTreeStatus(TreeState::Closed);
        let checkout = crate::apply_engine::InMemoryCheckoutManager::new();

        let mut vp = ValidationPool::new(&helper_pool, &resolver, &status_store, &recorder, &tree, &checkout, "http://build/1", false);

        let err = vp
            .acquire(
                |_| true,
                |accepted, non_manifest| (accepted, non_manifest),
                true,
                false,
                Duration::from_millis(20),
                Duration::from_millis(5),
                || false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CqError::TreeClosed));
    }

    #[test]
    fn filter_dependency_errors_surfaces_only_past_grace_period() {
        let mut old_change = base_change(1, false, false);
        old_change.approval_timestamp = Some(Utc::now() - chrono::Duration::hours(1));
        let mut fresh_change = base_change(2, false, false);
        fresh_change.approval_timestamp = Some(Utc::now());
        let mut no_ts_change = base_change(3, false, false);
        no_ts_change.approval_timestamp = None;

        let changes = vec![Arc::new(old_change.clone()), Arc::new(fresh_change.clone()), Arc::new(no_ts_change.clone())];

        let mut errors = HashMap::new();
        errors.insert(
            old_change.key(),
            CqError::DependencyError {
                change: old_change.key(),
                cause: old_change.key(),
            },
        );
        errors.insert(
            fresh_change.key(),
            CqError::DependencyError {
                change: fresh_change.key(),
                cause: fresh_change.key(),
            },
        );
        errors.insert(
            no_ts_change.key(),
            CqError::DependencyError {
                change: no_ts_change.key(),
                cause: no_ts_change.key(),
            },
        );

        let surfaced = filter_dependency_errors(&errors, &changes, Duration::from_secs(30 * 60));
        assert!(surfaced.contains_key(&old_change.key()), "past grace period should surface");
        assert!(!surfaced.contains_key(&fresh_change.key()), "within grace period should swallow");
        assert!(surfaced.contains_key(&no_ts_change.key()), "missing timestamp degrades to always-surface");
    }

    #[test]
    fn filter_dependency_errors_always_surfaces_non_grace_kinds() {
        let change = base_change(1, false, false);
        let changes = vec![Arc::new(change.clone())];
        let mut errors = HashMap::new();
        errors.insert(change.key(), CqError::PatchConflict(change.key()));

        let surfaced = filter_dependency_errors(&errors, &changes, Duration::from_secs(30 * 60));
        assert!(surfaced.contains_key(&change.key()));
    }

    #[tokio::test]
    async fn handle_pre_cq_success_advances_status_per_project_config() {
        let helper_pool = pool_with(Arc::new(ScriptedClient {
            ready: Vec::new(),
            flags_cleared: Mutex::new(Vec::new()),
            comments: Mutex::new(Vec::new()),
        }));
        let resolver = DependencyResolver::new();
        let status_store = StatusStore::new(Arc::new(InMemoryStatusBackend::new()));
        let recorder = NullActionRecorder;
        let tree = crate::tree_status::FixedTreeStatus(TreeState::Open);
        let checkout = crate::apply_engine::InMemoryCheckoutManager::new();
        let vp = ValidationPool::for_pre_cq(&helper_pool, &resolver, &status_store, &recorder, &tree, &checkout, "http://build/1", false);

        let change = Arc::new(base_change(1, false, false));
        let mut configs = HashMap::new();
        configs.insert(
            "proj".to_string(),
            ProjectConfig {
                ignored_stages: Vec::new(),
                submit_in_pre_cq: true,
            },
        );

        vp.handle_pre_cq_success(&[change.clone()], &configs).await.unwrap();

        let key = StatusKey::new(Bot::Pre, change.remote, change.gerrit_number);
        assert_eq!(status_store.get_status(&key).await.unwrap(), Some(Status::ReadyToSubmit));
    }
}
