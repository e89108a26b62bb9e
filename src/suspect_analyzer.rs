//! Cross-change blame analysis: given a failed build's messages and the
//! candidate changes that were in the pool, compute the subset to blame.
//!
//! Grounded in `CalculateSuspects` in the source: `FindSuspects` applies a
//! strict priority of rules (should-reject > lab-only > infra-only >
//! innocent-overlay filtering > package-build attribution > "blame
//! everyone left"), and `_FindPreviouslyFailedChanges` upgrades a
//! "probable" suspect to "reject" after repeated CQ failures.

use std::collections::HashSet;
use std::sync::Arc;

use crate::change::{Change, ChangeKey};
use crate::errors::CqError;
use crate::status_store::{Bot, Status, StatusKey, StatusStore};

/// Coarse classification of a build failure, used to decide whether
/// package-atom-level blame attribution applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    PackageBuild,
    Lab,
    Infra,
    Unknown,
}

/// A single supporting builder's failure report.
#[derive(Debug, Clone)]
pub struct FailureMessage {
    pub builder: String,
    pub internal: bool,
    pub text: String,
    pub kind: FailureKind,
    /// Projects this message's own analysis blames, when `kind` is
    /// `PackageBuild` (the source maps failed package atoms to their
    /// owning projects; that mapping is this crate's external caller's
    /// responsibility, so the mapped result is carried directly here).
    pub blamed_projects: Vec<String>,
    /// Overlay directories this builder's configured boards could have
    /// affected — used by the innocent-overlay filter.
    pub responsible_overlays: HashSet<String>,
}

/// Seam to the working-tree checkout for overlay-affected-by-change
/// queries (spec.md §1: the checkout manager is an external collaborator).
pub trait OverlayResolver {
    /// The overlays `change` could have affected, or `None` if `change`
    /// touched something other than an overlay (in which case it can never
    /// be filtered out as "innocent").
    fn affected_overlays(&self, change: &Change) -> Option<HashSet<String>>;
}

/// A resolver that never has overlay information — every change looks
/// like it could have affected anything, so no overlay-innocence filtering
/// happens. Suitable when the working tree has no overlay concept.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOverlayInfo;

impl OverlayResolver for NoOverlayInfo {
    fn affected_overlays(&self, _change: &Change) -> Option<HashSet<String>> {
        None
    }
}

pub struct SuspectAnalyzer<'a> {
    /// Project name treated as "infra" for the infra-only rule (spec.md
    /// §4.7 step 3: "the designated infra project (spec-configurable
    /// string)").
    infra_project: &'a str,
}

impl<'a> SuspectAnalyzer<'a> {
    pub fn new(infra_project: &'a str) -> Self {
        Self { infra_project }
    }

    /// Compute the subset of `candidates` to blame for a failed build.
    pub fn find_suspects(
        &self,
        overlays: &dyn OverlayResolver,
        candidates: &[Arc<Change>],
        messages: &[FailureMessage],
        infra_only: bool,
        lab_only: bool,
    ) -> HashSet<ChangeKey> {
        let should_reject: Vec<&Arc<Change>> = candidates.iter().filter(|c| c.should_reject).collect();
        if !should_reject.is_empty() {
            tracing::warn!(
                "some changes were already blamed (should-reject); only these will be rejected"
            );
            return should_reject.into_iter().map(|c| c.key()).collect();
        }

        if lab_only {
            tracing::warn!("build failed purely due to lab infrastructure; blaming no one");
            return HashSet::new();
        }

        if infra_only {
            tracing::warn!("build failed due to non-lab infrastructure issues; blaming only the infra project");
            return candidates
                .iter()
                .filter(|c| c.project == self.infra_project)
                .map(|c| c.key())
                .collect();
        }

        let surviving: Vec<&Arc<Change>> = candidates
            .iter()
            .filter(|c| !self.is_innocent_overlay_change(overlays, c, messages))
            .collect();

        if !messages.is_empty() && messages.iter().all(|m| m.kind == FailureKind::PackageBuild) {
            let blamed_projects: HashSet<&str> = messages
                .iter()
                .flat_map(|m| m.blamed_projects.iter().map(String::as_str))
                .collect();
            surviving
                .into_iter()
                .filter(|c| blamed_projects.contains(c.project.as_str()))
                .map(|c| c.key())
                .collect()
        } else {
            surviving.into_iter().map(|c| c.key()).collect()
        }
    }

    /// `true` iff `change` touched only overlays outside every failed
    /// builder's responsible set — i.e. it could not possibly have caused
    /// any of `messages`.
    fn is_innocent_overlay_change(
        &self,
        overlays: &dyn OverlayResolver,
        change: &Change,
        messages: &[FailureMessage],
    ) -> bool {
        if messages.is_empty() {
            return false;
        }
        let Some(affected) = overlays.affected_overlays(change) else {
            return false;
        };
        let responsible: HashSet<&String> = messages.iter().flat_map(|m| m.responsible_overlays.iter()).collect();
        !affected.iter().any(|o| responsible.contains(o))
    }

    /// `OnlyLabFailures`: `true` iff every message is a lab failure and no
    /// builder failed to report status at all.
    pub fn only_lab_failures(messages: &[FailureMessage], no_stat: &[String]) -> bool {
        no_stat.is_empty() && !messages.is_empty() && messages.iter().all(|m| m.kind == FailureKind::Lab)
    }

    /// `OnlyInfraFailures`: `true` iff every message is an infra failure,
    /// or no message reported at all but some builder failed to report
    /// status (treated the same as an infra failure).
    pub fn only_infra_failures(messages: &[FailureMessage], no_stat: &[String]) -> bool {
        (messages.is_empty() && !no_stat.is_empty())
            || (!messages.is_empty() && messages.iter().all(|m| m.kind == FailureKind::Infra))
    }

    /// `_FindPreviouslyFailedChanges`: candidates that have failed the CQ
    /// at least once before, used to upgrade a "probable" suspect to
    /// "rejected" after repeat offenses.
    pub async fn previous_failures(
        &self,
        status_store: &StatusStore,
        candidates: &[Arc<Change>],
    ) -> Result<HashSet<ChangeKey>, CqError> {
        let mut out = HashSet::new();
        for change in candidates {
            let key = StatusKey::new(Bot::Cq, change.remote, change.gerrit_number);
            if status_store.count(&key, Status::Failed, true).await? > 0 {
                out.insert(change.key());
            }
        }
        Ok(out)
    }
}
