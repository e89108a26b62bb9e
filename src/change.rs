//! The [`Change`] data model: an immutable snapshot of a review entity,
//! plus the identity and lookup-alias machinery every other module keys
//! off of.
//!
//! A re-fetch of the same review produces a new `Change` value; nothing
//! in this crate mutates one in place. Two changes are the same logical
//! review iff their `(remote, change_id)` match — see [`ChangeKey`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which review-server deployment a change lives on.
///
/// Mirrors the source's `cros_internal` / `cros` remote split: most
/// projects are `External`, but some cross reference an `Internal`
/// server with its own ACLs and host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remote {
    External,
    Internal,
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remote::External => write!(f, "external"),
            Remote::Internal => write!(f, "internal"),
        }
    }
}

/// Canonical identity of a [`Change`]: `(remote, change_id)`.
///
/// Used as the equality key for `Change` itself, as the key type in
/// every `DashMap`/`HashMap` keyed by change throughout the crate, and
/// as the payload carried by [`crate::errors::CqError`] variants that
/// name an offending change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeKey {
    pub remote: Remote,
    /// The review-server's change-id (e.g. `Iabc123...`), or the decimal
    /// gerrit number rendered as a string if the source has no change-id
    /// (synthetic/local changes in tests).
    pub change_id: String,
}

impl ChangeKey {
    pub fn new(remote: Remote, gerrit_number: u64) -> Self {
        Self {
            remote,
            change_id: gerrit_number.to_string(),
        }
    }

    pub fn with_change_id(remote: Remote, change_id: impl Into<String>) -> Self {
        Self {
            remote,
            change_id: change_id.into(),
        }
    }
}

impl fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.remote, self.change_id)
    }
}

/// A lookup alias for a change: any of these can resolve the same
/// cached instance (spec: gerrit number, change-id, project+branch+id,
/// or a server-supplied alias).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeAlias {
    GerritNumber(Remote, u64),
    ChangeId(Remote, String),
    ProjectBranchChangeId(Remote, String, String, String),
    ServerAlias(Remote, String),
}

/// An immutable snapshot of a review entity.
///
/// Re-fetching the same review produces a new `Change`; nothing in this
/// crate mutates a `Change` in place. Equality and hashing are defined
/// only over [`ChangeKey`] (`remote` + `change_id`) — two snapshots of
/// the same review at different patchsets are still "the same change"
/// for the purposes of sets, maps, and dependency graphs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub remote: Remote,
    pub gerrit_number: u64,
    pub patch_number: u32,
    pub change_id: String,
    pub project: String,
    pub branch: String,
    pub owner_email: String,
    pub approval_timestamp: Option<DateTime<Utc>>,
    /// Full commit message, including footer — parsed by
    /// `DependencyResolver` for `CQ-DEPEND=` lines.
    pub commit_message: String,
    /// Git-parent dependencies as reported by the review server's patch
    /// graph, in server order. Siblings keep this order through
    /// `TransactionPlanner::build_single_tx`'s breadth-first expansion.
    pub parent_change_ids: Vec<ChangeKey>,
    /// `true` when the current patchset is an unpublished draft; such
    /// changes are routed to `ValidationPool::handle_draft_change`
    /// rather than accepted into the pool.
    pub current_patchset_draft: bool,
    /// `true` when the review carries a should-reject signal (e.g.
    /// review-rejected or verified-negative label) — highest-priority
    /// input to `SuspectAnalyzer::find_suspects`.
    pub should_reject: bool,
    /// Owner has marked this commit-ready. Cleared by
    /// `ValidationPool`/`Submitter` on failure.
    pub commit_ready: bool,
    pub status: ChangeStatus,
}

/// Server-side lifecycle status of a change, as reported by
/// `ReviewClient::get_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeStatus {
    New,
    Submitted,
    Merged,
    Abandoned,
}

impl Change {
    pub fn key(&self) -> ChangeKey {
        ChangeKey::with_change_id(self.remote, self.change_id.clone())
    }

    /// Every alias this change can be looked up by, per spec.md §4.1.
    pub fn aliases(&self) -> Vec<ChangeAlias> {
        vec![
            ChangeAlias::GerritNumber(self.remote, self.gerrit_number),
            ChangeAlias::ChangeId(self.remote, self.change_id.clone()),
            ChangeAlias::ProjectBranchChangeId(
                self.remote,
                self.project.clone(),
                self.branch.clone(),
                self.change_id.clone(),
            ),
        ]
    }

    /// `FilterNonMatchingChanges`: still eligible to be picked up or
    /// submitted — not rejected, not a draft, not already merged/abandoned,
    /// and still marked commit-ready.
    pub fn is_ready(&self) -> bool {
        self.commit_ready
            && !self.should_reject
            && !self.current_patchset_draft
            && self.status == ChangeStatus::New
    }

    /// The query needed to re-fetch this change's dependencies, trimmed
    /// to the fields a `ReviewClient` query actually needs.
    pub fn to_patch_query(&self) -> PatchQuery {
        PatchQuery {
            remote: self.remote,
            gerrit_number: self.gerrit_number,
            change_id: self.change_id.clone(),
            project: self.project.clone(),
            branch: self.branch.clone(),
        }
    }
}

impl PartialEq for Change {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Change {}

impl std::hash::Hash for Change {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state)
    }
}

/// A subset of [`Change`] fields sufficient to re-query the server;
/// used when resolving dependencies without needing the full snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchQuery {
    pub remote: Remote,
    pub gerrit_number: u64,
    pub change_id: String,
    pub project: String,
    pub branch: String,
}
