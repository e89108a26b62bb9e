//! Parses the pending-commit elements an upstream manifest (checked out by
//! the build) can carry, feeding `ValidationPool::acquire_from_manifest`.
//!
//! The manifest XML itself is produced by a collaborator out of this
//! crate's scope; this module only owns the `<pending-commit>` schema
//! from spec.md §6. Deserializes with `quick_xml::de` against the
//! teacher's dependency table rather than hand-rolling an event reader —
//! `quick-xml`'s `serialize` feature maps attributes 1:1 onto `@`-prefixed
//! serde field renames.

use serde::Deserialize;

use crate::change::{Change, ChangeStatus, Remote};
use crate::errors::CqError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(rename = "pending-commit", default)]
    pub pending_commits: Vec<PendingCommit>,
}

/// One `<pending-commit>` element, spec.md §6's minimum field set.
#[derive(Debug, Clone, Deserialize)]
pub struct PendingCommit {
    #[serde(rename = "@project_url")]
    pub project_url: String,
    #[serde(rename = "@project")]
    pub project: String,
    #[serde(rename = "@ref")]
    pub git_ref: String,
    #[serde(rename = "@branch")]
    pub branch: String,
    #[serde(rename = "@remote")]
    pub remote: String,
    #[serde(rename = "@commit-sha")]
    pub commit_sha: String,
    #[serde(rename = "@change-id")]
    pub change_id: String,
    #[serde(rename = "@gerrit-number")]
    pub gerrit_number: u64,
    #[serde(rename = "@patch-number")]
    pub patch_number: u32,
    #[serde(rename = "@owner-email")]
    pub owner_email: String,
    #[serde(rename = "@fail-count", default)]
    pub fail_count: u32,
    #[serde(rename = "@pass-count", default)]
    pub pass_count: u32,
    #[serde(rename = "@total-fail-count", default)]
    pub total_fail_count: u32,
}

impl Manifest {
    pub fn parse(xml: &str) -> Result<Self, CqError> {
        quick_xml::de::from_str(xml).map_err(|e| CqError::Manifest(e.to_string()))
    }
}

impl PendingCommit {
    /// Convert to a `Change` as `ValidationPool::acquire_from_manifest`
    /// needs it: the manifest carries no review-server status fields
    /// beyond readiness, so a manifest-derived change is always treated
    /// as new, non-draft, commit-ready, and not already rejected — the
    /// manifest only ever lists commits the master already accepted.
    pub fn to_change(&self) -> Result<Change, CqError> {
        let remote = match self.remote.as_str() {
            "external" => Remote::External,
            "internal" => Remote::Internal,
            other => return Err(CqError::Manifest(format!("unknown remote '{other}' in manifest"))),
        };
        Ok(Change {
            remote,
            gerrit_number: self.gerrit_number,
            patch_number: self.patch_number,
            change_id: self.change_id.clone(),
            project: self.project.clone(),
            branch: self.branch.clone(),
            owner_email: self.owner_email.clone(),
            approval_timestamp: None,
            commit_message: String::new(),
            parent_change_ids: Vec::new(),
            current_patchset_draft: false,
            should_reject: false,
            commit_ready: true,
            status: ChangeStatus::New,
        })
    }
}
