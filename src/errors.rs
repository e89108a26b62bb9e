//! Error types for the Commit Queue orchestrator crate.
//!
//! This module defines a unified error enumeration used across dependency
//! resolution, transaction planning, applying changes to a checkout, and
//! submission back to the review server. It integrates with `thiserror` to
//! provide `Display` implementations and error source chaining.
//!
//! Notes:
//! - Each variant carries the offending change's identity where the source
//!   names one, rather than a separate exception subtype per error.
//! - `DependencyError` and the not-ready variants are subject to the grace
//!   period policy in [`crate::validation_pool`]; this module only defines
//!   their shape.

use thiserror::Error;

use crate::change::ChangeKey;

#[derive(Error, Debug)]
/// Unified error enumeration for the `commit-queue` crate.
pub enum CqError {
    /// The tree was closed, or throttled while `throttled_ok` was false.
    #[error("tree is closed")]
    TreeClosed,

    /// A change's remote was not configured in the `HelperPool`.
    #[error("no review client configured for remote of change {0}")]
    HelperUnavailable(ChangeKey),

    /// A required dependency was not present in the planner's `limit` set,
    /// encountered while building a transaction for submission.
    #[error("change {change} depends on {dep}, which is not ready to submit")]
    PatchRejected { change: ChangeKey, dep: ChangeKey },

    /// A required dependency was not present in the planner's `limit` set,
    /// encountered while building a transaction for normal apply.
    #[error("change {change} depends on {dep}, which is not commit-ready")]
    PatchNotCommitReady { change: ChangeKey, dep: ChangeKey },

    /// The change's patch number changed on the server during this run.
    #[error("change {0} was modified (patch number changed) during this run")]
    PatchModified(ChangeKey),

    /// The review server rejected submission as conflicting.
    #[error("change {0} conflicts with the current tree tip")]
    PatchConflict(ChangeKey),

    /// Submission failed for a reason other than a conflict.
    #[error("change {change} failed to submit: {reason}")]
    PatchFailedToSubmit { change: ChangeKey, reason: String },

    /// A change in a cycle was submitted even though a later member of the
    /// same cycle failed; only possible when cycle collapse hides the
    /// ordering violation.
    #[error("change {0} was submitted without all of its dependencies")]
    PatchSubmittedWithoutDeps(ChangeKey),

    /// The planner could not fit a cycle's transaction within `max_len`.
    #[error("change {change} could not be planned within max_len={max_len}")]
    PlanTooLong { change: ChangeKey, max_len: usize },

    /// A change was blocked because an earlier member of its transaction
    /// failed.
    #[error("change {change} blocked by earlier failure on {cause}")]
    DependencyError { change: ChangeKey, cause: ChangeKey },

    /// The `DependencyResolver` got a non-retriable error from the review
    /// server while resolving dependencies.
    #[error("failed to resolve dependencies for {change}: {message}")]
    ResolverError { change: ChangeKey, message: String },

    /// Any unexpected failure while applying a batch. Surfaced wrapped
    /// around every change in the pool, as a safety net against the CQ
    /// looping on the same bad batch.
    #[error("internal error: {0}")]
    InternalError(String),

    /// I/O error reading config files, manifests, or working-tree state.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error, e.g. from the status store wire codec.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// XML manifest parsing error.
    #[error("manifest parse error: {0}")]
    Manifest(String),
}

impl Clone for CqError {
    /// Not `#[derive(Clone)]`: `Io`/`Json` wrap non-`Clone` upstream error
    /// types. Every other variant clones structurally; those two collapse
    /// into `InternalError` carrying their rendered message, since callers
    /// that need to clone an error (the Submitter's shared map, the
    /// grace-period filter) only care about the offending change and the
    /// message, not the original source chain.
    fn clone(&self) -> Self {
        match self {
            CqError::TreeClosed => CqError::TreeClosed,
            CqError::HelperUnavailable(c) => CqError::HelperUnavailable(c.clone()),
            CqError::PatchRejected { change, dep } => CqError::PatchRejected {
                change: change.clone(),
                dep: dep.clone(),
            },
            CqError::PatchNotCommitReady { change, dep } => CqError::PatchNotCommitReady {
                change: change.clone(),
                dep: dep.clone(),
            },
            CqError::PatchModified(c) => CqError::PatchModified(c.clone()),
            CqError::PatchConflict(c) => CqError::PatchConflict(c.clone()),
            CqError::PatchFailedToSubmit { change, reason } => CqError::PatchFailedToSubmit {
                change: change.clone(),
                reason: reason.clone(),
            },
            CqError::PatchSubmittedWithoutDeps(c) => CqError::PatchSubmittedWithoutDeps(c.clone()),
            CqError::PlanTooLong { change, max_len } => CqError::PlanTooLong {
                change: change.clone(),
                max_len: *max_len,
            },
            CqError::DependencyError { change, cause } => CqError::DependencyError {
                change: change.clone(),
                cause: cause.clone(),
            },
            CqError::ResolverError { change, message } => CqError::ResolverError {
                change: change.clone(),
                message: message.clone(),
            },
            CqError::InternalError(m) => CqError::InternalError(m.clone()),
            CqError::Io(e) => CqError::InternalError(format!("io error: {e}")),
            CqError::Json(e) => CqError::InternalError(format!("json error: {e}")),
            CqError::Manifest(m) => CqError::Manifest(m.clone()),
        }
    }
}

impl CqError {
    /// The change this error is about, if any — used by callers that need
    /// to file a per-change failure (e.g. `ApplyEngine`, `Submitter`)
    /// without a big match on every variant.
    pub fn change(&self) -> Option<&ChangeKey> {
        match self {
            CqError::HelperUnavailable(c)
            | CqError::PatchModified(c)
            | CqError::PatchConflict(c)
            | CqError::PatchSubmittedWithoutDeps(c) => Some(c),
            CqError::PatchRejected { change, .. }
            | CqError::PatchNotCommitReady { change, .. }
            | CqError::PatchFailedToSubmit { change, .. }
            | CqError::PlanTooLong { change, .. }
            | CqError::DependencyError { change, .. }
            | CqError::ResolverError { change, .. } => Some(change),
            CqError::TreeClosed | CqError::InternalError(_) | CqError::Io(_) | CqError::Json(_) | CqError::Manifest(_) => None,
        }
    }
}
