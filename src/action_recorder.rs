//! `ActionRecorder`: the interface contract for the relational metadata
//! database sink (spec.md §1 marks the database itself out of scope).
//!
//! `ValidationPool` calls this on every picked-up, submitted, kicked-out,
//! and verified change so a downstream analytics pipeline can reconstruct
//! CQ history; this crate only defines the seam and a no-op default.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::change::ChangeKey;

/// An event worth recording against a change's history, mirroring the
/// source's `constants.CL_ACTION_*` enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClAction {
    PickedUp,
    Submitted,
    SubmitFailed,
    KickedOut,
    Verified,
}

/// Sink for per-change action history. A real implementation talks to the
/// relational metadata database; `NullActionRecorder` is the default so the
/// orchestrator compiles and runs without one configured.
#[async_trait]
pub trait ActionRecorder: Send + Sync {
    async fn record(&self, change: &ChangeKey, action: ClAction, at: DateTime<Utc>);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullActionRecorder;

#[async_trait]
impl ActionRecorder for NullActionRecorder {
    async fn record(&self, _change: &ChangeKey, _action: ClAction, _at: DateTime<Utc>) {}
}
