//! Posts templated comments back to the review server.
//!
//! Notification *formatting* is explicitly out of scope (spec.md §1): this
//! module only implements the message *contract* from spec.md §6 — plain
//! text with named substitutions `build_log`, `queue`, and optional
//! `failure`/`error`/`details` — and the handful of fixed templates the
//! orchestrator itself needs to phrase (picked-up, could-not-apply, draft,
//! timeout, validation-failure, could-not-submit, incorrect-submission,
//! pre-cq-success), each grounded in the source's literal message strings.

use std::collections::HashMap;

use crate::change::Change;
use crate::errors::CqError;
use crate::helper_pool::{HelperPool, MAX_COMMENT_BYTES};

/// `"The Commit Queue"` for a full CQ run, `"A trybot"` for pre-CQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    CommitQueue,
    Trybot,
}

impl Queue {
    pub fn label(self) -> &'static str {
        match self {
            Queue::CommitQueue => "The Commit Queue",
            Queue::Trybot => "A trybot",
        }
    }
}

/// Posts templated comments for one CQ run. `build_log` and `queue` are
/// fixed for the lifetime of a `ValidationPool`; `dry_run` suppresses the
/// actual network call while still logging what would have been sent.
pub struct Notifier<'a> {
    helper_pool: &'a HelperPool,
    build_log: String,
    queue: Queue,
    dry_run: bool,
}

impl<'a> Notifier<'a> {
    pub fn new(helper_pool: &'a HelperPool, build_log: impl Into<String>, queue: Queue, dry_run: bool) -> Self {
        Self {
            helper_pool,
            build_log: build_log.into(),
            queue,
            dry_run,
        }
    }

    /// Render `template` against the standard substitution set plus any
    /// caller-supplied `extra` keys (`failure`, `error`, `details`), then
    /// post it against `change`. Truncates to the review server's hard
    /// 32000-byte comment maximum before posting.
    pub async fn send(
        &self,
        change: &Change,
        template: &str,
        extra: &[(&str, &str)],
    ) -> Result<(), CqError> {
        let mut substitutions: HashMap<&str, String> = HashMap::new();
        substitutions.insert("build_log", self.build_log.clone());
        substitutions.insert("queue", self.queue.label().to_string());
        for (key, value) in extra {
            substitutions.insert(key, value.to_string());
        }

        let body = render(template, &substitutions);
        let body = truncate_to_byte_limit(&body, MAX_COMMENT_BYTES);

        if self.dry_run {
            tracing::info!(change = %change.key(), "dry-run: would post comment: {body}");
            return Ok(());
        }

        let client = self.helper_pool.for_change(&change.key())?;
        let host = change.remote.to_string();
        let change_rev = format!("{}/{}", change.gerrit_number, change.patch_number);
        client.post_comment(&host, &change_rev, &body).await
    }

    pub async fn picked_up(&self, change: &Change) -> Result<(), CqError> {
        self.send(
            change,
            "{queue} has picked up your change. You can follow along at {build_log} .",
            &[],
        )
        .await
    }

    pub async fn could_not_apply(&self, change: &Change, failure: &str) -> Result<(), CqError> {
        self.send(
            change,
            "{queue} failed to apply your change in {build_log} . {failure}",
            &[("failure", failure)],
        )
        .await
    }

    pub async fn incorrect_submission(&self, change: &Change, failure: &str) -> Result<(), CqError> {
        self.send(
            change,
            "{queue} incorrectly submitted your change in {build_log} .  {failure}",
            &[("failure", failure)],
        )
        .await
    }

    pub async fn draft_change(&self, change: &Change) -> Result<(), CqError> {
        self.send(
            change,
            "{queue} could not apply your change because the latest patch set is not \
             published. Please publish your draft patch set before marking your commit \
             as ready.",
            &[],
        )
        .await
    }

    pub async fn validation_timeout(&self, change: &Change, sane: bool) -> Result<(), CqError> {
        let mut body = "{queue} timed out while verifying your change in {build_log} . This \
                         means that a supporting builder did not finish building your change \
                         within the specified timeout."
            .to_string();
        if sane {
            body.push_str(
                " If you believe this happened in error, just re-mark your commit as ready. \
                 Your change will then get automatically retried.",
            );
        } else {
            body.push_str(
                " The build failure may have been caused by infrastructure issues, so no \
                 changes will be blamed for the failure.",
            );
        }
        self.send(change, &body, &[]).await
    }

    pub async fn validation_failure(&self, change: &Change, details: &str) -> Result<(), CqError> {
        self.send(change, "{details}", &[("details", details)]).await
    }

    pub async fn could_not_submit(&self, change: &Change, error: &str) -> Result<(), CqError> {
        self.send(
            change,
            "{queue} failed to submit your change in {build_log} . {error}",
            &[("error", error)],
        )
        .await
    }

    pub async fn pre_cq_success(&self, change: &Change) -> Result<(), CqError> {
        self.send(
            change,
            "{queue} successfully verified your change in {build_log} .",
            &[],
        )
        .await
    }
}

fn render(template: &str, substitutions: &HashMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in substitutions {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

fn truncate_to_byte_limit(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        return body.to_string();
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &body[..end])
}
