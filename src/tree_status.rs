//! Tree-state gating, shared by `ValidationPool::acquire` (which waits for
//! the tree to open) and `Submitter` (which asserts it's open once before
//! submitting). The tree-status service itself is an external collaborator
//! — this module only defines the seam and an in-memory double for tests.

use async_trait::async_trait;

/// Lifecycle state of the build tree, per spec.md §3 `PoolState.tree_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    Open,
    Throttled,
    Closed,
}

impl TreeState {
    /// `true` if changes may proceed: always for `Open`; for `Throttled`
    /// only when the caller opted into `throttled_ok`.
    pub fn accepts(self, throttled_ok: bool) -> bool {
        match self {
            TreeState::Open => true,
            TreeState::Throttled => throttled_ok,
            TreeState::Closed => false,
        }
    }
}

#[async_trait]
pub trait TreeStatusSource: Send + Sync {
    async fn current(&self) -> TreeState;
}

/// In-memory tree-status double for tests and single-process deployments.
pub struct FixedTreeStatus(pub TreeState);

#[async_trait]
impl TreeStatusSource for FixedTreeStatus {
    async fn current(&self) -> TreeState {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttled_accepts_only_when_opted_in() {
        assert!(TreeState::Throttled.accepts(true));
        assert!(!TreeState::Throttled.accepts(false));
        assert!(TreeState::Open.accepts(false));
        assert!(!TreeState::Closed.accepts(true));
    }
}
