//! Computes a change's git-parent dependencies and its cross-project
//! CQ-DEPEND dependencies, with per-change memoization.
//!
//! Gerrit dependencies are the review server's own patch graph (carried
//! on [`Change::parent_change_ids`], in server-reported order). CQ
//! dependencies are parsed out of the commit message footer, tolerantly:
//! a `CQ-DEPEND=` line lists comma/whitespace-separated gerrit numbers,
//! each optionally prefixed with `*` to mean "this dependency lives on
//! the internal remote".

use dashmap::DashMap;

use crate::change::{Change, ChangeAlias, ChangeKey, Remote};
use crate::errors::CqError;
use crate::helper_pool::HelperPool;
use crate::patch_cache::PatchCache;

/// A CQ-DEPEND token: a dependency named by its gerrit number, which is
/// only a lookup *alias* (spec.md §4.1) — never the canonical
/// `(remote, change_id)` identity a `ChangeKey` carries. Keeping this
/// distinct from `ChangeKey` is what lets `resolve_cq_deps` go through
/// `PatchCache::get_by_alias` instead of missing on a synthetic key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CqDependRef {
    pub remote: Remote,
    pub gerrit_number: u64,
}

/// Resolved dependency identities for a change — keys only, not
/// snapshots, so repeated calls always re-resolve against the current
/// `PatchCache` rather than serving a stale `Change`.
#[derive(Debug, Clone, Default)]
pub struct DepKeys {
    pub gerrit_deps: Vec<ChangeKey>,
    pub cq_deps: Vec<CqDependRef>,
}

/// Memoizing resolver for a change's dependencies.
pub struct DependencyResolver {
    cache: DashMap<ChangeKey, DepKeys>,
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    /// Parse the `CQ-DEPEND=` lines of a commit message into gerrit-number
    /// refs on the same remote as `owner_remote` unless the token is
    /// `*`-prefixed (internal).
    pub fn parse_cq_depend(commit_message: &str, owner_remote: Remote) -> Vec<CqDependRef> {
        let mut deps = Vec::new();
        for line in commit_message.lines() {
            let line = line.trim();
            let Some(rest) = line.strip_prefix("CQ-DEPEND=") else {
                continue;
            };
            for token in rest.split([',', ' ']) {
                let token = token.trim();
                if token.is_empty() {
                    continue;
                }
                let (remote, number) = if let Some(internal) = token.strip_prefix('*') {
                    (Remote::Internal, internal)
                } else {
                    (owner_remote, token)
                };
                if let Ok(gerrit_number) = number.parse::<u64>() {
                    deps.push(CqDependRef { remote, gerrit_number });
                }
                // Unparseable tokens are silently skipped — tolerant parsing.
            }
        }
        deps
    }

    /// Returns `(gerrit_deps, cq_deps)` for `change`, resolving each
    /// dependency key against `cache`, fetching from the server via
    /// `helper_pool` for anything not already cached.
    pub async fn deps_of(
        &self,
        change: &Change,
        cache: &PatchCache,
        helper_pool: &HelperPool,
    ) -> Result<(Vec<std::sync::Arc<Change>>, Vec<std::sync::Arc<Change>>), CqError> {
        let key = change.key();
        let dep_keys = if let Some(hit) = self.cache.get(&key) {
            hit.clone()
        } else {
            let gerrit_deps = change.parent_change_ids.clone();
            let cq_deps = Self::parse_cq_depend(&change.commit_message, change.remote);
            let computed = DepKeys {
                gerrit_deps,
                cq_deps,
            };
            self.cache.insert(key.clone(), computed.clone());
            computed
        };

        let gerrit = self.resolve_all(&dep_keys.gerrit_deps, cache, helper_pool).await?;
        let cq = self.resolve_cq_deps(&dep_keys.cq_deps, cache, helper_pool).await?;
        Ok((gerrit, cq))
    }

    async fn resolve_all(
        &self,
        keys: &[ChangeKey],
        cache: &PatchCache,
        helper_pool: &HelperPool,
    ) -> Result<Vec<std::sync::Arc<Change>>, CqError> {
        let mut resolved = Vec::with_capacity(keys.len());
        for dep_key in keys {
            if let Some(change) = cache.get(dep_key) {
                resolved.push(change);
                continue;
            }
            let client = helper_pool.for_change(dep_key)?;
            let query_text = format!("change:{}", dep_key.change_id);
            match client.query_one(&query_text, true).await {
                Ok(Some(fetched)) => {
                    cache.insert(fetched.clone());
                    resolved.push(cache.get(dep_key).unwrap_or_else(|| std::sync::Arc::new(fetched)));
                }
                Ok(None) => {
                    return Err(CqError::ResolverError {
                        change: dep_key.clone(),
                        message: "dependency not found on review server".to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(resolved)
    }

    /// Resolves CQ-DEPEND refs via the gerrit-number alias, never via a
    /// synthetic `ChangeKey`: a hit on `cache` comes back keyed on the
    /// dependency's real canonical identity, and a miss falls back to a
    /// server-side query filtered locally by gerrit number (the review
    /// server has no notion of "look this up by gerrit number alone" the
    /// way it does for a change-id).
    async fn resolve_cq_deps(
        &self,
        refs: &[CqDependRef],
        cache: &PatchCache,
        helper_pool: &HelperPool,
    ) -> Result<Vec<std::sync::Arc<Change>>, CqError> {
        let mut resolved = Vec::with_capacity(refs.len());
        for dep_ref in refs {
            let alias = ChangeAlias::GerritNumber(dep_ref.remote, dep_ref.gerrit_number);
            if let Some(change) = cache.get_by_alias(&alias) {
                resolved.push(change);
                continue;
            }
            let client = helper_pool.client_for(dep_ref.remote)?;
            let query_text = dep_ref.gerrit_number.to_string();
            let candidates = client.query(&query_text, None).await?;
            match candidates.into_iter().find(|c| c.gerrit_number == dep_ref.gerrit_number) {
                Some(fetched) => {
                    cache.insert(fetched.clone());
                    resolved.push(cache.get_by_alias(&alias).unwrap_or_else(|| std::sync::Arc::new(fetched)));
                }
                None => {
                    return Err(CqError::ResolverError {
                        change: ChangeKey::new(dep_ref.remote, dep_ref.gerrit_number),
                        message: "CQ-DEPEND dependency not found on review server".to_string(),
                    });
                }
            }
        }
        Ok(resolved)
    }
}
