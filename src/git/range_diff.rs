//! Commits introduced by one commit relative to another.
//!
//! The walk starts at `new` and follows parent edges with an explicit stack,
//! consulting merge bases against `old` to stop at the point where each line
//! of history joins `old`'s ancestry.  Linear single-parent stretches are
//! consumed in one go; merges push their parents back onto the stack.  The
//! `processed` set guarantees every commit is expanded at most once.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::trace;

use crate::error::RepoResult;

/// The two graph primitives the walk needs.
#[async_trait]
pub trait CommitGraph: Send + Sync {
    /// Parents of `hash`, first parent first.
    async fn parents(&self, hash: &str) -> RepoResult<Vec<String>>;

    /// Best common ancestors of `a` and `b`.
    async fn merge_bases(&self, a: &str, b: &str) -> RepoResult<Vec<String>>;
}

/// Hashes reachable from `new` but not from `old`, in discovery order.
///
/// Returns nothing when `new == old` or when `new` is already an ancestor of
/// `old`.
pub async fn unique_commits<G>(graph: &G, old: &str, new: &str) -> RepoResult<Vec<String>>
where
    G: CommitGraph + ?Sized,
{
    if old == new {
        return Ok(Vec::new());
    }
    if graph.merge_bases(new, old).await?.iter().any(|h| h == new) {
        return Ok(Vec::new());
    }

    let mut result = vec![new.to_string()];
    let mut processed: HashSet<String> = HashSet::from([new.to_string()]);
    let mut stack: Vec<String> = graph
        .parents(new)
        .await?
        .into_iter()
        .filter(|p| p != old)
        .collect();

    while let Some(candidate) = stack.pop() {
        if candidate == old || processed.contains(&candidate) {
            continue;
        }

        let bases = graph.merge_bases(&candidate, old).await?;
        if bases.contains(&candidate) {
            // Already part of `old`'s history.
            processed.insert(candidate);
            continue;
        }

        // Consume the linear stretch below `candidate`.
        let mut chain = vec![candidate.clone()];
        let mut cursor = candidate.clone();
        let mut frontier = Vec::new();
        loop {
            let parents = graph.parents(&cursor).await?;
            match parents.as_slice() {
                [] => break,
                [only] => {
                    if bases.contains(only) || only == old {
                        break;
                    }
                    chain.push(only.clone());
                    cursor = only.clone();
                }
                _ => {
                    frontier = parents;
                    break;
                }
            }
        }
        trace!(%candidate, chain = chain.len(), branches = frontier.len(), "walked chain");

        for hash in chain {
            if processed.insert(hash.clone()) {
                result.push(hash);
            }
        }
        for parent in frontier {
            if !processed.contains(&parent) && !stack.contains(&parent) {
                stack.push(parent);
            }
        }
    }

    Ok(result)
}
