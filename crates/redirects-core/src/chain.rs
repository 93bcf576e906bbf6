//! Redirect chain analysis over a `source → definition` map of one dimension.
//!
//! Both functions walk the chain that starts at a target, following each
//! definition's own `target` as the next step. Walks are bounded by a
//! visited set and always terminate.

use std::collections::HashSet;

use crate::models::RedirectsBySource;

/// Returns true if `source → target` would redirect forever.
///
/// The walk reports a cycle when it reaches `source` again (a definition
/// with `target == source` is a one-step cycle) or revisits any node seen
/// earlier in the same walk. It ends without a cycle at an empty target or
/// at a node with no outgoing redirect.
pub fn has_cycle(source: &str, target: &str, redirects: &RedirectsBySource) -> bool {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut current = target;

    loop {
        if current.is_empty() {
            return false;
        }
        if current == source {
            return true;
        }
        if !visited.insert(current) {
            return true;
        }
        match redirects.get(current) {
            Some(next) => current = next.target.as_str(),
            None => return false,
        }
    }
}

/// Follows the chain from `target` and returns its terminal target.
///
/// The walk stops at a node with no outgoing redirect or with an empty
/// target. When it runs into a loop it returns the first target that
/// repeats, so members of a pure cycle keep their current target and
/// repeated calls converge. Only an empty input yields an empty result.
pub fn resolve_final_target(target: &str, redirects: &RedirectsBySource) -> String {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut current = target;

    loop {
        let next = match redirects.get(current) {
            Some(next) if !next.target.is_empty() => next,
            _ => return current.to_string(),
        };
        if !visited.insert(current) {
            return current.to_string();
        }
        current = next.target.as_str();
    }
}
