//! Consolidation of newly derived redirects into the persisted set.
//!
//! Runs once per dimension inside a content-update write. Work is bounded
//! per changed node: chains are compressed by a single hop here, and the
//! full multi-hop pass lives in [`flatten`](crate::flatten).
//!
//! Cyclic definitions are marked `stale` rather than dropped, so they stay
//! available for diagnosis and can be reactivated by a later move.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{info, warn};

use crate::chain::has_cycle;
use crate::error::{RedirectError, Result};
use crate::models::{Dimension, EntityId, RedirectDefinition, RedirectsBySource};

/// Outcome of one consolidation round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Consolidation {
    /// Definitions to write, one per source, ordered by source.
    pub upserts: Vec<RedirectDefinition>,
    /// Ids of automatic definitions whose target is gone.
    pub deleted_ids: Vec<EntityId>,
}

impl Consolidation {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deleted_ids.is_empty()
    }
}

/// Merges `new_definitions` into `current` for one dimension.
///
/// `available_targets` holds the URIs present in the current content
/// tree. Manual definitions are never rewritten or deleted.
///
/// # Errors
///
/// Returns [`RedirectError::InvalidInput`] when `available_targets` is
/// empty (an empty tree would retire every automatic redirect) or when a
/// definition belongs to another dimension.
pub fn consolidate(
    dimension: &Dimension,
    new_definitions: Vec<RedirectDefinition>,
    current: &[RedirectDefinition],
    available_targets: &HashSet<String>,
) -> Result<Consolidation> {
    if available_targets.is_empty() {
        return Err(RedirectError::invalid(format!(
            "no available targets for dimension '{dimension}'"
        )));
    }
    if let Some(foreign) = current
        .iter()
        .chain(new_definitions.iter())
        .find(|d| &d.dimension != dimension)
    {
        return Err(RedirectError::invalid(format!(
            "definition {} belongs to dimension '{}', expected '{dimension}'",
            foreign.id, foreign.dimension
        )));
    }

    let mut by_source: RedirectsBySource = current
        .iter()
        .map(|d| (d.source.clone(), d.clone()))
        .collect();

    let mut upserts: BTreeMap<String, RedirectDefinition> = BTreeMap::new();
    let mut rewritten: HashMap<String, String> = HashMap::new();
    let mut valid_targets: HashSet<String> = available_targets.clone();

    for mut candidate in new_definitions {
        if has_cycle(&candidate.source, &candidate.target, &by_source) {
            candidate.stale = true;
            warn!(
                source = %candidate.source,
                target = %candidate.target,
                dimension = %dimension,
                "cycle detected, marking redirect as stale"
            );
        }
        valid_targets.insert(candidate.target.clone());

        let merged = match by_source.get(&candidate.source) {
            Some(existing) if !existing.is_automatic() => {
                warn!(
                    source = %candidate.source,
                    redirect_id = %existing.id,
                    "source is owned by a manual redirect, skipping derived redirect"
                );
                continue;
            }
            Some(existing) => {
                let mut existing = existing.clone();
                existing.target = candidate.target.clone();
                existing.stale = candidate.stale;
                if candidate.content_id.is_some() {
                    existing.content_id = candidate.content_id.clone();
                }
                info!(
                    source = %existing.source,
                    new_target = %existing.target,
                    "updated automatic redirect target"
                );
                existing
            }
            None => candidate,
        };

        rewritten.insert(merged.source.clone(), merged.target.clone());
        by_source.insert(merged.source.clone(), merged.clone());
        upserts.insert(merged.source.clone(), merged);
    }

    let mut deleted_ids = Vec::new();
    let mut untouched: Vec<&RedirectDefinition> = current
        .iter()
        .filter(|d| d.is_automatic() && !upserts.contains_key(&d.source))
        .collect();
    untouched.sort_by(|a, b| a.source.cmp(&b.source));

    for existing in untouched {
        let mut def = existing.clone();
        let mut touched = false;

        if let Some(next_target) = rewritten.get(&def.target) {
            if *next_target != def.source {
                info!(
                    source = %def.source,
                    old_target = %def.target,
                    new_target = %next_target,
                    "compressed chained redirect"
                );
                def.target = next_target.clone();
                touched = true;
            }
        }

        if !def.stale && has_cycle(&def.source, &def.target, &by_source) {
            warn!(
                source = %def.source,
                target = %def.target,
                dimension = %dimension,
                "cycle detected, marking redirect as stale"
            );
            def.stale = true;
        }

        if !touched && !valid_targets.contains(&def.target) {
            warn!(
                source = %def.source,
                target = %def.target,
                redirect_id = %def.id,
                "redirect target no longer exists, marking for deletion"
            );
            by_source.remove(&def.source);
            deleted_ids.push(def.id);
            continue;
        }

        by_source.insert(def.source.clone(), def.clone());
        upserts.insert(def.source.clone(), def);
    }

    Ok(Consolidation {
        upserts: upserts.into_values().collect(),
        deleted_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RedirectCode, RedirectionType};
    use pretty_assertions::assert_eq;

    fn dim() -> Dimension {
        Dimension::from("global")
    }

    fn auto(source: &str, target: &str) -> RedirectDefinition {
        RedirectDefinition::automatic(source, target, dim(), None)
    }

    fn targets(uris: &[&str]) -> HashSet<String> {
        uris.iter().map(|u| u.to_string()).collect()
    }

    fn pairs(c: &Consolidation) -> Vec<(String, String, bool)> {
        c.upserts
            .iter()
            .map(|d| (d.source.clone(), d.target.clone(), d.stale))
            .collect()
    }

    #[test]
    fn test_chain_is_propagated_to_new_target() {
        let existing = auto("/a", "/b");
        let result = consolidate(&dim(), vec![auto("/b", "/c")], &[existing.clone()], &targets(&["/c"]))
            .unwrap();

        assert_eq!(
            pairs(&result),
            vec![
                ("/a".to_string(), "/c".to_string(), false),
                ("/b".to_string(), "/c".to_string(), false),
            ]
        );
        assert!(result.deleted_ids.is_empty());
        assert_eq!(result.upserts[0].id, existing.id);
    }

    #[test]
    fn test_cyclic_candidate_is_marked_stale() {
        let current = vec![auto("/x", "/y")];
        let result =
            consolidate(&dim(), vec![auto("/y", "/x")], &current, &targets(&["/x"])).unwrap();

        let candidate = result.upserts.iter().find(|d| d.source == "/y").unwrap();
        assert!(candidate.stale);
    }

    #[test]
    fn test_self_loop_is_kept_as_stale() {
        let result =
            consolidate(&dim(), vec![auto("/same", "/same")], &[], &targets(&["/same"])).unwrap();

        assert_eq!(result.upserts.len(), 1);
        assert_eq!(result.upserts[0].source, result.upserts[0].target);
        assert!(result.upserts[0].stale);
    }

    #[test]
    fn test_existing_self_loop_is_marked_stale() {
        let current = vec![auto("/loop", "/loop")];
        let result =
            consolidate(&dim(), vec![], &current, &targets(&["/loop", "/other"])).unwrap();

        assert_eq!(result.upserts.len(), 1);
        assert!(result.upserts[0].stale);
        assert!(result.deleted_ids.is_empty());
    }

    #[test]
    fn test_existing_automatic_with_same_source_is_rewritten_in_place() {
        let existing = auto("/shoes", "/shoes-2023");
        let mut candidate = auto("/shoes", "/shoes-2024");
        candidate.content_id = Some("7".to_string());

        let result = consolidate(
            &dim(),
            vec![candidate],
            &[existing.clone()],
            &targets(&["/shoes-2024"]),
        )
        .unwrap();

        assert_eq!(result.upserts.len(), 1);
        let merged = &result.upserts[0];
        assert_eq!(merged.id, existing.id);
        assert_eq!(merged.target, "/shoes-2024");
        assert_eq!(merged.content_id.as_deref(), Some("7"));
    }

    #[test]
    fn test_dead_automatic_target_is_deleted_manual_is_kept() {
        let dead = auto("/old", "/gone");
        let manual = RedirectDefinition::manual("/promo", "/gone", RedirectCode::Found, dim());
        let alive = auto("/legacy", "/home");

        let result = consolidate(
            &dim(),
            vec![],
            &[dead.clone(), manual.clone(), alive.clone()],
            &targets(&["/home"]),
        )
        .unwrap();

        assert_eq!(result.deleted_ids, vec![dead.id]);
        assert_eq!(pairs(&result), vec![("/legacy".to_string(), "/home".to_string(), false)]);
        assert!(result.upserts.iter().all(|d| d.id != manual.id));
    }

    #[test]
    fn test_upserts_and_deletions_are_disjoint() {
        let current = vec![
            auto("/a", "/b"),
            auto("/c", "/gone"),
            auto("/d", "/e"),
            auto("/e", "/f"),
        ];
        let result = consolidate(
            &dim(),
            vec![auto("/b", "/b-new"), auto("/e", "/e-new")],
            &current,
            &targets(&["/b-new", "/e-new"]),
        )
        .unwrap();

        let upserted: HashSet<&EntityId> = result.upserts.iter().map(|d| &d.id).collect();
        for id in &result.deleted_ids {
            assert!(!upserted.contains(id));
        }
        let sources: HashSet<&str> = result.upserts.iter().map(|d| d.source.as_str()).collect();
        assert_eq!(sources.len(), result.upserts.len());
    }

    #[test]
    fn test_compression_never_points_at_itself() {
        let current = vec![auto("/x", "/y")];
        let result =
            consolidate(&dim(), vec![auto("/y", "/x")], &current, &targets(&["/x"])).unwrap();

        assert!(result.upserts.iter().all(|d| d.source != d.target || d.stale));
        assert!(result
            .upserts
            .iter()
            .all(|d| !(d.source == "/x" && d.target == "/x")));
    }

    #[test]
    fn test_manual_owner_blocks_candidate() {
        let manual = RedirectDefinition::manual("/sale", "/offers", RedirectCode::Found, dim());
        let result = consolidate(
            &dim(),
            vec![auto("/sale", "/sale-new")],
            &[manual],
            &targets(&["/sale-new"]),
        )
        .unwrap();

        assert!(result.upserts.is_empty());
        assert!(result.deleted_ids.is_empty());
    }

    #[test]
    fn test_rejects_empty_available_targets() {
        let err = consolidate(&dim(), vec![auto("/a", "/b")], &[], &HashSet::new()).unwrap_err();
        assert!(matches!(err, RedirectError::InvalidInput(_)));
    }

    #[test]
    fn test_rejects_foreign_dimension() {
        let foreign = RedirectDefinition::automatic("/a", "/b", Dimension::from("de"), None);
        let err = consolidate(&dim(), vec![foreign], &[], &targets(&["/b"])).unwrap_err();
        assert!(matches!(err, RedirectError::InvalidInput(_)));
    }

    #[test]
    fn test_candidates_stay_automatic() {
        let result = consolidate(&dim(), vec![auto("/a", "/b")], &[], &targets(&["/b"])).unwrap();
        assert_eq!(result.upserts[0].redirection_type, RedirectionType::Automatic);
    }
}
