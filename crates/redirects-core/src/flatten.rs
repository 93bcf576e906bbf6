//! Multi-hop flattening of an active redirect set.
//!
//! A separate maintenance pass: every active definition of a dimension is
//! pointed at the terminal target of its chain, so that in steady state
//! every live redirect is a single hop. Stale definitions are left alone.

use tracing::debug;

use crate::chain::resolve_final_target;
use crate::models::{RedirectDefinition, RedirectsBySource};

/// Returns the definitions whose target changed after full resolution.
///
/// Only active definitions take part, both as inputs and as chain steps.
/// Resolution runs against the unmodified input, so the result does not
/// depend on iteration order. Running it again on its own output returns
/// an empty list.
pub fn flatten_definitions(definitions: &[RedirectDefinition]) -> Vec<RedirectDefinition> {
    let active: RedirectsBySource = definitions
        .iter()
        .filter(|d| d.is_active())
        .map(|d| (d.source.clone(), d.clone()))
        .collect();

    let mut changed: Vec<RedirectDefinition> = active
        .values()
        .filter_map(|def| {
            let resolved = resolve_final_target(&def.target, &active);
            if resolved == def.target || resolved == def.source {
                return None;
            }
            debug!(
                source = %def.source,
                old_target = %def.target,
                new_target = %resolved,
                "flattened redirect chain"
            );
            let mut def = def.clone();
            def.target = resolved;
            Some(def)
        })
        .collect();

    changed.sort_by(|a, b| a.source.cmp(&b.source));
    changed
}
