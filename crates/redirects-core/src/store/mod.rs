//! Storage abstraction for redirect definitions.
//!
//! The [`RedirectStore`] trait is the durable-store contract consumed by
//! consolidation, the command API and the redirect index. The SQLite
//! backend lives in the application crate; [`memory::InMemoryStore`] is
//! used by tests and in-process setups.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;
use crate::models::{Dimension, EntityId, RedirectDefinition, RedirectionType, RedirectsBySource};

/// Active definitions of every dimension, keyed by dimension then source.
pub type DimensionSnapshot = HashMap<Dimension, RedirectsBySource>;

/// Criteria for [`RedirectStore::search`]. Unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilter {
    pub dimension: Option<Dimension>,
    /// Case-insensitive substring of `source`.
    pub source_contains: Option<String>,
    pub redirection_type: Option<RedirectionType>,
    /// `Some(true)` keeps active definitions only, `Some(false)` inactive ones.
    pub active: Option<bool>,
}

impl SearchFilter {
    pub fn matches(&self, def: &RedirectDefinition) -> bool {
        if let Some(dimension) = &self.dimension {
            if &def.dimension != dimension {
                return false;
            }
        }
        if let Some(needle) = &self.source_contains {
            if !def.source.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if let Some(kind) = self.redirection_type {
            if def.redirection_type != kind {
                return false;
            }
        }
        if let Some(active) = self.active {
            if def.is_active() != active {
                return false;
            }
        }
        true
    }
}

/// Abstract durable store for redirect definitions.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`find_all_by_dimension`](RedirectStore::find_all_by_dimension) | Every definition of one dimension |
/// | [`find_all`](RedirectStore::find_all) | All dimensions, keyed for the index |
/// | [`find`](RedirectStore::find) | One definition by id |
/// | [`upsert_many`](RedirectStore::upsert_many) | Insert or replace, idempotent by id |
/// | [`delete_many`](RedirectStore::delete_many) | Delete by id |
/// | [`apply`](RedirectStore::apply) | Upserts and deletions as one atomic write |
/// | [`search`](RedirectStore::search) | Filtered listing, sorted by source |
///
/// Failures surface as [`RedirectError::StoreUnavailable`](crate::RedirectError::StoreUnavailable).
#[async_trait]
pub trait RedirectStore: Send + Sync {
    async fn find_all_by_dimension(
        &self,
        dimension: &Dimension,
        only_active: bool,
    ) -> Result<Vec<RedirectDefinition>>;

    async fn find_all(&self, only_active: bool) -> Result<DimensionSnapshot>;

    async fn find(&self, id: &EntityId) -> Result<Option<RedirectDefinition>>;

    async fn upsert_many(&self, definitions: &[RedirectDefinition]) -> Result<()>;

    async fn delete_many(&self, ids: &[EntityId]) -> Result<()>;

    /// Writes `upserts` then removes `deletes`, all or nothing. A failed
    /// call leaves the store as it was.
    async fn apply(&self, upserts: &[RedirectDefinition], deletes: &[EntityId]) -> Result<()>;

    async fn search(&self, filter: &SearchFilter) -> Result<Vec<RedirectDefinition>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RedirectCode;

    #[test]
    fn test_filter_matches_each_criterion() {
        let mut def =
            RedirectDefinition::manual("/Sale/Shoes", "/shoes", RedirectCode::Found, "de".into());

        assert!(SearchFilter::default().matches(&def));

        let by_source = SearchFilter {
            source_contains: Some("sale".into()),
            ..Default::default()
        };
        assert!(by_source.matches(&def));

        let by_dimension = SearchFilter {
            dimension: Some("fr".into()),
            ..Default::default()
        };
        assert!(!by_dimension.matches(&def));

        let automatic_only = SearchFilter {
            redirection_type: Some(RedirectionType::Automatic),
            ..Default::default()
        };
        assert!(!automatic_only.matches(&def));

        let inactive_only = SearchFilter {
            active: Some(false),
            ..Default::default()
        };
        assert!(!inactive_only.matches(&def));
        def.stale = true;
        assert!(inactive_only.matches(&def));
    }
}
