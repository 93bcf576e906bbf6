//! Write commands composed from middleware at construction time.
//!
//! Every command has a terminal [`CommandHandler`] that talks to the store.
//! Cross-cutting steps (publishing the update signal, deriving redirects
//! from a content diff, consolidation, validation) are middleware that
//! wrap the next handler. [`compose`] applies a list of middleware,
//! outermost first:
//!
//! ```text
//! CreateRedirects: publish → auto_create → consolidate → PersistChanges
//! CreateRedirect:  publish → validate → PersistDefinition
//! UpdateRedirect:  publish → validate → PersistDefinition
//! DeleteRedirect:  publish → DeleteDefinition
//! UpdateRedirectsState: publish → PersistState
//! Flatten:         publish → FlattenAll
//! ```
//!
//! The publish middleware only signals when the wrapped handler reports
//! changes, so a no-op command never triggers an index reload.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use redirects_core::chain::has_cycle;
use redirects_core::consolidate::consolidate;
use redirects_core::flatten::flatten_definitions;
use redirects_core::store::RedirectStore;
use redirects_core::tree::{available_targets, diff_trees, flatten_tree, ContentNode};
use redirects_core::{
    Dimension, EntityId, RedirectDefinition, RedirectError, RedirectsBySource, Result,
};

use crate::signal::Publisher;

/// Content-export state: dimension → root node.
pub type ContentState = BTreeMap<String, ContentNode>;

/// What a command wrote.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Changes {
    pub upserted: Vec<RedirectDefinition>,
    pub deleted: Vec<EntityId>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.deleted.is_empty()
    }
}

#[async_trait]
pub trait CommandHandler<C: Send + 'static>: Send + Sync {
    async fn handle(&self, command: C) -> Result<Changes>;
}

pub type Handler<C> = Arc<dyn CommandHandler<C>>;

/// Wraps a handler in another one.
pub type Middleware<C> = Box<dyn FnOnce(Handler<C>) -> Handler<C> + Send>;

/// Applies `middlewares` around `handler`; the first entry ends up
/// outermost.
pub fn compose<C: Send + 'static>(handler: Handler<C>, middlewares: Vec<Middleware<C>>) -> Handler<C> {
    middlewares
        .into_iter()
        .rev()
        .fold(handler, |next, middleware| middleware(next))
}

// ============ Commands ============

/// Derive, consolidate and persist automatic redirects for a content update.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRedirects {
    pub old_state: ContentState,
    pub new_state: ContentState,
    #[serde(skip)]
    pub user: String,
    #[serde(skip)]
    pub to_upsert: Vec<RedirectDefinition>,
    #[serde(skip)]
    pub to_delete: Vec<EntityId>,
}

#[derive(Debug, Clone)]
pub struct CreateRedirect {
    pub definition: RedirectDefinition,
}

#[derive(Debug, Clone)]
pub struct UpdateRedirect {
    pub definition: RedirectDefinition,
}

#[derive(Debug, Clone)]
pub struct DeleteRedirect {
    pub id: EntityId,
}

#[derive(Debug, Clone)]
pub struct UpdateRedirectsState {
    pub ids: Vec<EntityId>,
    pub stale: bool,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct Flatten {
    pub user: String,
}

/// Commands that write a single user-supplied definition.
pub trait DefinitionCommand: Send + 'static {
    /// Whether the definition must already exist.
    const UPDATES_EXISTING: bool;

    fn definition(&self) -> &RedirectDefinition;
    fn into_definition(self) -> RedirectDefinition;
}

impl DefinitionCommand for CreateRedirect {
    const UPDATES_EXISTING: bool = false;

    fn definition(&self) -> &RedirectDefinition {
        &self.definition
    }

    fn into_definition(self) -> RedirectDefinition {
        self.definition
    }
}

impl DefinitionCommand for UpdateRedirect {
    const UPDATES_EXISTING: bool = true;

    fn definition(&self) -> &RedirectDefinition {
        &self.definition
    }

    fn into_definition(self) -> RedirectDefinition {
        self.definition
    }
}

// ============ Middleware ============

struct Publish<C: Send + 'static> {
    publisher: Arc<dyn Publisher>,
    next: Handler<C>,
}

#[async_trait]
impl<C: Send + 'static> CommandHandler<C> for Publish<C> {
    async fn handle(&self, command: C) -> Result<Changes> {
        let changes = self.next.handle(command).await?;
        if changes.is_empty() {
            debug!("no changes, skipping update signal");
        } else {
            info!(
                upserted = changes.upserted.len(),
                deleted = changes.deleted.len(),
                "publishing update signal"
            );
            self.publisher.publish()?;
        }
        Ok(changes)
    }
}

/// Publishes the update signal after the wrapped handler wrote something.
pub fn publish<C: Send + 'static>(publisher: Arc<dyn Publisher>) -> Middleware<C> {
    Box::new(move |next: Handler<C>| -> Handler<C> { Arc::new(Publish { publisher, next }) })
}

struct AutoCreate {
    initially_stale: bool,
    next: Handler<CreateRedirects>,
}

#[async_trait]
impl CommandHandler<CreateRedirects> for AutoCreate {
    async fn handle(&self, mut command: CreateRedirects) -> Result<Changes> {
        let dimensions: BTreeSet<&String> = command
            .old_state
            .keys()
            .chain(command.new_state.keys())
            .collect();

        let mut derived = Vec::new();
        for key in dimensions {
            let dimension = Dimension::new(key.clone());
            let old_map = flatten_tree(command.old_state.get(key));
            let new_map = flatten_tree(command.new_state.get(key));
            let mut defs = diff_trees(&old_map, &new_map, &dimension)?;
            if self.initially_stale {
                defs.iter_mut().for_each(|d| d.stale = true);
            }
            info!(dimension = %dimension, count = defs.len(), "auto-created redirects");
            derived.extend(defs);
        }

        command.to_upsert.extend(derived);
        self.next.handle(command).await
    }
}

/// Derives automatic redirects from `old_state` → `new_state`, per
/// dimension. Fails with `InvalidInput` if a dimension is missing on
/// either side.
pub fn auto_create(initially_stale: bool) -> Middleware<CreateRedirects> {
    Box::new(move |next: Handler<CreateRedirects>| -> Handler<CreateRedirects> {
        Arc::new(AutoCreate {
            initially_stale,
            next,
        })
    })
}

struct Consolidate {
    store: Arc<dyn RedirectStore>,
    next: Handler<CreateRedirects>,
}

#[async_trait]
impl CommandHandler<CreateRedirects> for Consolidate {
    async fn handle(&self, mut command: CreateRedirects) -> Result<Changes> {
        let derived = std::mem::take(&mut command.to_upsert);
        let mut to_upsert = Vec::new();
        let mut to_delete = Vec::new();

        for (key, root) in &command.new_state {
            let dimension = Dimension::new(key.clone());
            let available = available_targets(&flatten_tree(Some(root)));
            let candidates: Vec<RedirectDefinition> = derived
                .iter()
                .filter(|d| d.dimension == dimension)
                .cloned()
                .collect();

            let current = self.store.find_all_by_dimension(&dimension, false).await?;
            let result = consolidate(&dimension, candidates, &current, &available)?;

            let before: HashMap<&EntityId, &RedirectDefinition> =
                current.iter().map(|d| (&d.id, d)).collect();
            let mut written = 0;
            for mut def in result.upserts {
                if before.get(&def.id).is_some_and(|existing| **existing == def) {
                    continue;
                }
                def.touch(&command.user);
                to_upsert.push(def);
                written += 1;
            }
            info!(
                dimension = %dimension,
                upserts = written,
                deletions = result.deleted_ids.len(),
                "consolidated redirects"
            );
            to_delete.extend(result.deleted_ids);
        }

        command.to_upsert = to_upsert;
        command.to_delete = to_delete;
        self.next.handle(command).await
    }
}

/// Merges derived redirects into the stored set of each dimension in
/// `new_state`. Unchanged definitions are not rewritten.
pub fn consolidate_with(store: Arc<dyn RedirectStore>) -> Middleware<CreateRedirects> {
    Box::new(move |next: Handler<CreateRedirects>| -> Handler<CreateRedirects> {
        Arc::new(Consolidate { store, next })
    })
}

struct Validate<C: DefinitionCommand> {
    store: Arc<dyn RedirectStore>,
    restricted: Arc<RestrictedSources>,
    next: Handler<C>,
}

#[async_trait]
impl<C: DefinitionCommand> CommandHandler<C> for Validate<C> {
    async fn handle(&self, command: C) -> Result<Changes> {
        validate_definition(
            self.store.as_ref(),
            &self.restricted,
            command.definition(),
            C::UPDATES_EXISTING,
        )
        .await?;
        self.next.handle(command).await
    }
}

/// Rejects manual writes that would break a redirect invariant.
pub fn validate<C: DefinitionCommand>(
    store: Arc<dyn RedirectStore>,
    restricted: Arc<RestrictedSources>,
) -> Middleware<C> {
    Box::new(move |next: Handler<C>| -> Handler<C> {
        Arc::new(Validate {
            store,
            restricted,
            next,
        })
    })
}

/// Glob patterns no manual redirect may use as its source. Matching is
/// case-insensitive and `*` does not cross `/`.
pub struct RestrictedSources {
    patterns: Vec<String>,
    set: GlobSet,
}

impl RestrictedSources {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(true)
                .literal_separator(true)
                .build()
                .map_err(|e| RedirectError::invalid(format!("invalid restricted source '{pattern}': {e}")))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| RedirectError::invalid(format!("invalid restricted sources: {e}")))?;
        Ok(Self {
            patterns: patterns.to_vec(),
            set,
        })
    }

    /// The first pattern matching `source`, if any.
    pub fn matching(&self, source: &str) -> Option<&str> {
        self.set
            .matches(source)
            .first()
            .map(|&i| self.patterns[i].as_str())
    }
}

async fn validate_definition(
    store: &dyn RedirectStore,
    restricted: &RestrictedSources,
    def: &RedirectDefinition,
    updates_existing: bool,
) -> Result<()> {
    let source = def.source.to_lowercase();
    let target = def.target.to_lowercase();

    if source.is_empty() || target.is_empty() {
        return Err(RedirectError::invalid("redirect source and target must not be empty"));
    }
    if source == "/" {
        return Err(RedirectError::invalid("redirect from homepage is not allowed"));
    }
    if source == target {
        return Err(RedirectError::invalid(
            "redirect source and target cannot be the same",
        ));
    }
    if let Some(pattern) = restricted.matching(&def.source) {
        return Err(RedirectError::invalid(format!(
            "source '{}' is restricted due to pattern '{pattern}'",
            def.source
        )));
    }
    RedirectDefinition::validate_code(def.code.as_u16())?;

    if updates_existing && store.find(&def.id).await?.is_none() {
        return Err(RedirectError::NotFound(format!("redirect {}", def.id)));
    }

    let existing = store.find_all_by_dimension(&def.dimension, false).await?;
    if let Some(owner) = existing
        .iter()
        .find(|d| d.source == def.source && d.id != def.id)
    {
        return Err(RedirectError::invalid(format!(
            "source '{}' already has a redirect ({}) in dimension '{}'",
            def.source, owner.id, def.dimension
        )));
    }

    let others: RedirectsBySource = existing
        .into_iter()
        .filter(|d| d.id != def.id)
        .map(|d| (d.source.clone(), d))
        .collect();
    if has_cycle(&def.source, &def.target, &others) {
        return Err(RedirectError::invalid(format!(
            "cyclic redirect detected: {} → {} creates a loop",
            def.source, def.target
        )));
    }
    Ok(())
}

// ============ Terminal handlers ============

/// Writes the upserts and deletions accumulated on a [`CreateRedirects`]
/// in one atomic store call.
pub struct PersistChanges {
    pub store: Arc<dyn RedirectStore>,
}

#[async_trait]
impl CommandHandler<CreateRedirects> for PersistChanges {
    async fn handle(&self, command: CreateRedirects) -> Result<Changes> {
        self.store
            .apply(&command.to_upsert, &command.to_delete)
            .await?;
        info!(
            upserted = command.to_upsert.len(),
            deleted = command.to_delete.len(),
            "finished creating automatic redirects"
        );
        Ok(Changes {
            upserted: command.to_upsert,
            deleted: command.to_delete,
        })
    }
}

/// Upserts the single definition of a create or update command.
pub struct PersistDefinition {
    pub store: Arc<dyn RedirectStore>,
}

#[async_trait]
impl<C: DefinitionCommand> CommandHandler<C> for PersistDefinition {
    async fn handle(&self, command: C) -> Result<Changes> {
        let def = command.into_definition();
        self.store.upsert_many(std::slice::from_ref(&def)).await?;
        info!(redirect_id = %def.id, source = %def.source, target = %def.target, "saved redirect");
        Ok(Changes {
            upserted: vec![def],
            deleted: Vec::new(),
        })
    }
}

pub struct DeleteDefinition {
    pub store: Arc<dyn RedirectStore>,
}

#[async_trait]
impl CommandHandler<DeleteRedirect> for DeleteDefinition {
    async fn handle(&self, command: DeleteRedirect) -> Result<Changes> {
        if self.store.find(&command.id).await?.is_none() {
            return Err(RedirectError::NotFound(format!("redirect {}", command.id)));
        }
        self.store.delete_many(std::slice::from_ref(&command.id)).await?;
        info!(redirect_id = %command.id, "deleted redirect");
        Ok(Changes {
            upserted: Vec::new(),
            deleted: vec![command.id],
        })
    }
}

/// Sets or clears `stale` on the given definitions.
pub struct PersistState {
    pub store: Arc<dyn RedirectStore>,
}

#[async_trait]
impl CommandHandler<UpdateRedirectsState> for PersistState {
    async fn handle(&self, command: UpdateRedirectsState) -> Result<Changes> {
        let mut updated = Vec::with_capacity(command.ids.len());
        for id in &command.ids {
            let mut def = self
                .store
                .find(id)
                .await?
                .ok_or_else(|| RedirectError::NotFound(format!("redirect {id}")))?;
            if def.stale == command.stale {
                continue;
            }
            def.stale = command.stale;
            def.touch(&command.user);
            updated.push(def);
        }

        if !updated.is_empty() {
            self.store.upsert_many(&updated).await?;
        }
        info!(count = updated.len(), stale = command.stale, "updated redirect state");
        Ok(Changes {
            upserted: updated,
            deleted: Vec::new(),
        })
    }
}

/// Flattens the active redirects of every dimension and writes only the
/// definitions whose target changed.
pub struct FlattenAll {
    pub store: Arc<dyn RedirectStore>,
}

#[async_trait]
impl CommandHandler<Flatten> for FlattenAll {
    async fn handle(&self, command: Flatten) -> Result<Changes> {
        let snapshot = self.store.find_all(true).await?;
        let mut dimensions: Vec<&Dimension> = snapshot.keys().collect();
        dimensions.sort();

        let mut changed = Vec::new();
        for dimension in dimensions {
            let defs: Vec<RedirectDefinition> = snapshot[dimension].values().cloned().collect();
            let flattened = flatten_definitions(&defs);
            if !flattened.is_empty() {
                debug!(dimension = %dimension, count = flattened.len(), "flattened dimension");
            }
            changed.extend(flattened);
        }

        if changed.is_empty() {
            info!("no redirects changed after flattening");
            return Ok(Changes::default());
        }

        changed.iter_mut().for_each(|d| d.touch(&command.user));
        if let Err(e) = self.store.apply(&changed, &[]).await {
            warn!(error = %e, "failed to persist flattened redirects");
            return Err(e);
        }
        info!(count = changed.len(), "updated flattened redirects");
        Ok(Changes {
            upserted: changed,
            deleted: Vec::new(),
        })
    }
}
