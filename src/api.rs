//! Facade over the composed commands and the read queries.
//!
//! All writes go through one async mutex, so consolidation never runs
//! concurrently with another write. Every store call is bounded by the
//! configured timeout.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;

use redirects_core::store::{DimensionSnapshot, RedirectStore, SearchFilter};
use redirects_core::{Dimension, EntityId, RedirectDefinition, RedirectionType, Result};

use crate::bounded_store::BoundedStore;
use crate::commands::{
    auto_create, compose, consolidate_with, publish, validate, Changes, ContentState,
    CreateRedirect, CreateRedirects, DeleteDefinition, DeleteRedirect, FlattenAll, Flatten,
    Handler, PersistChanges, PersistDefinition, PersistState, RestrictedSources, UpdateRedirect,
    UpdateRedirectsState,
};
use crate::config::Config;
use crate::signal::Publisher;

/// Settings for [`RedirectsApi`], usually taken from `[api]` and `[store]`.
#[derive(Debug, Clone)]
pub struct ApiOptions {
    pub restricted_sources: Vec<String>,
    pub automatic_initially_stale: bool,
    pub default_user: String,
    pub store_timeout: Duration,
}

impl Default for ApiOptions {
    fn default() -> Self {
        Self {
            restricted_sources: Vec::new(),
            automatic_initially_stale: false,
            default_user: "unknown".to_string(),
            store_timeout: Duration::from_secs(10),
        }
    }
}

impl ApiOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            restricted_sources: config.api.restricted_sources.clone(),
            automatic_initially_stale: config.api.automatic_initially_stale,
            default_user: config.api.default_user.clone(),
            store_timeout: config.store.timeout(),
        }
    }
}

/// A user-authored redirect as submitted by a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRedirect {
    pub source: String,
    pub target: String,
    pub code: u16,
    pub dimension: Dimension,
    #[serde(default)]
    pub respect_params: bool,
    #[serde(default)]
    pub transfer_params: bool,
    #[serde(default)]
    pub stale: bool,
}

pub struct RedirectsApi {
    store: Arc<dyn RedirectStore>,
    default_user: String,
    writes: Mutex<()>,
    create_redirects: Handler<CreateRedirects>,
    create_redirect: Handler<CreateRedirect>,
    update_redirect: Handler<UpdateRedirect>,
    delete_redirect: Handler<DeleteRedirect>,
    update_state: Handler<UpdateRedirectsState>,
    flatten: Handler<Flatten>,
}

impl RedirectsApi {
    pub fn new(
        store: Arc<dyn RedirectStore>,
        publisher: Arc<dyn Publisher>,
        options: ApiOptions,
    ) -> Result<Self> {
        let store: Arc<dyn RedirectStore> =
            Arc::new(BoundedStore::new(store, options.store_timeout));
        let restricted = Arc::new(RestrictedSources::new(&options.restricted_sources)?);

        let create_redirects = compose::<CreateRedirects>(
            Arc::new(PersistChanges {
                store: store.clone(),
            }),
            vec![
                publish(publisher.clone()),
                auto_create(options.automatic_initially_stale),
                consolidate_with(store.clone()),
            ],
        );
        let create_redirect = compose::<CreateRedirect>(
            Arc::new(PersistDefinition {
                store: store.clone(),
            }),
            vec![
                publish(publisher.clone()),
                validate(store.clone(), restricted.clone()),
            ],
        );
        let update_redirect = compose::<UpdateRedirect>(
            Arc::new(PersistDefinition {
                store: store.clone(),
            }),
            vec![
                publish(publisher.clone()),
                validate(store.clone(), restricted),
            ],
        );
        let delete_redirect = compose::<DeleteRedirect>(
            Arc::new(DeleteDefinition {
                store: store.clone(),
            }),
            vec![publish(publisher.clone())],
        );
        let update_state = compose::<UpdateRedirectsState>(
            Arc::new(PersistState {
                store: store.clone(),
            }),
            vec![publish(publisher.clone())],
        );
        let flatten = compose::<Flatten>(
            Arc::new(FlattenAll {
                store: store.clone(),
            }),
            vec![publish(publisher)],
        );

        Ok(Self {
            store,
            default_user: options.default_user,
            writes: Mutex::new(()),
            create_redirects,
            create_redirect,
            update_redirect,
            delete_redirect,
            update_state,
            flatten,
        })
    }

    fn user(&self, user: Option<&str>) -> String {
        match user {
            Some(u) if !u.trim().is_empty() => u.to_string(),
            _ => self.default_user.clone(),
        }
    }

    /// Derives automatic redirects from a content update and consolidates
    /// them into the stored set.
    pub async fn create_redirects_from_content(
        &self,
        old_state: ContentState,
        new_state: ContentState,
        user: Option<&str>,
    ) -> Result<Changes> {
        let command = CreateRedirects {
            old_state,
            new_state,
            user: self.user(user),
            ..Default::default()
        };
        let _guard = self.writes.lock().await;
        self.create_redirects.handle(command).await
    }

    /// Creates a manual redirect with a fresh id.
    pub async fn create_redirect(
        &self,
        input: NewRedirect,
        user: Option<&str>,
    ) -> Result<RedirectDefinition> {
        let code = RedirectDefinition::validate_code(input.code)?;
        let mut definition =
            RedirectDefinition::manual(input.source, input.target, code, input.dimension);
        definition.respect_params = input.respect_params;
        definition.transfer_params = input.transfer_params;
        definition.stale = input.stale;
        definition.touch(&self.user(user));

        let _guard = self.writes.lock().await;
        self.create_redirect
            .handle(CreateRedirect {
                definition: definition.clone(),
            })
            .await?;
        Ok(definition)
    }

    /// Replaces a stored redirect. Updated redirects become manual.
    pub async fn update_redirect(
        &self,
        mut definition: RedirectDefinition,
        user: Option<&str>,
    ) -> Result<RedirectDefinition> {
        definition.redirection_type = RedirectionType::Manual;
        definition.touch(&self.user(user));

        let _guard = self.writes.lock().await;
        self.update_redirect
            .handle(UpdateRedirect {
                definition: definition.clone(),
            })
            .await?;
        Ok(definition)
    }

    pub async fn delete_redirect(&self, id: EntityId) -> Result<()> {
        let _guard = self.writes.lock().await;
        self.delete_redirect.handle(DeleteRedirect { id }).await?;
        Ok(())
    }

    /// Activates (`stale = false`) or deactivates redirects by id.
    pub async fn update_redirects_state(
        &self,
        ids: Vec<EntityId>,
        stale: bool,
        user: Option<&str>,
    ) -> Result<Changes> {
        let command = UpdateRedirectsState {
            ids,
            stale,
            user: self.user(user),
        };
        let _guard = self.writes.lock().await;
        self.update_state.handle(command).await
    }

    /// Runs the flattening pass over every dimension.
    pub async fn flatten(&self, user: Option<&str>) -> Result<Changes> {
        let command = Flatten {
            user: self.user(user),
        };
        let _guard = self.writes.lock().await;
        self.flatten.handle(command).await
    }

    /// Active redirects of every dimension, keyed by source.
    pub async fn get_redirects(&self) -> Result<DimensionSnapshot> {
        self.store.find_all(true).await
    }

    pub async fn search(&self, filter: &SearchFilter) -> Result<Vec<RedirectDefinition>> {
        self.store.search(filter).await
    }
}
