//! Store decorator that bounds every call with a timeout.
//!
//! A call that does not finish in time fails with `StoreUnavailable`; the
//! caller retries the whole operation rather than applying part of it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redirects_core::store::{DimensionSnapshot, RedirectStore, SearchFilter};
use redirects_core::{Dimension, EntityId, RedirectDefinition, RedirectError, Result};

pub struct BoundedStore {
    inner: Arc<dyn RedirectStore>,
    timeout: Duration,
}

impl BoundedStore {
    pub fn new(inner: Arc<dyn RedirectStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut).await.map_err(|_| {
            RedirectError::unavailable(format!("{op} did not finish within {:?}", self.timeout))
        })?
    }
}

#[async_trait]
impl RedirectStore for BoundedStore {
    async fn find_all_by_dimension(
        &self,
        dimension: &Dimension,
        only_active: bool,
    ) -> Result<Vec<RedirectDefinition>> {
        self.bounded(
            "find_all_by_dimension",
            self.inner.find_all_by_dimension(dimension, only_active),
        )
        .await
    }

    async fn find_all(&self, only_active: bool) -> Result<DimensionSnapshot> {
        self.bounded("find_all", self.inner.find_all(only_active)).await
    }

    async fn find(&self, id: &EntityId) -> Result<Option<RedirectDefinition>> {
        self.bounded("find", self.inner.find(id)).await
    }

    async fn upsert_many(&self, definitions: &[RedirectDefinition]) -> Result<()> {
        self.bounded("upsert_many", self.inner.upsert_many(definitions)).await
    }

    async fn delete_many(&self, ids: &[EntityId]) -> Result<()> {
        self.bounded("delete_many", self.inner.delete_many(ids)).await
    }

    async fn apply(&self, upserts: &[RedirectDefinition], deletes: &[EntityId]) -> Result<()> {
        self.bounded("apply", self.inner.apply(upserts, deletes)).await
    }

    async fn search(&self, filter: &SearchFilter) -> Result<Vec<RedirectDefinition>> {
        self.bounded("search", self.inner.search(filter)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowStore;

    #[async_trait]
    impl RedirectStore for SlowStore {
        async fn find_all_by_dimension(
            &self,
            _: &Dimension,
            _: bool,
        ) -> Result<Vec<RedirectDefinition>> {
            std::future::pending().await
        }
        async fn find_all(&self, _: bool) -> Result<DimensionSnapshot> {
            std::future::pending().await
        }
        async fn find(&self, _: &EntityId) -> Result<Option<RedirectDefinition>> {
            Ok(None)
        }
        async fn upsert_many(&self, _: &[RedirectDefinition]) -> Result<()> {
            Ok(())
        }
        async fn delete_many(&self, _: &[EntityId]) -> Result<()> {
            Ok(())
        }
        async fn apply(&self, _: &[RedirectDefinition], _: &[EntityId]) -> Result<()> {
            std::future::pending().await
        }
        async fn search(&self, _: &SearchFilter) -> Result<Vec<RedirectDefinition>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let store = BoundedStore::new(Arc::new(SlowStore), Duration::from_millis(20));
        let err = store.find_all(true).await.unwrap_err();
        assert!(matches!(err, RedirectError::StoreUnavailable(_)));
        assert!(store.find(&EntityId::from("x")).await.unwrap().is_none());
        assert!(matches!(
            store.apply(&[], &[]).await,
            Err(RedirectError::StoreUnavailable(_))
        ));
    }
}
