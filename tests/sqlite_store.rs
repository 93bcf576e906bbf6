use redirects::config::StoreConfig;
use redirects::migrate::migrate_pool;
use redirects::sqlite_store::SqliteStore;
use redirects_core::store::{RedirectStore, SearchFilter};
use redirects_core::{
    Dimension, EntityId, RedirectCode, RedirectDefinition, RedirectError, RedirectionType,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::TempDir;

async fn setup() -> (TempDir, SqliteStore) {
    setup_with(StoreConfig::default()).await
}

async fn setup_with(config: StoreConfig) -> (TempDir, SqliteStore) {
    let tmp = TempDir::new().unwrap();
    let options = SqliteConnectOptions::new()
        .filename(tmp.path().join("redirects.sqlite"))
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    migrate_pool(&pool).await.unwrap();
    (tmp, SqliteStore::from_config(pool, &config))
}

fn de() -> Dimension {
    Dimension::new("de")
}

#[tokio::test]
async fn test_upsert_and_find_roundtrip() {
    let (_tmp, store) = setup().await;

    let mut def = RedirectDefinition::automatic("/a", "/b", de(), Some("node-1".into()));
    def.touch("editor");
    store.upsert_many(&[def.clone()]).await.unwrap();

    let found = store.find(&def.id).await.unwrap().unwrap();
    assert_eq!(found.source, "/a");
    assert_eq!(found.target, "/b");
    assert_eq!(found.content_id.as_deref(), Some("node-1"));
    assert_eq!(found.code, RedirectCode::Permanent);
    assert_eq!(found.redirection_type, RedirectionType::Automatic);
    assert!(found.respect_params && found.transfer_params);
    assert_eq!(found.last_updated_by, "editor");

    assert!(store.find(&EntityId::from("missing")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_upsert_is_idempotent_by_id() {
    let (_tmp, store) = setup().await;

    let mut def = RedirectDefinition::manual("/a", "/b", RedirectCode::Found, de());
    store.upsert_many(&[def.clone()]).await.unwrap();
    def.target = "/c".into();
    store.upsert_many(&[def.clone()]).await.unwrap();
    store.upsert_many(&[def.clone()]).await.unwrap();

    let all = store.find_all_by_dimension(&de(), false).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].target, "/c");
}

#[tokio::test]
async fn test_upsert_replaces_other_owner_of_source() {
    let (_tmp, store) = setup().await;

    let first = RedirectDefinition::manual("/a", "/b", RedirectCode::Found, de());
    let second = RedirectDefinition::automatic("/a", "/c", de(), None);
    store.upsert_many(&[first.clone()]).await.unwrap();
    store.upsert_many(&[second.clone()]).await.unwrap();

    let all = store.find_all_by_dimension(&de(), false).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, second.id);
    assert!(store.find(&first.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_find_all_groups_active_by_dimension() {
    let (_tmp, store) = setup().await;

    let mut stale = RedirectDefinition::manual("/s", "/t", RedirectCode::Found, de());
    stale.stale = true;
    let defs = vec![
        RedirectDefinition::manual("/a", "/b", RedirectCode::Found, de()),
        RedirectDefinition::manual("/a", "/x", RedirectCode::Found, Dimension::new("com")),
        stale,
    ];
    store.upsert_many(&defs).await.unwrap();

    let active = store.find_all(true).await.unwrap();
    assert_eq!(active.len(), 2);
    assert_eq!(active[&de()].len(), 1);
    assert_eq!(active[&Dimension::new("com")]["/a"].target, "/x");

    let everything = store.find_all(false).await.unwrap();
    assert_eq!(everything[&de()].len(), 2);
}

#[tokio::test]
async fn test_writes_in_batches() {
    let (_tmp, store) = setup_with(StoreConfig {
        batch_size: 7,
        ..StoreConfig::default()
    })
    .await;

    let defs: Vec<RedirectDefinition> = (0..25)
        .map(|i| {
            RedirectDefinition::manual(format!("/p{i}"), "/target", RedirectCode::Found, de())
        })
        .collect();
    store.upsert_many(&defs).await.unwrap();

    assert_eq!(store.find_all_by_dimension(&de(), false).await.unwrap().len(), 25);

    let ids: Vec<EntityId> = defs.iter().take(20).map(|d| d.id.clone()).collect();
    store.delete_many(&ids).await.unwrap();

    let left = store.find_all_by_dimension(&de(), false).await.unwrap();
    assert_eq!(left.len(), 5);
}

#[tokio::test]
async fn test_search_filters() {
    let (_tmp, store) = setup().await;

    let mut stale = RedirectDefinition::automatic("/Shoes/old", "/shoes/new", de(), None);
    stale.stale = true;
    let defs = vec![
        RedirectDefinition::manual("/shoes/manual", "/x", RedirectCode::Found, de()),
        RedirectDefinition::manual("/50%_off", "/sale", RedirectCode::Found, de()),
        RedirectDefinition::automatic("/shoes", "/y", Dimension::new("com"), None),
        stale,
    ];
    store.upsert_many(&defs).await.unwrap();

    let found = store
        .search(&SearchFilter {
            dimension: Some(de()),
            source_contains: Some("shoes".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let sources: Vec<&str> = found.iter().map(|d| d.source.as_str()).collect();
    assert_eq!(sources, vec!["/Shoes/old", "/shoes/manual"]);

    let inactive = store
        .search(&SearchFilter {
            active: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(inactive.len(), 1);
    assert_eq!(inactive[0].source, "/Shoes/old");

    let literal = store
        .search(&SearchFilter {
            source_contains: Some("%_".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(literal.len(), 1);
    assert_eq!(literal[0].source, "/50%_off");

    let automatic = store
        .search(&SearchFilter {
            redirection_type: Some(RedirectionType::Automatic),
            active: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(automatic.len(), 1);
    assert_eq!(automatic[0].dimension, Dimension::new("com"));
}

#[tokio::test]
async fn test_apply_is_atomic_and_retried() {
    let (_tmp, store) = setup_with(StoreConfig {
        max_retries: 3,
        retry_backoff_ms: 5,
        ..StoreConfig::default()
    })
    .await;

    let locked = RedirectDefinition::automatic("/locked", "/gone", de(), None);
    let dead = RedirectDefinition::automatic("/old", "/gone", de(), None);
    store.upsert_many(&[locked.clone(), dead.clone()]).await.unwrap();
    sqlx::query(
        "CREATE TRIGGER keep_locked BEFORE DELETE ON redirects \
         WHEN OLD.source = '/locked' BEGIN SELECT RAISE(ABORT, 'row is locked'); END",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let moved = RedirectDefinition::automatic("/shoes", "/footwear", de(), None);
    let err = store
        .apply(&[moved.clone()], &[dead.id.clone(), locked.id.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, RedirectError::StoreUnavailable(_)));
    assert!(err.to_string().contains("apply failed after 3 attempts"));

    assert!(store.find(&moved.id).await.unwrap().is_none());
    assert!(store.find(&dead.id).await.unwrap().is_some());
    assert!(store.find(&locked.id).await.unwrap().is_some());

    store.apply(&[moved.clone()], &[dead.id.clone()]).await.unwrap();
    let sources: Vec<String> = store
        .find_all_by_dimension(&de(), false)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.source)
        .collect();
    assert_eq!(sources, vec!["/locked", "/shoes"]);
}
