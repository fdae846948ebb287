use anyhow::Result;
use catalog_import::adapters::{FileKvStore, KvCatalogStore};
use catalog_import::config::CacheConfig;
use catalog_import::core::{Cache, CacheGroup};
use catalog_import::domain::ports::KvStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_set_get_delete_roundtrip() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = FileKvStore::new(temp_dir.path().join("state"));

    assert!(store.get("batch:job:1").await?.is_none());
    store
        .set("batch:job:1", json!({ "status": "running" }), None)
        .await?;
    assert_eq!(
        store.get("batch:job:1").await?,
        Some(json!({ "status": "running" }))
    );

    assert!(store.delete("batch:job:1").await?);
    assert!(!store.delete("batch:job:1").await?);
    assert!(store.get("batch:job:1").await?.is_none());
    Ok(())
}

/// 過期的項目讀不到，也可以被 set_if_absent 取代
#[tokio::test]
async fn test_ttl_expiry_and_set_if_absent() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = FileKvStore::new(temp_dir.path());

    assert!(
        store
            .set_if_absent("batch:lock:import", json!("a"), Some(Duration::from_millis(50)))
            .await?
    );
    assert!(
        !store
            .set_if_absent("batch:lock:import", json!("b"), None)
            .await?
    );
    assert_eq!(store.get("batch:lock:import").await?, Some(json!("a")));

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(store.get("batch:lock:import").await?.is_none());
    assert!(
        store
            .set_if_absent("batch:lock:import", json!("b"), None)
            .await?
    );
    assert_eq!(store.get("batch:lock:import").await?, Some(json!("b")));
    Ok(())
}

#[tokio::test]
async fn test_scan_and_delete_prefix() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = FileKvStore::new(temp_dir.path());

    store.set("cache:products:b", json!(2), None).await?;
    store.set("cache:products:a", json!(1), None).await?;
    store.set("cache:searches:a", json!(3), None).await?;

    let found = store.scan_prefix("cache:products:").await?;
    let keys: Vec<&str> = found.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["cache:products:a", "cache:products:b"]);

    assert_eq!(store.delete_prefix("cache:products:").await?, 2);
    assert!(store.scan_prefix("cache:products:").await?.is_empty());
    assert_eq!(store.scan_prefix("cache:").await?.len(), 1);
    Ok(())
}

/// 不同的 store 實例共用同一目錄時看得到彼此的寫入
#[tokio::test]
async fn test_state_shared_between_instances() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let writer: Arc<dyn KvStore> = Arc::new(FileKvStore::new(temp_dir.path()));
    let reader: Arc<dyn KvStore> = Arc::new(FileKvStore::new(temp_dir.path()));

    let cache = Cache::new(writer, CacheConfig::default());
    assert!(cache.set("GetItems:US:B000000001", json!({ "ok": true }), CacheGroup::Products, None).await);

    let other = Cache::new(reader, CacheConfig::default());
    assert_eq!(
        other.get("GetItems:US:B000000001", CacheGroup::Products).await,
        Some(json!({ "ok": true }))
    );
    assert_eq!(other.clear_group(CacheGroup::Products).await, 1);
    Ok(())
}

#[tokio::test]
async fn test_catalog_persists_across_instances() -> Result<()> {
    use catalog_import::domain::model::ItemCode;
    use catalog_import::domain::ports::CatalogStore;

    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("catalog");
    let code = ItemCode::parse("B000000001")?;

    let record: catalog_import::domain::model::ProductRecord = serde_json::from_value(json!({
        "code": "B000000001",
        "title": "Desk lamp",
        "description": null,
        "short_description": null,
        "price": null,
        "availability": { "status": "in_stock", "message": null },
        "brand": null,
        "features": [],
        "primary_image": null,
        "variant_images": [],
        "category_path": [],
        "detail_page_url": null,
        "parent_code": null,
        "dimensions": [],
        "variations": []
    }))?;

    let first = KvCatalogStore::new(Arc::new(FileKvStore::new(&path)));
    let saved = first.upsert(&record).await?;
    assert!(saved.created);

    let second = KvCatalogStore::new(Arc::new(FileKvStore::new(&path)));
    assert!(second.exists(&code).await?);
    assert_eq!(second.get_id_by_code(&code).await?, Some(saved.id));
    Ok(())
}
