use anyhow::Result;
use catalog_import::adapters::MemoryKvStore;
use catalog_import::api::ApiClient;
use catalog_import::config::{ApiConfig, CacheConfig, MarketplaceTable};
use catalog_import::core::Cache;
use catalog_import::domain::model::{Credentials, ItemCode};
use catalog_import::domain::ports::ProductApi;
use catalog_import::ImportError;
use httpmock::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const TARGET_GET_ITEMS: &str = "com.amazon.paapi5.v1.ProductAdvertisingAPIv1.GetItems";

fn credentials() -> Credentials {
    Credentials {
        access_key: "AKIDEXAMPLE".into(),
        secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
        partner_tag: "shop-20".into(),
        marketplace: "US".into(),
    }
}

fn api_config(server: &MockServer) -> ApiConfig {
    ApiConfig {
        endpoint: Some(server.base_url()),
        max_attempts: 3,
        base_delay_ms: 10,
        max_delay_ms: 100,
        requests_per_second: 0,
        ..ApiConfig::default()
    }
}

fn client(config: ApiConfig, cache: Option<Arc<Cache>>) -> Result<ApiClient> {
    Ok(ApiClient::new(credentials(), &MarketplaceTable::builtin(), config, cache)?)
}

fn codes(raw: &[&str]) -> Vec<ItemCode> {
    raw.iter().map(|c| ItemCode::parse(c).unwrap()).collect()
}

fn item(code: &str) -> Value {
    json!({
        "ASIN": code,
        "ItemInfo": { "Title": { "DisplayValue": format!("Item {}", code) } }
    })
}

/// 請求需帶有簽章相關標頭與 PA-API 的 body 欄位
#[tokio::test]
async fn test_get_items_sends_signed_request() -> Result<()> {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/paapi5/getitems")
                .header("x-amz-target", TARGET_GET_ITEMS)
                .header("content-encoding", "amz-1.0")
                .header_exists("x-amz-date")
                .header_exists("authorization")
                .json_body_partial(r#"{ "PartnerTag": "shop-20", "PartnerType": "Associates", "Marketplace": "www.amazon.com" }"#)
                .body_contains("B000000001");
            then.status(200)
                .json_body(json!({ "ItemsResult": { "Items": [item("B000000001")] } }));
        })
        .await;

    let api = client(api_config(&server), None)?;
    let result = api
        .fetch_items(&codes(&["B000000001"]), &[], &CancellationToken::new())
        .await?;

    mock.assert_async().await;
    assert!(!result.is_partial());
    assert_eq!(result.payload["ItemsResult"]["Items"][0]["ASIN"], "B000000001");
    Ok(())
}

/// 相同請求第二次由快取回應
#[tokio::test]
async fn test_repeated_request_served_from_cache() -> Result<()> {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/paapi5/getitems");
            then.status(200)
                .json_body(json!({ "ItemsResult": { "Items": [item("B000000001")] } }));
        })
        .await;

    let cache = Arc::new(Cache::new(Arc::new(MemoryKvStore::new()), CacheConfig::default()));
    let api = client(api_config(&server), Some(cache.clone()))?;
    let cancel = CancellationToken::new();

    let first = api.fetch_items(&codes(&["B000000001"]), &[], &cancel).await?;
    let second = api.fetch_items(&codes(&["B000000001"]), &[], &cancel).await?;

    assert_eq!(first.payload, second.payload);
    assert_eq!(mock.hits_async().await, 1);
    let stats = cache.statistics().await;
    assert_eq!(stats.hits, 1);
    Ok(())
}

/// 被節流後退避重試，最後成功
#[tokio::test]
async fn test_throttle_then_success() -> Result<()> {
    let server = MockServer::start_async().await;
    let mut throttled = server
        .mock_async(|when, then| {
            when.method(POST).path("/paapi5/getitems");
            then.status(429).json_body(json!({
                "Errors": [{ "Code": "TooManyRequests", "Message": "slow down" }]
            }));
        })
        .await;

    let config = ApiConfig {
        base_delay_ms: 300,
        max_delay_ms: 1_000,
        ..api_config(&server)
    };
    let api = Arc::new(client(config, None)?);

    let started = Instant::now();
    let worker = api.clone();
    let request = tokio::spawn(async move {
        worker
            .fetch_items(&codes(&["B000000001"]), &[], &CancellationToken::new())
            .await
    });

    // 第一次被節流後換成成功的回應
    while throttled.hits_async().await == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    throttled.delete_async().await;
    let ok = server
        .mock_async(|when, then| {
            when.method(POST).path("/paapi5/getitems");
            then.status(200)
                .json_body(json!({ "ItemsResult": { "Items": [item("B000000001")] } }));
        })
        .await;

    let result = request.await??;
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(ok.hits_async().await, 1);
    assert_eq!(result.payload["ItemsResult"]["Items"][0]["ASIN"], "B000000001");
    Ok(())
}

/// 限速時連續請求之間至少相隔 1/rps 秒
#[tokio::test]
async fn test_requests_are_paced_by_rate_limit() -> Result<()> {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/paapi5/getitems");
            then.status(200)
                .json_body(json!({ "ItemsResult": { "Items": [item("B000000001")] } }));
        })
        .await;

    let config = ApiConfig {
        requests_per_second: 5,
        ..api_config(&server)
    };
    let api = client(config, None)?;
    let cancel = CancellationToken::new();

    let started = Instant::now();
    for code in ["B000000001", "B000000002", "B000000003", "B000000004"] {
        api.fetch_items(&codes(&[code]), &[], &cancel).await?;
    }

    // 第一個請求立即送出，之後每個間隔 200ms
    assert!(started.elapsed() >= Duration::from_millis(550));
    assert_eq!(mock.hits_async().await, 4);
    Ok(())
}

/// 等待限速配額時也能被取消
#[tokio::test]
async fn test_cancel_interrupts_rate_limit_wait() -> Result<()> {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/paapi5/getitems");
            then.status(200)
                .json_body(json!({ "ItemsResult": { "Items": [item("B000000001")] } }));
        })
        .await;

    let config = ApiConfig {
        requests_per_second: 1,
        ..api_config(&server)
    };
    let api = client(config, None)?;
    let cancel = CancellationToken::new();
    api.fetch_items(&codes(&["B000000001"]), &[], &cancel).await?;

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = api
        .fetch_items(&codes(&["B000000002"]), &[], &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ImportError::Cancelled));
    assert!(started.elapsed() < Duration::from_millis(800));
    assert_eq!(mock.hits_async().await, 1);
    Ok(())
}

/// 憑證錯誤不重試
#[tokio::test]
async fn test_auth_failure_is_not_retried() -> Result<()> {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/paapi5/getitems");
            then.status(403).json_body(json!({
                "Errors": [{ "Code": "InvalidSignature", "Message": "signature mismatch" }]
            }));
        })
        .await;

    let api = client(api_config(&server), None)?;
    let err = api
        .fetch_items(&codes(&["B000000001"]), &[], &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_auth());
    assert_eq!(mock.hits_async().await, 1);
    Ok(())
}

/// 暫時性錯誤用盡重試次數
#[tokio::test]
async fn test_server_errors_exhaust_retries() -> Result<()> {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/paapi5/getitems");
            then.status(503).body("unavailable");
        })
        .await;

    let api = client(api_config(&server), None)?;
    let err = api
        .fetch_items(&codes(&["B000000001"]), &[], &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        ImportError::ExhaustedRetries { attempts, last } => {
            assert_eq!(attempts, 3);
            assert_eq!(last.kind(), "transient_network");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(mock.hits_async().await, 3);
    Ok(())
}

/// 超過 10 個代碼時拆成多個請求，部分失敗不影響其他子請求
#[tokio::test]
async fn test_large_request_is_chunked_with_partial_failure() -> Result<()> {
    let server = MockServer::start_async().await;
    let all: Vec<String> = (1..=12).map(|n| format!("B{:09}", n)).collect();

    // 回傳順序刻意與輸入相反
    let first_chunk: Vec<Value> = all[..10].iter().rev().map(|c| item(c)).collect();
    let first = server
        .mock_async(|when, then| {
            when.method(POST).path("/paapi5/getitems").body_contains("B000000001");
            then.status(200).json_body(json!({
                "ItemsResult": { "Items": first_chunk },
                "Errors": [{ "Code": "ItemNotAccessible", "Message": "B000000005 is not accessible" }]
            }));
        })
        .await;
    let second = server
        .mock_async(|when, then| {
            when.method(POST).path("/paapi5/getitems").body_contains("B000000011");
            then.status(500).body("boom");
        })
        .await;

    let api = client(api_config(&server), None)?;
    let requested: Vec<&str> = all.iter().map(String::as_str).collect();
    let result = api
        .fetch_items(&codes(&requested), &[], &CancellationToken::new())
        .await?;

    assert_eq!(first.hits_async().await, 1);
    assert_eq!(second.hits_async().await, 3);
    assert!(result.is_partial());

    let items = result.payload["ItemsResult"]["Items"].as_array().unwrap();
    assert_eq!(items.len(), 10);
    assert_eq!(items[0]["ASIN"], "B000000001");
    assert_eq!(items[9]["ASIN"], "B000000010");
    assert_eq!(result.payload["Errors"][0]["Code"], "ItemNotAccessible");

    let failed = ItemCode::parse("B000000012")?;
    assert!(result.failure_for(&failed).is_some());
    assert!(result.failure_for(&ItemCode::parse("B000000003")?).is_none());
    Ok(())
}

/// 取消會中斷退避等待
#[tokio::test]
async fn test_cancel_interrupts_backoff() -> Result<()> {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/paapi5/getitems");
            then.status(429).body("{}");
        })
        .await;

    let config = ApiConfig {
        base_delay_ms: 5_000,
        max_delay_ms: 5_000,
        ..api_config(&server)
    };
    let api = client(config, None)?;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = api
        .fetch_items(&codes(&["B000000001"]), &[], &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ImportError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}

/// 變體依 PageCount 逐頁抓取並合併
#[tokio::test]
async fn test_variations_follow_page_count() -> Result<()> {
    let server = MockServer::start_async().await;
    let page_one = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/paapi5/getvariations")
                .json_body_partial(r#"{ "VariationPage": 1 }"#);
            then.status(200).json_body(json!({
                "VariationsResult": {
                    "Items": [{ "ASIN": "B0VAR00001" }],
                    "VariationSummary": { "PageCount": 2 }
                }
            }));
        })
        .await;
    let page_two = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/paapi5/getvariations")
                .json_body_partial(r#"{ "VariationPage": 2 }"#);
            then.status(200).json_body(json!({
                "VariationsResult": { "Items": [{ "ASIN": "B0VAR00002" }] }
            }));
        })
        .await;

    let api = client(api_config(&server), None)?;
    let raw = api
        .fetch_variations(&ItemCode::parse("B0PARENT01")?, &[], &CancellationToken::new())
        .await?;

    assert_eq!(page_one.hits_async().await, 1);
    assert_eq!(page_two.hits_async().await, 1);
    let items = raw["VariationsResult"]["Items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(raw["VariationsResult"]["VariationSummary"]["PageCount"], 2);
    Ok(())
}
