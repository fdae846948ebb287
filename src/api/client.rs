use crate::api::signer::{RequestSigner, SigningInput};
use crate::config::marketplace::{MarketplaceInfo, MarketplaceTable};
use crate::config::ApiConfig;
use crate::core::cache::{Cache, CacheGroup};
use crate::domain::model::{Credentials, ItemCode};
use crate::domain::ports::{ChunkFailure, ItemsResult, ProductApi, SearchRequest};
use crate::utils::error::{ImportError, Result};
use async_trait::async_trait;
use chrono::Utc;
use governor::clock::DefaultClock;
use governor::state::{direct::NotKeyed, InMemoryState};
use governor::{Quota, RateLimiter};
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// 單一 GetItems 請求可帶的代碼上限
pub const MAX_ITEMS_PER_REQUEST: usize = 10;

const SERVICE: &str = "ProductAdvertisingAPI";
const TARGET_PREFIX: &str = "com.amazon.paapi5.v1.ProductAdvertisingAPIv1";

const THROTTLE_CODES: &[&str] = &["TooManyRequests", "RequestThrottled"];
const AUTH_CODES: &[&str] = &[
    "InvalidSignature",
    "UnrecognizedClient",
    "AccessDenied",
    "InvalidPartnerTag",
    "IncompleteSignature",
];

const DEFAULT_RESOURCES: &[&str] = &[
    "BrowseNodeInfo.BrowseNodes",
    "BrowseNodeInfo.BrowseNodes.Ancestor",
    "Images.Primary.Large",
    "Images.Variants.Large",
    "ItemInfo.ByLineInfo",
    "ItemInfo.Features",
    "ItemInfo.Title",
    "Offers.Listings.Availability.Message",
    "Offers.Listings.Availability.Type",
    "Offers.Listings.Price",
    "Offers.Listings.SavingBasis",
    "ParentASIN",
];

const VARIATION_RESOURCES: &[&str] = &["VariationSummary.VariationDimension"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    GetItems,
    SearchItems,
    GetVariations,
}

impl OperationKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::GetItems => "GetItems",
            Self::SearchItems => "SearchItems",
            Self::GetVariations => "GetVariations",
        }
    }

    pub fn path(self) -> String {
        format!("/paapi5/{}", self.name().to_ascii_lowercase())
    }

    pub fn target(self) -> String {
        format!("{}.{}", TARGET_PREFIX, self.name())
    }

    /// 決定回應快取使用哪個群組的 TTL
    fn ttl_group(self) -> CacheGroup {
        match self {
            Self::GetItems => CacheGroup::ApiResponses,
            Self::SearchItems => CacheGroup::Searches,
            Self::GetVariations => CacheGroup::Variations,
        }
    }
}

pub fn default_resources() -> Vec<String> {
    DEFAULT_RESOURCES.iter().map(|s| s.to_string()).collect()
}

type RequestLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// 簽章、限速、快取、重試一手包辦的 API client
pub struct ApiClient {
    http: Client,
    signer: RequestSigner,
    credentials: Credentials,
    marketplace: MarketplaceInfo,
    endpoint: Url,
    host: String,
    config: ApiConfig,
    cache: Option<Arc<Cache>>,
    /// 所有請求共用，重試也要排隊
    limiter: Option<RequestLimiter>,
}

impl ApiClient {
    pub fn new(
        credentials: Credentials,
        marketplaces: &MarketplaceTable,
        config: ApiConfig,
        cache: Option<Arc<Cache>>,
    ) -> Result<Self> {
        let marketplace = marketplaces.lookup(&credentials.marketplace)?.clone();

        let raw_endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}", marketplace.host));
        let endpoint = Url::parse(&raw_endpoint).map_err(|e| ImportError::InvalidConfigValue {
            field: "api.endpoint".to_string(),
            value: raw_endpoint.clone(),
            reason: e.to_string(),
        })?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(h), Some(port)) => format!("{}:{}", h, port),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(ImportError::InvalidConfigValue {
                    field: "api.endpoint".to_string(),
                    value: raw_endpoint,
                    reason: "endpoint has no host".to_string(),
                })
            }
        };

        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ImportError::Config {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        let signer = RequestSigner::new(
            credentials.access_key.clone(),
            credentials.secret_key.clone(),
            marketplace.region,
            SERVICE,
        );

        let limiter = NonZeroU32::new(config.requests_per_second)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate).allow_burst(NonZeroU32::MIN)));

        tracing::debug!(
            "🔧 API client for marketplace {} at {} ({} req/s)",
            marketplace.code,
            endpoint,
            config.requests_per_second
        );

        Ok(Self {
            http,
            signer,
            credentials,
            marketplace,
            endpoint,
            host,
            config,
            cache,
            limiter,
        })
    }

    pub fn marketplace(&self) -> &MarketplaceInfo {
        &self.marketplace
    }

    fn resources_or_default(&self, resources: &[String]) -> Vec<String> {
        if !resources.is_empty() {
            return resources.to_vec();
        }
        self.config
            .resources
            .clone()
            .unwrap_or_else(default_resources)
    }

    fn base_body(&self, resources: Vec<String>) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("PartnerTag".into(), json!(self.credentials.partner_tag));
        body.insert("PartnerType".into(), json!("Associates"));
        body.insert("Marketplace".into(), json!(self.marketplace.domain));
        body.insert("Resources".into(), json!(resources));
        body
    }

    /// 快取鍵：操作、市場、partner tag 與排序後的參數
    fn cache_key(&self, op: OperationKind, body: &Map<String, Value>) -> String {
        let mut normalized = body.clone();
        for field in ["ItemIds", "Resources"] {
            if let Some(Value::Array(values)) = normalized.get_mut(field) {
                values.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
            }
        }
        format!(
            "{}:{}:{}:{}",
            op.name(),
            self.marketplace.code,
            self.credentials.partner_tag,
            Value::Object(normalized)
        )
    }

    async fn call(
        &self,
        op: OperationKind,
        body: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let cache_key = self.cache_key(op, &body);
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&cache_key, CacheGroup::ApiResponses).await {
                tracing::debug!("📦 Cache hit for {}", op.name());
                return Ok(hit);
            }
        }

        let payload = serde_json::to_vec(&Value::Object(body))?;
        let value = self.send_with_retry(op, &payload, cancel).await?;

        if let Some(cache) = &self.cache {
            let ttl = cache.ttl_for(op.ttl_group());
            cache
                .set(&cache_key, value.clone(), CacheGroup::ApiResponses, Some(ttl))
                .await;
        }
        Ok(value)
    }

    async fn send_with_retry(
        &self,
        op: OperationKind,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut throttle_attempts = 0u32;
        let mut transient_attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }

            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ImportError::Cancelled),
                    _ = limiter.until_ready() => {}
                }
            }

            let err = match self.send_once(op, payload).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            // throttle 與暫時性錯誤各自計算預算
            let (attempts, retry_after) = match err {
                ImportError::Throttle { retry_after, .. } => {
                    throttle_attempts += 1;
                    (throttle_attempts, retry_after)
                }
                ImportError::TransientNetwork { .. } => {
                    transient_attempts += 1;
                    (transient_attempts, None)
                }
                other => return Err(other),
            };

            if attempts >= self.config.max_attempts {
                tracing::warn!(
                    "❌ {} gave up after {} attempts: {}",
                    op.name(),
                    attempts,
                    err
                );
                return Err(ImportError::ExhaustedRetries {
                    attempts,
                    last: Box::new(err),
                });
            }

            let delay = backoff_delay(
                self.config.base_delay(),
                self.config.max_delay(),
                attempts,
                retry_after,
            );
            tracing::warn!(
                "⏳ {} attempt {} failed ({}), retrying in {:?}",
                op.name(),
                attempts,
                err.kind(),
                delay
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(ImportError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn send_once(&self, op: OperationKind, payload: &[u8]) -> Result<Value> {
        let path = op.path();
        let url = self
            .endpoint
            .join(&path)
            .map_err(|e| ImportError::Config {
                message: format!("invalid request path {}: {}", path, e),
            })?;

        let target = op.target();
        let mut headers = BTreeMap::new();
        headers.insert("content-encoding".to_string(), "amz-1.0".to_string());
        headers.insert(
            "content-type".to_string(),
            "application/json; charset=utf-8".to_string(),
        );
        headers.insert("host".to_string(), self.host.clone());
        headers.insert("x-amz-target".to_string(), target.clone());

        let signature = self.signer.sign(
            &SigningInput {
                method: "POST",
                path: &path,
                query: &[],
                headers: &headers,
                payload,
            },
            Utc::now(),
        )?;

        // host 由 reqwest 依 URL 自行送出
        let mut request = self.http.post(url);
        for (name, value) in headers.iter().filter(|(k, _)| k.as_str() != "host") {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .header("x-amz-date", signature.amz_date.as_str())
            .header("authorization", signature.authorization.as_str())
            .body(payload.to_vec())
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        tracing::debug!("📡 {} response status: {}", op.name(), status);

        let retry_after = parse_retry_after(response.headers());
        let text = response.text().await.map_err(classify_transport)?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| ImportError::UnexpectedResponse {
                message: format!("{} returned invalid JSON: {}", op.name(), e),
            })
        } else {
            Err(classify_status(status.as_u16(), retry_after, &text))
        }
    }

    async fn get_items_chunk(
        &self,
        codes: &[ItemCode],
        resources: &[String],
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut body = self.base_body(self.resources_or_default(resources));
        let ids: Vec<&str> = codes.iter().map(ItemCode::as_str).collect();
        body.insert("ItemIds".into(), json!(ids));
        self.call(OperationKind::GetItems, body, cancel).await
    }
}

#[async_trait]
impl ProductApi for ApiClient {
    async fn fetch_items(
        &self,
        codes: &[ItemCode],
        resources: &[String],
        cancel: &CancellationToken,
    ) -> Result<ItemsResult> {
        let mut items: Vec<Value> = Vec::new();
        let mut errors: Vec<Value> = Vec::new();
        let mut failures: Vec<ChunkFailure> = Vec::new();
        let chunk_count = codes.chunks(MAX_ITEMS_PER_REQUEST).count();

        for chunk in codes.chunks(MAX_ITEMS_PER_REQUEST) {
            match self.get_items_chunk(chunk, resources, cancel).await {
                Ok(value) => {
                    if let Some(found) = value.pointer("/ItemsResult/Items").and_then(Value::as_array) {
                        items.extend(found.iter().cloned());
                    }
                    if let Some(found) = value.get("Errors").and_then(Value::as_array) {
                        errors.extend(found.iter().cloned());
                    }
                }
                // 憑證錯誤對其餘子請求同樣成立
                Err(e) if matches!(e, ImportError::Cancelled) || e.is_auth() => return Err(e),
                Err(e) => {
                    tracing::warn!("⚠️ GetItems chunk of {} codes failed: {}", chunk.len(), e);
                    failures.push(ChunkFailure {
                        codes: chunk.to_vec(),
                        error: e,
                    });
                }
            }
        }

        if chunk_count > 0 && failures.len() == chunk_count {
            if let Some(first) = failures.into_iter().next() {
                return Err(first.error);
            }
            return Err(ImportError::UnexpectedResponse {
                message: "all GetItems requests failed".to_string(),
            });
        }

        let position: HashMap<&str, usize> = codes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), i))
            .collect();
        items.sort_by_key(|item| {
            item.get("ASIN")
                .and_then(Value::as_str)
                .and_then(|asin| position.get(asin.to_ascii_uppercase().as_str()).copied())
                .unwrap_or(usize::MAX)
        });

        let mut payload = json!({ "ItemsResult": { "Items": items } });
        if !errors.is_empty() {
            payload["Errors"] = Value::Array(errors);
        }
        Ok(ItemsResult { payload, failures })
    }

    async fn search_items(
        &self,
        request: &SearchRequest,
        resources: &[String],
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut body = self.base_body(self.resources_or_default(resources));
        body.insert("Keywords".into(), json!(request.keywords));
        let index = if request.search_index.is_empty() {
            "All"
        } else {
            request.search_index.as_str()
        };
        body.insert("SearchIndex".into(), json!(index));
        body.insert("ItemPage".into(), json!(request.page.max(1)));
        if let Some(min) = request.min_price {
            body.insert("MinPrice".into(), json!(min));
        }
        if let Some(max) = request.max_price {
            body.insert("MaxPrice".into(), json!(max));
        }
        if let Some(brand) = &request.brand {
            body.insert("Brand".into(), json!(brand));
        }
        if let Some(sort_by) = &request.sort_by {
            body.insert("SortBy".into(), json!(sort_by));
        }
        self.call(OperationKind::SearchItems, body, cancel).await
    }

    async fn fetch_variations(
        &self,
        parent: &ItemCode,
        resources: &[String],
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut resources = self.resources_or_default(resources);
        for extra in VARIATION_RESOURCES {
            if !resources.iter().any(|r| r == extra) {
                resources.push(extra.to_string());
            }
        }

        let max_pages = self.config.max_variation_pages.max(1);
        let mut items: Vec<Value> = Vec::new();
        let mut summary = Value::Null;
        let mut page = 1u32;

        loop {
            let mut body = self.base_body(resources.clone());
            body.insert("ASIN".into(), json!(parent.as_str()));
            body.insert("VariationPage".into(), json!(page));
            let value = self.call(OperationKind::GetVariations, body, cancel).await?;

            if let Some(found) = value
                .pointer("/VariationsResult/Items")
                .and_then(Value::as_array)
            {
                items.extend(found.iter().cloned());
            }
            if summary.is_null() {
                if let Some(s) = value.pointer("/VariationsResult/VariationSummary") {
                    summary = s.clone();
                }
            }

            let page_count = summary
                .get("PageCount")
                .and_then(Value::as_u64)
                .unwrap_or(1) as u32;
            if page >= page_count.min(max_pages) {
                break;
            }
            page += 1;
        }

        tracing::debug!(
            "🧩 Fetched {} variations of {} in {} page(s)",
            items.len(),
            parent,
            page
        );
        Ok(json!({
            "VariationsResult": {
                "Items": items,
                "VariationSummary": summary,
            }
        }))
    }
}

/// 指數退避：base × 2^(attempt-1)，上限 max；Retry-After 只會拉長等待
pub fn backoff_delay(
    base: Duration,
    max: Duration,
    attempt: u32,
    retry_after: Option<Duration>,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let computed = base.saturating_mul(1u32 << exponent).min(max);
    match retry_after {
        Some(hint) if hint > computed => hint.min(max),
        _ => computed,
    }
}

/// 從錯誤回應中取出供應商錯誤碼
pub fn vendor_error_code(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    if let Some(code) = value.pointer("/Errors/0/Code").and_then(Value::as_str) {
        return Some(code.to_string());
    }
    // "__type": "com.amazon.paapi5#TooManyRequestsException"
    value
        .get("__type")
        .and_then(Value::as_str)
        .and_then(|t| t.rsplit('#').next())
        .map(|t| t.trim_end_matches("Exception").to_string())
}

fn vendor_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/Errors/0/Message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

pub fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> ImportError {
    let code = vendor_error_code(body);
    let code_ref = code.as_deref().unwrap_or("");
    let message = match &code {
        Some(c) => format!("HTTP {} {}: {}", status, c, vendor_error_message(body)),
        None => format!("HTTP {}: {}", status, vendor_error_message(body)),
    };

    if status == 429 || THROTTLE_CODES.contains(&code_ref) {
        ImportError::Throttle {
            message,
            retry_after,
        }
    } else if status == 401 || status == 403 || AUTH_CODES.contains(&code_ref) {
        ImportError::Auth { message }
    } else if status >= 500 {
        ImportError::TransientNetwork { message }
    } else if status == 404 {
        ImportError::NotFound { message }
    } else {
        ImportError::Validation { message }
    }
}

fn classify_transport(err: reqwest::Error) -> ImportError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ImportError::TransientNetwork {
            message: err.to_string(),
        }
    } else {
        ImportError::UnexpectedResponse {
            message: err.to_string(),
        }
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
