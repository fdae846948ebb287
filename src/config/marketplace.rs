use crate::utils::error::{ImportError, Result};
use std::collections::BTreeMap;

/// 單一市場（storefront）的固定設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketplaceInfo {
    pub code: &'static str,
    pub host: &'static str,
    pub region: &'static str,
    pub domain: &'static str,
    pub currency: &'static str,
    pub language: &'static str,
}

const BUILTIN: &[MarketplaceInfo] = &[
    MarketplaceInfo { code: "US", host: "webservices.amazon.com", region: "us-east-1", domain: "www.amazon.com", currency: "USD", language: "en_US" },
    MarketplaceInfo { code: "CA", host: "webservices.amazon.ca", region: "us-east-1", domain: "www.amazon.ca", currency: "CAD", language: "en_CA" },
    MarketplaceInfo { code: "MX", host: "webservices.amazon.com.mx", region: "us-east-1", domain: "www.amazon.com.mx", currency: "MXN", language: "es_MX" },
    MarketplaceInfo { code: "BR", host: "webservices.amazon.com.br", region: "us-east-1", domain: "www.amazon.com.br", currency: "BRL", language: "pt_BR" },
    MarketplaceInfo { code: "UK", host: "webservices.amazon.co.uk", region: "eu-west-1", domain: "www.amazon.co.uk", currency: "GBP", language: "en_GB" },
    MarketplaceInfo { code: "DE", host: "webservices.amazon.de", region: "eu-west-1", domain: "www.amazon.de", currency: "EUR", language: "de_DE" },
    MarketplaceInfo { code: "FR", host: "webservices.amazon.fr", region: "eu-west-1", domain: "www.amazon.fr", currency: "EUR", language: "fr_FR" },
    MarketplaceInfo { code: "IT", host: "webservices.amazon.it", region: "eu-west-1", domain: "www.amazon.it", currency: "EUR", language: "it_IT" },
    MarketplaceInfo { code: "ES", host: "webservices.amazon.es", region: "eu-west-1", domain: "www.amazon.es", currency: "EUR", language: "es_ES" },
    MarketplaceInfo { code: "IN", host: "webservices.amazon.in", region: "eu-west-1", domain: "www.amazon.in", currency: "INR", language: "en_IN" },
    MarketplaceInfo { code: "JP", host: "webservices.amazon.co.jp", region: "us-west-2", domain: "www.amazon.co.jp", currency: "JPY", language: "ja_JP" },
    MarketplaceInfo { code: "AU", host: "webservices.amazon.com.au", region: "us-west-2", domain: "www.amazon.com.au", currency: "AUD", language: "en_AU" },
];

/// 不可變的市場對照表，在建構 client 時注入
#[derive(Debug, Clone)]
pub struct MarketplaceTable {
    entries: BTreeMap<&'static str, MarketplaceInfo>,
}

impl MarketplaceTable {
    pub fn builtin() -> Self {
        Self::from_entries(BUILTIN.iter().cloned())
    }

    pub fn from_entries(entries: impl IntoIterator<Item = MarketplaceInfo>) -> Self {
        Self {
            entries: entries.into_iter().map(|m| (m.code, m)).collect(),
        }
    }

    pub fn lookup(&self, code: &str) -> Result<&MarketplaceInfo> {
        let key = code.trim().to_ascii_uppercase();
        // GB 是 UK 的常見別名
        let key = if key == "GB" { "UK".to_string() } else { key };
        self.entries
            .get(key.as_str())
            .ok_or_else(|| ImportError::InvalidConfigValue {
                field: "credentials.marketplace".to_string(),
                value: code.to_string(),
                reason: format!(
                    "Unknown marketplace. Known: {}",
                    self.codes().collect::<Vec<_>>().join(", ")
                ),
            })
    }

    pub fn codes(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }
}

impl Default for MarketplaceTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// 貨幣的小數位數（JPY 沒有輔幣）
pub fn currency_exponent(currency: &str) -> u32 {
    match currency {
        "JPY" | "KRW" | "CLP" => 0,
        _ => 2,
    }
}
