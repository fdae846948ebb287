use crate::utils::error::{ImportError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const ITEM_CODE_LEN: usize = 10;

/// 固定格式的商品代碼（10 碼大寫英數字）
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemCode(String);

impl ItemCode {
    /// 解析並驗證代碼；前後空白會被去除並轉為大寫
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_uppercase();
        let valid = normalized.len() == ITEM_CODE_LEN
            && normalized
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());

        if !valid {
            return Err(ImportError::validation(format!(
                "invalid item code '{}': expected {} characters [A-Z0-9]",
                raw.trim(),
                ITEM_CODE_LEN
            )));
        }
        Ok(Self(normalized))
    }

    /// 從逗號或空白分隔的字串中解析多個代碼
    pub fn parse_list(raw: &str) -> Result<Vec<Self>> {
        raw.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ItemCode {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ItemCode {
    type Error = ImportError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ItemCode> for String {
    fn from(code: ItemCode) -> Self {
        code.0
    }
}

/// API 憑證；每個 client 實例固定不變
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub partner_tag: String,
    pub marketplace: String,
}

// secret 不可出現在日誌中
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .field("partner_tag", &self.partner_tag)
            .field("marketplace", &self.marketplace)
            .finish()
    }
}

/// 價格以最小貨幣單位（分）儲存
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub currency: String,
    pub regular: i64,
    pub sale: Option<i64>,
}

impl Price {
    pub fn is_on_sale(&self) -> bool {
        self.sale.is_some()
    }

    /// 實際售價
    pub fn effective(&self) -> i64 {
        self.sale.unwrap_or(self.regular)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityStatus {
    InStock,
    OutOfStock,
    Preorder,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Availability {
    pub status: AvailabilityStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariationDimension {
    pub name: String,
    pub display_name: Option<String>,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariationRecord {
    pub code: ItemCode,
    pub parent_code: ItemCode,
    pub attributes: BTreeMap<String, String>,
    pub price: Option<Price>,
}

/// 正規化後、與供應商無關的商品表示
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub code: ItemCode,
    pub title: String,
    pub description: Option<String>,
    pub short_description: Option<String>,
    pub price: Option<Price>,
    pub availability: Availability,
    pub brand: Option<String>,
    pub features: Vec<String>,
    pub primary_image: Option<String>,
    pub variant_images: Vec<String>,
    pub category_path: Vec<CategoryNode>,
    pub detail_page_url: Option<String>,
    pub parent_code: Option<ItemCode>,
    pub dimensions: Vec<VariationDimension>,
    pub variations: Vec<VariationRecord>,
}

impl ProductRecord {
    pub fn is_variable(&self) -> bool {
        !self.variations.is_empty()
    }
}

/// 一組變體（GetVariations 的正規化結果）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariationSet {
    pub parent_code: ItemCode,
    pub dimensions: Vec<VariationDimension>,
    pub variations: Vec<VariationRecord>,
}

/// 供應商回報的單項錯誤
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPage {
    pub items: Vec<ProductRecord>,
    pub page: u32,
    pub total_pages: u32,
    pub total_results: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    Keywords,
    Code,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SearchFilters {
    pub page: Option<u32>,
    pub search_index: Option<String>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub brand: Option<String>,
    pub sort_by: Option<String>,
}

/// 寫入目錄後的結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertResult {
    pub id: u64,
    pub created: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_code_normalizes_case_and_whitespace() {
        let code = ItemCode::parse("  b07xj8c8f5 ").unwrap();
        assert_eq!(code.as_str(), "B07XJ8C8F5");
    }

    #[test]
    fn test_price_sale_detection() {
        let regular = Price {
            currency: "USD".into(),
            regular: 1999,
            sale: None,
        };
        assert!(!regular.is_on_sale());
        assert_eq!(regular.effective(), 1999);

        let discounted = Price {
            sale: Some(1499),
            ..regular
        };
        assert!(discounted.is_on_sale());
        assert_eq!(discounted.effective(), 1499);
    }

    #[test]
    fn test_item_code_rejects_bad_input() {
        assert!(ItemCode::parse("B07XJ8C8F").is_err());
        assert!(ItemCode::parse("B07XJ8C8F55").is_err());
        assert!(ItemCode::parse("B07XJ8-8F5").is_err());
        assert!(ItemCode::parse("").is_err());
    }

    #[test]
    fn test_parse_list_mixed_separators() {
        let codes = ItemCode::parse_list("B000000001, B000000002\nB000000003").unwrap();
        assert_eq!(codes.len(), 3);
        assert_eq!(codes[2].as_str(), "B000000003");
        assert!(ItemCode::parse_list("B000000001,nope").is_err());
    }

    #[test]
    fn test_item_code_serde_validates() {
        let ok: ItemCode = serde_json::from_str("\"B000000001\"").unwrap();
        assert_eq!(ok.to_string(), "B000000001");
        assert!(serde_json::from_str::<ItemCode>("\"short\"").is_err());
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let creds = Credentials {
            access_key: "AKID".into(),
            secret_key: "super-secret".into(),
            partner_tag: "tag-20".into(),
            marketplace: "US".into(),
        };
        assert!(!format!("{:?}", creds).contains("super-secret"));
    }
}
