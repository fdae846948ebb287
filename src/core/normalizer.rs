use crate::api::OperationKind;
use crate::config::marketplace::currency_exponent;
use crate::domain::model::{
    Availability, AvailabilityStatus, CategoryNode, ItemCode, Price, ProductRecord, SearchPage,
    VariationDimension, VariationRecord, VariationSet, VendorError,
};
use crate::utils::error::{ImportError, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// 供應商單頁最多回傳的搜尋結果數
pub const SEARCH_PAGE_SIZE: u64 = 10;
/// 供應商允許翻到的最後一頁
pub const MAX_SEARCH_PAGES: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Products(ParsedItems),
    Variations(VariationSet),
    Search(SearchPage),
}

/// GetItems 的正規化結果，供應商的單項錯誤一併保留
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedItems {
    pub records: Vec<ProductRecord>,
    pub errors: Vec<VendorError>,
}

impl ParsedItems {
    pub fn find(&self, code: &ItemCode) -> Option<&ProductRecord> {
        self.records.iter().find(|r| &r.code == code)
    }

    pub fn error_for(&self, code: &ItemCode) -> Option<&VendorError> {
        self.errors.iter().find(|e| e.message.contains(code.as_str()))
    }
}

/// 將供應商 JSON 轉為 ProductRecord 等與供應商無關的結構；不做任何 I/O
#[derive(Debug, Clone)]
pub struct Normalizer {
    max_category_depth: usize,
    default_currency: String,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(6, "USD")
    }
}

impl Normalizer {
    pub fn new(max_category_depth: usize, default_currency: impl Into<String>) -> Self {
        Self {
            max_category_depth,
            default_currency: default_currency.into(),
        }
    }

    /// 依操作種類分派；搜尋結果的頁碼預設為 1
    pub fn parse(&self, raw: &Value, kind: OperationKind) -> Result<Parsed> {
        match kind {
            OperationKind::GetItems => self.parse_items(raw).map(Parsed::Products),
            OperationKind::SearchItems => self.parse_search(raw, 1).map(Parsed::Search),
            OperationKind::GetVariations => {
                let parent = raw
                    .pointer("/VariationsResult/Items")
                    .and_then(Value::as_array)
                    .and_then(|items| items.iter().find_map(|i| str_at(i, "/ParentASIN")))
                    .ok_or_else(|| ImportError::validation("variation payload has no parent code"))
                    .and_then(ItemCode::parse)?;
                self.parse_variations(raw, &parent).map(Parsed::Variations)
            }
        }
    }

    pub fn parse_items(&self, raw: &Value) -> Result<ParsedItems> {
        let mut parsed = ParsedItems {
            errors: vendor_errors(raw),
            ..Default::default()
        };

        for item in array_at(raw, "/ItemsResult/Items") {
            match self.parse_item(item) {
                Ok(record) => parsed.records.push(record),
                Err(e) => {
                    tracing::warn!("⚠️ Skipping malformed item: {}", e);
                    parsed.errors.push(VendorError {
                        code: "InvalidItem".to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(parsed)
    }

    pub fn parse_item(&self, item: &Value) -> Result<ProductRecord> {
        let code = str_at(item, "/ASIN")
            .ok_or_else(|| ImportError::validation("item without ASIN"))
            .and_then(ItemCode::parse)?;

        let features: Vec<String> = array_at(item, "/ItemInfo/Features/DisplayValues")
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let description = if features.is_empty() {
            None
        } else {
            Some(features.join("\n"))
        };

        let parent_code = str_at(item, "/ParentASIN")
            .and_then(|p| ItemCode::parse(p).ok())
            .filter(|p| p != &code);

        let variant_images = array_at(item, "/Images/Variants")
            .iter()
            .filter_map(|v| str_at(v, "/Large/URL"))
            .map(str::to_string)
            .collect();

        Ok(ProductRecord {
            title: str_at(item, "/ItemInfo/Title/DisplayValue")
                .unwrap_or_default()
                .trim()
                .to_string(),
            short_description: features.first().cloned(),
            description,
            price: self.parse_price(item),
            availability: parse_availability(item),
            brand: str_at(item, "/ItemInfo/ByLineInfo/Brand/DisplayValue").map(str::to_string),
            features,
            primary_image: str_at(item, "/Images/Primary/Large/URL").map(str::to_string),
            variant_images,
            category_path: self.parse_category_path(item),
            detail_page_url: str_at(item, "/DetailPageURL").map(str::to_string),
            parent_code,
            dimensions: Vec::new(),
            variations: Vec::new(),
            code,
        })
    }

    /// 第一個 listing 的價格；有不同的原價時，原價為 regular、現價為 sale
    pub fn parse_price(&self, item: &Value) -> Option<Price> {
        let listing = item.pointer("/Offers/Listings/0")?;
        let amount = listing.pointer("/Price/Amount").and_then(Value::as_f64)?;
        let currency = str_at(listing, "/Price/Currency")
            .unwrap_or(self.default_currency.as_str())
            .to_string();
        let exponent = currency_exponent(&currency);
        let current = to_minor_units(amount, exponent);

        let was = listing
            .pointer("/SavingBasis/Amount")
            .and_then(Value::as_f64)
            .map(|a| to_minor_units(a, exponent));

        Some(match was {
            Some(was) if was != current => Price {
                currency,
                regular: was,
                sale: Some(current),
            },
            _ => Price {
                currency,
                regular: current,
                sale: None,
            },
        })
    }

    /// 第一個分類節點沿祖先鏈往上，輸出 root→leaf，過深時保留靠近 root 的部分
    pub fn parse_category_path(&self, item: &Value) -> Vec<CategoryNode> {
        let mut path = Vec::new();
        let mut node = item.pointer("/BrowseNodeInfo/BrowseNodes/0");
        while let Some(current) = node {
            let id = match current.get("Id") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => break,
            };
            let name = str_at(current, "/DisplayName")
                .or_else(|| str_at(current, "/ContextFreeName"))
                .unwrap_or_default()
                .to_string();
            path.push(CategoryNode { id, name });
            node = current.get("Ancestor");
        }
        path.reverse();
        path.truncate(self.max_category_depth);
        path
    }

    pub fn parse_variations(&self, raw: &Value, parent: &ItemCode) -> Result<VariationSet> {
        let mut variations = Vec::new();
        for item in array_at(raw, "/VariationsResult/Items") {
            variations.push(self.parse_variation(item, parent)?);
        }

        let mut dimensions: Vec<VariationDimension> =
            array_at(raw, "/VariationsResult/VariationSummary/VariationDimensions")
                .iter()
                .filter_map(|d| {
                    let name = str_at(d, "/Name")?.to_string();
                    Some(VariationDimension {
                        display_name: str_at(d, "/DisplayName").map(str::to_string),
                        values: array_at(d, "/Values")
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect(),
                        name,
                    })
                })
                .collect();

        if dimensions.is_empty() {
            dimensions = dimensions_from_attributes(&variations);
        }

        Ok(VariationSet {
            parent_code: parent.clone(),
            dimensions,
            variations,
        })
    }

    fn parse_variation(&self, item: &Value, parent: &ItemCode) -> Result<VariationRecord> {
        let raw_code = str_at(item, "/ASIN")
            .ok_or_else(|| ImportError::validation(format!("variation of {} without code", parent)))?;
        let code = ItemCode::parse(raw_code)?;

        let attributes: BTreeMap<String, String> = array_at(item, "/VariationAttributes")
            .iter()
            .filter_map(|a| Some((str_at(a, "/Name")?.to_string(), str_at(a, "/Value")?.to_string())))
            .collect();
        if attributes.is_empty() {
            return Err(ImportError::validation(format!(
                "variation {} of {} has no attributes",
                code, parent
            )));
        }

        Ok(VariationRecord {
            price: self.parse_price(item),
            code,
            parent_code: parent.clone(),
            attributes,
        })
    }

    pub fn parse_search(&self, raw: &Value, page: u32) -> Result<SearchPage> {
        let mut items = Vec::new();
        for item in array_at(raw, "/SearchResult/Items") {
            match self.parse_item(item) {
                Ok(record) => items.push(record),
                Err(e) => tracing::debug!("Skipping search result: {}", e),
            }
        }

        let total_results = raw
            .pointer("/SearchResult/TotalResultCount")
            .and_then(Value::as_u64)
            .unwrap_or(items.len() as u64);

        Ok(SearchPage {
            items,
            page: page.max(1),
            total_pages: total_pages(total_results),
            total_results,
        })
    }
}

/// ceil(total / 10)，最多 10 頁
pub fn total_pages(total_results: u64) -> u32 {
    let pages = total_results.div_ceil(SEARCH_PAGE_SIZE);
    pages.min(MAX_SEARCH_PAGES as u64) as u32
}

pub fn vendor_errors(raw: &Value) -> Vec<VendorError> {
    array_at(raw, "/Errors")
        .iter()
        .map(|e| VendorError {
            code: str_at(e, "/Code").unwrap_or("Unknown").to_string(),
            message: str_at(e, "/Message").unwrap_or_default().to_string(),
        })
        .collect()
}

fn parse_availability(item: &Value) -> Availability {
    let kind = str_at(item, "/Offers/Listings/0/Availability/Type");
    let message = str_at(item, "/Offers/Listings/0/Availability/Message").map(str::to_string);

    let status = match kind {
        Some("Now") => AvailabilityStatus::InStock,
        Some("Preorder") | Some("PreOrder") => AvailabilityStatus::Preorder,
        Some("Backorder") | Some("OutOfStock") => AvailabilityStatus::OutOfStock,
        _ => match &message {
            Some(m) if m.to_ascii_lowercase().contains("unavailable") => {
                AvailabilityStatus::OutOfStock
            }
            Some(m) if m.to_ascii_lowercase().contains("in stock") => AvailabilityStatus::InStock,
            _ => AvailabilityStatus::Unknown,
        },
    };
    Availability { status, message }
}

fn dimensions_from_attributes(variations: &[VariationRecord]) -> Vec<VariationDimension> {
    let mut by_name: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for variation in variations {
        for (name, value) in &variation.attributes {
            let values = by_name.entry(name.as_str()).or_default();
            if !values.contains(value) {
                values.push(value.clone());
            }
        }
    }
    by_name
        .into_iter()
        .map(|(name, values)| VariationDimension {
            name: name.to_string(),
            display_name: None,
            values,
        })
        .collect()
}

fn to_minor_units(amount: f64, exponent: u32) -> i64 {
    (amount * 10f64.powi(exponent as i32)).round() as i64
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn array_at<'a>(value: &'a Value, pointer: &str) -> &'a [Value] {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_item() -> Value {
        json!({
            "ASIN": "B07XJ8C8F5",
            "DetailPageURL": "https://www.amazon.com/dp/B07XJ8C8F5",
            "ItemInfo": {
                "Title": { "DisplayValue": " Ceramic Mug " },
                "Features": { "DisplayValues": ["Holds 350ml", "Dishwasher safe"] },
                "ByLineInfo": { "Brand": { "DisplayValue": "Acme" } }
            },
            "Offers": { "Listings": [{
                "Price": { "Amount": 12.99, "Currency": "USD" },
                "SavingBasis": { "Amount": 19.99, "Currency": "USD" },
                "Availability": { "Message": "In Stock.", "Type": "Now" }
            }]},
            "Images": {
                "Primary": { "Large": { "URL": "https://img/primary.jpg" } },
                "Variants": [ { "Large": { "URL": "https://img/v1.jpg" } } ]
            },
            "BrowseNodeInfo": { "BrowseNodes": [{
                "Id": "3", "DisplayName": "Mugs",
                "Ancestor": { "Id": "2", "DisplayName": "Kitchen",
                    "Ancestor": { "Id": "1", "DisplayName": "Home" } }
            }]}
        })
    }

    #[test]
    fn test_parse_full_item() {
        let record = Normalizer::default().parse_item(&full_item()).unwrap();

        assert_eq!(record.code.as_str(), "B07XJ8C8F5");
        assert_eq!(record.title, "Ceramic Mug");
        assert_eq!(record.short_description.as_deref(), Some("Holds 350ml"));
        assert_eq!(record.description.as_deref(), Some("Holds 350ml\nDishwasher safe"));
        assert_eq!(record.brand.as_deref(), Some("Acme"));
        assert_eq!(
            record.price,
            Some(Price { currency: "USD".into(), regular: 1999, sale: Some(1299) })
        );
        assert_eq!(record.availability.status, AvailabilityStatus::InStock);
        assert_eq!(record.variant_images, vec!["https://img/v1.jpg".to_string()]);
        let names: Vec<_> = record.category_path.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Home", "Kitchen", "Mugs"]);
        assert!(record.parent_code.is_none());
    }

    #[test]
    fn test_missing_sections_are_not_errors() {
        let record = Normalizer::default()
            .parse_item(&json!({ "ASIN": "B000000001" }))
            .unwrap();
        assert!(record.price.is_none());
        assert!(record.features.is_empty());
        assert!(record.description.is_none());
        assert!(record.primary_image.is_none());
        assert!(record.category_path.is_empty());
        assert_eq!(record.availability.status, AvailabilityStatus::Unknown);
    }

    #[test]
    fn test_price_without_discount_and_zero_exponent() {
        let item = json!({
            "ASIN": "B000000001",
            "Offers": { "Listings": [{
                "Price": { "Amount": 1980, "Currency": "JPY" },
                "SavingBasis": { "Amount": 1980, "Currency": "JPY" }
            }]}
        });
        let price = Normalizer::default().parse_price(&item).unwrap();
        assert_eq!(price, Price { currency: "JPY".into(), regular: 1980, sale: None });
    }

    #[test]
    fn test_category_path_truncated_from_leaf_side() {
        let record = Normalizer::new(2, "USD").parse_item(&full_item()).unwrap();
        let ids: Vec<_> = record.category_path.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn test_parse_items_keeps_vendor_errors() {
        let raw = json!({
            "ItemsResult": { "Items": [ full_item(), { "ASIN": "bad" } ] },
            "Errors": [{ "Code": "InvalidParameterValue",
                         "Message": "The ItemId B000000009 provided in the request is invalid." }]
        });
        let parsed = Normalizer::default().parse_items(&raw).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.errors.len(), 2);
        assert_eq!(parsed.errors[0].code, "InvalidParameterValue");

        let missing = ItemCode::parse("B000000009").unwrap();
        assert!(parsed.error_for(&missing).is_some());
    }

    fn color_size_payload(colors: &[&str], sizes: &[&str]) -> Value {
        let mut items = Vec::new();
        let mut n = 0;
        for color in colors {
            for size in sizes {
                n += 1;
                items.push(json!({
                    "ASIN": format!("B0VAR{:05}", n),
                    "ParentASIN": "B0PARENT01",
                    "VariationAttributes": [
                        { "Name": "color_name", "Value": color },
                        { "Name": "size_name", "Value": size }
                    ],
                    "Offers": { "Listings": [{ "Price": { "Amount": 9.5, "Currency": "USD" } }] }
                }));
            }
        }
        json!({
            "VariationsResult": {
                "Items": items,
                "VariationSummary": {
                    "PageCount": 1,
                    "VariationDimensions": [
                        { "Name": "color_name", "DisplayName": "Color", "Values": colors },
                        { "Name": "size_name", "DisplayName": "Size", "Values": sizes }
                    ]
                }
            }
        })
    }

    #[test]
    fn test_color_by_size_variations() {
        let raw = color_size_payload(&["Red", "Blue", "Black"], &["S", "M"]);
        let parent = ItemCode::parse("B0PARENT01").unwrap();
        let set = Normalizer::default().parse_variations(&raw, &parent).unwrap();

        assert_eq!(set.variations.len(), 6);
        assert_eq!(set.dimensions.len(), 2);
        assert_eq!(set.dimensions[0].display_name.as_deref(), Some("Color"));

        let mut codes: Vec<_> = set.variations.iter().map(|v| v.code.clone()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), 6);

        for variation in &set.variations {
            assert_eq!(variation.parent_code, parent);
            assert!(variation.attributes.contains_key("color_name"));
            assert!(variation.attributes.contains_key("size_name"));
            assert_eq!(variation.price.as_ref().map(|p| p.regular), Some(950));
        }
    }

    #[test]
    fn test_generic_parse_derives_parent() {
        let raw = color_size_payload(&["Red"], &["S", "M"]);
        match Normalizer::default().parse(&raw, OperationKind::GetVariations).unwrap() {
            Parsed::Variations(set) => {
                assert_eq!(set.parent_code.as_str(), "B0PARENT01");
                assert_eq!(set.variations.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_variation_without_attributes_is_rejected() {
        let raw = json!({ "VariationsResult": { "Items": [ { "ASIN": "B0VAR00001" } ] } });
        let parent = ItemCode::parse("B0PARENT01").unwrap();
        let err = Normalizer::default().parse_variations(&raw, &parent).unwrap_err();
        assert_eq!(err.kind(), "validation");

        let raw = json!({ "VariationsResult": { "Items": [ {
            "ASIN": "nope",
            "VariationAttributes": [ { "Name": "color_name", "Value": "Red" } ]
        } ] } });
        assert!(Normalizer::default().parse_variations(&raw, &parent).is_err());
    }

    #[test]
    fn test_dimensions_derived_when_summary_missing() {
        let mut raw = color_size_payload(&["Red", "Blue"], &["S"]);
        raw["VariationsResult"]["VariationSummary"] = Value::Null;
        let parent = ItemCode::parse("B0PARENT01").unwrap();
        let set = Normalizer::default().parse_variations(&raw, &parent).unwrap();
        assert_eq!(set.dimensions.len(), 2);
        assert_eq!(set.dimensions[0].name, "color_name");
        assert_eq!(set.dimensions[0].values, vec!["Red".to_string(), "Blue".to_string()]);
    }

    #[test]
    fn test_search_page_counts() {
        assert_eq!(total_pages(0), 0);
        assert_eq!(total_pages(10), 1);
        assert_eq!(total_pages(11), 2);
        assert_eq!(total_pages(5000), MAX_SEARCH_PAGES);

        let raw = json!({ "SearchResult": { "Items": [ full_item() ], "TotalResultCount": 42 } });
        let page = Normalizer::default().parse_search(&raw, 3).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.page, 3);
        assert_eq!(page.total_pages, 5);
        assert_eq!(page.total_results, 42);
    }
}
