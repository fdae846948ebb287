use crate::utils::error::{ImportError, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const TERMINATOR: &str = "aws4_request";

/// 待簽署的請求內容
#[derive(Debug, Clone)]
pub struct SigningInput<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a [(String, String)],
    /// 鍵不分大小寫，簽署時一律轉小寫
    pub headers: &'a BTreeMap<String, String>,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub amz_date: String,
    pub signed_headers: String,
    pub signature: String,
    pub authorization: String,
}

/// HMAC-SHA256 鏈式簽章
#[derive(Clone)]
pub struct RequestSigner {
    access_key: String,
    secret_key: String,
    region: String,
    service: String,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("access_key", &self.access_key)
            .field("region", &self.region)
            .field("service", &self.service)
            .finish()
    }
}

impl RequestSigner {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: region.into(),
            service: service.into(),
        }
    }

    /// 對固定的輸入與時間戳記，結果必定相同
    pub fn sign(&self, input: &SigningInput<'_>, now: DateTime<Utc>) -> Result<Signature> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        let mut headers: BTreeMap<String, String> = input
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), collapse_whitespace(v)))
            .collect();
        headers.insert("x-amz-date".to_string(), amz_date.clone());

        let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
        let canonical = canonical_request(input, &headers, &signed_headers);

        let scope = format!(
            "{}/{}/{}/{}",
            date_stamp, self.region, self.service, TERMINATOR
        );
        let to_sign = string_to_sign(&amz_date, &scope, &canonical);
        let key = signing_key(&self.secret_key, &date_stamp, &self.region, &self.service)?;
        let signature = hex::encode(hmac_sha256(&key, to_sign.as_bytes())?);

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, self.access_key, scope, signed_headers, signature
        );

        Ok(Signature {
            amz_date,
            signed_headers,
            signature,
            authorization,
        })
    }
}

pub fn canonical_request(
    input: &SigningInput<'_>,
    lowered_headers: &BTreeMap<String, String>,
    signed_headers: &str,
) -> String {
    let canonical_headers: String = lowered_headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        input.method.to_ascii_uppercase(),
        canonical_uri(input.path),
        canonical_query(input.query),
        canonical_headers,
        signed_headers,
        hex::encode(Sha256::digest(input.payload))
    )
}

pub fn string_to_sign(amz_date: &str, scope: &str, canonical_request: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    )
}

pub fn signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, TERMINATOR.as_bytes())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| ImportError::Auth {
        message: format!("cannot initialise request signer: {}", e),
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn canonical_uri(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(|segment| uri_encode(segment))
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// RFC 3986：只保留非保留字元，大寫十六進位
fn uri_encode(raw: &str) -> String {
    urlencoding::encode(raw).into_owned()
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
