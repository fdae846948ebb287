use crate::domain::model::Credentials;
use crate::domain::ports::CredentialSource;
use crate::utils::error::{ImportError, Result};

/// 固定的憑證，測試與嵌入式使用
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

impl CredentialSource for StaticCredentials {
    fn get(&self) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}

/// 從環境變數讀取：`{PREFIX}_ACCESS_KEY`、`{PREFIX}_SECRET_KEY`、
/// `{PREFIX}_PARTNER_TAG`，以及選填的 `{PREFIX}_MARKETPLACE`
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    prefix: String,
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new("CATALOG")
    }
}

impl EnvCredentials {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        std::env::var(format!("{}_{}", self.prefix, name))
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> Result<String> {
        self.var(name).ok_or_else(|| ImportError::MissingConfig {
            field: format!("{}_{}", self.prefix, name),
        })
    }
}

impl CredentialSource for EnvCredentials {
    fn get(&self) -> Result<Credentials> {
        Ok(Credentials {
            access_key: self.required("ACCESS_KEY")?,
            secret_key: self.required("SECRET_KEY")?,
            partner_tag: self.required("PARTNER_TAG")?,
            marketplace: self.var("MARKETPLACE").unwrap_or_else(|| "US".to_string()),
        })
    }
}
