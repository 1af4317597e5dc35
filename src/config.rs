use std::{collections::HashMap, fmt, time::Duration};

use serde::Deserialize;

use crate::{
    crypto::AES_GCM,
    error::{Error, Result},
    kms::{ProviderId, secret_key},
};

pub const DEFAULT_SECRET_KEY: &str = "SW2YcwTIb9zpOOhoPsMm";

/// Connection details for a third-party KMS provider.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct KmsSettings {
    pub key_id: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Master secret of the built-in `secretKey.v1` provider.
    pub secret_key: String,
    pub current_provider: String,
    pub encryption_algorithm: String,
    pub data_key_cache_ttl_secs: u64,
    pub data_key_cache_cleanup_interval_secs: u64,
    pub metrics_prefix: String,
    /// provider id -> connection settings
    pub kms_providers: HashMap<String, KmsSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            secret_key: DEFAULT_SECRET_KEY.into(),
            current_provider: secret_key::default_provider_id().to_string(),
            encryption_algorithm: AES_GCM.into(),
            data_key_cache_ttl_secs: 15 * 60,
            data_key_cache_cleanup_interval_secs: 60,
            metrics_prefix: "secrets".into(),
            kms_providers: HashMap::new(),
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("secret_key", &"***")
            .field("current_provider", &self.current_provider)
            .field("encryption_algorithm", &self.encryption_algorithm)
            .field("data_key_cache_ttl_secs", &self.data_key_cache_ttl_secs)
            .field(
                "data_key_cache_cleanup_interval_secs",
                &self.data_key_cache_cleanup_interval_secs,
            )
            .field("metrics_prefix", &self.metrics_prefix)
            .field("kms_providers", &self.kms_providers)
            .finish()
    }
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults overridden by `SECRETS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `SECRETS_*` overrides read through `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("SECRETS_SECRET_KEY") {
            self.secret_key = v;
        }
        if let Some(v) = lookup("SECRETS_CURRENT_PROVIDER") {
            self.current_provider = v;
        }
        if let Some(v) = lookup("SECRETS_ENCRYPTION_ALGORITHM") {
            self.encryption_algorithm = v;
        }
        if let Some(v) = lookup("SECRETS_DATA_KEY_CACHE_TTL") {
            self.data_key_cache_ttl_secs = parse_secs("SECRETS_DATA_KEY_CACHE_TTL", &v)?;
        }
        if let Some(v) = lookup("SECRETS_DATA_KEY_CACHE_CLEANUP_INTERVAL") {
            self.data_key_cache_cleanup_interval_secs =
                parse_secs("SECRETS_DATA_KEY_CACHE_CLEANUP_INTERVAL", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.secret_key.is_empty() {
            return Err(Error::Configuration("secret_key must not be empty".into()));
        }
        if self.data_key_cache_ttl_secs == 0 {
            return Err(Error::Configuration(
                "data_key_cache_ttl_secs must be positive".into(),
            ));
        }
        if self.data_key_cache_cleanup_interval_secs == 0 {
            return Err(Error::Configuration(
                "data_key_cache_cleanup_interval_secs must be positive".into(),
            ));
        }
        self.current_provider_id()?;
        for id in self.kms_providers.keys() {
            id.parse::<ProviderId>()?;
        }
        Ok(())
    }

    pub fn current_provider_id(&self) -> Result<ProviderId> {
        self.current_provider.parse()
    }

    pub fn data_key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.data_key_cache_ttl_secs)
    }

    pub fn data_key_cache_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.data_key_cache_cleanup_interval_secs)
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("{key} must be a number of seconds, got {value:?}")))
}
