pub mod cloud;
pub mod secret_key;

use std::{borrow::Borrow, collections::HashMap, fmt, str::FromStr, sync::Arc};

use once_cell::sync::OnceCell;

use crate::{
    config::Settings,
    crypto::Encryption,
    error::{Error, Result},
};

/// Wraps and unwraps raw data keys with a master secret that never leaves
/// the provider.
pub trait KmsProvider: Send + Sync + 'static {
    fn encrypt(&self, blob: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>>;
}

/// Provider identifier of the form `<kind>.<version>`, e.g. `secretKey.v1`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn kind(&self) -> &str {
        self.0.split_once('.').map_or(self.0.as_str(), |(kind, _)| kind)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ProviderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((kind, version)) if !kind.is_empty() && !version.is_empty() => {
                Ok(Self(s.to_owned()))
            }
            _ => Err(Error::Configuration(format!(
                "provider id {s:?} must look like <kind>.<version>"
            ))),
        }
    }
}

impl Borrow<str> for ProviderId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The finalized provider set: one current provider plus every provider
/// that may still be needed to unwrap older keys.
pub struct ProviderConfig {
    current: ProviderId,
    available: HashMap<ProviderId, Arc<dyn KmsProvider>>,
}

impl ProviderConfig {
    pub fn new(
        current: ProviderId,
        available: HashMap<ProviderId, Arc<dyn KmsProvider>>,
    ) -> Result<Self> {
        if !available.contains_key(&current) {
            return Err(Error::Configuration(format!(
                "current provider {current} is not among the available providers"
            )));
        }
        Ok(Self { current, available })
    }
}

/// Write-once holder for the provider set.
#[derive(Default)]
pub struct ProviderRegistry {
    config: OnceCell<ProviderConfig>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&self, config: ProviderConfig) -> Result<()> {
        self.config
            .set(config)
            .map_err(|_| Error::AlreadyInitialized)
    }

    fn config(&self) -> Result<&ProviderConfig> {
        self.config
            .get()
            .ok_or_else(|| Error::Configuration("kms providers are not initialized".into()))
    }

    pub fn current(&self) -> Result<(&ProviderId, &Arc<dyn KmsProvider>)> {
        let config = self.config()?;
        let provider = config
            .available
            .get(&config.current)
            .ok_or_else(|| Error::ProviderNotFound(config.current.to_string()))?;
        Ok((&config.current, provider))
    }

    pub fn get(&self, id: &str) -> Result<&Arc<dyn KmsProvider>> {
        let config = self.config()?;
        config
            .available
            .get(id)
            .ok_or_else(|| Error::ProviderNotFound(id.to_owned()))
    }

    pub fn ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<_> = self
            .config
            .get()
            .map(|c| c.available.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

/// Build the providers named by the settings: the always-present secret
/// key provider plus any configured third-party KMS providers.
pub fn providers_from_settings(
    settings: &Settings,
    encryption: Arc<Encryption>,
) -> Result<HashMap<ProviderId, Arc<dyn KmsProvider>>> {
    let mut providers: HashMap<ProviderId, Arc<dyn KmsProvider>> = HashMap::new();
    providers.insert(
        secret_key::default_provider_id(),
        Arc::new(secret_key::SecretKeyProvider::new(
            &settings.secret_key,
            encryption,
        )),
    );

    for (id, kms) in &settings.kms_providers {
        let id: ProviderId = id.parse()?;
        let provider: Arc<dyn KmsProvider> = match id.kind() {
            cloud::KIND => Arc::new(cloud::CloudKmsProvider::new(
                kms.key_id.clone(),
                kms.endpoint.clone(),
            )),
            other => {
                return Err(Error::Configuration(format!(
                    "unsupported kms provider kind {other:?} for {id}"
                )));
            }
        };
        providers.insert(id, provider);
    }
    Ok(providers)
}
