//! The provider registry (design §4.3): a pure factory that turns loaded
//! credentials into the ordered set of provider clients actually usable
//! this invocation. Stateless between calls -- it owns no connections or
//! rate-limit state itself, only the clients it hands back.

use std::sync::Arc;

use gpu_lease_core::config::{Credentials, PROVIDER_ORDER};
use gpu_lease_core::traits::Provider;
use gpu_lease_providers::{CoreweaveClient, LambdaClient, PaperspaceClient, RunpodClient, VastClient};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no provider configured: set at least one of VAST_API_KEY, LAMBDA_API_KEY, RUNPOD_API_KEY, COREWEAVE_API_KEY, PAPERSPACE_API_KEY")]
    NoProviderConfigured,
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

/// Build one client for the given provider name and key. The name must be
/// one of `PROVIDER_ORDER`; callers that already validated the name can
/// `expect` this.
fn build_client(provider: &str, api_key: String) -> Option<Arc<dyn Provider>> {
    match provider {
        "vast" => Some(Arc::new(VastClient::new(api_key))),
        "lambda" => Some(Arc::new(LambdaClient::new(api_key))),
        "runpod" => Some(Arc::new(RunpodClient::new(api_key))),
        "coreweave" => Some(Arc::new(CoreweaveClient::new(api_key))),
        "paperspace" => Some(Arc::new(PaperspaceClient::new(api_key))),
        _ => None,
    }
}

/// The ordered list of clients for which a key is present (design §4.3).
/// Order is `PROVIDER_ORDER` -- used only for deterministic iteration and
/// as the selector's price tiebreak, never for selection itself.
pub struct Registry {
    providers: Vec<Arc<dyn Provider>>,
}

impl Registry {
    /// Instantiate a client for every provider with a configured key, in
    /// `PROVIDER_ORDER`. Empty credentials is not itself an error here --
    /// `no_provider_configured` is only signaled once a caller asks for the
    /// list via [`Registry::require_nonempty`].
    pub fn from_credentials(credentials: &Credentials) -> Self {
        let providers = PROVIDER_ORDER
            .iter()
            .filter_map(|name| {
                let key = credentials.key_for(name)?;
                build_client(name, key.to_string())
            })
            .collect();
        Self { providers }
    }

    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Priority rank of `provider` in `PROVIDER_ORDER`, used by the
    /// Deployer's selector to break effective-price ties deterministically.
    pub fn priority(&self, provider: &str) -> usize {
        PROVIDER_ORDER
            .iter()
            .position(|p| *p == provider)
            .unwrap_or(PROVIDER_ORDER.len())
    }

    /// `self.providers()`, or `no_provider_configured` if empty.
    pub fn require_nonempty(&self) -> Result<&[Arc<dyn Provider>], RegistryError> {
        if self.providers.is_empty() {
            Err(RegistryError::NoProviderConfigured)
        } else {
            Ok(&self.providers)
        }
    }

    /// Exactly one client by stable name, or `unknown_provider`.
    pub fn by_name(&self, name: &str) -> Result<Arc<dyn Provider>, RegistryError> {
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownProvider(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn credentials_with(providers: &[&str]) -> Credentials {
        let overrides: HashMap<String, String> = providers
            .iter()
            .map(|p| (p.to_string(), format!("{p}-key")))
            .collect();
        gpu_lease_core::config::load_credentials(&overrides).unwrap()
    }

    #[test]
    fn only_configured_providers_are_instantiated() {
        let creds = credentials_with(&["vast", "coreweave"]);
        let registry = Registry::from_credentials(&creds);
        let names: Vec<_> = registry.providers().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["vast", "coreweave"]);
    }

    #[test]
    fn empty_registry_signals_no_provider_configured() {
        let creds = credentials_with(&[]);
        let registry = Registry::from_credentials(&creds);
        assert_eq!(
            registry.require_nonempty().unwrap_err(),
            RegistryError::NoProviderConfigured
        );
    }

    #[test]
    fn by_name_returns_unknown_provider_for_unconfigured_name() {
        let creds = credentials_with(&["vast"]);
        let registry = Registry::from_credentials(&creds);
        assert!(registry.by_name("lambda").is_err());
        assert!(registry.by_name("vast").is_ok());
    }

    #[test]
    fn priority_matches_provider_order() {
        let creds = credentials_with(&[]);
        let registry = Registry::from_credentials(&creds);
        assert_eq!(registry.priority("vast"), 0);
        assert_eq!(registry.priority("paperspace"), 4);
    }
}
