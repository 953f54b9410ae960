//! The Reconciler (design §4.6): compares local State against provider
//! reality before any Stop (and optionally at the start of any command
//! that relies on State), healing divergence rather than trusting a stale
//! record.

use gpu_lease_core::error::ErrorCode;
use gpu_lease_core::traits::Provider;
use gpu_lease_state::StateStore;
use log::warn;
use tokio_util::sync::CancellationToken;

/// One of the four reconciliation outcomes (design §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No State recorded; nothing to reconcile.
    NoActiveInstance,
    /// The provider reports a non-terminal instance; State is valid as-is.
    Valid,
    /// The provider reports the instance absent. State was cleared (unless
    /// `auto_cleanup = false`).
    MismatchNotFound { provider: String, instance_id: String, reasons: Vec<&'static str> },
    /// The provider reports the instance in a terminal state. State was
    /// cleared (unless `auto_cleanup = false`).
    MismatchTerminated { provider: String, instance_id: String },
    /// The provider is unreachable or not configured for this State's
    /// provider. State is left in place.
    ProviderUnreachable { provider: String, instance_id: String, detail: String },
}

const NOT_FOUND_REASONS: [&str; 3] = [
    "the instance was terminated externally (e.g. from the provider's console)",
    "a spot instance was preempted by the provider",
    "the server-side deadman timer fired before the client's heartbeat arrived",
];

/// Reconcile `state_store`'s record against `provider`, if one is supplied
/// for the recorded provider name (`None` models "provider not configured",
/// design §4.6 outcome (d)). `auto_cleanup = false` only reports; the
/// default (`true`) also clears State on a mismatch.
pub async fn reconcile(
    state_store: &StateStore,
    provider: Option<&dyn Provider>,
    auto_cleanup: bool,
    cancel: &CancellationToken,
) -> anyhow::Result<ReconcileOutcome> {
    let Some(state) = state_store.load()? else {
        return Ok(ReconcileOutcome::NoActiveInstance);
    };
    let instance_id = state.instance.id.clone();
    let provider_name = state.instance.provider.clone();

    let Some(provider) = provider else {
        warn!("{provider_name}: not configured; leaving state for instance {instance_id} in place");
        return Ok(ReconcileOutcome::ProviderUnreachable {
            provider: provider_name,
            instance_id,
            detail: "provider not configured".to_string(),
        });
    };

    match provider.get_instance(&instance_id, cancel).await {
        Ok(instance) if !instance.status.is_terminal() => Ok(ReconcileOutcome::Valid),
        Ok(_terminal_instance) => {
            warn!("{provider_name}: instance {instance_id} terminated externally; clearing state");
            if auto_cleanup {
                state_store.clear()?;
            }
            Ok(ReconcileOutcome::MismatchTerminated {
                provider: provider_name,
                instance_id,
            })
        }
        Err(e) if e.code == ErrorCode::InstanceNotFound => {
            warn!(
                "{provider_name}: instance {instance_id} not found (possible causes: {})",
                NOT_FOUND_REASONS.join("; ")
            );
            if auto_cleanup {
                state_store.clear()?;
            }
            Ok(ReconcileOutcome::MismatchNotFound {
                provider: provider_name,
                instance_id,
                reasons: NOT_FOUND_REASONS.to_vec(),
            })
        }
        Err(e) => {
            warn!("{provider_name}: could not reach provider to reconcile instance {instance_id}: {e}");
            Ok(ReconcileOutcome::ProviderUnreachable {
                provider: provider_name,
                instance_id,
                detail: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gpu_lease_core::error::ProviderError;
    use gpu_lease_core::types::{AccountInfo, BillingStatus, CreateRequest, Instance, InstanceStatus, Offer, OfferFilter};
    use gpu_lease_state::{InstanceRecord, State};
    use tempfile::tempdir;

    struct FixedProvider {
        response: Result<Instance, ProviderError>,
    }

    #[async_trait]
    impl Provider for FixedProvider {
        fn name(&self) -> &'static str {
            "vast"
        }
        fn console_url(&self) -> &'static str {
            "https://cloud.vast.ai/"
        }
        fn supports_spot(&self) -> bool {
            true
        }
        fn supports_billing_verification(&self) -> bool {
            true
        }
        async fn get_offers(&self, _: &OfferFilter, _: &CancellationToken) -> Result<Vec<Offer>, ProviderError> {
            unimplemented!()
        }
        async fn create_instance(&self, _: &CreateRequest, _: &CancellationToken) -> Result<Instance, ProviderError> {
            unimplemented!()
        }
        async fn get_instance(&self, _: &str, _: &CancellationToken) -> Result<Instance, ProviderError> {
            self.response.clone()
        }
        async fn terminate_instance(&self, _: &str, _: &CancellationToken) -> Result<(), ProviderError> {
            unimplemented!()
        }
        async fn get_billing_status(&self, _: &str, _: &CancellationToken) -> Result<BillingStatus, ProviderError> {
            unimplemented!()
        }
        async fn validate_api_key(&self, _: &CancellationToken) -> Result<AccountInfo, ProviderError> {
            unimplemented!()
        }
    }

    fn sample_state() -> State {
        State::new(InstanceRecord {
            id: "v-7".to_string(),
            provider: "vast".to_string(),
            gpu: "A100 80GB".to_string(),
            region: "US-East".to_string(),
            instance_type: "on-demand".to_string(),
            public_ip: "203.0.113.5".to_string(),
            wireguard_ip: "10.66.0.2".to_string(),
            created_at: chrono::Utc::now(),
        })
    }

    #[tokio::test]
    async fn clears_state_when_instance_not_found() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(&sample_state()).unwrap();
        let provider = FixedProvider {
            response: Err(ProviderError::instance_not_found("vast", "v-7")),
        };
        let cancel = CancellationToken::new();
        let outcome = reconcile(&store, Some(&provider), true, &cancel).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::MismatchNotFound { .. }));
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn leaves_state_in_place_when_no_provider_configured() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(&sample_state()).unwrap();
        let cancel = CancellationToken::new();
        let outcome = reconcile(&store, None, true, &cancel).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::ProviderUnreachable { .. }));
        assert!(store.load().unwrap().is_some());
    }

    #[tokio::test]
    async fn no_active_instance_short_circuits() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let cancel = CancellationToken::new();
        let outcome = reconcile(&store, None, true, &cancel).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::NoActiveInstance);
    }
}
