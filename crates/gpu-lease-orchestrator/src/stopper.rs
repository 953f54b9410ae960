//! The Stopper (design §4.6): the 4-stage reverse pipeline. Terminates the
//! instance, verifies billing has actually stopped (or escalates to manual
//! verification when the provider can't confirm it), tears down the
//! tunnel, and clears State.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gpu_lease_core::error::{ErrorCode, StopError};
use gpu_lease_core::traits::Provider;
use gpu_lease_core::types::BillingStatus;
use gpu_lease_core::utils::{format_duration, hours_elapsed, session_cost};
use gpu_lease_state::StateStore;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::progress::{ProgressCallback, ProgressEvent};
use crate::tunnel;

const TOTAL_STAGES: u8 = 4;
const MAX_ATTEMPTS: u32 = 5;
const BACKOFF: [Duration; 4] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
];

/// `{instance_id, provider, attempts, console_url}` handed to the
/// critical-alert callback when terminate or billing-verification retries
/// are exhausted (design §4.6). Fires at most once per Stop, since either
/// exhaustion path that reaches it is the last thing that Stop invocation
/// does before returning.
#[derive(Debug, Clone)]
pub struct CriticalAlert {
    pub instance_id: String,
    pub provider: String,
    pub attempts: u32,
    pub console_url: &'static str,
    pub reason: &'static str,
}

/// Numbered, provider-specific instructions presented when a provider
/// lacks a billing-status API (design §4.6).
#[derive(Debug, Clone)]
pub struct ManualVerification {
    pub provider: String,
    pub instance_id: String,
    pub console_url: &'static str,
    pub instructions: Vec<String>,
}

pub type CriticalAlertCallback = Arc<dyn Fn(CriticalAlert) + Send + Sync>;
pub type ManualVerificationCallback = Arc<dyn Fn(ManualVerification) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum StopStatus {
    Stopped,
    ManualVerificationRequired,
    Error,
}

/// The JSON-shaped result (design §6 "Stop"): always populated once an
/// active instance was found, whether or not the Stop fully succeeded.
/// `error` carries the stage-level code when `status = Error`.
#[derive(Debug, Clone)]
pub struct StopResult {
    pub status: StopStatus,
    pub instance_id: String,
    pub provider: String,
    pub billing_verified: bool,
    pub manual_verification_required: bool,
    pub console_url: &'static str,
    pub session_cost: f64,
    pub session_duration: String,
    pub session_duration_seconds: i64,
    pub error: Option<&'static str>,
}

pub struct Stopper<'a> {
    state_store: &'a StateStore,
    progress: ProgressCallback,
    critical_alert: Option<CriticalAlertCallback>,
    manual_verification: Option<ManualVerificationCallback>,
}

impl<'a> Stopper<'a> {
    pub fn new(state_store: &'a StateStore, progress: ProgressCallback) -> Self {
        Self {
            state_store,
            progress,
            critical_alert: None,
            manual_verification: None,
        }
    }

    pub fn with_critical_alert(mut self, cb: CriticalAlertCallback) -> Self {
        self.critical_alert = Some(cb);
        self
    }

    pub fn with_manual_verification(mut self, cb: ManualVerificationCallback) -> Self {
        self.manual_verification = Some(cb);
        self
    }

    fn emit(&self, event: ProgressEvent) {
        (self.progress)(event);
    }

    /// Run the 4-stage pipeline. `Err(NoActiveInstance)` is the only outcome
    /// with no instance to report; every other outcome -- including
    /// `terminate_failed` and `billing_not_verified` -- is returned as a
    /// fully populated [`StopResult`] so JSON output always carries session
    /// cost/duration even when the Stop did not cleanly succeed.
    pub async fn run(
        &self,
        provider: Arc<dyn Provider>,
        cancel: &CancellationToken,
    ) -> Result<StopResult, StopError> {
        let state = self
            .state_store
            .load()
            .map_err(|_| StopError::NoActiveInstance)?
            .ok_or(StopError::NoActiveInstance)?;
        let instance_id = state.instance.id.clone();
        let now = Utc::now();
        let session_cost_value = session_cost(state.instance.created_at, now, state.cost.hourly_rate);
        let duration_seconds = (hours_elapsed(state.instance.created_at, now) * 3600.0) as i64;

        let base_result = |status: StopStatus, billing_verified: bool, manual_required: bool, error: Option<&'static str>| StopResult {
            status,
            instance_id: instance_id.clone(),
            provider: provider.name().to_string(),
            billing_verified,
            manual_verification_required: manual_required,
            console_url: provider.console_url(),
            session_cost: session_cost_value,
            session_duration: format_duration(duration_seconds),
            session_duration_seconds: duration_seconds,
            error,
        };

        // Stage 1: terminate.
        self.emit(ProgressEvent::start(1, TOTAL_STAGES, "Terminating instance"));
        if let Err(stage_err) = self.terminate_with_retries(&provider, &instance_id, cancel).await {
            self.emit(ProgressEvent::done(1, TOTAL_STAGES, "Terminating instance", Some("failed".to_string())));
            return Ok(base_result(StopStatus::Error, false, false, Some(stage_err.code())));
        }
        self.emit(ProgressEvent::done(1, TOTAL_STAGES, "Terminating instance", None));

        // Stage 2: verify billing.
        self.emit(ProgressEvent::start(2, TOTAL_STAGES, "Verifying billing has stopped"));
        let (billing_verified, manual_required) = if provider.supports_billing_verification() {
            (self.verify_billing_with_retries(&provider, &instance_id, cancel).await, false)
        } else {
            self.escalate_manual_verification(&provider, &instance_id);
            (false, true)
        };
        self.emit(ProgressEvent::done(
            2,
            TOTAL_STAGES,
            "Verifying billing has stopped",
            Some(if billing_verified {
                "confirmed stopped".to_string()
            } else if manual_required {
                "manual verification required".to_string()
            } else {
                "could not confirm".to_string()
            }),
        ));

        // Stage 3: tear down tunnel. Best effort; never fails the Stop.
        self.emit(ProgressEvent::start(3, TOTAL_STAGES, "Tearing down tunnel"));
        if !state.wireguard.interface_name.is_empty() {
            if let Err(e) = tunnel::teardown_tunnel(&state.wireguard.interface_name).await {
                warn!("tunnel teardown reported a warning: {e}");
            }
        }
        self.emit(ProgressEvent::done(3, TOTAL_STAGES, "Tearing down tunnel", None));

        // Stage 4: clear state.
        self.emit(ProgressEvent::start(4, TOTAL_STAGES, "Clearing local state"));
        if let Err(e) = self.state_store.clear() {
            warn!("failed to clear state: {e}");
        }
        self.emit(ProgressEvent::done(4, TOTAL_STAGES, "Clearing local state", None));

        if manual_required {
            return Ok(base_result(StopStatus::ManualVerificationRequired, false, true, None));
        }
        if !billing_verified {
            return Ok(base_result(StopStatus::Error, false, false, Some(StopError::BillingNotVerified.code())));
        }
        Ok(base_result(StopStatus::Stopped, true, false, None))
    }

    async fn terminate_with_retries(
        &self,
        provider: &Arc<dyn Provider>,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), StopError> {
        for attempt in 1..=MAX_ATTEMPTS {
            match provider.terminate_instance(instance_id, cancel).await {
                Ok(()) => return Ok(()),
                Err(e) if e.code == ErrorCode::InstanceNotFound => return Ok(()),
                Err(e) => {
                    warn!("{}: terminate attempt {attempt}/{MAX_ATTEMPTS} failed: {e}", provider.name());
                    if attempt < MAX_ATTEMPTS {
                        let delay = BACKOFF[(attempt - 1) as usize];
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => break,
                        }
                    }
                }
            }
        }
        if let Some(cb) = &self.critical_alert {
            cb(CriticalAlert {
                instance_id: instance_id.to_string(),
                provider: provider.name().to_string(),
                attempts: MAX_ATTEMPTS,
                console_url: provider.console_url(),
                reason: "terminate_instance retries exhausted",
            });
        }
        Err(StopError::TerminateFailed)
    }

    async fn verify_billing_with_retries(
        &self,
        provider: &Arc<dyn Provider>,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> bool {
        for attempt in 1..=MAX_ATTEMPTS {
            match provider.get_billing_status(instance_id, cancel).await {
                Ok(BillingStatus::Stopped) => return true,
                Ok(other) => {
                    info!("{}: billing status {other:?} on attempt {attempt}/{MAX_ATTEMPTS}", provider.name());
                }
                Err(e) => {
                    warn!("{}: billing check attempt {attempt}/{MAX_ATTEMPTS} failed: {e}", provider.name());
                }
            }
            if attempt < MAX_ATTEMPTS {
                let delay = BACKOFF[(attempt - 1) as usize];
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
        if let Some(cb) = &self.critical_alert {
            cb(CriticalAlert {
                instance_id: instance_id.to_string(),
                provider: provider.name().to_string(),
                attempts: MAX_ATTEMPTS,
                console_url: provider.console_url(),
                reason: "billing-status retries exhausted",
            });
        }
        false
    }

    fn escalate_manual_verification(&self, provider: &Arc<dyn Provider>, instance_id: &str) {
        let console_url = provider.console_url();
        let instructions = vec![
            format!("Open {console_url} and sign in."),
            format!("Find instance {instance_id} and confirm its status shows terminated/stopped."),
            "Check the billing/usage section to confirm no further charges are accruing.".to_string(),
        ];
        if let Some(cb) = &self.manual_verification {
            cb(ManualVerification {
                provider: provider.name().to_string(),
                instance_id: instance_id.to_string(),
                console_url,
                instructions,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gpu_lease_core::error::ProviderError;
    use gpu_lease_core::types::{AccountInfo, CreateRequest, Instance, Offer, OfferFilter};
    use gpu_lease_state::{InstanceRecord, State};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    struct PaperspaceLikeProvider {
        terminate_calls: AtomicU32,
    }

    #[async_trait]
    impl Provider for PaperspaceLikeProvider {
        fn name(&self) -> &'static str {
            "paperspace"
        }
        fn console_url(&self) -> &'static str {
            "https://console.paperspace.com/"
        }
        fn supports_spot(&self) -> bool {
            false
        }
        fn supports_billing_verification(&self) -> bool {
            false
        }
        async fn get_offers(&self, _: &OfferFilter, _: &CancellationToken) -> Result<Vec<Offer>, ProviderError> {
            unimplemented!()
        }
        async fn create_instance(&self, _: &CreateRequest, _: &CancellationToken) -> Result<Instance, ProviderError> {
            unimplemented!()
        }
        async fn get_instance(&self, _: &str, _: &CancellationToken) -> Result<Instance, ProviderError> {
            unimplemented!()
        }
        async fn terminate_instance(&self, _: &str, _: &CancellationToken) -> Result<(), ProviderError> {
            self.terminate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn get_billing_status(&self, _: &str, _: &CancellationToken) -> Result<BillingStatus, ProviderError> {
            Err(ProviderError::billing_not_supported("paperspace"))
        }
        async fn validate_api_key(&self, _: &CancellationToken) -> Result<AccountInfo, ProviderError> {
            unimplemented!()
        }
    }

    struct AlwaysFailsTerminate {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Provider for AlwaysFailsTerminate {
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
            unimplemented!()
        }
        async fn terminate_instance(&self, _: &str, _: &CancellationToken) -> Result<(), ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::service_unavailable("vast", "HTTP 500"))
        }
        async fn get_billing_status(&self, _: &str, _: &CancellationToken) -> Result<BillingStatus, ProviderError> {
            unimplemented!()
        }
        async fn validate_api_key(&self, _: &CancellationToken) -> Result<AccountInfo, ProviderError> {
            unimplemented!()
        }
    }

    fn sample_state(provider: &str, id: &str) -> State {
        State::new(InstanceRecord {
            id: id.to_string(),
            provider: provider.to_string(),
            gpu: "RTX 4090 24GB".to_string(),
            region: "US-East".to_string(),
            instance_type: "on-demand".to_string(),
            public_ip: "203.0.113.9".to_string(),
            wireguard_ip: String::new(),
            created_at: chrono::Utc::now(),
        })
    }

    #[tokio::test]
    async fn stop_against_paperspace_escalates_to_manual_verification() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(&sample_state("paperspace", "ps-42")).unwrap();

        let provider: Arc<dyn Provider> = Arc::new(PaperspaceLikeProvider {
            terminate_calls: AtomicU32::new(0),
        });
        let received = Arc::new(std::sync::Mutex::new(None));
        let received_clone = Arc::clone(&received);
        let stopper = Stopper::new(&store, crate::progress::noop()).with_manual_verification(Arc::new(move |mv| {
            *received_clone.lock().unwrap() = Some(mv);
        }));

        let cancel = CancellationToken::new();
        let result = stopper.run(provider, &cancel).await.unwrap();

        assert_eq!(result.status, StopStatus::ManualVerificationRequired);
        assert!(result.manual_verification_required);
        assert!(!result.billing_verified);
        let mv = received.lock().unwrap().clone().unwrap();
        assert_eq!(mv.instance_id, "ps-42");
        assert_eq!(mv.instructions.len(), 3);
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn terminate_exhausting_retries_fires_critical_alert_and_leaves_state() {
        tokio::time::pause();
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(&sample_state("vast", "v-1")).unwrap();

        let provider: Arc<dyn Provider> = Arc::new(AlwaysFailsTerminate { calls: AtomicU32::new(0) });
        let alert_count = Arc::new(AtomicU32::new(0));
        let alert_count_clone = Arc::clone(&alert_count);
        let stopper = Stopper::new(&store, crate::progress::noop()).with_critical_alert(Arc::new(move |alert| {
            assert_eq!(alert.attempts, 5);
            alert_count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let cancel = CancellationToken::new();
        let result = stopper.run(provider, &cancel).await.unwrap();

        assert_eq!(result.status, StopStatus::Error);
        assert_eq!(result.error, Some("terminate_failed"));
        assert_eq!(alert_count.load(Ordering::SeqCst), 1);
        assert!(store.load().unwrap().is_some());
    }
}
