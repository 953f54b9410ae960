//! The Deployer (design §4.5): the staged forward pipeline that composes a
//! successful lease. Stages execute in the numbered order; any failure at
//! stage >= 3 triggers compensating rollback of the resources that stage
//! and its predecessors already created, run under a fresh deadline
//! independent of the caller's (possibly already cancelled) context.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gpu_lease_core::error::{DeployError, ErrorCode, ProviderError};
use gpu_lease_core::traits::Provider;
use gpu_lease_core::types::{CreateRequest, Instance, ModelProfile, Offer, OfferFilter};
use gpu_lease_state::{CostRecord, DeadmanRecord, InstanceRecord, ModelRecord, State, StateStore, WireguardRecord};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::cloud_init::{generate_cloud_init, CloudInitParams};
use crate::progress::{ProgressCallback, ProgressEvent};
use crate::registry::Registry;
use crate::tunnel::{self, ClientConfig, KeyPair, Tunnel, WaitOptions};

const TOTAL_STAGES: u8 = 8;
const PRICE_DISCOVERY_DEADLINE: Duration = Duration::from_secs(30);
const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const BOOT_DEADLINE: Duration = Duration::from_secs(5 * 60);
const TUNNEL_HANDSHAKE_DEADLINE: Duration = Duration::from_secs(2 * 60);
const MODEL_POLL_INTERVAL: Duration = Duration::from_secs(10);
const MODEL_READY_DEADLINE: Duration = Duration::from_secs(15 * 60);
const FINAL_HEALTH_DEADLINE: Duration = Duration::from_secs(30);
const ROLLBACK_DEADLINE: Duration = Duration::from_secs(30);
const WIREGUARD_LISTEN_PORT: u16 = 51820;

/// Everything the Deployer needs that isn't discovered mid-pipeline: the
/// resolved model profile, the user's provider/gpu/region/spot preferences,
/// and the deadman timeout already clamped to `[1, 72]` hours.
pub struct DeployRequest {
    pub model: ModelProfile,
    pub provider_filter: Option<String>,
    pub gpu_filter: Option<String>,
    pub region_filter: Option<String>,
    /// Whether spot is preferred for *selection* (stage 2) and for the
    /// instance request itself (stage 3): `!on_demand` (design §9 Open
    /// Question), true by default.
    pub prefer_spot: bool,
    /// The raw `--spot` flag: the user explicitly asked to restrict the
    /// Fetch-prices filter (stage 1) to spot-carrying offers, as opposed
    /// to `prefer_spot` merely nudging stage 2's selection. Distinct from
    /// `prefer_spot` so stage 1's filter reflects the user's literal
    /// intent rather than the collapsed preference bool (spec.md §4.5
    /// stage 1: "spot-only vs on-demand-only" is a filter dimension on
    /// par with GPU type, VRAM, and region).
    pub spot_requested: bool,
    pub timeout_hours: u32,
    pub ssh_public_key: Option<String>,
}

pub struct DeployOutcome {
    pub instance: Instance,
    pub wireguard_client_ip: String,
    pub tunnel: Tunnel,
    pub model_port: u16,
}

pub struct Deployer<'a> {
    registry: &'a Registry,
    state_store: &'a StateStore,
    progress: ProgressCallback,
}

impl<'a> Deployer<'a> {
    pub fn new(registry: &'a Registry, state_store: &'a StateStore, progress: ProgressCallback) -> Self {
        Self {
            registry,
            state_store,
            progress,
        }
    }

    fn emit(&self, event: ProgressEvent) {
        (self.progress)(event);
    }

    pub async fn run(&self, req: &DeployRequest, cancel: &CancellationToken) -> Result<DeployOutcome, DeployError> {
        match self.run_inner(req, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err((err, created)) => {
                if err.rollback_from_stage() >= 3 {
                    self.rollback(created).await;
                }
                Err(err)
            }
        }
    }

    async fn run_inner(
        &self,
        req: &DeployRequest,
        cancel: &CancellationToken,
    ) -> Result<DeployOutcome, (DeployError, CreatedResources)> {
        let mut created = CreatedResources::default();

        // Stage 1: fetch prices.
        self.emit(ProgressEvent::start(1, TOTAL_STAGES, "Fetching prices"));
        let filter = build_offer_filter(req);
        let offers = self
            .fetch_prices(req, &filter, cancel)
            .await
            .map_err(|e| (e, created.clone()))?;
        self.emit(ProgressEvent::done(
            1,
            TOTAL_STAGES,
            "Fetching prices",
            Some(format!("{} offers", offers.len())),
        ));

        // Stage 2: select offer.
        self.emit(ProgressEvent::start(2, TOTAL_STAGES, "Selecting offer"));
        let (offer, provider) = select_offer(offers, req.prefer_spot, self.registry)
            .ok_or_else(|| (DeployError::NoCompatibleOffers("no offers survived selection".to_string()), created.clone()))?;
        self.emit(ProgressEvent::done(
            2,
            TOTAL_STAGES,
            "Selecting offer",
            Some(format!("{} in {} at {:.2}/hr", offer.gpu_model, offer.region, offer.effective_price(req.prefer_spot))),
        ));

        // Stage 3: create instance.
        self.emit(ProgressEvent::start(3, TOTAL_STAGES, "Creating instance"));
        let server_keys = KeyPair::generate();
        let use_spot = req.prefer_spot && offer.price_spot.map(|p| p > 0.0).unwrap_or(false);
        let cloud_init = generate_cloud_init(&CloudInitParams {
            server_keys: &server_keys,
            server_listen_port: WIREGUARD_LISTEN_PORT,
            deadman_timeout_hours: req.timeout_hours,
            model_pull_tag: &req.model.pull_tag,
            model_port: req.model.port,
            provider: provider.name(),
            self_termination_token: &uuid_like_token(),
        });
        let create_req = CreateRequest {
            offer_id: offer.offer_id.clone(),
            spot: use_spot,
            cloud_init,
            ssh_public_key: req.ssh_public_key.clone(),
            disk_size_gb: req.model.disk_size_gb.max(CreateRequest::MIN_DISK_SIZE_GB),
        };
        let instance = provider
            .create_instance(&create_req, cancel)
            .await
            .map_err(|e| (DeployError::InstanceCreationFailed(e.to_string()), created.clone()))?;
        created.instance_id = Some(instance.id.clone());
        created.provider = Some(Arc::clone(&provider));
        self.emit(ProgressEvent::done(
            3,
            TOTAL_STAGES,
            "Creating instance",
            Some(instance.id.clone()),
        ));

        // Stage 4: wait for boot.
        self.emit(ProgressEvent::start(4, TOTAL_STAGES, "Waiting for instance to boot"));
        let instance = self
            .wait_for_boot(&provider, &instance.id, cancel)
            .await
            .map_err(|e| (e, created.clone()))?;
        self.emit(ProgressEvent::done(4, TOTAL_STAGES, "Waiting for instance to boot", Some(instance.public_ip.clone())));

        // Stage 5: configure tunnel.
        self.emit(ProgressEvent::start(5, TOTAL_STAGES, "Configuring tunnel"));
        let client_keys = KeyPair::generate();
        let interface_name = format!("gl{}", &instance.id.chars().take(8).collect::<String>());
        let client_tunnel_ip = "10.66.0.2".to_string();
        let client_config = ClientConfig {
            interface_name: interface_name.clone(),
            client_keys: client_keys.clone(),
            client_tunnel_ip: client_tunnel_ip.clone(),
            server_public_key_b64: server_keys.public_key_b64.clone(),
            server_endpoint: instance.public_ip.clone(),
            server_endpoint_port: WIREGUARD_LISTEN_PORT,
        };
        let tunnel = tunnel::setup_tunnel(&client_config)
            .await
            .map_err(|e| (DeployError::TunnelFailed(e.to_string()), created.clone()))?;
        created.tunnel_interface = Some(tunnel.interface_name.clone());
        tunnel::wait_for_connection(
            &tunnel,
            &WaitOptions {
                probe_model_health: None,
                deadline: TUNNEL_HANDSHAKE_DEADLINE,
            },
            cancel,
        )
        .await
        .map_err(|e| (DeployError::TunnelFailed(e.to_string()), created.clone()))?;
        self.emit(ProgressEvent::done(5, TOTAL_STAGES, "Configuring tunnel", Some(client_tunnel_ip.clone())));

        // Stage 6: wait for model.
        self.emit(ProgressEvent::start(6, TOTAL_STAGES, "Waiting for model to become ready"));
        let server_tunnel_ip = "10.66.0.1".to_string();
        tunnel::wait_for_connection(
            &tunnel,
            &WaitOptions {
                probe_model_health: Some((server_tunnel_ip.clone(), req.model.port)),
                deadline: MODEL_READY_DEADLINE,
            },
            cancel,
        )
        .await
        .map_err(|e| (DeployError::ModelPullFailed(e.to_string()), created.clone()))?;
        self.emit(ProgressEvent::done(6, TOTAL_STAGES, "Waiting for model to become ready", None));

        // Stage 7: arm deadman (semantic -- the timer is armed by cloud-init at
        // creation; this stage surfaces the deadline to the caller).
        self.emit(ProgressEvent::start(7, TOTAL_STAGES, "Arming deadman switch"));
        self.emit(ProgressEvent::done(
            7,
            TOTAL_STAGES,
            "Arming deadman switch",
            Some(format!("{}h", req.timeout_hours)),
        ));

        // Stage 8: verify health.
        self.emit(ProgressEvent::start(8, TOTAL_STAGES, "Verifying health"));
        tunnel::wait_for_connection(
            &tunnel,
            &WaitOptions {
                probe_model_health: Some((server_tunnel_ip, req.model.port)),
                deadline: FINAL_HEALTH_DEADLINE,
            },
            cancel,
        )
        .await
        .map_err(|e| (DeployError::HealthCheckFailed(e.to_string()), created.clone()))?;
        self.emit(ProgressEvent::done(8, TOTAL_STAGES, "Verifying health", None));

        self.persist_state(&instance, &provider, &client_config, req, use_spot);

        Ok(DeployOutcome {
            instance,
            wireguard_client_ip: client_tunnel_ip,
            tunnel,
            model_port: req.model.port,
        })
    }

    async fn fetch_prices(
        &self,
        req: &DeployRequest,
        filter: &OfferFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<(Offer, Arc<dyn Provider>)>, DeployError> {
        let candidates: Vec<Arc<dyn Provider>> = self
            .registry
            .providers()
            .iter()
            .filter(|p| req.provider_filter.as_deref().map(|f| f == p.name()).unwrap_or(true))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(DeployError::NoCompatibleOffers("no provider matches --provider filter".to_string()));
        }

        let fan_out = futures::future::join_all(candidates.iter().map(|provider| {
            let provider = Arc::clone(provider);
            let filter = filter.clone();
            let cancel = cancel.clone();
            async move {
                let result = tokio::time::timeout(PRICE_DISCOVERY_DEADLINE, provider.get_offers(&filter, &cancel)).await;
                (provider, result)
            }
        }))
        .await;

        let mut offers = Vec::new();
        let mut all_failed = true;
        for (provider, result) in fan_out {
            match result {
                Ok(Ok(provider_offers)) => {
                    all_failed = false;
                    offers.extend(provider_offers.into_iter().map(|o| (o, Arc::clone(&provider))));
                }
                Ok(Err(err)) => {
                    warn!("{}: price discovery failed: {err}", provider.name());
                }
                Err(_) => {
                    warn!("{}: price discovery timed out after {PRICE_DISCOVERY_DEADLINE:?}", provider.name());
                }
            }
        }
        if all_failed {
            return Err(DeployError::NoCompatibleOffers("every configured provider failed price discovery".to_string()));
        }
        if offers.is_empty() {
            return Err(DeployError::NoCompatibleOffers("no available offers matched the filter".to_string()));
        }
        Ok(offers)
    }

    async fn wait_for_boot(
        &self,
        provider: &Arc<dyn Provider>,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Instance, DeployError> {
        let deadline = tokio::time::Instant::now() + BOOT_DEADLINE;
        loop {
            match provider.get_instance(instance_id, cancel).await {
                Ok(instance) if instance.status == gpu_lease_core::types::InstanceStatus::Running => {
                    return provider
                        .get_instance(instance_id, cancel)
                        .await
                        .map_err(DeployError::Provider);
                }
                Ok(instance) if instance.status.is_terminal() => {
                    return Err(DeployError::BootTimeout {
                        instance_id: instance_id.to_string(),
                    });
                }
                Ok(_) => {}
                Err(e) if e.code == ErrorCode::ContextCancelled => return Err(DeployError::Provider(e)),
                Err(e) => warn!("{}: transient error polling boot status: {e}", provider.name()),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DeployError::BootTimeout {
                    instance_id: instance_id.to_string(),
                });
            }
            tokio::select! {
                _ = tokio::time::sleep(BOOT_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(DeployError::Provider(ProviderError::cancelled(provider.name()))),
            }
        }
    }

    fn persist_state(
        &self,
        instance: &Instance,
        provider: &Arc<dyn Provider>,
        client_config: &ClientConfig,
        req: &DeployRequest,
        use_spot: bool,
    ) {
        let state = State {
            version: gpu_lease_state::CURRENT_VERSION,
            instance: InstanceRecord {
                id: instance.id.clone(),
                provider: provider.name().to_string(),
                gpu: instance.gpu_model.clone(),
                region: instance.region.clone(),
                instance_type: if use_spot { "spot".to_string() } else { "on-demand".to_string() },
                public_ip: instance.public_ip.clone(),
                wireguard_ip: client_config.client_tunnel_ip.clone(),
                created_at: instance.created_at,
            },
            model: ModelRecord {
                name: req.model.model_id.clone(),
                status: "ready".to_string(),
            },
            wireguard: WireguardRecord {
                server_public_key: client_config.server_public_key_b64.clone(),
                interface_name: client_config.interface_name.clone(),
            },
            cost: CostRecord {
                hourly_rate: instance.hourly_rate,
                accumulated: 0.0,
                currency: "USD".to_string(),
            },
            deadman: DeadmanRecord {
                timeout_hours: req.timeout_hours,
                last_heartbeat: Some(Utc::now()),
            },
        };
        if let Err(e) = self.state_store.save(&state) {
            warn!("failed to persist deploy state (lease is live regardless): {e}");
        }
    }

    /// Best-effort rollback under a fresh, caller-independent deadline
    /// (design §4.5, §9 "Compensating rollback"): tear down the tunnel if
    /// stage 5 succeeded, then terminate the instance if stage 3 succeeded.
    /// Errors here are logged, never returned -- they must not mask the
    /// original stage failure.
    async fn rollback(&self, created: CreatedResources) {
        let fresh_cancel = CancellationToken::new();
        if let Some(iface) = created.tunnel_interface {
            if let Err(e) = tokio::time::timeout(ROLLBACK_DEADLINE, tunnel::teardown_tunnel(&iface)).await {
                warn!("rollback: tunnel teardown timed out: {e}");
            } else if let Err(e) = tunnel::teardown_tunnel(&iface).await {
                warn!("rollback: tunnel teardown failed: {e}");
            }
        }
        if let (Some(instance_id), Some(provider)) = (created.instance_id, created.provider) {
            info!("rollback: terminating instance {instance_id}");
            let result = tokio::time::timeout(
                ROLLBACK_DEADLINE,
                provider.terminate_instance(&instance_id, &fresh_cancel),
            )
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("rollback: terminate_instance failed: {e}"),
                Err(_) => warn!("rollback: terminate_instance timed out after {ROLLBACK_DEADLINE:?}"),
            }
        }
    }
}

#[derive(Clone, Default)]
struct CreatedResources {
    instance_id: Option<String>,
    provider: Option<Arc<dyn Provider>>,
    tunnel_interface: Option<String>,
}

/// Derive stage 1's shared `GetOffers` filter (design §4.5 stage 1) from
/// the request's raw flags: `--spot` narrows candidates to spot-carrying
/// offers unless `--on-demand` overrides it; `--on-demand` always narrows
/// to on-demand-only.
fn build_offer_filter(req: &DeployRequest) -> OfferFilter {
    OfferFilter {
        gpu_model: req.gpu_filter.clone(),
        min_vram_gb: Some(req.model.min_vram_gb),
        region: req.region_filter.clone(),
        spot_only: req.spot_requested && req.prefer_spot,
        on_demand_only: !req.prefer_spot,
        max_price: None,
    }
}

/// Sort by effective price (design §4.5 stage 2), ties broken by provider
/// priority order; return the cheapest `(offer, provider)` pair.
fn select_offer(
    offers: Vec<(Offer, Arc<dyn Provider>)>,
    prefer_spot: bool,
    registry: &Registry,
) -> Option<(Offer, Arc<dyn Provider>)> {
    offers.into_iter().min_by(|(a, pa), (b, pb)| {
        let price_a = a.effective_price(prefer_spot);
        let price_b = b.effective_price(prefer_spot);
        price_a
            .partial_cmp(&price_b)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| registry.priority(pa.name()).cmp(&registry.priority(pb.name())))
    })
}

/// A short opaque token for the cloud-init self-termination callback. Not
/// a cryptographic identifier -- the provider-side timer only needs
/// something that round-trips through the payload.
fn uuid_like_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_lease_core::config::load_credentials;
    use std::collections::HashMap;

    fn registry_with(providers: &[&str]) -> Registry {
        let overrides: HashMap<String, String> =
            providers.iter().map(|p| (p.to_string(), format!("{p}-key"))).collect();
        Registry::from_credentials(&load_credentials(&overrides).unwrap())
    }

    fn offer(provider: &str, on_demand: f64, spot: Option<f64>) -> Offer {
        Offer {
            offer_id: "o1".to_string(),
            provider: provider.to_string(),
            gpu_model: "A100 40GB".to_string(),
            vram_gb: 40,
            region: "US-East".to_string(),
            price_on_demand: on_demand,
            price_spot: spot,
            available: true,
        }
    }

    fn request(prefer_spot: bool, spot_requested: bool) -> DeployRequest {
        DeployRequest {
            model: ModelProfile {
                model_id: "qwen2.5-coder:14b".to_string(),
                min_vram_gb: 24,
                preferred_gpu: "A100 40GB".to_string(),
                disk_size_gb: 80,
                pull_tag: "qwen2.5-coder:14b".to_string(),
                port: 11434,
            },
            provider_filter: None,
            gpu_filter: None,
            region_filter: None,
            prefer_spot,
            spot_requested,
            timeout_hours: 10,
            ssh_public_key: None,
        }
    }

    #[test]
    fn default_request_filters_neither_spot_only_nor_on_demand_only() {
        let filter = build_offer_filter(&request(true, false));
        assert!(!filter.spot_only);
        assert!(!filter.on_demand_only);
    }

    #[test]
    fn explicit_spot_flag_narrows_to_spot_only() {
        let filter = build_offer_filter(&request(true, true));
        assert!(filter.spot_only);
        assert!(!filter.on_demand_only);
    }

    #[test]
    fn on_demand_overrides_spot_only_even_if_spot_was_also_requested() {
        let filter = build_offer_filter(&request(false, true));
        assert!(!filter.spot_only);
        assert!(filter.on_demand_only);
    }

    #[test]
    fn filter_carries_gpu_vram_and_region_through() {
        let mut req = request(true, false);
        req.gpu_filter = Some("A100 40GB".to_string());
        req.region_filter = Some("US-East".to_string());
        let filter = build_offer_filter(&req);
        assert_eq!(filter.gpu_model, Some("A100 40GB".to_string()));
        assert_eq!(filter.min_vram_gb, Some(24));
        assert_eq!(filter.region, Some("US-East".to_string()));
    }

    #[test]
    fn selects_cheapest_effective_price_preferring_spot() {
        let registry = registry_with(&["vast", "lambda"]);
        let vast = registry.by_name("vast").unwrap();
        let lambda = registry.by_name("lambda").unwrap();
        let offers = vec![
            (offer("vast", 0.95, Some(0.65)), vast),
            (offer("lambda", 1.10, None), lambda),
        ];
        let (selected, provider) = select_offer(offers, true, &registry).unwrap();
        assert_eq!(provider.name(), "vast");
        assert_eq!(selected.effective_price(true), 0.65);
    }

    #[test]
    fn ties_break_by_provider_priority_order() {
        let registry = registry_with(&["lambda", "vast"]);
        let vast = registry.by_name("vast").unwrap();
        let lambda = registry.by_name("lambda").unwrap();
        let offers = vec![
            (offer("lambda", 1.0, None), lambda),
            (offer("vast", 1.0, None), vast),
        ];
        let (_, provider) = select_offer(offers, false, &registry).unwrap();
        assert_eq!(provider.name(), "vast");
    }
}
