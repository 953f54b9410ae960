//! Core data types shared by the provider contract, the Deployer/Stopper
//! pipelines, and the State Store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable price quote from one provider at one point in time.
///
/// Produced by `Provider::get_offers`, consumed by the offer selector,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    /// Provider-scoped opaque token. Synthesized as `<sku>@<region>` by
    /// providers with no native single identifier.
    pub offer_id: String,
    pub provider: String,
    /// Normalized GPU model, e.g. "A100 80GB".
    pub gpu_model: String,
    pub vram_gb: u32,
    /// Normalized region, e.g. "US-East".
    pub region: String,
    pub price_on_demand: f64,
    /// Absent means the provider does not offer spot for this SKU.
    pub price_spot: Option<f64>,
    pub available: bool,
}

impl Offer {
    /// Spot price if `prefer_spot` and spot is present and positive,
    /// otherwise on-demand.
    pub fn effective_price(&self, prefer_spot: bool) -> f64 {
        if prefer_spot {
            if let Some(spot) = self.price_spot {
                if spot > 0.0 {
                    return spot;
                }
            }
        }
        self.price_on_demand
    }
}

/// Whether a lease should be requested as spot or on-demand capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceType {
    Spot,
    OnDemand,
}

impl std::fmt::Display for InstanceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceType::Spot => write!(f, "spot"),
            InstanceType::OnDemand => write!(f, "on-demand"),
        }
    }
}

/// Parameters for leasing an instance against a chosen offer.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub offer_id: String,
    pub spot: bool,
    /// Opaque payload produced by the cloud-init collaborator.
    pub cloud_init: String,
    pub ssh_public_key: Option<String>,
    pub disk_size_gb: u32,
}

impl CreateRequest {
    pub const MIN_DISK_SIZE_GB: u32 = 50;
}

/// Lifecycle status of a leased instance. Transitions are monotone:
/// `Creating -> Running -> Stopping -> Terminated`, with `Error` reachable
/// from any state. No transition returns to a prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Creating,
    Running,
    Stopping,
    Terminated,
    Error,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Terminated | InstanceStatus::Error)
    }
}

/// A live or recently-terminated lease, as reported by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub provider: String,
    pub status: InstanceStatus,
    /// Empty until `status` reaches `Running`.
    pub public_ip: String,
    pub gpu_model: String,
    pub region: String,
    pub spot: bool,
    pub created_at: DateTime<Utc>,
    pub hourly_rate: f64,
}

/// Closed set of billing states, produced by `Provider::get_billing_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Active,
    Stopped,
    Unknown,
}

/// Result of `Provider::validate_api_key`. Consumed only during
/// configuration, never on the Deploy/Stop hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub label: String,
    pub balance: Option<f64>,
    pub plan: Option<String>,
}

/// A filter over `Provider::get_offers`. All present fields are AND'd.
#[derive(Debug, Clone, Default)]
pub struct OfferFilter {
    pub gpu_model: Option<String>,
    pub min_vram_gb: Option<u32>,
    pub region: Option<String>,
    pub spot_only: bool,
    pub on_demand_only: bool,
    pub max_price: Option<f64>,
}

impl OfferFilter {
    /// Whether `offer` satisfies every predicate this filter sets.
    pub fn matches(&self, offer: &Offer) -> bool {
        if !offer.available {
            return false;
        }
        if let Some(ref gpu) = self.gpu_model {
            if &offer.gpu_model != gpu {
                return false;
            }
        }
        if let Some(min_vram) = self.min_vram_gb {
            if offer.vram_gb < min_vram {
                return false;
            }
        }
        if let Some(ref region) = self.region {
            if &offer.region != region {
                return false;
            }
        }
        if self.spot_only && offer.price_spot.is_none() {
            return false;
        }
        if self.on_demand_only && offer.price_on_demand <= 0.0 {
            return false;
        }
        if let Some(max_price) = self.max_price {
            let price = if self.spot_only {
                offer.price_spot.unwrap_or(f64::MAX)
            } else {
                offer.price_on_demand
            };
            if price > max_price {
                return false;
            }
        }
        true
    }
}

/// A built-in model/GPU resource-requirement entry. The CLI's `--model`/
/// `--tier` flags resolve against a small static table of these; the
/// Deployer never invents resource requirements itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    pub model_id: String,
    pub min_vram_gb: u32,
    pub preferred_gpu: String,
    pub disk_size_gb: u32,
    /// Ollama pull tag, e.g. "qwen2.5-coder:14b".
    pub pull_tag: String,
    pub port: u16,
}

impl ModelProfile {
    pub const OLLAMA_PORT: u16 = 11434;
}
