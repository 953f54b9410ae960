//! CoreWeave client: REST, `Authorization: Bearer <key>` (design §4.2).
//! Spot availability is a per-region flag rather than a universal
//! capability. CoreWeave has no single native offer identifier either, so
//! `offer_id` is synthesized as `<sku>@<region>`.

use async_trait::async_trait;
use gpu_lease_core::error::{ErrorCode, ProviderError};
use gpu_lease_core::redaction::redact_secrets_in_text;
use gpu_lease_core::retry::{Outcome, RateLimiter};
use gpu_lease_core::traits::Provider;
use gpu_lease_core::types::{
    AccountInfo, BillingStatus, CreateRequest, Instance, InstanceStatus, Offer, OfferFilter,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::common::{http_retry, normalize_gpu_model, normalize_region, parse_synth_offer_id, synth_offer_id};

const BASE_URL: &str = "https://api.coreweave.com/v1";

pub struct CoreweaveClient {
    api_key: String,
    http: reqwest::Client,
    limiter: RateLimiter,
    base_url: String,
}

impl CoreweaveClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            http: reqwest::Client::new(),
            limiter: RateLimiter::new(),
            base_url: BASE_URL.to_string(),
        }
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.api_key)
    }

    fn map_instance(&self, raw: &Value) -> Instance {
        let status_str = raw["phase"].as_str().unwrap_or("");
        let status = match status_str {
            "Pending" | "ContainerCreating" => InstanceStatus::Creating,
            "Running" => InstanceStatus::Running,
            "Terminating" => InstanceStatus::Stopping,
            "Succeeded" | "Terminated" => InstanceStatus::Terminated,
            _ => InstanceStatus::Error,
        };
        Instance {
            id: raw["name"].as_str().unwrap_or("").to_string(),
            provider: self.name().to_string(),
            status,
            public_ip: raw["publicIp"].as_str().unwrap_or("").to_string(),
            gpu_model: normalize_gpu_model(raw["gpuType"].as_str().unwrap_or("")),
            region: normalize_region(raw["region"].as_str().unwrap_or("")),
            spot: raw["priority"].as_str() == Some("interruptible"),
            created_at: raw["createdAt"]
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_else(chrono::Utc::now),
            hourly_rate: raw["hourlyRate"].as_f64().unwrap_or(0.0),
        }
    }
}

#[async_trait]
impl Provider for CoreweaveClient {
    fn name(&self) -> &'static str {
        "coreweave"
    }

    fn console_url(&self) -> &'static str {
        "https://cloud.coreweave.com/"
    }

    fn supports_spot(&self) -> bool {
        true
    }

    fn supports_billing_verification(&self) -> bool {
        true
    }

    async fn get_offers(
        &self,
        filter: &OfferFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Offer>, ProviderError> {
        let url = format!("{}/inventory/skus", self.base_url);
        let offers = http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || self.auth(self.http.get(&url)).build().expect("valid request"),
            |status, body| {
                if status != 200 {
                    return Outcome::Permanent(ProviderError::api_error(
                        "coreweave",
                        redact_secrets_in_text(&format!("HTTP {status}: {body}")),
                    ));
                }
                let mut offers = Vec::new();
                for entry in body["skus"].as_array().into_iter().flatten() {
                    let sku = entry["sku"].as_str().unwrap_or("unknown");
                    let region_code = entry["region"].as_str().unwrap_or("unknown");
                    let spot_available = entry["spotAvailable"].as_bool().unwrap_or(false);
                    let offer = Offer {
                        offer_id: synth_offer_id(sku, region_code),
                        provider: "coreweave".to_string(),
                        gpu_model: normalize_gpu_model(entry["gpuType"].as_str().unwrap_or("")),
                        vram_gb: entry["vramGb"].as_u64().unwrap_or(0) as u32,
                        region: normalize_region(region_code),
                        price_on_demand: entry["onDemandHourly"].as_f64().unwrap_or(0.0),
                        price_spot: if spot_available {
                            entry["spotHourly"].as_f64()
                        } else {
                            None
                        },
                        available: entry["available"].as_bool().unwrap_or(false),
                    };
                    if filter.matches(&offer) {
                        offers.push(offer);
                    }
                }
                Outcome::Success(offers)
            },
        )
        .await?;
        Ok(offers)
    }

    async fn create_instance(
        &self,
        req: &CreateRequest,
        cancel: &CancellationToken,
    ) -> Result<Instance, ProviderError> {
        let (sku, region) = parse_synth_offer_id(&req.offer_id)
            .ok_or_else(|| ProviderError::offer_not_found("coreweave", &req.offer_id))?;

        let mut payload = json!({
            "sku": sku,
            "region": region,
            "diskGb": req.disk_size_gb,
            "userData": req.cloud_init,
            "priority": if req.spot { "interruptible" } else { "standard" },
        });
        if let Some(ref key) = req.ssh_public_key {
            payload["sshPublicKey"] = json!(key);
        }
        let body_bytes = serde_json::to_vec(&payload).expect("serializable payload");
        let url = format!("{}/instances", self.base_url);

        let raw = http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || {
                self.auth(self.http.post(&url))
                    .header("content-type", "application/json")
                    .body(body_bytes.clone())
                    .build()
                    .expect("valid request")
            },
            |status, body| match status {
                200 | 201 => Outcome::Success(body),
                409 => Outcome::Permanent(ProviderError::insufficient_capacity("coreweave")),
                422 if req.spot => {
                    Outcome::Permanent(ProviderError::spot_not_available("coreweave"))
                }
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("coreweave")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "coreweave",
                    redact_secrets_in_text(&format!("HTTP {status}: {body}")),
                )),
            },
        )
        .await?;
        Ok(self.map_instance(&raw))
    }

    async fn get_instance(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Instance, ProviderError> {
        let url = format!("{}/instances/{}", self.base_url, id);
        let id_owned = id.to_string();
        let raw = http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || self.auth(self.http.get(&url)).build().expect("valid request"),
            move |status, body| match status {
                200 => Outcome::Success(body),
                404 => Outcome::Permanent(ProviderError::instance_not_found("coreweave", &id_owned)),
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("coreweave")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "coreweave",
                    redact_secrets_in_text(&format!("HTTP {status}: {body}")),
                )),
            },
        )
        .await?;
        Ok(self.map_instance(&raw))
    }

    async fn terminate_instance(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/instances/{}", self.base_url, id);
        http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || self.auth(self.http.delete(&url)).build().expect("valid request"),
            |status, body| match status {
                200 | 202 | 404 => Outcome::Success(()),
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("coreweave")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "coreweave",
                    redact_secrets_in_text(&format!("HTTP {status}: {body}")),
                )),
            },
        )
        .await
    }

    async fn get_billing_status(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<BillingStatus, ProviderError> {
        match self.get_instance(id, cancel).await {
            Ok(instance) => Ok(match instance.status {
                InstanceStatus::Creating | InstanceStatus::Running | InstanceStatus::Stopping => {
                    BillingStatus::Active
                }
                InstanceStatus::Terminated => BillingStatus::Stopped,
                InstanceStatus::Error => BillingStatus::Unknown,
            }),
            Err(e) if e.code == ErrorCode::InstanceNotFound => Ok(BillingStatus::Stopped),
            Err(e) => Err(e),
        }
    }

    async fn validate_api_key(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AccountInfo, ProviderError> {
        let url = format!("{}/account", self.base_url);
        let raw = http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || self.auth(self.http.get(&url)).build().expect("valid request"),
            |status, body| match status {
                200 => Outcome::Success(body),
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("coreweave")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "coreweave",
                    redact_secrets_in_text(&format!("HTTP {status}: {body}")),
                )),
            },
        )
        .await?;
        Ok(AccountInfo {
            label: raw["orgName"].as_str().unwrap_or("coreweave-account").to_string(),
            balance: raw["creditBalance"].as_f64(),
            plan: raw["plan"].as_str().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spot_flag_is_derived_from_priority_field() {
        let client = CoreweaveClient::new("key".to_string());
        let raw = json!({
            "name": "cw-1",
            "phase": "Running",
            "publicIp": "203.0.113.2",
            "gpuType": "H100",
            "region": "us-east-1",
            "priority": "interruptible",
            "createdAt": "2024-05-01T00:00:00Z",
            "hourlyRate": 2.1,
        });
        let instance = client.map_instance(&raw);
        assert!(instance.spot);
        assert_eq!(instance.status, InstanceStatus::Running);
    }
}
