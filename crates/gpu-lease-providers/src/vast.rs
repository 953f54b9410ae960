//! Vast.ai client: REST, `Authorization: Bearer <key>`, spot via bid price
//! (design §4.2). Vast assigns a native offer id, so `offer_id` passes
//! through unsynthesized.

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

use crate::common::{http_retry, normalize_gpu_model, normalize_region};

const BASE_URL: &str = "https://console.vast.ai/api/v0";

pub struct VastClient {
    api_key: String,
    http: reqwest::Client,
    limiter: RateLimiter,
    base_url: String,
}

impl VastClient {
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
        let status_str = raw["actual_status"].as_str().unwrap_or("");
        let status = match status_str {
            "loading" | "created" => InstanceStatus::Creating,
            "running" => InstanceStatus::Running,
            "stopping" => InstanceStatus::Stopping,
            "exited" | "terminated" => InstanceStatus::Terminated,
            _ => InstanceStatus::Error,
        };
        Instance {
            id: raw["id"].as_u64().map(|n| n.to_string()).unwrap_or_default(),
            provider: self.name().to_string(),
            status,
            public_ip: raw["public_ipaddr"].as_str().unwrap_or("").to_string(),
            gpu_model: normalize_gpu_model(raw["gpu_name"].as_str().unwrap_or("")),
            region: normalize_region(raw["geolocation"].as_str().unwrap_or("")),
            spot: raw["is_bid"].as_bool().unwrap_or(false),
            created_at: raw["start_date"]
                .as_f64()
                .and_then(|secs| chrono::DateTime::from_timestamp(secs as i64, 0))
                .unwrap_or_else(chrono::Utc::now),
            hourly_rate: raw["dph_total"].as_f64().unwrap_or(0.0),
        }
    }
}

#[async_trait]
impl Provider for VastClient {
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

    async fn get_offers(
        &self,
        filter: &OfferFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Offer>, ProviderError> {
        let url = format!("{}/bundles/", self.base_url);
        let offers = http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || self.auth(self.http.get(&url)).build().expect("valid request"),
            |status, body| {
                if status != 200 {
                    return Outcome::Permanent(ProviderError::api_error(
                        "vast",
                        redact_secrets_in_text(&format!("HTTP {status}: {body}")),
                    ));
                }
                let offers: Vec<Offer> = body["offers"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .map(|raw| Offer {
                        offer_id: raw["id"].as_u64().map(|n| n.to_string()).unwrap_or_default(),
                        provider: "vast".to_string(),
                        gpu_model: normalize_gpu_model(raw["gpu_name"].as_str().unwrap_or("")),
                        vram_gb: (raw["gpu_ram"].as_f64().unwrap_or(0.0) / 1024.0).round() as u32,
                        region: normalize_region(raw["geolocation"].as_str().unwrap_or("")),
                        price_on_demand: raw["dph_total"].as_f64().unwrap_or(0.0),
                        price_spot: raw["min_bid"].as_f64(),
                        available: raw["rentable"].as_bool().unwrap_or(false),
                    })
                    .filter(|o| filter.matches(o))
                    .collect();
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
        let url = format!("{}/asks/{}/", self.base_url, req.offer_id);
        let mut payload = json!({
            "client_id": "me",
            "image": "ollama/ollama:latest",
            "disk": req.disk_size_gb,
            "onstart": req.cloud_init,
        });
        if req.spot {
            payload["price"] = json!(null);
            payload["is_bid"] = json!(true);
        }
        if let Some(ref key) = req.ssh_public_key {
            payload["ssh_key"] = json!(key);
        }
        let body_bytes = serde_json::to_vec(&payload).expect("serializable payload");

        let instance = http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || {
                self.auth(self.http.put(&url))
                    .header("content-type", "application/json")
                    .body(body_bytes.clone())
                    .build()
                    .expect("valid request")
            },
            |status, body| match status {
                200 | 201 => Outcome::Success(body),
                400 if body["msg"].as_str().unwrap_or("").contains("no_such_ask") => {
                    Outcome::Permanent(ProviderError::offer_not_found("vast", &req.offer_id))
                }
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("vast")),
                503 => Outcome::Permanent(ProviderError::insufficient_capacity("vast")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "vast",
                    redact_secrets_in_text(&format!("HTTP {status}: {body}")),
                )),
            },
        )
        .await?;

        let new_id = instance["new_contract"]
            .as_u64()
            .map(|n| n.to_string())
            .unwrap_or_default();
        self.get_instance(&new_id, cancel).await
    }

    async fn get_instance(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Instance, ProviderError> {
        let url = format!("{}/instances/{}/", self.base_url, id);
        let id_owned = id.to_string();
        let raw = http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || self.auth(self.http.get(&url)).build().expect("valid request"),
            move |status, body| match status {
                200 if body["instances"].is_null() => {
                    Outcome::Permanent(ProviderError::instance_not_found("vast", &id_owned))
                }
                200 => Outcome::Success(body["instances"].clone()),
                404 => Outcome::Permanent(ProviderError::instance_not_found("vast", &id_owned)),
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("vast")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "vast",
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
        let url = format!("{}/instances/{}/", self.base_url, id);
        http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || self.auth(self.http.delete(&url)).build().expect("valid request"),
            |status, body| match status {
                200 | 404 => Outcome::Success(()),
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("vast")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "vast",
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
        let url = format!("{}/users/current/", self.base_url);
        let raw = http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || self.auth(self.http.get(&url)).build().expect("valid request"),
            |status, body| match status {
                200 => Outcome::Success(body),
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("vast")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "vast",
                    redact_secrets_in_text(&format!("HTTP {status}: {body}")),
                )),
            },
        )
        .await?;
        Ok(AccountInfo {
            label: raw["username"].as_str().unwrap_or("vast-user").to_string(),
            balance: raw["credit"].as_f64(),
            plan: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_running_status() {
        let client = VastClient::new("key".to_string());
        let raw = json!({
            "id": 42,
            "actual_status": "running",
            "public_ipaddr": "203.0.113.1",
            "gpu_name": "A100_80GB",
            "geolocation": "US-East-1",
            "is_bid": true,
            "start_date": 1_700_000_000.0,
            "dph_total": 0.65,
        });
        let instance = client.map_instance(&raw);
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.gpu_model, "A100 80GB");
        assert!(instance.spot);
    }

    #[test]
    fn ambiguous_status_collapses_to_error() {
        let client = VastClient::new("key".to_string());
        let raw = json!({"id": 1, "actual_status": "weird_new_state"});
        assert_eq!(client.map_instance(&raw).status, InstanceStatus::Error);
    }
}
