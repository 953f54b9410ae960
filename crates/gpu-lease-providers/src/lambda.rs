//! Lambda Labs client: REST, HTTP Basic with the key as username and an
//! empty password (design §4.2). Lambda exposes no single offer identifier,
//! so `offer_id` is synthesized as `<instance_type>@<region>` and parsed
//! back in `create_instance`. No spot support.

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

const BASE_URL: &str = "https://cloud.lambdalabs.com/api/v1";

pub struct LambdaClient {
    api_key: String,
    http: reqwest::Client,
    limiter: RateLimiter,
    base_url: String,
}

impl LambdaClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            http: reqwest::Client::new(),
            limiter: RateLimiter::new(),
            base_url: BASE_URL.to_string(),
        }
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.basic_auth(&self.api_key, Some(""))
    }

    fn map_instance(&self, raw: &Value) -> Instance {
        let status_str = raw["status"].as_str().unwrap_or("");
        let status = match status_str {
            "booting" => InstanceStatus::Creating,
            "active" => InstanceStatus::Running,
            "unhealthy" => InstanceStatus::Error,
            "terminating" => InstanceStatus::Stopping,
            "terminated" => InstanceStatus::Terminated,
            _ => InstanceStatus::Error,
        };
        Instance {
            id: raw["id"].as_str().unwrap_or("").to_string(),
            provider: self.name().to_string(),
            status,
            public_ip: raw["ip"].as_str().unwrap_or("").to_string(),
            gpu_model: normalize_gpu_model(
                raw["instance_type"]["description"].as_str().unwrap_or(""),
            ),
            region: normalize_region(raw["region"]["name"].as_str().unwrap_or("")),
            spot: false,
            created_at: chrono::Utc::now(),
            hourly_rate: raw["instance_type"]["price_cents_per_hour"]
                .as_f64()
                .unwrap_or(0.0)
                / 100.0,
        }
    }
}

#[async_trait]
impl Provider for LambdaClient {
    fn name(&self) -> &'static str {
        "lambda"
    }

    fn console_url(&self) -> &'static str {
        "https://cloud.lambdalabs.com/instances"
    }

    fn supports_spot(&self) -> bool {
        false
    }

    fn supports_billing_verification(&self) -> bool {
        true
    }

    async fn get_offers(
        &self,
        filter: &OfferFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Offer>, ProviderError> {
        if filter.spot_only {
            return Ok(Vec::new());
        }
        let url = format!("{}/instance-types", self.base_url);
        let offers = http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || self.auth(self.http.get(&url)).build().expect("valid request"),
            |status, body| {
                if status != 200 {
                    return Outcome::Permanent(ProviderError::api_error(
                        "lambda",
                        redact_secrets_in_text(&format!("HTTP {status}: {body}")),
                    ));
                }
                let mut offers = Vec::new();
                if let Some(map) = body["data"].as_object() {
                    for (sku, entry) in map {
                        let regions = entry["regions_with_capacity_available"]
                            .as_array()
                            .cloned()
                            .unwrap_or_default();
                        let info = &entry["instance_type"];
                        for region in regions {
                            let region_code = region["name"].as_str().unwrap_or("unknown");
                            let offer = Offer {
                                offer_id: synth_offer_id(sku, region_code),
                                provider: "lambda".to_string(),
                                gpu_model: normalize_gpu_model(
                                    info["description"].as_str().unwrap_or(""),
                                ),
                                vram_gb: info["specs"]["vram_gib"].as_u64().unwrap_or(0) as u32,
                                region: normalize_region(region_code),
                                price_on_demand: info["price_cents_per_hour"].as_f64().unwrap_or(0.0)
                                    / 100.0,
                                price_spot: None,
                                available: true,
                            };
                            if filter.matches(&offer) {
                                offers.push(offer);
                            }
                        }
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
        if req.spot {
            return Err(ProviderError::spot_not_available("lambda"));
        }
        let (sku, region) = parse_synth_offer_id(&req.offer_id)
            .ok_or_else(|| ProviderError::offer_not_found("lambda", &req.offer_id))?;

        let mut payload = json!({
            "region_name": region,
            "instance_type_name": sku,
            "user_data": req.cloud_init,
        });
        if let Some(ref key) = req.ssh_public_key {
            payload["ssh_key_names"] = json!([key]);
        }
        let body_bytes = serde_json::to_vec(&payload).expect("serializable payload");
        let url = format!("{}/instance-operations/launch", self.base_url);

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
                200 => Outcome::Success(body),
                400 if body["error"]["code"].as_str() == Some("insufficient-capacity") => {
                    Outcome::Permanent(ProviderError::insufficient_capacity("lambda"))
                }
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("lambda")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "lambda",
                    redact_secrets_in_text(&format!("HTTP {status}: {body}")),
                )),
            },
        )
        .await?;

        let id = raw["data"]["instance_ids"][0]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.get_instance(&id, cancel).await
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
                200 => Outcome::Success(body["data"].clone()),
                404 => Outcome::Permanent(ProviderError::instance_not_found("lambda", &id_owned)),
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("lambda")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "lambda",
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
        let url = format!("{}/instance-operations/terminate", self.base_url);
        let body_bytes = serde_json::to_vec(&json!({ "instance_ids": [id] })).unwrap();
        http_retry(
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
            move |status, body| match status {
                // Lambda's terminate call is idempotent by construction: an
                // id absent from the account simply comes back in an empty
                // `terminated_instances` list rather than as an error.
                200 | 404 => Outcome::Success(()),
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("lambda")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "lambda",
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
        let url = format!("{}/instance-types", self.base_url);
        http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || self.auth(self.http.get(&url)).build().expect("valid request"),
            |status, body| match status {
                200 => Outcome::Success(()),
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("lambda")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "lambda",
                    redact_secrets_in_text(&format!("HTTP {status}: {body}")),
                )),
            },
        )
        .await?;
        Ok(AccountInfo {
            label: "lambda-account".to_string(),
            balance: None,
            plan: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_active_status() {
        let client = LambdaClient::new("key".to_string());
        let raw = json!({
            "id": "i-123",
            "status": "active",
            "ip": "203.0.113.9",
            "instance_type": {"description": "1x A100 (40 GB)", "price_cents_per_hour": 110},
            "region": {"name": "us-west-1"},
        });
        let instance = client.map_instance(&raw);
        assert_eq!(instance.status, InstanceStatus::Running);
        assert!(!instance.spot);
        assert_eq!(instance.hourly_rate, 1.1);
    }
}
