//! Paperspace client: REST, `x-api-key: <key>` (design §4.2). No spot
//! support and no billing-verification API -- `get_billing_status` always
//! returns `billing_not_supported` without network I/O, and the Stopper
//! escalates to manual verification for this provider.

use async_trait::async_trait;
use gpu_lease_core::error::ProviderError;
use gpu_lease_core::redaction::redact_secrets_in_text;
use gpu_lease_core::retry::{Outcome, RateLimiter};
use gpu_lease_core::traits::Provider;
use gpu_lease_core::types::{
    AccountInfo, BillingStatus, CreateRequest, Instance, InstanceStatus, Offer, OfferFilter,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::common::{http_retry, normalize_gpu_model, normalize_region};

const BASE_URL: &str = "https://api.paperspace.com/v1";

pub struct PaperspaceClient {
    api_key: String,
    http: reqwest::Client,
    limiter: RateLimiter,
    base_url: String,
}

impl PaperspaceClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            http: reqwest::Client::new(),
            limiter: RateLimiter::new(),
            base_url: BASE_URL.to_string(),
        }
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("x-api-key", &self.api_key)
    }

    fn map_instance(&self, raw: &Value) -> Instance {
        let status_str = raw["state"].as_str().unwrap_or("");
        let status = match status_str {
            "provisioning" | "starting" => InstanceStatus::Creating,
            "ready" => InstanceStatus::Running,
            "stopping" => InstanceStatus::Stopping,
            "off" | "deleted" => InstanceStatus::Terminated,
            _ => InstanceStatus::Error,
        };
        Instance {
            id: raw["id"].as_str().unwrap_or("").to_string(),
            provider: self.name().to_string(),
            status,
            public_ip: raw["publicIpAddress"].as_str().unwrap_or("").to_string(),
            gpu_model: normalize_gpu_model(raw["machineType"].as_str().unwrap_or("")),
            region: normalize_region(raw["region"].as_str().unwrap_or("")),
            spot: false,
            created_at: raw["dtCreated"]
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_else(chrono::Utc::now),
            hourly_rate: raw["hourlyRate"].as_f64().unwrap_or(0.0),
        }
    }
}

#[async_trait]
impl Provider for PaperspaceClient {
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

    async fn get_offers(
        &self,
        filter: &OfferFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Offer>, ProviderError> {
        if filter.spot_only {
            return Ok(Vec::new());
        }
        let url = format!("{}/machines/availability", self.base_url);
        let offers = http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || self.auth(self.http.get(&url)).build().expect("valid request"),
            |status, body| {
                if status != 200 {
                    return Outcome::Permanent(ProviderError::api_error(
                        "paperspace",
                        redact_secrets_in_text(&format!("HTTP {status}: {body}")),
                    ));
                }
                let offers: Vec<Offer> = body["items"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .map(|raw| Offer {
                        offer_id: raw["machineType"].as_str().unwrap_or("").to_string(),
                        provider: "paperspace".to_string(),
                        gpu_model: normalize_gpu_model(raw["machineType"].as_str().unwrap_or("")),
                        vram_gb: raw["ramGb"].as_u64().unwrap_or(0) as u32,
                        region: normalize_region(raw["region"].as_str().unwrap_or("")),
                        price_on_demand: raw["hourlyRate"].as_f64().unwrap_or(0.0),
                        price_spot: None,
                        available: raw["available"].as_bool().unwrap_or(false),
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
        if req.spot {
            return Err(ProviderError::spot_not_available("paperspace"));
        }
        let mut payload = json!({
            "machineType": req.offer_id,
            "diskSize": req.disk_size_gb,
            "startupScript": req.cloud_init,
        });
        if let Some(ref key) = req.ssh_public_key {
            payload["publicKey"] = json!(key);
        }
        let body_bytes = serde_json::to_vec(&payload).expect("serializable payload");
        let url = format!("{}/machines", self.base_url);

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
                409 => Outcome::Permanent(ProviderError::insufficient_capacity("paperspace")),
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("paperspace")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "paperspace",
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
        let url = format!("{}/machines/{}", self.base_url, id);
        let id_owned = id.to_string();
        let raw = http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || self.auth(self.http.get(&url)).build().expect("valid request"),
            move |status, body| match status {
                200 => Outcome::Success(body),
                404 => Outcome::Permanent(ProviderError::instance_not_found("paperspace", &id_owned)),
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("paperspace")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "paperspace",
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
        let url = format!("{}/machines/{}", self.base_url, id);
        http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || self.auth(self.http.delete(&url)).build().expect("valid request"),
            |status, body| match status {
                200 | 204 | 404 => Outcome::Success(()),
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("paperspace")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "paperspace",
                    redact_secrets_in_text(&format!("HTTP {status}: {body}")),
                )),
            },
        )
        .await
    }

    /// Paperspace exposes no billing-status API: this returns
    /// `billing_not_supported` immediately, issuing no network I/O.
    async fn get_billing_status(
        &self,
        _id: &str,
        _cancel: &CancellationToken,
    ) -> Result<BillingStatus, ProviderError> {
        Err(ProviderError::billing_not_supported("paperspace"))
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
                401 | 403 => Outcome::Permanent(ProviderError::authentication_failed("paperspace")),
                _ => Outcome::Permanent(ProviderError::api_error(
                    "paperspace",
                    redact_secrets_in_text(&format!("HTTP {status}: {body}")),
                )),
            },
        )
        .await?;
        Ok(AccountInfo {
            label: raw["email"].as_str().unwrap_or("paperspace-account").to_string(),
            balance: None,
            plan: raw["planName"].as_str().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn billing_status_is_unsupported_without_network_io() {
        let client = PaperspaceClient::new("key".to_string());
        let cancel = CancellationToken::new();
        let err = client.get_billing_status("p-1", &cancel).await.unwrap_err();
        assert_eq!(err.code, gpu_lease_core::error::ErrorCode::BillingNotSupported);
    }

    #[tokio::test]
    async fn spot_create_request_fails_before_any_send() {
        let client = PaperspaceClient::new("key".to_string());
        let cancel = CancellationToken::new();
        let req = CreateRequest {
            offer_id: "gpu-h100".to_string(),
            spot: true,
            cloud_init: String::new(),
            ssh_public_key: None,
            disk_size_gb: 50,
        };
        let err = client.create_instance(&req, &cancel).await.unwrap_err();
        assert_eq!(err.code, gpu_lease_core::error::ErrorCode::SpotNotAvailable);
    }

    #[tokio::test]
    async fn spot_only_filter_returns_empty_offers() {
        let client = PaperspaceClient::new("key".to_string());
        let cancel = CancellationToken::new();
        let filter = OfferFilter {
            spot_only: true,
            ..Default::default()
        };
        let offers = client.get_offers(&filter, &cancel).await.unwrap();
        assert!(offers.is_empty());
    }
}
