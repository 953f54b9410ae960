//! RunPod client: a single GraphQL endpoint, `Authorization: Bearer <key>`
//! on every POST (design §4.2, §9 "GraphQL vs REST inside one contract").
//! RunPod transports every operation over the same mutation/query pair
//! rather than distinct REST endpoints; a GraphQL `errors` array is treated
//! as an HTTP-level error class with its own mapping to the taxonomy,
//! classified inside `classify_graphql` before the generic status check
//! ever sees a non-2xx code (GraphQL servers answer errors with 200).

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

const GRAPHQL_URL: &str = "https://api.runpod.io/graphql";

pub struct RunpodClient {
    api_key: String,
    http: reqwest::Client,
    limiter: RateLimiter,
    url: String,
}

impl RunpodClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            http: reqwest::Client::new(),
            limiter: RateLimiter::new(),
            url: GRAPHQL_URL.to_string(),
        }
    }

    async fn graphql(
        &self,
        query: &str,
        variables: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, ProviderError> {
        let payload = json!({ "query": query, "variables": variables });
        let body_bytes = serde_json::to_vec(&payload).expect("serializable payload");
        http_retry(
            self.name(),
            &self.http,
            &self.limiter,
            cancel,
            || {
                self.http
                    .post(&self.url)
                    .bearer_auth(&self.api_key)
                    .header("content-type", "application/json")
                    .body(body_bytes.clone())
                    .build()
                    .expect("valid request")
            },
            |status, body| classify_graphql(status, body),
        )
        .await
    }

    fn map_instance(&self, raw: &Value) -> Instance {
        let status_str = raw["desiredStatus"].as_str().unwrap_or("");
        let status = match status_str {
            "CREATED" | "RESTARTING" => InstanceStatus::Creating,
            "RUNNING" => InstanceStatus::Running,
            "EXITED" => InstanceStatus::Stopping,
            "TERMINATED" => InstanceStatus::Terminated,
            _ => InstanceStatus::Error,
        };
        Instance {
            id: raw["id"].as_str().unwrap_or("").to_string(),
            provider: self.name().to_string(),
            status,
            public_ip: raw["runtime"]["ports"][0]["ip"].as_str().unwrap_or("").to_string(),
            gpu_model: normalize_gpu_model(raw["machine"]["gpuDisplayName"].as_str().unwrap_or("")),
            region: normalize_region(raw["machine"]["dataCenterId"].as_str().unwrap_or("")),
            spot: raw["interruptible"].as_bool().unwrap_or(false),
            created_at: chrono::Utc::now(),
            hourly_rate: raw["costPerHr"].as_f64().unwrap_or(0.0),
        }
    }
}

/// A GraphQL `errors` array on an otherwise-200 response maps to the same
/// taxonomy a REST client would reach from status codes.
fn classify_graphql(status: u16, body: Value) -> Outcome<Value> {
    if status == 429 {
        return Outcome::RateLimited { retry_after: None };
    }
    if (500..600).contains(&status) {
        return Outcome::Transient(ProviderError::service_unavailable(
            "runpod",
            format!("HTTP {status}"),
        ));
    }
    if status != 200 {
        return Outcome::Permanent(ProviderError::api_error(
            "runpod",
            redact_secrets_in_text(&format!("HTTP {status}: {body}")),
        ));
    }
    if let Some(errors) = body["errors"].as_array() {
        if let Some(first) = errors.first() {
            let message = first["message"].as_str().unwrap_or("graphql error").to_lowercase();
            return if message.contains("unauthorized") || message.contains("invalid api key") {
                Outcome::Permanent(ProviderError::authentication_failed("runpod"))
            } else if message.contains("no instances available")
                || message.contains("capacity")
            {
                Outcome::Permanent(ProviderError::insufficient_capacity("runpod"))
            } else if message.contains("not found") {
                Outcome::Permanent(ProviderError::api_error("runpod", first["message"].as_str().unwrap_or("")))
            } else if message.contains("timeout") || message.contains("unavailable") {
                Outcome::Transient(ProviderError::service_unavailable("runpod", first["message"].as_str().unwrap_or("")))
            } else {
                Outcome::Permanent(ProviderError::api_error("runpod", first["message"].as_str().unwrap_or("")))
            };
        }
    }
    Outcome::Success(body["data"].clone())
}

#[async_trait]
impl Provider for RunpodClient {
    fn name(&self) -> &'static str {
        "runpod"
    }

    fn console_url(&self) -> &'static str {
        "https://www.runpod.io/console/pods"
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
        let query = r#"
            query GpuTypes { gpuTypes {
                id displayName memoryInGb
                lowestPrice { minimumBidPrice uninterruptiblePrice }
                dataCenterId
            } }
        "#;
        let data = self.graphql(query, json!({}), cancel).await?;
        let offers: Vec<Offer> = data["gpuTypes"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|raw| {
                let region = raw["dataCenterId"].as_str().unwrap_or("unknown");
                let sku = raw["id"].as_str().unwrap_or("unknown");
                Offer {
                    offer_id: crate::common::synth_offer_id(sku, region),
                    provider: "runpod".to_string(),
                    gpu_model: normalize_gpu_model(raw["displayName"].as_str().unwrap_or("")),
                    vram_gb: raw["memoryInGb"].as_u64().unwrap_or(0) as u32,
                    region: normalize_region(region),
                    price_on_demand: raw["lowestPrice"]["uninterruptiblePrice"].as_f64().unwrap_or(0.0),
                    price_spot: raw["lowestPrice"]["minimumBidPrice"].as_f64(),
                    available: raw["lowestPrice"]["uninterruptiblePrice"].as_f64().is_some(),
                }
            })
            .filter(|o| filter.matches(o))
            .collect();
        Ok(offers)
    }

    async fn create_instance(
        &self,
        req: &CreateRequest,
        cancel: &CancellationToken,
    ) -> Result<Instance, ProviderError> {
        let (sku, _region) = crate::common::parse_synth_offer_id(&req.offer_id)
            .ok_or_else(|| ProviderError::offer_not_found("runpod", &req.offer_id))?;

        let mutation = r#"
            mutation PodFindAndDeployOnDemand($input: PodFindAndDeployOnDemandInput) {
                podFindAndDeployOnDemand(input: $input) { id }
            }
        "#;
        let variables = json!({
            "input": {
                "gpuTypeId": sku,
                "cloudType": if req.spot { "INTERRUPTIBLE" } else { "ON_DEMAND" },
                "containerDiskInGb": req.disk_size_gb,
                "dockerArgs": req.cloud_init,
                "imageName": "runpod/ollama:latest",
            }
        });
        let data = self.graphql(mutation, variables, cancel).await?;
        let id = data["podFindAndDeployOnDemand"]["id"]
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
        let query = r#"
            query Pod($id: String!) { pod(input: {podId: $id}) {
                id desiredStatus interruptible costPerHr
                machine { gpuDisplayName dataCenterId }
                runtime { ports { ip } }
            } }
        "#;
        let data = self.graphql(query, json!({ "id": id }), cancel).await?;
        if data["pod"].is_null() {
            return Err(ProviderError::instance_not_found("runpod", id));
        }
        Ok(self.map_instance(&data["pod"]))
    }

    async fn terminate_instance(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let mutation = r#"
            mutation Terminate($id: String!) { podTerminate(input: {podId: $id}) }
        "#;
        match self.graphql(mutation, json!({ "id": id }), cancel).await {
            Ok(_) => Ok(()),
            Err(e)
                if e.code == ErrorCode::InstanceNotFound
                    || (e.code == ErrorCode::ApiError
                        && e.message.to_lowercase().contains("not found")) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
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
        let query = r#"query Myself { myself { id email clientBalance } }"#;
        let data = self.graphql(query, json!({}), cancel).await?;
        Ok(AccountInfo {
            label: data["myself"]["email"].as_str().unwrap_or("runpod-account").to_string(),
            balance: data["myself"]["clientBalance"].as_f64(),
            plan: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphql_errors_array_maps_to_authentication_failed() {
        let body = json!({ "errors": [{"message": "Unauthorized: invalid api key"}] });
        match classify_graphql(200, body) {
            Outcome::Permanent(e) => assert_eq!(e.code, ErrorCode::AuthenticationFailed),
            _ => panic!("expected permanent error"),
        }
    }

    #[test]
    fn graphql_errors_array_maps_capacity_wording_to_insufficient_capacity() {
        let body = json!({ "errors": [{"message": "no instances available for this GPU type"}] });
        match classify_graphql(200, body) {
            Outcome::Permanent(e) => assert_eq!(e.code, ErrorCode::InsufficientCapacity),
            _ => panic!("expected permanent error"),
        }
    }

    #[test]
    fn successful_response_extracts_data_field() {
        let body = json!({ "data": { "myself": { "id": "u1" } } });
        match classify_graphql(200, body) {
            Outcome::Success(v) => assert_eq!(v["myself"]["id"], "u1"),
            _ => panic!("expected success"),
        }
    }
}
