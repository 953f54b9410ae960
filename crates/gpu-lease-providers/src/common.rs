//! Normalization helpers shared across clients (design §4.2 "Offer
//! normalization"). Each client still owns its own mapping tables and
//! decides when to apply them -- normalization is best-effort, and an
//! unknown SKU or region code passes through unchanged.
//!
//! Also hosts the one piece of HTTP plumbing genuinely common to the REST
//! clients: running a request through the core retry primitive and handing
//! each attempt's status/body to a provider-supplied classifier. The
//! GraphQL client (RunPod) has its own variant since its error channel is
//! a response-body array rather than a status code.

use gpu_lease_core::retry::{retry, Outcome, RateLimiter};
use gpu_lease_core::traits::Provider;
use gpu_lease_core::types::InstanceStatus;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use gpu_lease_core::error::ProviderError;
use gpu_lease_core::redaction::redact_secrets_in_text;

/// Send `build_request()` through the shared rate-limit/retry policy,
/// decoding a 2xx body as JSON (an empty body decodes as `Value::Null`) and
/// delegating non-2xx classification to `classify`.
pub async fn http_retry<T, B, C>(
    provider: &str,
    client: &reqwest::Client,
    limiter: &RateLimiter,
    cancel: &CancellationToken,
    build_request: B,
    classify: C,
) -> Result<T, ProviderError>
where
    B: Fn() -> reqwest::Request,
    C: Fn(u16, Value) -> Outcome<T>,
{
    retry(provider, limiter, cancel, || async {
        let request = build_request();
        let send = tokio::select! {
            resp = client.execute(request) => resp,
            _ = cancel.cancelled() => {
                return Outcome::Transient(ProviderError::cancelled(provider));
            }
        };
        match send {
            Ok(response) => {
                let status = response.status().as_u16();
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = response.text().await.unwrap_or_default();
                let value: Value = if body.trim().is_empty() {
                    Value::Null
                } else {
                    serde_json::from_str(&body).unwrap_or(Value::Null)
                };
                if status == 429 {
                    Outcome::RateLimited { retry_after }
                } else if (500..600).contains(&status) {
                    Outcome::Transient(ProviderError::service_unavailable(
                        provider,
                        format!("HTTP {status}"),
                    ))
                } else {
                    classify(status, value)
                }
            }
            Err(err) => Outcome::Transient(ProviderError::request_failed(
                provider,
                redact_secrets_in_text(&err.to_string()),
            )),
        }
    })
    .await
}

/// Shared mapping from a bearer/basic/header-key client's `validate_api_key`
/// failure modes: a 401/403 is `authentication_failed`, anything else
/// bubbles as `api_error`. The body is redacted before being folded into
/// the message -- some APIs echo request headers back in error bodies.
pub fn classify_auth_status(provider: &str, status: u16, body: &Value) -> ProviderError {
    if status == 401 || status == 403 {
        ProviderError::authentication_failed(provider)
    } else {
        ProviderError::api_error(provider, redact_secrets_in_text(&format!("HTTP {status}: {body}")))
    }
}

/// Re-export so provider modules only need one `use` for the trait.
pub type DynProvider = std::sync::Arc<dyn Provider>;

/// Map a native GPU SKU string to the small canonical vocabulary. Matching
/// is case-insensitive and substring-based against common native spellings;
/// anything unrecognized passes through unchanged.
pub fn normalize_gpu_model(native: &str) -> String {
    let lower = native.to_lowercase();
    let table: &[(&str, &str)] = &[
        ("h100", "H100 80GB"),
        ("a100-80", "A100 80GB"),
        ("a100_80", "A100 80GB"),
        ("a100 80", "A100 80GB"),
        ("a100-40", "A100 40GB"),
        ("a100_40", "A100 40GB"),
        ("a100 40", "A100 40GB"),
        ("a100", "A100 40GB"),
        ("a6000", "A6000 48GB"),
        ("rtx4090", "RTX 4090 24GB"),
        ("rtx 4090", "RTX 4090 24GB"),
        ("l40s", "L40S 48GB"),
        ("v100", "V100 16GB"),
    ];
    for (needle, canonical) in table {
        if lower.contains(needle) {
            return canonical.to_string();
        }
    }
    native.to_string()
}

/// Map a native region code to `Continent-Direction` form. Passes through
/// unchanged when unrecognized.
pub fn normalize_region(native: &str) -> String {
    let lower = native.to_lowercase();
    let table: &[(&str, &str)] = &[
        ("us-east", "US-East"),
        ("useast", "US-East"),
        ("us-west", "US-West"),
        ("uswest", "US-West"),
        ("eu-west", "EU-West"),
        ("euwest", "EU-West"),
        ("eu-central", "EU-Central"),
        ("eucentral", "EU-Central"),
        ("ap-northeast", "AP-Northeast"),
        ("apnortheast", "AP-Northeast"),
        ("ap-southeast", "AP-Southeast"),
        ("apsoutheast", "AP-Southeast"),
    ];
    for (needle, canonical) in table {
        if lower.contains(needle) {
            return canonical.to_string();
        }
    }
    native.to_string()
}

/// Synthesize an opaque `offer_id` for providers with no single native
/// identifier (coreweave, lambda). The Deployer never inspects this; the
/// owning client parses it back in `create_instance`.
pub fn synth_offer_id(sku: &str, region: &str) -> String {
    format!("{sku}@{region}")
}

/// Parse a synthesized `<sku>@<region>` offer id back into its parts.
pub fn parse_synth_offer_id(offer_id: &str) -> Option<(&str, &str)> {
    offer_id.split_once('@')
}

/// Fold a provider's native lifecycle status string into the shared state
/// machine (design §4.4). Ambiguous strings collapse to `Error`.
pub fn map_status(native: &str, recognized: &[(&str, InstanceStatus)]) -> InstanceStatus {
    let lower = native.to_lowercase();
    recognized
        .iter()
        .find(|(s, _)| *s == lower)
        .map(|(_, status)| *status)
        .unwrap_or(InstanceStatus::Error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_known_gpu_skus() {
        assert_eq!(normalize_gpu_model("NVIDIA A100-80GB-PCIE"), "A100 80GB");
        assert_eq!(normalize_gpu_model("H100_SXM"), "H100 80GB");
    }

    #[test]
    fn unknown_sku_passes_through() {
        assert_eq!(normalize_gpu_model("Mythical GPU 9000"), "Mythical GPU 9000");
    }

    #[test]
    fn synth_offer_id_round_trips() {
        let id = synth_offer_id("rtx4090.1x", "us-east-1");
        assert_eq!(parse_synth_offer_id(&id), Some(("rtx4090.1x", "us-east-1")));
    }
}
