//! The sealed provider error taxonomy and the stage-level errors the
//! Deployer/Stopper wrap them in.
//!
//! `ProviderError` is the one error type every `Provider` method returns.
//! Its variants are the closed set from the design's error-handling section;
//! callers branch on `.code` rather than on the `Display` text.

use std::fmt;
use thiserror::Error;

/// Machine-readable error code. Closed set -- do not add variants without
/// updating every `match` that dispatches on `ProviderError::code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    OfferNotFound,
    InstanceNotFound,
    SpotNotAvailable,
    InsufficientCapacity,
    AuthenticationFailed,
    RateLimited,
    BillingNotSupported,
    ServiceUnavailable,
    RequestFailed,
    ApiError,
    ContextCancelled,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::OfferNotFound => "offer_not_found",
            ErrorCode::InstanceNotFound => "instance_not_found",
            ErrorCode::SpotNotAvailable => "spot_not_available",
            ErrorCode::InsufficientCapacity => "insufficient_capacity",
            ErrorCode::AuthenticationFailed => "authentication_failed",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::BillingNotSupported => "billing_not_supported",
            ErrorCode::ServiceUnavailable => "service_unavailable",
            ErrorCode::RequestFailed => "request_failed",
            ErrorCode::ApiError => "api_error",
            ErrorCode::ContextCancelled => "context_cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A tagged error returned by any `Provider` operation.
#[derive(Debug, Error, Clone)]
#[error("{provider}: {message}")]
pub struct ProviderError {
    pub code: ErrorCode,
    pub provider: String,
    pub message: String,
    /// Stringified cause, kept for diagnostics. Providers are retried
    /// in-place rather than boxed, so the cause can't be a trait object.
    pub cause: Option<String>,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            provider: provider.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    pub fn offer_not_found(provider: impl Into<String>, offer_id: &str) -> Self {
        Self::new(
            provider,
            ErrorCode::OfferNotFound,
            format!("offer not found: {offer_id}"),
        )
    }

    pub fn instance_not_found(provider: impl Into<String>, instance_id: &str) -> Self {
        Self::new(
            provider,
            ErrorCode::InstanceNotFound,
            format!("instance not found: {instance_id}"),
        )
    }

    pub fn spot_not_available(provider: impl Into<String>) -> Self {
        let p = provider.into();
        Self::new(
            p.clone(),
            ErrorCode::SpotNotAvailable,
            format!("{p} does not support spot instances"),
        )
    }

    pub fn insufficient_capacity(provider: impl Into<String>) -> Self {
        Self::new(
            provider,
            ErrorCode::InsufficientCapacity,
            "provider has no capacity for the requested SKU",
        )
    }

    pub fn authentication_failed(provider: impl Into<String>) -> Self {
        Self::new(provider, ErrorCode::AuthenticationFailed, "authentication failed")
    }

    pub fn rate_limited(provider: impl Into<String>) -> Self {
        Self::new(provider, ErrorCode::RateLimited, "rate limited")
    }

    pub fn billing_not_supported(provider: impl Into<String>) -> Self {
        let p = provider.into();
        Self::new(
            p.clone(),
            ErrorCode::BillingNotSupported,
            format!("{p} does not expose a billing-status API"),
        )
    }

    pub fn service_unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ErrorCode::ServiceUnavailable, message)
    }

    pub fn request_failed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ErrorCode::RequestFailed, message)
    }

    pub fn api_error(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ErrorCode::ApiError, message)
    }

    pub fn cancelled(provider: impl Into<String>) -> Self {
        Self::new(provider, ErrorCode::ContextCancelled, "operation cancelled")
    }

    /// Whether this outcome is, by construction, one the retry loop already
    /// exhausted (rate limiting or a 5xx/transport failure). `instance_not_found`
    /// is deliberately excluded: its idempotence is handled by the caller, not
    /// by retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self.code, ErrorCode::RateLimited | ErrorCode::ServiceUnavailable)
    }
}

/// Errors synthesized by the Deployer at stage granularity (design §7).
#[derive(Debug, Error, Clone)]
pub enum DeployError {
    #[error("no compatible offers: {0}")]
    NoCompatibleOffers(String),
    #[error("instance creation failed: {0}")]
    InstanceCreationFailed(String),
    #[error("boot timeout waiting for instance {instance_id} to reach Running")]
    BootTimeout { instance_id: String },
    #[error("tunnel setup failed: {0}")]
    TunnelFailed(String),
    #[error("model failed to become ready: {0}")]
    ModelPullFailed(String),
    #[error("final health check failed: {0}")]
    HealthCheckFailed(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl DeployError {
    pub fn code(&self) -> &'static str {
        match self {
            DeployError::NoCompatibleOffers(_) => "no_compatible_offers",
            DeployError::InstanceCreationFailed(_) => "instance_creation_failed",
            DeployError::BootTimeout { .. } => "boot_timeout",
            DeployError::TunnelFailed(_) => "tunnel_failed",
            DeployError::ModelPullFailed(_) => "model_pull_failed",
            DeployError::HealthCheckFailed(_) => "health_check_failed",
            DeployError::Provider(e) if e.code == ErrorCode::ContextCancelled => "context_cancelled",
            DeployError::Provider(_) => "api_error",
        }
    }

    /// Stage index (1-based, matching design §4.5) at or after which this
    /// failure must trigger compensating rollback of the created instance.
    pub fn rollback_from_stage(&self) -> u8 {
        match self {
            DeployError::NoCompatibleOffers(_) => 1,
            DeployError::InstanceCreationFailed(_) | DeployError::Provider(_) => 3,
            DeployError::BootTimeout { .. } => 4,
            DeployError::TunnelFailed(_) => 5,
            DeployError::ModelPullFailed(_) => 6,
            DeployError::HealthCheckFailed(_) => 8,
        }
    }
}

/// Errors produced by the Stopper (design §7).
#[derive(Debug, Error, Clone)]
pub enum StopError {
    #[error("no active instance recorded")]
    NoActiveInstance,
    #[error("failed to terminate instance after retries")]
    TerminateFailed,
    #[error("billing could not be confirmed stopped after retries")]
    BillingNotVerified,
}

impl StopError {
    pub fn code(&self) -> &'static str {
        match self {
            StopError::NoActiveInstance => "no_active_instance",
            StopError::TerminateFailed => "terminate_failed",
            StopError::BillingNotVerified => "billing_not_verified",
        }
    }
}
