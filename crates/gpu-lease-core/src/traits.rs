//! The Provider contract (design §4.1): the single interface every
//! marketplace client implements. Capability polymorphism is expressed as
//! two boolean queries (`supports_spot`, `supports_billing_verification`)
//! rather than per-provider inheritance or type-tagged dispatch -- the rest
//! of the method set is uniform across all five providers.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::types::{AccountInfo, BillingStatus, CreateRequest, Instance, Offer, OfferFilter};

/// A capability-typed client for one cloud-GPU marketplace. All operations
/// are cancellable: `cancel` is checked before any blocking step and a
/// cancelled operation returns promptly with `ErrorCode::ContextCancelled`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable, lowercase identifier: "vast", "lambda", "runpod", "coreweave",
    /// "paperspace".
    fn name(&self) -> &'static str;

    /// Console URL shown to the user for manual verification.
    fn console_url(&self) -> &'static str;

    /// Whether this provider ever accepts `CreateRequest { spot: true, .. }`.
    fn supports_spot(&self) -> bool;

    /// Capability flag: when false, `get_billing_status` returns
    /// `billing_not_supported` without network I/O and the Stopper escalates
    /// to manual verification.
    fn supports_billing_verification(&self) -> bool;

    /// Offers matching every predicate in `filter`, restricted to
    /// `available = true`. A provider with no spot support returning `[]`
    /// for `filter.spot_only = true` is correct, not an error.
    async fn get_offers(
        &self,
        filter: &OfferFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<Offer>, ProviderError>;

    /// Lease an instance. Idempotency is not required. `spot = true` against
    /// a provider with no spot support must fail with `spot_not_available`
    /// before any side effect; capacity exhaustion fails with
    /// `insufficient_capacity`.
    async fn create_instance(
        &self,
        req: &CreateRequest,
        cancel: &CancellationToken,
    ) -> Result<Instance, ProviderError>;

    /// `instance_not_found` if absent at the provider; other failures are
    /// retryable transient failures.
    async fn get_instance(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Instance, ProviderError>;

    /// Idempotent: succeeds if the provider already reports the instance
    /// absent.
    async fn terminate_instance(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    /// `Stopped` when absent; `Active` for any lifecycle state that may
    /// still accrue charges, including the stopping transient (conservative);
    /// `billing_not_supported` when `supports_billing_verification()` is
    /// false.
    async fn get_billing_status(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<BillingStatus, ProviderError>;

    /// Used only during configuration, never on the Deploy/Stop hot path.
    async fn validate_api_key(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AccountInfo, ProviderError>;
}
