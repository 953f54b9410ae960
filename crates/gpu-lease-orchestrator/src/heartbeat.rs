//! Heartbeat and spot-interruption pollers (SPEC_FULL §4.7 ambient
//! addition): two best-effort background loops started after the Deployer
//! completes and stopped on process exit or an explicit Stop. Neither is
//! on the Deploy/Stop hot path; both are logged-and-ignored on error.

use std::sync::Arc;
use std::time::Duration;

use gpu_lease_core::traits::Provider;
use gpu_lease_state::StateStore;
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const SPOT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Refresh `deadman.last_heartbeat` in State on every tick so the
/// server-side deadman timer doesn't fire under the client's nose. Runs
/// until `cancel` fires; persistence failures are logged and retried next
/// tick, never fatal to the loop.
pub async fn run_heartbeat_loop(state_store: Arc<StateStore>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
            _ = cancel.cancelled() => return,
        }
        match state_store.load() {
            Ok(Some(mut state)) => {
                state.deadman.last_heartbeat = Some(chrono::Utc::now());
                if let Err(e) = state_store.save(&state) {
                    warn!("heartbeat: failed to persist last_heartbeat: {e}");
                } else {
                    debug!("heartbeat: refreshed last_heartbeat");
                }
            }
            Ok(None) => return,
            Err(e) => warn!("heartbeat: failed to load state: {e}"),
        }
    }
}

/// Poll `GetInstance` every 30s (only meaningful when the lease is spot)
/// and warn when the instance has moved to `Stopping` without the user
/// having asked for a Stop -- the only preemption signal the `Provider`
/// contract exposes, since the canonical state machine collapses every
/// provider-native "reclaiming this spot instance" status into `Stopping`.
/// Never tears anything down itself -- that is the deadman switch's and
/// the user's job (design §4.7).
pub async fn run_spot_interruption_poller(
    provider: Arc<dyn Provider>,
    instance_id: String,
    cancel: CancellationToken,
) {
    use gpu_lease_core::types::InstanceStatus;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SPOT_POLL_INTERVAL) => {}
            _ = cancel.cancelled() => return,
        }
        match provider.get_instance(&instance_id, &cancel).await {
            Ok(instance) if instance.status == InstanceStatus::Stopping => {
                warn!(
                    "{}: instance {instance_id} entered Stopping -- possible spot preemption",
                    provider.name()
                );
            }
            Ok(instance) if instance.status.is_terminal() => return,
            Ok(_) => {}
            Err(e) => debug!("{}: spot-interruption poll failed (ignored): {e}", provider.name()),
        }
    }
}
