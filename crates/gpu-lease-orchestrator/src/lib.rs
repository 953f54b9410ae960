//! The Deploy/Stop Orchestrator (design §2): the Registry, the Deployer's
//! staged forward pipeline, the Stopper's staged reverse pipeline, and the
//! Reconciler that heals State against provider reality. Also hosts the
//! ambient collaborators the distilled spec treats as external contracts
//! (tunnel, cloud-init, heartbeat/spot-interruption pollers) so the crate
//! produces a runnable binary end to end (SPEC_FULL §4.7).

pub mod cloud_init;
pub mod deployer;
pub mod heartbeat;
pub mod progress;
pub mod reconciler;
pub mod registry;
pub mod stopper;
pub mod tunnel;
