//! The CLI and its ambient collaborators (design §6 "CLI", SPEC_FULL §4.7):
//! argument parsing, provider credential loading, progress/output
//! rendering, and the command wiring that drives
//! [`gpu_lease_orchestrator`]'s Deployer, Stopper, and Reconciler end to
//! end from a single binary.

pub mod cli;
pub mod deploy;
pub mod output;
pub mod stop;
