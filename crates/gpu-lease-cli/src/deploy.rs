//! The `deploy` command (the CLI's default action, design §4.5): wires
//! argument parsing to the Deployer, renders its result, and then keeps
//! the process alive running the heartbeat and spot-interruption
//! pollers (SPEC_FULL §4.7) until the user interrupts it or stops the
//! lease from another invocation.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use gpu_lease_core::types::ModelProfile;
use gpu_lease_core::utils::format_duration;
use gpu_lease_orchestrator::deployer::{DeployRequest, Deployer};
use gpu_lease_orchestrator::heartbeat::{run_heartbeat_loop, run_spot_interruption_poller};
use gpu_lease_orchestrator::progress::{self, ProgressCallback};
use gpu_lease_orchestrator::registry::Registry;
use gpu_lease_state::StateStore;
use log::info;
use tokio_util::sync::CancellationToken;

use crate::cli::Args;
use crate::output::{self, DeployCost, DeployDeadman, DeployEndpoint, DeployInstance, DeployOutput, OutputFormat};

pub async fn run(
    args: &Args,
    registry: &Registry,
    state_store: &Arc<StateStore>,
    model: ModelProfile,
    timeout_hours: u32,
    cancel: &CancellationToken,
) -> Result<()> {
    if state_store.load()?.is_some() {
        bail!("an instance is already managed by gpu-lease; run `gpu-lease --stop` first");
    }
    registry.require_nonempty().map_err(|e| anyhow!(e))?;

    let spinner = (args.output == OutputFormat::Text).then(output::spinner_progress);
    let progress: ProgressCallback = match &spinner {
        Some((_, callback)) => Arc::clone(callback),
        None => progress::noop(),
    };

    let started = Instant::now();
    let model_id = model.model_id.clone();
    let deployer = Deployer::new(registry, state_store.as_ref(), progress);
    let req = DeployRequest {
        model,
        provider_filter: args.provider.clone(),
        gpu_filter: args.gpu.clone(),
        region_filter: args.region.clone(),
        prefer_spot: args.prefer_spot(),
        spot_requested: args.spot,
        timeout_hours,
        ssh_public_key: None,
    };

    let outcome = match deployer.run(&req, cancel).await {
        Ok(outcome) => {
            if let Some((bar, _)) = &spinner {
                bar.finish_and_clear();
            }
            outcome
        }
        Err(err) => {
            if let Some((bar, _)) = &spinner {
                bar.finish_and_clear();
            }
            if args.output == OutputFormat::Json {
                println!(
                    "{}",
                    serde_json::to_string(&serde_json::json!({
                        "status": "error",
                        "error": err.code(),
                    }))?
                );
            } else {
                output::render_stage_failure(err.rollback_from_stage(), 8, "deploy failed", &err.to_string());
            }
            bail!(err);
        }
    };

    let provider = registry.by_name(&outcome.instance.provider).map_err(|e| anyhow!(e))?;
    let url = format!("http://{}:{}", outcome.wireguard_client_ip, outcome.model_port);
    let remaining_seconds = timeout_hours as i64 * 3600;
    let result = DeployOutput {
        status: "deployed",
        instance: DeployInstance {
            id: outcome.instance.id.clone(),
            provider: outcome.instance.provider.clone(),
            gpu: outcome.instance.gpu_model.clone(),
            region: outcome.instance.region.clone(),
            instance_type: if outcome.instance.spot { "spot".to_string() } else { "on-demand".to_string() },
            public_ip: outcome.instance.public_ip.clone(),
        },
        model: model_id,
        endpoint: DeployEndpoint {
            wireguard_ip: outcome.wireguard_client_ip.clone(),
            port: outcome.model_port,
            url,
        },
        cost: DeployCost {
            hourly: outcome.instance.hourly_rate,
            currency: "USD",
        },
        deadman: DeployDeadman {
            active: true,
            timeout_hours,
            remaining_seconds,
        },
        duration: format_duration(started.elapsed().as_secs() as i64),
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string(&result)?),
        OutputFormat::Text => {
            println!(
                "Deployed {} on {} ({}) in {}",
                result.model, result.instance.provider, result.instance.gpu, result.duration
            );
            println!("Endpoint: {}", result.endpoint.url);
            println!(
                "Cost: {:.2}/hr {} -- deadman armed for {}h",
                result.cost.hourly, result.cost.currency, result.deadman.timeout_hours
            );
            println!("Press Ctrl+C or run `gpu-lease --stop` from another shell to tear it down.");
        }
    }

    info!("deploy complete; running heartbeat loop until stopped or interrupted");
    let heartbeat = tokio::spawn(run_heartbeat_loop(Arc::clone(state_store), cancel.clone()));
    let spot_poller = if outcome.instance.spot {
        Some(tokio::spawn(run_spot_interruption_poller(
            provider,
            outcome.instance.id.clone(),
            cancel.clone(),
        )))
    } else {
        None
    };

    let _ = heartbeat.await;
    if let Some(poller) = spot_poller {
        let _ = poller.await;
    }
    Ok(())
}
