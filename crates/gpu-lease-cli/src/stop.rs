//! The `stop` command (design §4.6): reconciles local State against
//! provider reality first, then -- if a valid lease was found -- runs the
//! Stopper's 4-stage reverse pipeline.

use anyhow::{anyhow, bail, Result};
use gpu_lease_orchestrator::progress::{self, ProgressCallback};
use gpu_lease_orchestrator::reconciler::{reconcile, ReconcileOutcome};
use gpu_lease_orchestrator::registry::Registry;
use gpu_lease_orchestrator::stopper::{CriticalAlert, ManualVerification, StopStatus, Stopper};
use gpu_lease_state::StateStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cli::Args;
use crate::output::{self, OutputFormat, StopOutput};

pub async fn run(
    args: &Args,
    registry: &Registry,
    state_store: &Arc<StateStore>,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(state) = state_store.load()? else {
        return print_result(args, StopOutput::no_active_instance());
    };
    let provider = registry.by_name(&state.instance.provider).ok();

    let outcome = reconcile(state_store.as_ref(), provider.as_deref(), true, cancel).await?;

    match outcome {
        ReconcileOutcome::NoActiveInstance => print_result(args, StopOutput::no_active_instance()),
        ReconcileOutcome::MismatchNotFound { provider, reasons, .. } => {
            if args.output == OutputFormat::Text {
                output::render_warning(&format!(
                    "instance not found at {provider} (possible causes: {})",
                    reasons.join("; ")
                ));
            }
            print_result(
                args,
                StopOutput {
                    status: "stopped",
                    ..StopOutput::no_active_instance()
                },
            )
        }
        ReconcileOutcome::MismatchTerminated { provider, instance_id } => {
            if args.output == OutputFormat::Text {
                output::render_warning(&format!("{provider}: instance {instance_id} terminated externally"));
            }
            print_result(
                args,
                StopOutput {
                    status: "stopped",
                    ..StopOutput::no_active_instance()
                },
            )
        }
        ReconcileOutcome::ProviderUnreachable { provider, detail, .. } => {
            bail!("could not reconcile against {provider}; state left in place ({detail}); try again");
        }
        ReconcileOutcome::Valid => {
            let provider = provider.expect("Valid outcome implies the provider was configured");

            let spinner = (args.output == OutputFormat::Text).then(output::spinner_progress);
            let progress: ProgressCallback = match &spinner {
                Some((_, callback)) => Arc::clone(callback),
                None => progress::noop(),
            };

            let critical_alert_output = args.output;
            let critical_alert = Arc::new(move |alert: CriticalAlert| {
                if critical_alert_output == OutputFormat::Text {
                    eprintln!(
                        "CRITICAL: {} on {} could not be confirmed stopped after {} attempts -- check {} immediately",
                        alert.instance_id, alert.provider, alert.attempts, alert.console_url
                    );
                }
            });
            let manual_verification_output = args.output;
            let manual_verification = Arc::new(move |mv: ManualVerification| {
                if manual_verification_output == OutputFormat::Text {
                    eprintln!("Manual billing verification required for {} on {}:", mv.instance_id, mv.provider);
                    for (i, step) in mv.instructions.iter().enumerate() {
                        eprintln!("  {}. {step}", i + 1);
                    }
                }
            });

            let stopper = Stopper::new(state_store.as_ref(), progress)
                .with_critical_alert(critical_alert)
                .with_manual_verification(manual_verification);

            let result = stopper.run(provider, cancel).await;
            if let Some((bar, _)) = &spinner {
                bar.finish_and_clear();
            }
            let result = result.map_err(|e| anyhow!(e))?;

            let status = match result.status {
                StopStatus::Stopped => "stopped",
                StopStatus::ManualVerificationRequired => "manual_verification_required",
                StopStatus::Error => "error",
            };
            print_result(
                args,
                StopOutput {
                    status,
                    instance_id: result.instance_id,
                    provider: result.provider,
                    billing_verified: result.billing_verified,
                    manual_verification_required: result.manual_verification_required,
                    console_url: result.console_url,
                    session_cost: result.session_cost,
                    session_duration: result.session_duration,
                    session_duration_seconds: result.session_duration_seconds,
                    error: result.error,
                },
            )?;
            if result.status == StopStatus::Error {
                bail!(result.error.unwrap_or("stop failed"));
            }
            Ok(())
        }
    }
}

fn print_result(args: &Args, result: StopOutput) -> Result<()> {
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string(&result)?),
        OutputFormat::Text => {
            if result.instance_id.is_empty() {
                println!("No active instance.");
            } else {
                println!(
                    "{}: {} on {} -- session cost {:.2} over {}",
                    result.status, result.instance_id, result.provider, result.session_cost, result.session_duration
                );
            }
        }
    }
    Ok(())
}
