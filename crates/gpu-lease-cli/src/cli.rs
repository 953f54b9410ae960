//! Argument parsing and the top-level command dispatch (design §6 "CLI").
//! Everything that belongs to the Deploy/Stop Orchestrator itself lives in
//! `gpu_lease_orchestrator`; this module only parses flags, loads
//! credentials, wires up cancellation, and calls into [`crate::deploy`] /
//! [`crate::stop`].

use std::io::Write as _;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use gpu_lease_core::config::{load_credentials, parse_timeout_hours};
use gpu_lease_core::models;
use gpu_lease_orchestrator::registry::Registry;
use gpu_lease_state::StateStore;
use log::warn;
use tokio_util::sync::CancellationToken;

use crate::output::OutputFormat;

/// The model size tiers the built-in `ModelProfile` table resolves
/// (design §4.7's `--tier`). Variant names render as `small`/`medium`/
/// `large` via clap's kebab-case `ValueEnum` rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "lower")]
pub enum Tier {
    Small,
    Medium,
    Large,
}

impl Tier {
    fn as_str(self) -> &'static str {
        match self {
            Tier::Small => "small",
            Tier::Medium => "medium",
            Tier::Large => "large",
        }
    }
}

/// `gpu-lease`: lease an ephemeral GPU instance, tunnel a code-assist
/// model to this machine, and guarantee its teardown.
#[derive(Debug, Parser)]
#[command(name = "gpu-lease", version, about)]
pub struct Args {
    /// Select the cheapest available offer across configured providers
    /// (the only selection strategy the Deployer implements today; kept
    /// as an explicit flag for forward compatibility with alternative
    /// selectors).
    #[arg(long)]
    pub cheapest: bool,

    /// Terminate the currently active instance instead of deploying one.
    #[arg(long)]
    pub stop: bool,

    /// Restrict price discovery and selection to one provider.
    #[arg(long)]
    pub provider: Option<String>,

    /// Restrict price discovery to offers whose normalized GPU model
    /// matches exactly.
    #[arg(long)]
    pub gpu: Option<String>,

    /// An explicit model id from the built-in `ModelProfile` table. Wins
    /// over `--tier` when both are given.
    #[arg(long)]
    pub model: Option<String>,

    /// A model size tier; resolves to `medium` when neither `--model` nor
    /// `--tier` is given.
    #[arg(long)]
    pub tier: Option<Tier>,

    /// Restrict price discovery to offers that carry a spot price (spot is
    /// already preferred by default when present; this narrows the Fetch
    /// stage's candidate set instead of just nudging selection).
    #[arg(long)]
    pub spot: bool,

    /// Force on-demand pricing even where spot is available. Takes
    /// precedence over `--spot` (design §9 Open Question: the source
    /// resolves `prefer_spot = spot && !on_demand`, and `spot` defaults
    /// true regardless of whether the flag was passed).
    #[arg(long = "on-demand")]
    pub on_demand: bool,

    /// Restrict price discovery to one normalized region.
    #[arg(long)]
    pub region: Option<String>,

    /// Deadman switch timeout: `Nh` or a bare integer, both meaning
    /// hours. Clamped to `[1, 72]`.
    #[arg(long, default_value = "10h")]
    pub timeout: String,

    /// Output format: human-readable progress and summary, or a single
    /// JSON document on stdout.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Increase log verbosity. Repeatable: `-v` is `info`, `-vv` is
    /// `debug`. Ignored when `RUST_LOG` is set.
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Skip the interactive confirmation prompt.
    #[arg(long)]
    pub yes: bool,
}

impl Args {
    /// Resolution of the two spot/on-demand flags (design §9 Open
    /// Question, decided in `DESIGN.md`): on-demand always wins when
    /// passed; otherwise spot is preferred, matching its default-true
    /// semantics in the original source.
    pub fn prefer_spot(&self) -> bool {
        !self.on_demand
    }

    pub fn tier_str(&self) -> Option<&'static str> {
        self.tier.map(Tier::as_str)
    }
}

fn init_logging(verbose: u8) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
        return;
    }
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Block until SIGINT/SIGTERM, cancelling `token` (design §5
/// "Cancellation"). Installed once per invocation; a cancelled top-level
/// context stops new requests within one poll tick and still runs
/// compensating rollback under its own fresh deadline.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        token.cancel();
    });
}

/// Prompt for confirmation unless `--yes` was given or the output format
/// is JSON (a JSON consumer has no terminal to answer a prompt).
fn confirm(prompt: &str, yes: bool, output: OutputFormat) -> Result<bool> {
    if yes || output == OutputFormat::Json {
        return Ok(true);
    }
    eprint!("{prompt} [y/N] ");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Entry point called by `main`. Parses arguments, loads credentials,
/// builds the provider registry, and dispatches to `deploy::run` or
/// `stop::run`.
pub async fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let credentials = load_credentials(&std::collections::HashMap::new())?;
    let registry = Registry::from_credentials(&credentials);
    let state_store = Arc::new(StateStore::default_location());

    if args.stop {
        let confirmed = confirm("Stop the active instance?", args.yes, args.output)?;
        if !confirmed {
            bail!("aborted by user");
        }
        return crate::stop::run(&args, &registry, &state_store, &cancel).await;
    }

    let (timeout_hours, clamped) = parse_timeout_hours(&args.timeout)?;
    if clamped {
        warn!("--timeout {} clamped to {timeout_hours}h (valid range is [1, 72])", args.timeout);
    }
    let model = models::resolve(args.model.as_deref(), args.tier_str())
        .ok_or_else(|| anyhow::anyhow!("unknown --model; see the built-in model table"))?;

    let confirmed = confirm(
        &format!("Deploy {} (tier resolved to {})?", model.model_id, model.min_vram_gb),
        args.yes,
        args.output,
    )?;
    if !confirmed {
        bail!("aborted by user");
    }

    crate::deploy::run(&args, &registry, &state_store, model, timeout_hours, &cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        let mut full = vec!["gpu-lease"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).expect("valid argv")
    }

    #[test]
    fn spot_is_the_default() {
        let args = parse(&[]);
        assert!(args.prefer_spot());
    }

    #[test]
    fn on_demand_overrides_explicit_spot() {
        let args = parse(&["--spot", "--on-demand"]);
        assert!(!args.prefer_spot());
    }

    #[test]
    fn tier_resolves_to_static_str() {
        let args = parse(&["--tier", "large"]);
        assert_eq!(args.tier_str(), Some("large"));
    }

    #[test]
    fn no_tier_resolves_to_none() {
        let args = parse(&[]);
        assert_eq!(args.tier_str(), None);
    }

    #[test]
    fn timeout_defaults_to_10h() {
        let args = parse(&[]);
        assert_eq!(args.timeout, "10h");
    }

    #[test]
    fn output_defaults_to_text() {
        let args = parse(&[]);
        assert_eq!(args.output, OutputFormat::Text);
    }

    #[test]
    fn rejects_unknown_tier() {
        let mut full = vec!["gpu-lease", "--tier", "huge"];
        let result = Args::try_parse_from(std::mem::take(&mut full));
        assert!(result.is_err());
    }

    #[test]
    fn stop_and_model_flags_parse_independently() {
        let args = parse(&["--stop", "--yes"]);
        assert!(args.stop);
        assert!(args.yes);
        assert_eq!(args.model, None);
    }

    #[test]
    fn confirm_skips_prompt_with_yes() {
        assert!(confirm("deploy?", true, OutputFormat::Text).unwrap());
    }

    #[test]
    fn confirm_skips_prompt_for_json_output() {
        assert!(confirm("deploy?", false, OutputFormat::Json).unwrap());
    }
}
