//! Output rendering (design §6 "JSON output shapes", §7 "User-visible
//! behavior"): the `--output json` shapes for Deploy/Stop/error, and the
//! `[k/N]` prefixed text-mode progress lines with their glyph vocabulary.

use std::time::Duration;

use gpu_lease_orchestrator::progress::{glyph, ProgressCallback, ProgressEvent};
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use serde::Serialize;

/// `--output` selector (design §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "lower")]
pub enum OutputFormat {
    Text,
    Json,
}

/// The `Deploy` JSON shape (design §6).
#[derive(Debug, Serialize)]
pub struct DeployOutput {
    pub status: &'static str,
    pub instance: DeployInstance,
    pub model: String,
    pub endpoint: DeployEndpoint,
    pub cost: DeployCost,
    pub deadman: DeployDeadman,
    pub duration: String,
}

#[derive(Debug, Serialize)]
pub struct DeployInstance {
    pub id: String,
    pub provider: String,
    pub gpu: String,
    pub region: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    pub public_ip: String,
}

#[derive(Debug, Serialize)]
pub struct DeployEndpoint {
    pub wireguard_ip: String,
    pub port: u16,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct DeployCost {
    pub hourly: f64,
    pub currency: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DeployDeadman {
    pub active: bool,
    pub timeout_hours: u32,
    pub remaining_seconds: i64,
}

/// The `Stop` JSON shape (design §6).
#[derive(Debug, Serialize)]
pub struct StopOutput {
    pub status: &'static str,
    pub instance_id: String,
    pub provider: String,
    pub billing_verified: bool,
    pub manual_verification_required: bool,
    pub console_url: &'static str,
    pub session_cost: f64,
    pub session_duration: String,
    pub session_duration_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

impl StopOutput {
    pub fn no_active_instance() -> Self {
        Self {
            status: "no_active_instance",
            instance_id: String::new(),
            provider: String::new(),
            billing_verified: false,
            manual_verification_required: false,
            console_url: "",
            session_cost: 0.0,
            session_duration: "0m 0s".to_string(),
            session_duration_seconds: 0,
            error: None,
        }
    }
}

/// The error JSON shape (design §6): `{status: "error", error}`.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub status: &'static str,
    pub error: String,
}

/// Render a top-level failure for stderr, in the same shape regardless of
/// `--output` (the caller already failed before a command-specific result
/// could be produced).
pub fn render_error(err: &anyhow::Error) -> String {
    serde_json::to_string(&ErrorOutput {
        status: "error",
        error: err.to_string(),
    })
    .unwrap_or_else(|_| format!("{{\"status\":\"error\",\"error\":{:?}}}", err.to_string()))
}

/// A steady-tick spinner (matching the teacher's `ProgressBar::new_spinner`
/// idiom) that prints one completed `[k/N] glyph message (detail)` line
/// above itself per finished stage, with the spinner's own message tracking
/// whichever stage is currently in flight. The caller owns the returned
/// `ProgressBar` and must `finish_and_clear` it once the pipeline returns,
/// success or failure, so a stale spinner frame never lingers on exit.
pub fn spinner_progress() -> (ProgressBar, ProgressCallback) {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.yellow} {msg}") {
        spinner.set_style(style);
    }
    spinner.enable_steady_tick(Duration::from_millis(120));

    let bar = spinner.clone();
    let callback: ProgressCallback = std::sync::Arc::new(move |event: ProgressEvent| {
        let prefix = format!("[{}/{}]", event.step, event.total);
        if event.completed {
            match &event.detail {
                Some(detail) => bar.println(format!("{prefix} {} {} ({detail})", glyph::SUCCESS.green(), event.message)),
                None => bar.println(format!("{prefix} {} {}", glyph::SUCCESS.green(), event.message)),
            }
        }
        bar.set_message(format!("{prefix} {}", event.message));
    });
    (spinner, callback)
}

/// A failed-stage line using the failure glyph, printed once a pipeline
/// returns an error so the last progress line isn't left dangling at
/// "in progress".
pub fn render_stage_failure(step: u8, total: u8, message: &str, err: &str) {
    eprintln!("[{step}/{total}] {} {message}: {err}", glyph::FAILURE.red());
}

/// A warning line (design §7's `⚠` glyph), used for reconciliation
/// mismatches and best-effort cleanup failures.
pub fn render_warning(message: &str) {
    eprintln!("{} {message}", glyph::WARNING.yellow());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_active_instance_stop_output_serializes_without_error_field() {
        let json = serde_json::to_value(StopOutput::no_active_instance()).unwrap();
        assert_eq!(json["status"], "no_active_instance");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn stop_output_with_error_includes_the_field() {
        let mut result = StopOutput::no_active_instance();
        result.status = "error";
        result.error = Some("terminate_failed");
        let json = serde_json::to_value(result).unwrap();
        assert_eq!(json["error"], "terminate_failed");
    }

    #[test]
    fn error_output_shape_matches_design() {
        let err = anyhow::anyhow!("no_provider_configured");
        let rendered = render_error(&err);
        let json: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "no_provider_configured");
    }

    #[test]
    fn deploy_instance_type_field_renames_to_type() {
        let instance = DeployInstance {
            id: "i-1".to_string(),
            provider: "vast".to_string(),
            gpu: "A100".to_string(),
            region: "us-east".to_string(),
            instance_type: "spot".to_string(),
            public_ip: "1.2.3.4".to_string(),
        };
        let json = serde_json::to_value(instance).unwrap();
        assert_eq!(json["type"], "spot");
        assert!(json.get("instance_type").is_none());
    }

    #[test]
    fn output_format_parses_lowercase_value_names() {
        use clap::ValueEnum;
        assert_eq!(OutputFormat::from_str("json", true).unwrap(), OutputFormat::Json);
        assert_eq!(OutputFormat::from_str("text", true).unwrap(), OutputFormat::Text);
    }
}
