//! The tunnel collaborator (design §6, SPEC_FULL §4.7): a thin wrapper
//! around the `wg`/`wg-quick` command-line tools, shelled out via
//! `tokio::process::Command` (matching the teacher's sandboxed-subprocess
//! idiom in `tools::shell::ShellExecutor`). `TeardownTunnel` tolerates an
//! absent interface as success, the same idempotence contract as
//! `Provider::terminate_instance`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use log::{debug, warn};
use rand::rngs::OsRng;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use x25519_dalek::{PublicKey, StaticSecret};

const WAIT_FOR_HANDSHAKE_POLL: Duration = Duration::from_secs(2);

/// A generated WireGuard keypair, base64-encoded the way `wg genkey`/`wg
/// pubkey` would emit them.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key_b64: String,
    pub public_key_b64: String,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            private_key_b64: BASE64_STANDARD.encode(secret.to_bytes()),
            public_key_b64: BASE64_STANDARD.encode(public.to_bytes()),
        }
    }
}

/// The parameters for bringing up the client side of a link: this host's
/// own keypair, the server's public key and endpoint, and the interface's
/// assigned tunnel address.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub interface_name: String,
    pub client_keys: KeyPair,
    pub client_tunnel_ip: String,
    pub server_public_key_b64: String,
    pub server_endpoint: String,
    pub server_endpoint_port: u16,
}

/// A live client-side tunnel interface.
pub struct Tunnel {
    pub interface_name: String,
    config_path: PathBuf,
}

/// Options for `wait_for_connection`'s optional health probe.
pub struct WaitOptions {
    /// When set, also requires a 200 from `http://<tunnel_ip>:<port>/api/tags`
    /// (the Ollama-style health endpoint) before returning success.
    pub probe_model_health: Option<(String, u16)>,
    pub deadline: Duration,
}

fn render_client_config(cfg: &ClientConfig) -> String {
    format!(
        "[Interface]\nPrivateKey = {}\nAddress = {}/32\n\n[Peer]\nPublicKey = {}\nEndpoint = {}:{}\nAllowedIPs = 0.0.0.0/0\nPersistentKeepalive = 25\n",
        cfg.client_keys.private_key_b64,
        cfg.client_tunnel_ip,
        cfg.server_public_key_b64,
        cfg.server_endpoint,
        cfg.server_endpoint_port,
    )
}

async fn run(cmd: &mut Command) -> Result<std::process::Output> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.output().await.context("spawning wg/wg-quick")
}

/// Locate `wg-quick` on `PATH`, surfacing a clear error if the WireGuard
/// tools are not installed rather than failing deep inside a stage.
fn wg_quick_path() -> Result<PathBuf> {
    which::which("wg-quick").context("wg-quick not found on PATH; install wireguard-tools")
}

fn wg_path() -> Result<PathBuf> {
    which::which("wg").context("wg not found on PATH; install wireguard-tools")
}

/// Write `contents` to `path` and, on Unix, restrict it to `0o600` before
/// any other process sharing the (typically world-readable) temp directory
/// gets a chance to read it -- the config embeds the client's raw private
/// key, the same sensitivity as the server-side `wg0.conf` in the
/// cloud-init template.
async fn write_private_file(path: &Path, contents: &str) -> Result<()> {
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("writing wireguard config to {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(path).await?.permissions();
        perms.set_mode(0o600);
        tokio::fs::set_permissions(path, perms)
            .await
            .context("restricting wireguard client config permissions")?;
    }
    Ok(())
}

/// Bring up a local interface bound to `config.client_keys` and
/// `config.server_endpoint`: write the rendered client config to a temp
/// file, then `wg-quick up <file>`.
pub async fn setup_tunnel(config: &ClientConfig) -> Result<Tunnel> {
    let wg_quick = wg_quick_path()?;
    let dir = std::env::temp_dir();
    let config_path = dir.join(format!("{}.conf", config.interface_name));
    write_private_file(&config_path, &render_client_config(config)).await?;

    let output = run(Command::new(&wg_quick).arg("up").arg(&config_path)).await?;
    if !output.status.success() {
        return Err(anyhow!(
            "wg-quick up failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    debug!("tunnel interface {} up", config.interface_name);
    Ok(Tunnel {
        interface_name: config.interface_name.clone(),
        config_path,
    })
}

/// Block until the peer handshake completes or `opts.deadline` elapses,
/// polling `wg show <iface> latest-handshakes` every 2s; when
/// `opts.probe_model_health` is set, also requires a successful GET to the
/// tunnel IP's Ollama health endpoint.
pub async fn wait_for_connection(
    tunnel: &Tunnel,
    opts: &WaitOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let wg = wg_path()?;
    let deadline = tokio::time::Instant::now() + opts.deadline;

    loop {
        if cancel.is_cancelled() {
            return Err(anyhow!("tunnel wait cancelled"));
        }
        let output = run(Command::new(&wg).arg("show").arg(&tunnel.interface_name).arg("latest-handshakes")).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let handshake_established = stdout
            .split_whitespace()
            .last()
            .and_then(|ts| ts.parse::<u64>().ok())
            .map(|ts| ts > 0)
            .unwrap_or(false);

        if handshake_established {
            if let Some((ip, port)) = &opts.probe_model_health {
                if probe_health(ip, *port).await.is_ok() {
                    return Ok(());
                }
            } else {
                return Ok(());
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!(
                "timed out waiting for tunnel connection on {}",
                tunnel.interface_name
            ));
        }
        tokio::select! {
            _ = tokio::time::sleep(WAIT_FOR_HANDSHAKE_POLL) => {}
            _ = cancel.cancelled() => return Err(anyhow!("tunnel wait cancelled")),
        }
    }
}

async fn probe_health(tunnel_ip: &str, port: u16) -> Result<()> {
    let url = format!("http://{tunnel_ip}:{port}/api/tags");
    let response = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .context("model health probe request failed")?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(anyhow!("model health probe returned {}", response.status()))
    }
}

/// Tear down the interface with `wg-quick down`. Idempotent: "interface
/// does not exist" (and a missing `wg-quick` binary) are tolerated as
/// success, mirroring `Provider::terminate_instance`'s contract.
pub async fn teardown_tunnel(interface_name: &str) -> Result<()> {
    let Ok(wg_quick) = wg_quick_path() else {
        warn!("wg-quick not found on PATH; treating tunnel {interface_name} as already torn down");
        return Ok(());
    };
    let output = run(Command::new(&wg_quick).arg("down").arg(interface_name)).await?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("is not a WireGuard interface") || stderr.contains("does not exist") {
        return Ok(());
    }
    Err(anyhow!("wg-quick down failed: {stderr}"))
}

/// Best-effort wait wrapper with a cancellable overall timeout, used by
/// stages 5/6/8 which each have their own deadline.
pub async fn with_deadline<T, F>(duration: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    timeout(duration, fut)
        .await
        .map_err(|_| anyhow!("operation timed out after {duration:?}"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ClientConfig {
        ClientConfig {
            interface_name: "wg-test0".to_string(),
            client_keys: KeyPair::generate(),
            client_tunnel_ip: "10.66.0.2".to_string(),
            server_public_key_b64: "serverpubkey==".to_string(),
            server_endpoint: "203.0.113.5".to_string(),
            server_endpoint_port: 51820,
        }
    }

    #[test]
    fn rendered_config_embeds_private_key_and_endpoint() {
        let rendered = render_client_config(&sample_config());
        assert!(rendered.contains("[Interface]"));
        assert!(rendered.contains("Address = 10.66.0.2/32"));
        assert!(rendered.contains("Endpoint = 203.0.113.5:51820"));
        assert!(rendered.contains("PersistentKeepalive = 25"));
    }

    #[tokio::test]
    async fn write_private_file_restricts_permissions_to_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg-test0.conf");
        write_private_file(&path, "[Interface]\nPrivateKey = secret\n").await.unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
