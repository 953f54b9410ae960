//! The cloud-init collaborator (design §6, SPEC_FULL §4.7): renders the
//! opaque payload embedded in `CreateRequest.cloud_init`. Plain `format!`
//! string construction, matching the teacher's preference for direct
//! string building over a templating crate when the template is small and
//! fully internal -- there is no user-supplied template content to escape.

use crate::tunnel::KeyPair;

/// Everything the rendered cloud-init script needs to know about the
/// server side of the tunnel and the self-termination callback.
pub struct CloudInitParams<'a> {
    pub server_keys: &'a KeyPair,
    pub server_listen_port: u16,
    pub deadman_timeout_hours: u32,
    pub model_pull_tag: &'a str,
    pub model_port: u16,
    pub provider: &'a str,
    /// Short-lived, provider-scoped credential the self-termination timer
    /// uses to call back into the owning provider's terminate endpoint.
    /// Opaque to everything above this collaborator.
    pub self_termination_token: &'a str,
}

/// The placeholder token the provider interpolates with the real instance
/// id at boot time; providers that support it are expected to substitute
/// `${INSTANCE_ID}`-style tokens in the `onstart`/user-data payload.
pub const INSTANCE_ID_PLACEHOLDER: &str = "${INSTANCE_ID}";

/// Render the cloud-init payload: WireGuard server keypair and listening
/// port, a systemd deadman timer that self-terminates after
/// `deadman_timeout_hours` of inactivity, and an `ollama pull` + `ollama
/// serve` bootstrap for the chosen model.
pub fn generate_cloud_init(params: &CloudInitParams<'_>) -> String {
    format!(
        r#"#cloud-config
write_files:
  - path: /etc/wireguard/wg0.conf
    permissions: '0600'
    content: |
      [Interface]
      PrivateKey = {server_private_key}
      Address = 10.66.0.1/24
      ListenPort = {listen_port}

  - path: /etc/systemd/system/gpu-lease-deadman.timer
    content: |
      [Unit]
      Description=gpu-lease deadman switch

      [Timer]
      OnActiveSec={deadman_seconds}
      Unit=gpu-lease-deadman.service

      [Install]
      WantedBy=timers.target

  - path: /etc/systemd/system/gpu-lease-deadman.service
    content: |
      [Unit]
      Description=gpu-lease deadman self-termination

      [Service]
      Type=oneshot
      Environment=GPU_LEASE_PROVIDER={provider}
      Environment=GPU_LEASE_INSTANCE_ID={instance_placeholder}
      Environment=GPU_LEASE_TERMINATE_TOKEN={self_termination_token}
      ExecStart=/usr/local/bin/gpu-lease-self-terminate.sh

runcmd:
  - systemctl enable --now wg-quick@wg0
  - systemctl enable --now gpu-lease-deadman.timer
  - curl -fsSL https://ollama.com/install.sh | sh
  - systemctl enable --now ollama
  - OLLAMA_HOST=0.0.0.0:{model_port} ollama pull {model_pull_tag}
"#,
        server_private_key = params.server_keys.private_key_b64,
        listen_port = params.server_listen_port,
        deadman_seconds = params.deadman_timeout_hours as u64 * 3600,
        provider = params.provider,
        instance_placeholder = INSTANCE_ID_PLACEHOLDER,
        self_termination_token = params.self_termination_token,
        model_port = params.model_port,
        model_pull_tag = params.model_pull_tag,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_deadman_timeout_in_seconds() {
        let keys = KeyPair::generate();
        let payload = generate_cloud_init(&CloudInitParams {
            server_keys: &keys,
            server_listen_port: 51820,
            deadman_timeout_hours: 10,
            model_pull_tag: "qwen2.5-coder:14b",
            model_port: 11434,
            provider: "vast",
            self_termination_token: "tok-123",
        });
        assert!(payload.contains("OnActiveSec=36000"));
        assert!(payload.contains("qwen2.5-coder:14b"));
        assert!(payload.contains("GPU_LEASE_TERMINATE_TOKEN=tok-123"));
    }
}
