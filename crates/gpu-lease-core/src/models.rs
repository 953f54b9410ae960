//! The static model/GPU registry (design §4.7 ambient addition). The CLI's
//! `--model`/`--tier` flags resolve against this small built-in table; the
//! Deployer never invents resource requirements itself.

use crate::types::ModelProfile;

/// Built-in `(tier, model_id)` profiles, ordered from smallest to largest.
/// An explicit `--model` is matched by `model_id`; `--tier` picks the
/// profile tagged with that tier.
fn profiles() -> &'static [(&'static str, ModelProfile)] {
    use std::sync::OnceLock;
    static PROFILES: OnceLock<Vec<(&'static str, ModelProfile)>> = OnceLock::new();
    PROFILES.get_or_init(|| {
        vec![
            (
                "small",
                ModelProfile {
                    model_id: "qwen2.5-coder:7b".to_string(),
                    min_vram_gb: 12,
                    preferred_gpu: "A6000 48GB".to_string(),
                    disk_size_gb: 60,
                    pull_tag: "qwen2.5-coder:7b".to_string(),
                    port: ModelProfile::OLLAMA_PORT,
                },
            ),
            (
                "medium",
                ModelProfile {
                    model_id: "qwen2.5-coder:14b".to_string(),
                    min_vram_gb: 24,
                    preferred_gpu: "A100 40GB".to_string(),
                    disk_size_gb: 80,
                    pull_tag: "qwen2.5-coder:14b".to_string(),
                    port: ModelProfile::OLLAMA_PORT,
                },
            ),
            (
                "large",
                ModelProfile {
                    model_id: "qwen2.5-coder:32b".to_string(),
                    min_vram_gb: 48,
                    preferred_gpu: "A100 80GB".to_string(),
                    disk_size_gb: 120,
                    pull_tag: "qwen2.5-coder:32b".to_string(),
                    port: ModelProfile::OLLAMA_PORT,
                },
            ),
            (
                "large",
                ModelProfile {
                    model_id: "deepseek-coder-v2:16b".to_string(),
                    min_vram_gb: 36,
                    preferred_gpu: "A100 80GB".to_string(),
                    disk_size_gb: 100,
                    pull_tag: "deepseek-coder-v2:16b".to_string(),
                    port: ModelProfile::OLLAMA_PORT,
                },
            ),
        ]
    })
    .as_slice()
}

/// Resolve `--model`/`--tier` to a profile. An explicit model id wins over
/// a tier when both are given (design §4.7).
pub fn resolve(model: Option<&str>, tier: Option<&str>) -> Option<ModelProfile> {
    if let Some(model) = model {
        if let Some((_, profile)) = profiles().iter().find(|(_, p)| p.model_id == model) {
            return Some(profile.clone());
        }
        return None;
    }
    let tier = tier.unwrap_or("medium");
    profiles()
        .iter()
        .find(|(t, _)| *t == tier)
        .map(|(_, p)| p.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_model_wins_over_tier() {
        let profile = resolve(Some("qwen2.5-coder:7b"), Some("large")).unwrap();
        assert_eq!(profile.model_id, "qwen2.5-coder:7b");
    }

    #[test]
    fn tier_resolves_to_a_profile() {
        let profile = resolve(None, Some("large")).unwrap();
        assert_eq!(profile.min_vram_gb, 48);
    }

    #[test]
    fn default_tier_is_medium_when_neither_given() {
        let profile = resolve(None, None).unwrap();
        assert_eq!(profile.model_id, "qwen2.5-coder:14b");
    }

    #[test]
    fn unknown_model_id_resolves_to_none() {
        assert!(resolve(Some("not-a-real-model"), None).is_none());
    }
}
