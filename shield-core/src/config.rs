//! Job-level configuration (spec §3 `Configuration`, §4.4 intensity presets).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Intensity {
    Low,
    Medium,
    High,
}

impl Default for Intensity {
    fn default() -> Self {
        Intensity::Medium
    }
}

/// Resolved PGD hyperparameters for one intensity preset (spec §4.4 table).
#[derive(Debug, Clone, Copy)]
pub struct IntensityPreset {
    pub epsilon: f32,
    pub alpha_step: f32,
    pub steps: usize,
    pub w_lpips: f32,
    pub w_repel: f32,
    pub w_attract: f32,
}

impl Intensity {
    pub fn preset(self) -> IntensityPreset {
        match self {
            Intensity::Low => IntensityPreset {
                epsilon: 6.0 / 255.0,
                alpha_step: 1.0 / 255.0,
                steps: 50,
                w_lpips: 5.0,
                w_repel: 1.0,
                w_attract: 1.0,
            },
            Intensity::Medium => IntensityPreset {
                epsilon: 32.0 / 255.0,
                alpha_step: 2.0 / 255.0,
                steps: 200,
                w_lpips: 0.01,
                w_repel: 2.0,
                w_attract: 2.0,
            },
            Intensity::High => IntensityPreset {
                epsilon: 80.0 / 255.0,
                alpha_step: 4.0 / 255.0,
                steps: 600,
                w_lpips: 0.0,
                w_repel: 15.0,
                w_attract: 10.0,
            },
        }
    }
}

/// [SUPPLEMENT] advisory metadata only; does not change which encoders the
/// Adversarial Perturbation Engine attacks (fixed to CLIP + SigLIP, see Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetModel {
    Sd15,
    Sdxl,
    Flux,
    All,
}

fn default_target_models() -> Vec<TargetModel> {
    vec![TargetModel::Sdxl, TargetModel::Flux]
}

fn default_watermark_text() -> String {
    "DRIMIT SHIELD".to_string()
}

fn default_decoy_prompts() -> Vec<String> {
    vec![
        "static noise pattern".to_string(),
        "abstract grey digital texture".to_string(),
        "blank screen error".to_string(),
    ]
}

const fn default_alpha() -> f32 {
    0.012
}

const fn default_max_res() -> u32 {
    3840
}

const fn default_detect_threshold() -> f32 {
    2.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub apply_poison: bool,
    pub apply_concept_poison: bool,
    pub apply_watermark: bool,
    pub apply_visual_watermark: bool,
    pub watermark_text: String,
    pub secret_key: Option<String>,
    pub intensity: Intensity,
    /// Overrides `intensity.preset().epsilon` when set.
    pub epsilon: Option<f32>,
    /// Overrides `intensity.preset().steps` when set.
    pub steps: Option<usize>,
    pub alpha: f32,
    pub max_res: u32,
    pub apply_verification: bool,
    /// [SUPPLEMENT] advisory only, see `TargetModel`.
    pub target_models: Vec<TargetModel>,
    /// Decoy text concepts for the attract-to-text loss term (spec §4.2).
    pub decoy_prompts: Vec<String>,
    /// Detection presence threshold for the watermark codec (spec §4.5, §9 Open Questions).
    pub watermark_detect_threshold: f32,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            apply_poison: true,
            apply_concept_poison: false,
            apply_watermark: true,
            apply_visual_watermark: false,
            watermark_text: default_watermark_text(),
            secret_key: None,
            intensity: Intensity::Medium,
            epsilon: None,
            steps: None,
            alpha: default_alpha(),
            max_res: default_max_res(),
            apply_verification: false,
            target_models: default_target_models(),
            decoy_prompts: default_decoy_prompts(),
            watermark_detect_threshold: default_detect_threshold(),
        }
    }
}

impl Configuration {
    /// Resolve the effective PGD hyperparameters: intensity preset with any
    /// per-field overrides applied (spec §4.4 "Override from config if specific").
    pub fn resolved_pgd_params(&self) -> IntensityPreset {
        let mut preset = self.intensity.preset();
        if let Some(eps) = self.epsilon {
            preset.epsilon = eps;
        }
        if let Some(steps) = self.steps {
            preset.steps = steps;
        }
        preset
    }

    pub fn resolved_secret_key(&self) -> String {
        self.secret_key
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intensity_presets_monotonically_increase_in_epsilon() {
        let low = Intensity::Low.preset();
        let medium = Intensity::Medium.preset();
        let high = Intensity::High.preset();
        assert!(low.epsilon < medium.epsilon);
        assert!(medium.epsilon < high.epsilon);
        assert!(low.steps < medium.steps);
        assert!(medium.steps < high.steps);
    }

    #[test]
    fn config_overrides_win_over_intensity_preset() {
        let config = Configuration {
            intensity: Intensity::Low,
            epsilon: Some(0.5),
            steps: Some(7),
            ..Configuration::default()
        };
        let resolved = config.resolved_pgd_params();
        assert_eq!(resolved.epsilon, 0.5);
        assert_eq!(resolved.steps, 7);
    }

    #[test]
    fn config_without_overrides_uses_preset_unchanged() {
        let config = Configuration {
            intensity: Intensity::High,
            ..Configuration::default()
        };
        let resolved = config.resolved_pgd_params();
        assert_eq!(resolved.epsilon, Intensity::High.preset().epsilon);
    }

    #[test]
    fn resolved_secret_key_prefers_explicit_key() {
        let config = Configuration {
            secret_key: Some("abc123".to_string()),
            ..Configuration::default()
        };
        assert_eq!(config.resolved_secret_key(), "abc123");
    }

    #[test]
    fn resolved_secret_key_generates_one_when_absent() {
        let config = Configuration::default();
        let key = config.resolved_secret_key();
        assert!(!key.is_empty());
    }

    #[test]
    fn default_configuration_matches_spec_defaults() {
        let config = Configuration::default();
        assert!(config.apply_poison);
        assert!(!config.apply_concept_poison);
        assert!(config.apply_watermark);
        assert!(!config.apply_verification);
        assert_eq!(config.intensity, Intensity::Medium);
    }
}
