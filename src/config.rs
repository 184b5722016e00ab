//! Configuration records for a single generation run
//!
//! [`GenerationConfig`] holds everything the user asked for and
//! [`RuntimeConfig`] captures the environment the process runs in. Both are
//! built once per invocation and passed by reference afterwards.

use std::path::{Path, PathBuf};
use tracing::warn;

use crate::device::ModelDType;

pub const DEFAULT_MODEL_ID: &str = "black-forest-labs/FLUX.1-schnell";
pub const DEFAULT_PROMPT: &str = "cinematic portrait photo, soft natural light, 85mm lens, shallow depth of field, ultra realistic";
pub const DEFAULT_OUT_DIR: &str = "outputs";
pub const DEFAULT_OUTPUT_NAME: &str = "flux_schnell.png";
pub const DEFAULT_HEIGHT: usize = 768;
pub const DEFAULT_WIDTH: usize = 768;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 3.5;
pub const DEFAULT_NUM_INFERENCE_STEPS: usize = 20;
pub const DEFAULT_LORA_SCALE: f32 = 1.0;
pub const DEFAULT_IP_ADAPTER_SCALE: f32 = 0.6;

/// One LoRA adapter to fuse, with the strength it is fused at
#[derive(Debug, Clone, PartialEq)]
pub struct LoraSpec {
    pub path: PathBuf,
    pub scale: f32,
}

/// Reference image used to condition the initial latents
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceImage {
    pub path: PathBuf,
    /// Strength in [0, 1]; 0 ignores the image, 1 reproduces it
    pub scale: f32,
}

/// Parameters for one image generation
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub model_id: String,
    pub prompt: String,
    pub height: usize,
    pub width: usize,
    pub guidance_scale: f64,
    pub num_inference_steps: usize,
    pub out_dir: PathBuf,
    pub output_name: String,
    pub loras: Vec<LoraSpec>,
    pub lora_config_path: Option<PathBuf>,
    pub trigger_words: Vec<String>,
    pub reference_image: Option<ReferenceImage>,
    pub seed: Option<u64>,
    pub dtype: ModelDType,
    pub cpu_offload: bool,
    pub force_cpu: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            height: DEFAULT_HEIGHT,
            width: DEFAULT_WIDTH,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            num_inference_steps: DEFAULT_NUM_INFERENCE_STEPS,
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
            output_name: DEFAULT_OUTPUT_NAME.to_string(),
            loras: Vec::new(),
            lora_config_path: None,
            trigger_words: Vec::new(),
            reference_image: None,
            seed: None,
            dtype: ModelDType::Auto,
            cpu_offload: false,
            force_cpu: false,
        }
    }
}

impl GenerationConfig {
    /// Full path where the generated image will be saved
    pub fn output_path(&self) -> PathBuf {
        self.out_dir.join(&self.output_name)
    }

    /// Prompt with LoRA trigger words prepended
    ///
    /// Trigger words already present in the prompt are not repeated.
    pub fn effective_prompt(&self) -> String {
        let missing: Vec<&str> = self
            .trigger_words
            .iter()
            .map(|w| w.trim())
            .filter(|w| !w.is_empty() && !self.prompt.contains(*w))
            .collect();

        if missing.is_empty() {
            self.prompt.clone()
        } else {
            format!("{}, {}", missing.join(", "), self.prompt)
        }
    }

    pub fn has_loras(&self) -> bool {
        !self.loras.is_empty()
    }
}

/// Pair LoRA paths with scales.
///
/// `paths` takes precedence over the single `path`. Per-adapter `scales`
/// take precedence over the single `scale`, which is repeated for every
/// path. A path left without a scale is fused at 1.0.
pub fn normalize_loras(
    paths: &[PathBuf],
    path: Option<&Path>,
    scales: &[f32],
    scale: f32,
) -> Vec<LoraSpec> {
    let paths: Vec<PathBuf> = if !paths.is_empty() {
        paths.to_vec()
    } else if let Some(path) = path {
        vec![path.to_path_buf()]
    } else {
        return Vec::new();
    };

    if scales.len() > paths.len() {
        warn!(
            paths = paths.len(),
            scales = scales.len(),
            "More LoRA scales than LoRA paths; extra scales ignored"
        );
    }

    paths
        .into_iter()
        .enumerate()
        .map(|(idx, path)| {
            let scale = if scales.is_empty() {
                scale
            } else {
                scales.get(idx).copied().unwrap_or(1.0)
            };
            LoraSpec { path, scale }
        })
        .collect()
}

/// Runtime environment of the process
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub hf_token: Option<String>,
    pub has_cuda: bool,
}

impl RuntimeConfig {
    /// Read `HF_TOKEN` and detect CUDA
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), detect_cuda())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F, has_cuda: bool) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let hf_token = lookup("HF_TOKEN").filter(|t| !t.trim().is_empty());
        Self { hf_token, has_cuda }
    }
}

fn detect_cuda() -> bool {
    candle_core::utils::cuda_is_available()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lora_paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_output_path() {
        let config = GenerationConfig {
            out_dir: PathBuf::from("/tmp/test_outputs"),
            ..Default::default()
        };
        assert_eq!(
            config.output_path(),
            PathBuf::from("/tmp/test_outputs/flux_schnell.png")
        );

        let config = GenerationConfig {
            out_dir: PathBuf::from("out"),
            output_name: "cat.png".to_string(),
            ..Default::default()
        };
        assert_eq!(config.output_path(), PathBuf::from("out/cat.png"));
    }

    #[test]
    fn test_effective_prompt_without_triggers() {
        let config = GenerationConfig {
            prompt: "a cat".to_string(),
            ..Default::default()
        };
        assert_eq!(config.effective_prompt(), "a cat");
    }

    #[test]
    fn test_effective_prompt_prepends_missing_triggers() {
        let config = GenerationConfig {
            prompt: "a cat in ohwx style".to_string(),
            trigger_words: vec!["ohwx".to_string(), "pixelart".to_string(), " ".to_string()],
            ..Default::default()
        };
        assert_eq!(config.effective_prompt(), "pixelart, a cat in ohwx style");
    }

    #[test]
    fn test_normalize_single_lora() {
        let loras = normalize_loras(&[], Some(Path::new("a.safetensors")), &[], 0.8);
        assert_eq!(
            loras,
            vec![LoraSpec {
                path: PathBuf::from("a.safetensors"),
                scale: 0.8
            }]
        );
    }

    #[test]
    fn test_normalize_no_lora() {
        assert!(normalize_loras(&[], None, &[0.5], 1.0).is_empty());
    }

    #[test]
    fn test_normalize_multiple_paths_win_over_single() {
        let paths = lora_paths(&["a.safetensors", "b.safetensors"]);
        let loras = normalize_loras(&paths, Some(Path::new("ignored.safetensors")), &[], 0.7);
        assert_eq!(loras.len(), 2);
        assert_eq!(loras[0].path, PathBuf::from("a.safetensors"));
        assert!(loras.iter().all(|l| l.scale == 0.7));
    }

    #[test]
    fn test_normalize_short_scale_list_defaults_to_one() {
        let paths = lora_paths(&["a", "b", "c"]);
        let loras = normalize_loras(&paths, None, &[0.5, 0.25], 0.9);
        let scales: Vec<f32> = loras.iter().map(|l| l.scale).collect();
        assert_eq!(scales, vec![0.5, 0.25, 1.0]);
    }

    #[test]
    fn test_normalize_extra_scales_ignored() {
        let paths = lora_paths(&["a"]);
        let loras = normalize_loras(&paths, None, &[0.3, 0.4], 1.0);
        assert_eq!(loras.len(), 1);
        assert_eq!(loras[0].scale, 0.3);
    }

    #[test]
    fn test_runtime_config_with_token() {
        let env: HashMap<&str, &str> = [("HF_TOKEN", "test_token")].into_iter().collect();
        let config = RuntimeConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()), true);
        assert_eq!(config.hf_token.as_deref(), Some("test_token"));
        assert!(config.has_cuda);
    }

    #[test]
    fn test_runtime_config_without_token() {
        let config = RuntimeConfig::from_lookup(|_| None, false);
        assert_eq!(config.hf_token, None);
        assert!(!config.has_cuda);

        let config = RuntimeConfig::from_lookup(|_| Some(String::new()), false);
        assert_eq!(config.hf_token, None);
    }
}
