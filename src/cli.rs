//! Command-line interface
//!
//! Flags are kebab-case; the underscore spellings (`--model_id`,
//! `--num_inference_steps`, ...) are accepted as aliases.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{
    normalize_loras, GenerationConfig, ReferenceImage, DEFAULT_GUIDANCE_SCALE, DEFAULT_HEIGHT,
    DEFAULT_IP_ADAPTER_SCALE, DEFAULT_LORA_SCALE, DEFAULT_MODEL_ID, DEFAULT_NUM_INFERENCE_STEPS,
    DEFAULT_OUTPUT_NAME, DEFAULT_OUT_DIR, DEFAULT_PROMPT, DEFAULT_WIDTH,
};
use crate::device::ModelDType;
use crate::error::FluxGenError;

/// Image dimensions must be multiples of this (VAE factor 8 x patch size 2)
pub const DIMENSION_ALIGN: usize = 16;

#[derive(Parser, Debug)]
#[command(name = "flux-gen")]
#[command(version)]
#[command(about = "Generate images with FLUX.1, optional LoRA fusion and reference-image conditioning", long_about = None)]
#[command(propagate_version = true)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Flags for `generate` when no subcommand is given
    #[command(flatten)]
    pub generate: GenerateArgs,
}

impl Cli {
    /// The requested subcommand, `generate` when none was named
    pub fn into_command(self) -> Commands {
        self.command.unwrap_or(Commands::Generate(self.generate))
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate one image and save it as PNG
    Generate(GenerateArgs),

    /// Download every model file into the HuggingFace cache
    ///
    /// Requires HF_TOKEN for gated models such as FLUX.1-dev.
    Download(DownloadArgs),
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// Hub model id or local model directory
    #[arg(long, alias = "model_id", default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Hub model id or local model directory
    #[arg(long, alias = "model_id", default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    /// Text prompt for image generation
    #[arg(short, long, default_value = DEFAULT_PROMPT)]
    pub prompt: String,

    /// Output directory for generated images
    #[arg(short, long, alias = "out_dir", default_value = DEFAULT_OUT_DIR)]
    pub out_dir: PathBuf,

    /// Output file name inside the output directory
    #[arg(long, alias = "output_name", default_value = DEFAULT_OUTPUT_NAME)]
    pub output_name: String,

    /// Image height in pixels (multiple of 16)
    #[arg(long, default_value_t = DEFAULT_HEIGHT)]
    pub height: usize,

    /// Image width in pixels (multiple of 16)
    #[arg(long, default_value_t = DEFAULT_WIDTH)]
    pub width: usize,

    /// Guidance scale (ignored by schnell)
    #[arg(long, alias = "guidance_scale", default_value_t = DEFAULT_GUIDANCE_SCALE)]
    pub guidance_scale: f64,

    /// Number of denoising steps
    #[arg(long, alias = "num_inference_steps", default_value_t = DEFAULT_NUM_INFERENCE_STEPS)]
    pub num_inference_steps: usize,

    /// Path to a LoRA weights file (.safetensors)
    #[arg(long, alias = "lora_path")]
    pub lora_path: Option<PathBuf>,

    /// Several LoRA files, fused in order (overrides --lora-path)
    #[arg(long, alias = "lora_paths", num_args = 1..)]
    pub lora_paths: Vec<PathBuf>,

    /// Scale applied to every LoRA without a --lora-scales entry
    #[arg(long, alias = "lora_scale", default_value_t = DEFAULT_LORA_SCALE)]
    pub lora_scale: f32,

    /// Per-LoRA scales, matched to --lora-paths by position
    #[arg(long, alias = "lora_scales", num_args = 1..)]
    pub lora_scales: Vec<f32>,

    /// PEFT adapter_config.json supplying lora_alpha
    #[arg(long, alias = "lora_config_path")]
    pub lora_config_path: Option<PathBuf>,

    /// LoRA trigger words prepended to the prompt
    #[arg(long, alias = "trigger_words", num_args = 1..)]
    pub trigger_words: Vec<String>,

    /// Reference image conditioning the generation
    #[arg(long, alias = "reference_image")]
    pub reference_image: Option<PathBuf>,

    /// Reference strength in [0, 1]; 1 reproduces the reference
    #[arg(long, alias = "ip_adapter_scale", default_value_t = DEFAULT_IP_ADAPTER_SCALE)]
    pub ip_adapter_scale: f32,

    /// Random seed for reproducibility
    #[arg(long)]
    pub seed: Option<u64>,

    /// Weight precision
    #[arg(long, value_enum, default_value_t = ModelDType::Auto)]
    pub dtype: ModelDType,

    /// Keep the text encoders on the CPU to save GPU memory
    #[arg(long, alias = "cpu_offload")]
    pub cpu_offload: bool,

    /// Run on the CPU even when CUDA is available (very slow)
    #[arg(long)]
    pub cpu: bool,
}

impl GenerateArgs {
    /// Validate the flags and build the configuration record
    pub fn into_config(self) -> Result<GenerationConfig> {
        for (name, value) in [("height", self.height), ("width", self.width)] {
            if value == 0 || value % DIMENSION_ALIGN != 0 {
                return Err(invalid(format!(
                    "{name} must be a positive multiple of {DIMENSION_ALIGN}, got {value}"
                )));
            }
        }
        if self.num_inference_steps == 0 {
            return Err(invalid("num_inference_steps must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.ip_adapter_scale) {
            return Err(invalid(format!(
                "ip_adapter_scale must be in [0, 1], got {}",
                self.ip_adapter_scale
            )));
        }

        let loras = normalize_loras(
            &self.lora_paths,
            self.lora_path.as_deref(),
            &self.lora_scales,
            self.lora_scale,
        );
        for lora in &loras {
            if !lora.path.exists() {
                return Err(invalid(format!("LoRA file not found: {}", lora.path.display())));
            }
        }

        let reference_image = self.reference_image.map(|path| ReferenceImage {
            path,
            scale: self.ip_adapter_scale,
        });

        Ok(GenerationConfig {
            model_id: self.model_id,
            prompt: self.prompt,
            height: self.height,
            width: self.width,
            guidance_scale: self.guidance_scale,
            num_inference_steps: self.num_inference_steps,
            out_dir: self.out_dir,
            output_name: self.output_name,
            loras,
            lora_config_path: self.lora_config_path,
            trigger_words: self.trigger_words,
            reference_image,
            seed: self.seed,
            dtype: self.dtype,
            cpu_offload: self.cpu_offload,
            force_cpu: self.cpu,
        })
    }
}

fn invalid(message: String) -> anyhow::Error {
    FluxGenError::InvalidArgument(message).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate_args(args: &[&str]) -> GenerateArgs {
        let argv = ["flux-gen", "generate"].iter().chain(args.iter());
        match Cli::try_parse_from(argv).unwrap().into_command() {
            Commands::Generate(args) => args,
            other => panic!("expected generate, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults() {
        let config = generate_args(&[]).into_config().unwrap();

        assert_eq!(config.model_id, DEFAULT_MODEL_ID);
        assert_eq!(
            config.prompt,
            "cinematic portrait photo, soft natural light, 85mm lens, shallow depth of field, ultra realistic"
        );
        assert_eq!(config.out_dir, PathBuf::from("outputs"));
        assert_eq!(config.height, 768);
        assert_eq!(config.width, 768);
        assert_eq!(config.guidance_scale, 3.5);
        assert_eq!(config.num_inference_steps, 20);
        assert_eq!(config.output_path(), PathBuf::from("outputs/flux_schnell.png"));
        assert!(config.loras.is_empty());
        assert!(config.reference_image.is_none());
        assert_eq!(config.dtype, ModelDType::Auto);
        assert!(!config.force_cpu);
    }

    #[test]
    fn test_custom_values_with_underscore_aliases() {
        let config = generate_args(&[
            "--model_id",
            "custom/model",
            "--prompt",
            "test prompt",
            "--out_dir",
            "./custom_outputs",
            "--height",
            "512",
            "--width",
            "1024",
            "--guidance_scale",
            "2.0",
            "--num_inference_steps",
            "10",
            "--dtype",
            "f16",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.model_id, "custom/model");
        assert_eq!(config.prompt, "test prompt");
        assert_eq!(config.height, 512);
        assert_eq!(config.width, 1024);
        assert_eq!(config.guidance_scale, 2.0);
        assert_eq!(config.num_inference_steps, 10);
        assert_eq!(config.dtype, ModelDType::F16);
        assert_eq!(
            config.output_path(),
            PathBuf::from("./custom_outputs/flux_schnell.png")
        );
    }

    #[test]
    fn test_multiple_loras_and_triggers() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.safetensors");
        let b = tmp.path().join("b.safetensors");
        std::fs::write(&a, b"").unwrap();
        std::fs::write(&b, b"").unwrap();

        let config = generate_args(&[
            "--lora-paths",
            a.to_str().unwrap(),
            b.to_str().unwrap(),
            "--lora-scales",
            "0.8",
            "--trigger-words",
            "ohwx",
            "--prompt",
            "a cat",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.loras.len(), 2);
        assert_eq!(config.loras[0].scale, 0.8);
        assert_eq!(config.loras[1].scale, 1.0);
        assert_eq!(config.effective_prompt(), "ohwx, a cat");
    }

    #[test]
    fn test_missing_lora_rejected() {
        let err = generate_args(&["--lora-path", "/nonexistent/lora.safetensors"])
            .into_config()
            .unwrap_err();
        assert!(err.to_string().contains("LoRA file not found"));
    }

    #[test]
    fn test_invalid_dimensions_rejected() {
        let err = generate_args(&["--height", "500"]).into_config().unwrap_err();
        assert!(err.to_string().contains("height must be a positive multiple of 16"));

        assert!(generate_args(&["--width", "0"]).into_config().is_err());
        assert!(generate_args(&["--num-inference-steps", "0"])
            .into_config()
            .is_err());
    }

    #[test]
    fn test_reference_image_scale() {
        let config = generate_args(&["--reference-image", "ref.png", "--ip-adapter-scale", "0.3"])
            .into_config()
            .unwrap();
        let reference = config.reference_image.unwrap();
        assert_eq!(reference.path, PathBuf::from("ref.png"));
        assert_eq!(reference.scale, 0.3);

        assert!(generate_args(&["--ip-adapter-scale", "1.5"])
            .into_config()
            .is_err());
    }

    #[test]
    fn test_flags_without_subcommand_generate() {
        let cli = Cli::try_parse_from(["flux-gen", "--prompt", "a lighthouse", "--num_inference_steps", "4"])
            .unwrap();
        match cli.into_command() {
            Commands::Generate(args) => {
                assert_eq!(args.prompt, "a lighthouse");
                assert_eq!(args.num_inference_steps, 4);
            }
            other => panic!("expected generate, got {other:?}"),
        }

        match Cli::try_parse_from(["flux-gen"]).unwrap().into_command() {
            Commands::Generate(args) => assert_eq!(args.model_id, DEFAULT_MODEL_ID),
            other => panic!("expected generate, got {other:?}"),
        }
    }

    #[test]
    fn test_download_subcommand() {
        let cli = Cli::try_parse_from(["flux-gen", "download", "--model-id", "black-forest-labs/FLUX.1-dev"])
            .unwrap();
        match cli.into_command() {
            Commands::Download(args) => assert_eq!(args.model_id, "black-forest-labs/FLUX.1-dev"),
            other => panic!("expected download, got {other:?}"),
        }
    }
}
