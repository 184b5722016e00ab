//! End-to-end generation run

use anyhow::Result;
use candle_core::Device;
use std::path::PathBuf;
use tracing::info;

use crate::config::{GenerationConfig, RuntimeConfig};
use crate::pipeline::{load_flux_pipeline, GenerationRequest};
use crate::{device, env, io, memory};

/// Run one generation and return the path of the saved image
pub async fn run_generation(config: &GenerationConfig) -> Result<PathBuf> {
    env::apply_compatibility_settings();

    let runtime = RuntimeConfig::from_env();
    let device = device::detect_and_report_device(&runtime, config.force_cpu)?;
    device::report_hf_token_status(&runtime);

    generate_on(config, &runtime, &device).await
}

/// Output directory, pipeline load, generation and save on a chosen device
async fn generate_on(
    config: &GenerationConfig,
    runtime: &RuntimeConfig,
    device: &Device,
) -> Result<PathBuf> {
    io::ensure_output_directory(&config.out_dir)?;

    let mut pipeline = load_flux_pipeline(config, runtime, device).await?;

    let prompt = config.effective_prompt();
    if prompt != config.prompt {
        info!("Using effective prompt with LoRA trigger: '{}'", prompt);
    }

    let reference = config
        .reference_image
        .as_ref()
        .map(|r| {
            io::load_reference_image(&r.path, config.width, config.height).map(|img| (img, r.scale))
        })
        .transpose()?;

    let request = GenerationRequest {
        prompt: &prompt,
        width: config.width,
        height: config.height,
        steps: config.num_inference_steps,
        guidance: config.guidance_scale,
        seed: config.seed,
        reference: reference.as_ref().map(|(img, scale)| (img, *scale)),
    };
    let image = pipeline.generate(&request)?;

    let output_path = config.output_path();
    io::save_generated_image(&image, &output_path)?;

    memory::release(pipeline)?;
    Ok(output_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FluxGenError;

    fn local_config(root: &std::path::Path, force_cpu: bool) -> GenerationConfig {
        let model_dir = root.join("FLUX.1-schnell");
        std::fs::create_dir_all(&model_dir).unwrap();
        GenerationConfig {
            model_id: model_dir.to_string_lossy().into_owned(),
            out_dir: root.join("out").join("nested"),
            force_cpu,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_output_directory_created_before_load() {
        let tmp = tempfile::tempdir().unwrap();
        let config = local_config(tmp.path(), false);
        let runtime = RuntimeConfig {
            hf_token: None,
            has_cuda: false,
        };

        let err = generate_on(&config, &runtime, &Device::Cpu).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FluxGenError>(),
            Some(FluxGenError::CudaUnavailable)
        ));
        assert!(config.out_dir.is_dir());
        assert!(!config.output_path().exists());
    }

    #[tokio::test]
    async fn test_run_generation_stops_at_missing_weights() {
        let tmp = tempfile::tempdir().unwrap();
        let config = local_config(tmp.path(), true);

        let err = run_generation(&config).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FluxGenError>(),
            Some(FluxGenError::MissingModelFile(_))
        ));
        assert!(std::env::var("CUDA_MODULE_LOADING").is_ok());
        assert!(std::env::var("RAYON_NUM_THREADS").is_ok());
        assert!(config.out_dir.is_dir());
        assert!(!config.output_path().exists());
    }
}
