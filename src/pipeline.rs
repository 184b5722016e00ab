//! FLUX generation pipeline
//!
//! Loading wires the resolved model files, LoRA adapters, dtype and device
//! placement together. Generation runs:
//! 1. Encode prompt (T5 + CLIP)
//! 2. Build initial latents (noise, optionally blended with a reference image)
//! 3. Denoise with the FLUX transformer (Euler, over the truncated schedule)
//! 4. Decode latents to RGB

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::flux;
use image::RgbImage;
use tracing::{debug, info};

use crate::config::{GenerationConfig, RuntimeConfig};
use crate::device::select_dtype;
use crate::download::{ModelDownloader, ModelFiles, ModelVariant};
use crate::error::FluxGenError;
use crate::io;
use crate::lora::{LoraAdapter, PeftConfig};
use crate::models::{Autoencoder, ClipTextEncoder, FluxTransformer, T5TextEncoder};

/// Schedule shift parameters used by FLUX.1-dev
const DEV_BASE_SHIFT: f64 = 0.5;
const DEV_MAX_SHIFT: f64 = 1.15;

/// One image to generate
#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub seed: Option<u64>,
    /// Reference image (already sized to width x height) and its strength
    pub reference: Option<(&'a RgbImage, f32)>,
}

/// Loaded FLUX pipeline
pub struct FluxPipeline {
    t5: T5TextEncoder,
    clip: ClipTextEncoder,
    vae: Autoencoder,
    flux: FluxTransformer,
    variant: ModelVariant,
    device: Device,
    dtype: DType,
}

/// Resolve the model files and load the pipeline for `config`.
///
/// Fails with [`FluxGenError::CudaUnavailable`] when CUDA is missing and the
/// CPU was not explicitly requested.
pub async fn load_flux_pipeline(
    config: &GenerationConfig,
    runtime: &RuntimeConfig,
    device: &Device,
) -> Result<FluxPipeline> {
    if !runtime.has_cuda && !config.force_cpu {
        return Err(FluxGenError::CudaUnavailable.into());
    }

    let files = ModelDownloader::new(&config.model_id, runtime.hf_token.clone())?
        .download_all()
        .await?;
    let dtype = select_dtype(config.dtype, device);

    FluxPipeline::load(&files, config, dtype, device)
}

impl FluxPipeline {
    /// Load every component from resolved files.
    ///
    /// With `cpu_offload` the text encoders stay on the CPU in F32 and only
    /// their outputs are moved to `device`.
    pub fn load(
        files: &ModelFiles,
        config: &GenerationConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        info!(model_id = %config.model_id, "Initializing FLUX pipeline");

        let (encoder_device, encoder_dtype) = if config.cpu_offload && !device.is_cpu() {
            info!("CPU offload enabled: text encoders stay on the CPU");
            (Device::Cpu, DType::F32)
        } else {
            (device.clone(), dtype)
        };

        let t5 = T5TextEncoder::load(
            &files.t5_config,
            &files.t5_weights,
            &files.t5_tokenizer,
            encoder_dtype,
            &encoder_device,
        )?;
        let clip = ClipTextEncoder::load(
            &files.clip_weights,
            &files.clip_tokenizer_dir,
            encoder_dtype,
            &encoder_device,
        )?;
        let vae = Autoencoder::load(&files.autoencoder, files.variant, dtype, device)?;

        let adapters = load_adapters(config)?;
        let flux = FluxTransformer::load(&files.transformer, files.variant, &adapters, dtype, device)?;

        if !adapters.is_empty() {
            info!("LoRA(s) successfully fused:");
            for (adapter, scale) in &adapters {
                info!("  path: {}  scale: {}", adapter.path.display(), scale);
            }
        }

        info!("✓ Pipeline initialized");

        Ok(Self {
            t5,
            clip,
            vae,
            flux,
            variant: files.variant,
            device: device.clone(),
            dtype,
        })
    }

    /// Generate one image
    pub fn generate(&mut self, request: &GenerationRequest<'_>) -> Result<RgbImage> {
        info!(
            prompt_preview = %request.prompt.chars().take(50).collect::<String>(),
            steps = request.steps,
            size = format!("{}x{}", request.width, request.height),
            guidance = request.guidance,
            seed = ?request.seed,
            "Starting generation"
        );

        if let Some(seed) = request.seed {
            if let Err(e) = self.device.set_seed(seed) {
                debug!(error = %e, "Could not set device seed");
            }
        }

        info!("Step 1/4: Encoding prompt");
        let (t5_emb, clip_emb) = self.encode_prompt(request.prompt)?;
        debug!(t5 = ?t5_emb.dims(), clip = ?clip_emb.dims(), "Prompt embeddings");

        info!("Step 2/4: Preparing latents");
        let noise = flux::sampling::get_noise(1, request.height, request.width, &self.device)?
            .to_dtype(self.dtype)?;
        let (latents, start) = match request.reference {
            Some((image, scale)) => {
                let start = reference_start(scale);
                info!(scale, start, "Conditioning on reference image");
                let pixels = io::image_to_tensor(image, &self.device, self.dtype)?;
                let reference = self.vae.encode(&pixels)?;
                (blend_latents(&noise, &reference, start)?, start)
            }
            None => (noise, 1.0),
        };

        let state = flux::sampling::State::new(&t5_emb, &clip_emb, &latents)?;
        let schedule = match self.variant {
            ModelVariant::Schnell => flux::sampling::get_schedule(request.steps, None),
            ModelVariant::Dev => flux::sampling::get_schedule(
                request.steps,
                Some((state.img.dim(1)?, DEV_BASE_SHIFT, DEV_MAX_SHIFT)),
            ),
        };
        let schedule = truncate_schedule(&schedule, start);

        info!("Step 3/4: Denoising ({} steps)", schedule.len().saturating_sub(1));
        let latents = flux::sampling::denoise(
            self.flux.model(),
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &schedule,
            request.guidance,
        )?;
        let latents = flux::sampling::unpack(&latents, request.height, request.width)?;

        info!("Step 4/4: Decoding latents");
        let decoded = self.vae.decode(&latents)?;
        let image = io::tensor_to_image(&decoded)?;

        info!("✓ Generation complete");
        Ok(image)
    }

    /// T5 and CLIP embeddings on the pipeline device
    fn encode_prompt(&mut self, prompt: &str) -> Result<(Tensor, Tensor)> {
        let t5_emb = self
            .t5
            .encode(prompt)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;
        let clip_emb = self
            .clip
            .encode(prompt)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;
        Ok((t5_emb, clip_emb))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

/// Load every configured adapter on the CPU, paired with its scale
fn load_adapters(config: &GenerationConfig) -> Result<Vec<(LoraAdapter, f32)>> {
    if !config.has_loras() {
        return Ok(Vec::new());
    }

    let peft = config
        .lora_config_path
        .as_deref()
        .map(PeftConfig::load)
        .transpose()?;

    config
        .loras
        .iter()
        .map(|spec| {
            LoraAdapter::load(&spec.path, peft.as_ref(), &Device::Cpu)
                .map(|adapter| (adapter, spec.scale))
                .map_err(|e| {
                    anyhow::Error::from(FluxGenError::LoraApplication {
                        path: spec.path.clone(),
                        reason: format!("{e:#}"),
                    })
                })
        })
        .collect()
}

/// Schedule time the sampler starts from for a reference strength
fn reference_start(scale: f32) -> f64 {
    (1.0 - scale as f64).clamp(0.0, 1.0)
}

/// start * noise + (1 - start) * reference
fn blend_latents(noise: &Tensor, reference: &Tensor, start: f64) -> Result<Tensor> {
    let reference = reference.to_dtype(noise.dtype())?;
    Ok(((noise * start)? + (reference * (1.0 - start))?)?)
}

/// Keep the schedule points below `start`, beginning at `start`
fn truncate_schedule(timesteps: &[f64], start: f64) -> Vec<f64> {
    if start >= 1.0 {
        return timesteps.to_vec();
    }
    let mut schedule = vec![start];
    schedule.extend(timesteps.iter().copied().filter(|t| *t < start));
    schedule
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_transformers::models::flux::WithForward;

    #[tokio::test]
    async fn test_cuda_required_unless_cpu_forced() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = RuntimeConfig {
            hf_token: None,
            has_cuda: false,
        };
        let mut config = GenerationConfig {
            model_id: tmp.path().to_string_lossy().into_owned(),
            ..Default::default()
        };

        let err = load_flux_pipeline(&config, &runtime, &Device::Cpu)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<FluxGenError>(),
            Some(FluxGenError::CudaUnavailable)
        ));
        assert!(err.to_string().contains("CUDA is required to run FLUX models"));

        config.force_cpu = true;
        let err = load_flux_pipeline(&config, &runtime, &Device::Cpu)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<FluxGenError>(),
            Some(FluxGenError::MissingModelFile(_))
        ));
    }

    #[test]
    fn test_reference_start() {
        assert_eq!(reference_start(0.0), 1.0);
        assert_eq!(reference_start(1.0), 0.0);
        assert!((reference_start(0.6) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_truncate_schedule() {
        let schedule = vec![1.0, 0.75, 0.5, 0.25, 0.0];
        assert_eq!(truncate_schedule(&schedule, 1.0), schedule);
        assert_eq!(truncate_schedule(&schedule, 0.6), vec![0.6, 0.5, 0.25, 0.0]);
        assert_eq!(truncate_schedule(&schedule, 0.5), vec![0.5, 0.25, 0.0]);
        assert_eq!(truncate_schedule(&schedule, 0.0), vec![0.0]);
    }

    #[test]
    fn test_blend_latents() {
        let dev = Device::Cpu;
        let noise = Tensor::ones((1, 2), DType::F32, &dev).unwrap();
        let reference = Tensor::new(&[[3f32, -1.]], &dev).unwrap();

        let blended: Vec<Vec<f32>> = blend_latents(&noise, &reference, 0.25)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(blended, vec![vec![2.5, -0.5]]);
    }

    /// Constant velocity: x_0 = x_1 - v over the full schedule
    struct ConstantVelocity(f32);

    impl WithForward for ConstantVelocity {
        #[allow(clippy::too_many_arguments)]
        fn forward(
            &self,
            img: &Tensor,
            _img_ids: &Tensor,
            _txt: &Tensor,
            _txt_ids: &Tensor,
            _timesteps: &Tensor,
            _y: &Tensor,
            _guidance: Option<&Tensor>,
        ) -> candle_core::Result<Tensor> {
            img.ones_like()? * self.0 as f64
        }
    }

    #[test]
    fn test_truncated_schedule_integrates_from_start() {
        let dev = Device::Cpu;
        let t5 = Tensor::zeros((1, 4, 8), DType::F32, &dev).unwrap();
        let clip = Tensor::zeros((1, 8), DType::F32, &dev).unwrap();
        let img = Tensor::ones((1, 16, 4, 4), DType::F32, &dev).unwrap();
        let state = flux::sampling::State::new(&t5, &clip, &img).unwrap();

        let sample = |timesteps: &[f64]| -> Vec<f32> {
            flux::sampling::denoise(
                &ConstantVelocity(2.0),
                &state.img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &state.vec,
                timesteps,
                3.5,
            )
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
        };

        // full schedule: 1 - 2 * (1 - 0)
        let full = sample(&[1.0, 0.75, 0.5, 0.25, 0.0]);
        assert!(full.iter().all(|v| (v + 1.0).abs() < 1e-6));

        // starting at 0.4 only integrates the last 0.4 of the schedule
        let schedule = truncate_schedule(&[1.0, 0.75, 0.5, 0.25, 0.0], reference_start(0.6));
        let partial = sample(&schedule);
        assert!(partial.iter().all(|v| (v - 0.2).abs() < 1e-5));

        let unchanged = sample(&truncate_schedule(&[1.0, 0.5, 0.0], reference_start(1.0)));
        assert!(unchanged.iter().all(|v| *v == 1.0));
    }
}
