//! Device selection, dtype selection and status reporting

use anyhow::Result;
use candle_core::{DType, Device};
use std::fmt::Display;
use tracing::{info, warn};

use crate::config::RuntimeConfig;

/// Precision the pipeline weights are loaded in.
///
/// `Auto` picks BF16 on CUDA and F32 on CPU.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ModelDType {
    #[default]
    Auto,
    Bf16,
    F16,
    F32,
}

impl Display for ModelDType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Bf16 => write!(f, "bf16"),
            Self::F16 => write!(f, "f16"),
            Self::F32 => write!(f, "f32"),
        }
    }
}

/// Resolve the requested precision for a device
pub fn select_dtype(requested: ModelDType, device: &Device) -> DType {
    let dtype = match requested {
        ModelDType::Auto if device.is_cuda() => DType::BF16,
        ModelDType::Auto => DType::F32,
        ModelDType::Bf16 => DType::BF16,
        ModelDType::F16 => DType::F16,
        ModelDType::F32 => DType::F32,
    };
    info!(requested = %requested, selected = ?dtype, "dtype selected");
    dtype
}

/// GPU as reported by `nvidia-smi`
#[derive(Debug, Clone, PartialEq)]
pub struct GpuInfo {
    pub index: String,
    pub name: String,
    pub memory_total_mb: String,
    pub memory_free_mb: String,
}

/// Parse `nvidia-smi --query-gpu=index,name,memory.total,memory.free --format=csv,noheader,nounits`
pub fn parse_gpu_listing(listing: &str) -> Vec<GpuInfo> {
    listing
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 4 {
                return None;
            }
            Some(GpuInfo {
                index: parts[0].to_string(),
                name: parts[1].to_string(),
                memory_total_mb: parts[2].to_string(),
                memory_free_mb: parts[3].to_string(),
            })
        })
        .collect()
}

fn query_gpus() -> Vec<GpuInfo> {
    let output = std::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total,memory.free",
            "--format=csv,noheader,nounits",
        ])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            parse_gpu_listing(&String::from_utf8_lossy(&output.stdout))
        }
        _ => Vec::new(),
    }
}

/// Memory listing of the GPU behind `device`; `None` off CUDA or without `nvidia-smi`
pub fn gpu_memory_snapshot(device: &Device) -> Option<GpuInfo> {
    if !device.is_cuda() {
        return None;
    }
    query_gpus().into_iter().next()
}

/// Pick the device to run on and log what was found.
///
/// Uses CUDA device 0 when CUDA is available and the CPU was not forced.
pub fn detect_and_report_device(runtime: &RuntimeConfig, force_cpu: bool) -> Result<Device> {
    if runtime.has_cuda && !force_cpu {
        let device = Device::new_cuda(0)?;
        match query_gpus().into_iter().next() {
            Some(gpu) => info!(
                gpu = %gpu.name,
                total_mb = %gpu.memory_total_mb,
                free_mb = %gpu.memory_free_mb,
                "Using CUDA GPU {}",
                gpu.index
            ),
            None => info!("Using CUDA GPU 0"),
        }
        return Ok(device);
    }

    if runtime.has_cuda {
        info!("CPU requested, CUDA GPU left unused");
    } else {
        warn!("CUDA GPU not available, falling back to CPU");
    }
    warn!("CPU inference will be very slow for FLUX models");
    Ok(Device::Cpu)
}

/// Warn when no Hugging Face token is configured.
///
/// Returns whether a warning was emitted.
pub fn report_hf_token_status(runtime: &RuntimeConfig) -> bool {
    if runtime.hf_token.is_some() {
        return false;
    }
    warn!("HF_TOKEN environment variable not set.");
    warn!("If the model is private or gated, set HF_TOKEN before running:");
    warn!("  export HF_TOKEN=your_huggingface_token_here");
    true
}
