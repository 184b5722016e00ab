//! Best-effort release of a loaded pipeline
//!
//! Dropping the pipeline frees its tensors, but the CUDA caching allocator
//! keeps device memory reserved until the process exits.

use anyhow::Result;
use tracing::{debug, info};

use crate::device::{gpu_memory_snapshot, GpuInfo};
use crate::pipeline::FluxPipeline;

/// Drop `pipeline` and wait for outstanding device work
pub fn release(pipeline: FluxPipeline) -> Result<()> {
    let device = pipeline.device().clone();
    debug!(device = ?device, "Releasing FLUX pipeline");

    let before = gpu_memory_snapshot(&device);
    if let Some(gpu) = &before {
        info!(free_mb = %gpu.memory_free_mb, total_mb = %gpu.memory_total_mb, "GPU memory before release");
    }

    drop(pipeline);
    device.synchronize()?;

    if device.is_cpu() {
        info!("Pipeline released");
        return Ok(());
    }

    let after = gpu_memory_snapshot(&device);
    match (&before, &after) {
        (Some(before), Some(after)) => info!(
            free_mb = %after.memory_free_mb,
            freed_mb = ?freed_mb(before, after),
            "GPU memory after release"
        ),
        (_, Some(after)) => info!(free_mb = %after.memory_free_mb, "GPU memory after release"),
        _ => {}
    }
    info!("Pipeline released; device memory is fully returned when the process exits");
    Ok(())
}

/// Growth in free device memory between two listings, in MB
fn freed_mb(before: &GpuInfo, after: &GpuInfo) -> Option<i64> {
    let before: i64 = before.memory_free_mb.parse().ok()?;
    let after: i64 = after.memory_free_mb.parse().ok()?;
    Some(after - before)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(free: &str) -> GpuInfo {
        GpuInfo {
            index: "0".to_string(),
            name: "NVIDIA RTX A6000".to_string(),
            memory_total_mb: "49140".to_string(),
            memory_free_mb: free.to_string(),
        }
    }

    #[test]
    fn test_freed_mb() {
        assert_eq!(freed_mb(&listing("1200"), &listing("35000")), Some(33800));
        assert_eq!(freed_mb(&listing("1200"), &listing("1000")), Some(-200));
        assert_eq!(freed_mb(&listing("[N/A]"), &listing("1000")), None);
    }
}
