//! Explicit device placement for pipeline stages.
//!
//! Every stage receives a [`DeviceContext`] instead of querying process-wide
//! state. Tests build one on `Device::Cpu`.

use candle_core::Device;
use tracing::{debug, warn};

/// Accelerators at or above this size get a doubled decode frame batch.
pub const LARGE_MEMORY_BYTES: u64 = 48 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DeviceContext {
    /// Device running the transformer and the VAE decoder.
    pub compute: Device,
    /// Where idle modules are parked between node invocations.
    pub offload: Device,
    /// Where decoded frames are handed back to the host.
    pub intermediate: Device,
    /// Device the text encoder runs on.
    pub text_encoder: Device,
    /// Total accelerator memory in bytes, when the backend can report it.
    pub total_memory: Option<u64>,
}

impl DeviceContext {
    /// Everything on the CPU.
    pub fn cpu() -> Self {
        Self {
            compute: Device::Cpu,
            offload: Device::Cpu,
            intermediate: Device::Cpu,
            text_encoder: Device::Cpu,
            total_memory: None,
        }
    }

    /// CUDA device `ordinal` for compute, CPU for offload, falling back to an
    /// all-CPU context when CUDA is unavailable.
    pub fn cuda_if_available(ordinal: usize) -> Self {
        match Device::cuda_if_available(ordinal) {
            Ok(device) if device.is_cuda() => Self {
                compute: device.clone(),
                offload: Device::Cpu,
                intermediate: Device::Cpu,
                text_encoder: device,
                total_memory: None,
            },
            Ok(_) => Self::cpu(),
            Err(e) => {
                warn!("CUDA not available: {}, falling back to CPU", e);
                Self::cpu()
            }
        }
    }

    pub fn with_total_memory(mut self, bytes: u64) -> Self {
        self.total_memory = Some(bytes);
        self
    }

    /// Frame batch size for chunked decoding. Doubled (capped at the latent
    /// frame count) on large CUDA devices.
    pub fn frame_batch_size(&self, requested: usize, latent_frames: usize) -> usize {
        let large = self.compute.is_cuda()
            && self
                .total_memory
                .is_some_and(|bytes| bytes >= LARGE_MEMORY_BYTES);
        if large {
            let doubled = (requested * 2).min(latent_frames.max(1));
            debug!(requested, doubled, "large accelerator, doubling frame batch");
            doubled
        } else {
            requested
        }
    }

    /// Equivalent of emptying the allocator cache between stages. Candle
    /// frees buffers on drop, so this only synchronizes the compute device.
    pub fn soft_empty_cache(&self) {
        if let Err(e) = self.compute.synchronize() {
            warn!("device synchronize failed: {}", e);
        }
    }
}

impl Default for DeviceContext {
    fn default() -> Self {
        Self::cpu()
    }
}
