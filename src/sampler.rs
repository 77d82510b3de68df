//! Mochi sampler: schedule construction, conditioning packaging and the
//! Euler flow-matching denoising loop over a [`MochiTransformer`].

use candle_core::{DType, Device, IndexOp, Result, Tensor};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::conditioning::{Conditioning, EncodeError};
use crate::config::{ConfigError, GenerationConfig, MochiVaeConfig};
use crate::device::DeviceContext;
use crate::loader::{LoaderError, load_model_config};
use crate::scheduler::{MochiSchedule, ScheduleError};
use crate::utils::noise::Pcg32;

/// The diffusion transformer capability.
pub trait MochiTransformer {
    /// Velocity prediction for `latents` `[B, 12, T, H, W]` at noise levels
    /// `sigma` `[B]`.
    fn forward(
        &mut self,
        latents: &Tensor,
        sigma: &Tensor,
        conditioning: &Conditioning,
    ) -> Result<Tensor>;

    fn move_to(&mut self, _device: &Device) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Per-channel statistics mapping transformer latents back to VAE latents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatentStats {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl LatentStats {
    pub fn from_json(path: impl AsRef<Path>) -> std::result::Result<Self, LoaderError> {
        load_model_config(path)
    }

    /// `z * std + mean` per channel of `[B, C, T, H, W]`.
    pub fn denormalize(&self, latents: &Tensor) -> Result<Tensor> {
        let c = latents.dims5()?.1;
        if self.mean.len() != c || self.std.len() != c {
            candle_core::bail!(
                "latent stats have {} / {} channels, latents have {c}",
                self.mean.len(),
                self.std.len()
            );
        }
        let device = latents.device();
        let mean = Tensor::new(self.mean.as_slice(), device)?.reshape((1, c, 1, 1, 1))?;
        let std = Tensor::new(self.std.as_slice(), device)?.reshape((1, c, 1, 1, 1))?;
        let latents = latents.to_dtype(DType::F32)?;
        latents.broadcast_mul(&std)?.broadcast_add(&mean)
    }
}

/// What the sampler node receives.
#[derive(Debug, Clone)]
pub struct SampleRequest<'a> {
    pub positive: &'a Conditioning,
    pub negative: &'a Conditioning,
    pub image_cond: Option<&'a Conditioning>,
    pub image_strength: f64,
    pub config: GenerationConfig,
}

/// Positive conditioning with the image bundle appended, if any.
pub fn combine_conditioning(
    positive: &Conditioning,
    image_cond: Option<&Conditioning>,
    image_strength: f64,
) -> std::result::Result<Conditioning, EncodeError> {
    match image_cond {
        Some(image) => positive.concat(&image.scaled(image_strength)?),
        None => Ok(positive.clone()),
    }
}

#[derive(Debug, Clone, Default)]
pub struct MochiSampler {
    pub vae: MochiVaeConfig,
    pub latent_stats: Option<LatentStats>,
    /// Run conditional and unconditional passes as one batch when the
    /// conditioning shapes allow it.
    pub batch_cfg: bool,
}

impl MochiSampler {
    pub fn new(vae: MochiVaeConfig) -> Self {
        Self {
            vae,
            latent_stats: None,
            batch_cfg: false,
        }
    }

    pub fn with_latent_stats(mut self, stats: LatentStats) -> Self {
        self.latent_stats = Some(stats);
        self
    }

    pub fn with_batch_cfg(mut self, batch_cfg: bool) -> Self {
        self.batch_cfg = batch_cfg;
        self
    }

    /// Run the full denoising loop and return bf16 latents
    /// `[1, 12, (F - 1) / 6 + 1, H / 8, W / 8]`.
    pub fn sample(
        &self,
        model: &mut dyn MochiTransformer,
        request: &SampleRequest<'_>,
        ctx: &DeviceContext,
    ) -> std::result::Result<Tensor, SampleError> {
        let config = &request.config;
        let schedule = MochiSchedule::new(config.steps, config.cfg)?;
        let positive =
            combine_conditioning(request.positive, request.image_cond, request.image_strength)?;
        let shape = config.latent_shape(&self.vae);
        let device = &ctx.compute;

        info!(
            width = config.width,
            height = config.height,
            num_frames = config.num_frames,
            steps = config.steps,
            cfg = config.cfg,
            seed = config.seed,
            latent_shape = ?shape,
            "Mochi sampling start"
        );

        ctx.soft_empty_cache();
        model.move_to(device)?;
        let positive = move_conditioning(&positive, device)?;
        let negative = move_conditioning(request.negative, device)?;
        let batched = self.batch_cfg && positive.embeds.dims() == negative.embeds.dims();
        let batched_cond = if batched {
            Some(Conditioning::new(
                Tensor::cat(&[&positive.embeds, &negative.embeds], 0)?,
                Tensor::cat(&[&positive.attention_mask, &negative.attention_mask], 0)?,
            )?)
        } else {
            None
        };

        let mut z = Pcg32::new(config.seed, 0).randn(shape, device)?;
        let b = shape.0;
        for (i, (sigma, dsigma, cfg)) in schedule.steps().enumerate() {
            let (cond_v, uncond_v) = match &batched_cond {
                Some(cond) => {
                    let z2 = Tensor::cat(&[&z, &z], 0)?;
                    let s2 = Tensor::full(sigma as f32, 2 * b, device)?;
                    let v = model.forward(&z2, &s2, cond)?.to_dtype(DType::F32)?;
                    (v.i(0..b)?, v.i(b..2 * b)?)
                }
                None => {
                    let s = Tensor::full(sigma as f32, b, device)?;
                    let cond_v = model.forward(&z, &s, &positive)?.to_dtype(DType::F32)?;
                    let uncond_v = model.forward(&z, &s, &negative)?.to_dtype(DType::F32)?;
                    (cond_v, uncond_v)
                }
            };
            let guided = (&uncond_v + (cond_v - &uncond_v)?.affine(cfg, 0.0)?)?;
            z = (z + guided.affine(dsigma, 0.0)?)?;
            debug!(step = i + 1, total = schedule.num_steps(), sigma, "denoising step");
        }

        let z = match &self.latent_stats {
            Some(stats) => stats.denormalize(&z)?,
            None => z,
        };
        ctx.soft_empty_cache();
        info!("Mochi sampling done");
        Ok(z.to_dtype(DType::BF16)?)
    }
}

fn move_conditioning(cond: &Conditioning, device: &Device) -> Result<Conditioning> {
    Ok(Conditioning {
        embeds: cond.embeds.to_device(device)?,
        attention_mask: cond.attention_mask.to_device(device)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latent_stats_denormalize() -> Result<()> {
        let stats = LatentStats {
            mean: vec![1.0, -1.0],
            std: vec![2.0, 0.5],
        };
        let z = Tensor::ones((1, 2, 1, 1, 1), DType::F32, &Device::Cpu)?;
        let out = stats.denormalize(&z)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(out, vec![3.0, -0.5]);
        Ok(())
    }
}
