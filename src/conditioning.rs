//! Conditioning bundles and image conditioning.
//!
//! A [`Conditioning`] pairs `embeds` `[B, L, D]` with a `u8` attention mask
//! `[B, L]` (1 = valid position). Text and image bundles are combined by
//! concatenating along the sequence axis.

use candle_core::{D, DType, Device, Result, Tensor};
use tracing::debug;

/// Spatial size images are resized to before packing.
pub const IMAGE_SIZE: usize = 224;

/// Errors specific to conditioning encode
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Prompt is too long, max tokens supported is {max} or less, got {tokens}")]
    PromptTooLong { tokens: usize, max: usize },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

#[derive(Debug, Clone)]
pub struct Conditioning {
    pub embeds: Tensor,
    pub attention_mask: Tensor,
}

impl Conditioning {
    /// Bundle `embeds` `[B, L, D]` with `attention_mask` `[B, L]`.
    pub fn new(embeds: Tensor, attention_mask: Tensor) -> std::result::Result<Self, EncodeError> {
        let (b, l, _d) = embeds.dims3().map_err(|_| {
            EncodeError::ShapeMismatch(format!(
                "embeds must be [B, L, D], got {:?}",
                embeds.dims()
            ))
        })?;
        if attention_mask.dims() != [b, l] {
            return Err(EncodeError::ShapeMismatch(format!(
                "attention_mask must be [{b}, {l}], got {:?}",
                attention_mask.dims()
            )));
        }
        let attention_mask = attention_mask.to_dtype(DType::U8)?;
        Ok(Self {
            embeds,
            attention_mask,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.embeds.dims()[0]
    }

    pub fn seq_len(&self) -> usize {
        self.embeds.dims()[1]
    }

    pub fn hidden_size(&self) -> usize {
        self.embeds.dims()[2]
    }

    pub fn device(&self) -> &Device {
        self.embeds.device()
    }

    /// Number of valid positions per batch entry.
    pub fn valid_tokens(&self) -> Result<Vec<u32>> {
        self.attention_mask
            .to_dtype(DType::U32)?
            .sum(D::Minus1)?
            .to_vec1::<u32>()
    }

    /// Multiply the embeddings by `strength`; the mask is unchanged.
    pub fn scaled(&self, strength: f64) -> Result<Self> {
        Ok(Self {
            embeds: self.embeds.affine(strength, 0.0)?,
            attention_mask: self.attention_mask.clone(),
        })
    }

    /// Concatenate `other` after `self` along the sequence axis.
    pub fn concat(&self, other: &Conditioning) -> std::result::Result<Self, EncodeError> {
        if self.batch_size() != other.batch_size() || self.hidden_size() != other.hidden_size() {
            return Err(EncodeError::ShapeMismatch(format!(
                "cannot concatenate conditioning {:?} with {:?}",
                self.embeds.dims(),
                other.embeds.dims()
            )));
        }
        let other_embeds = other
            .embeds
            .to_device(self.device())?
            .to_dtype(self.embeds.dtype())?;
        let other_mask = other.attention_mask.to_device(self.device())?;
        Ok(Self {
            embeds: Tensor::cat(&[&self.embeds, &other_embeds], 1)?,
            attention_mask: Tensor::cat(&[&self.attention_mask, &other_mask], 1)?,
        })
    }
}

// =============================================================================
// Image conditioning
// =============================================================================

/// Row-stochastic `[out, in]` matrix for 1-D bilinear resampling with
/// half-pixel centres (no corner alignment).
fn bilinear_weights(in_size: usize, out_size: usize, device: &Device) -> Result<Tensor> {
    let mut w = vec![0f32; out_size * in_size];
    let scale = in_size as f64 / out_size as f64;
    for o in 0..out_size {
        let src = ((o as f64 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(in_size - 1);
        let i1 = (i0 + 1).min(in_size - 1);
        let frac = (src - i0 as f64) as f32;
        w[o * in_size + i0] += 1.0 - frac;
        w[o * in_size + i1] += frac;
    }
    Tensor::from_vec(w, (out_size, in_size), device)
}

/// Bilinear resize of `[B, C, H, W]` to `[B, C, out_h, out_w]`.
pub fn resize_bilinear(image: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (b, c, h, w) = image.dims4()?;
    let device = image.device();
    let wy_t = bilinear_weights(h, out_h, device)?.t()?.contiguous()?;
    let wx_t = bilinear_weights(w, out_w, device)?.t()?.contiguous()?;

    // Resample width: [B*C*H, W] x [W, out_w]
    let x = image
        .to_dtype(DType::F32)?
        .contiguous()?
        .reshape((b * c * h, w))?
        .matmul(&wx_t)?;
    // Resample height on the transposed planes: [B*C*out_w, H] x [H, out_h]
    let x = x
        .reshape((b * c, h, out_w))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((b * c * out_w, h))?
        .matmul(&wy_t)?;
    x.reshape((b * c, out_w, out_h))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((b, c, out_h, out_w))
}

/// `[3, H, W]` or `[B, 3, H, W]` in [0, 1] → `[B, 3, 224, 224]` in [-1, 1].
///
/// Channel-last `[H, W, 3]` / `[B, H, W, 3]` (the decode nodes' frame
/// layout) is accepted too.
pub fn preprocess_image(image: &Tensor) -> std::result::Result<Tensor, EncodeError> {
    let image = match image.rank() {
        3 => image.unsqueeze(0)?,
        4 => image.clone(),
        _ => {
            return Err(EncodeError::ShapeMismatch(format!(
                "image must be [3, H, W] or [B, 3, H, W] (or channel-last), got {:?}",
                image.dims()
            )));
        }
    };
    let image = match image.dims4()? {
        (_, c, _, 3) if c != 3 => image.permute((0, 3, 1, 2))?.contiguous()?,
        _ => image,
    };
    let (_b, c, h, w) = image.dims4()?;
    if c != 3 || h == 0 || w == 0 {
        return Err(EncodeError::ShapeMismatch(format!(
            "image must have 3 channels and non-empty extent, got {:?}",
            image.dims()
        )));
    }
    let resized = resize_bilinear(&image, IMAGE_SIZE, IMAGE_SIZE)?;
    Ok(resized.affine(2.0, -1.0)?)
}

/// Image conditioning: the preprocessed pixels scaled by `strength`, packed
/// into rows of `hidden_size` values (zero padded) with every row valid.
pub fn encode_image(
    image: &Tensor,
    strength: f64,
    hidden_size: usize,
) -> std::result::Result<Conditioning, EncodeError> {
    if hidden_size == 0 {
        return Err(EncodeError::ShapeMismatch(
            "hidden_size must be positive".to_string(),
        ));
    }
    let pixels = preprocess_image(image)?.affine(strength, 0.0)?;
    let b = pixels.dims()[0];
    let flat = pixels.flatten_from(1)?;
    let n = flat.dims()[1];
    let rows = n.div_ceil(hidden_size);
    let flat = flat.pad_with_zeros(1, 0, rows * hidden_size - n)?;
    let embeds = flat.reshape((b, rows, hidden_size))?;
    let attention_mask = Tensor::ones((b, rows), DType::U8, pixels.device())?;
    debug!(batch = b, rows, hidden_size, "encoded image conditioning");
    Conditioning::new(embeds, attention_mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bilinear_weights_rows_sum_to_one() -> Result<()> {
        let w = bilinear_weights(7, 3, &Device::Cpu)?;
        let sums = w.sum(1)?.to_vec1::<f32>()?;
        for s in sums {
            assert!((s - 1.0).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn resize_same_size_is_identity() -> Result<()> {
        let img = Tensor::rand(0f32, 1.0, (1, 3, 5, 6), &Device::Cpu)?;
        let out = resize_bilinear(&img, 5, 6)?;
        let diff = (out - &img)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn concat_requires_matching_hidden_size() {
        let dev = Device::Cpu;
        let a = Conditioning::new(
            Tensor::zeros((1, 4, 8), DType::F32, &dev).unwrap(),
            Tensor::ones((1, 4), DType::U8, &dev).unwrap(),
        )
        .unwrap();
        let b = Conditioning::new(
            Tensor::zeros((1, 2, 6), DType::F32, &dev).unwrap(),
            Tensor::ones((1, 2), DType::U8, &dev).unwrap(),
        )
        .unwrap();
        assert!(matches!(a.concat(&b), Err(EncodeError::ShapeMismatch(_))));
    }
}
