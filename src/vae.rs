//! Tiled VAE decode for Mochi latents.
//!
//! Decoding a full `[B, 12, T, H/8, W/8]` latent in one call needs the
//! activation memory of the whole video. This module bounds it along two
//! independent axes:
//!
//! - **temporal chunking**: the latent time axis is cut into chunks of
//!   `per_batch` frames decoded in order; the last frame of each chunk is
//!   replaced by its mean with the first frame of the next chunk;
//! - **spatial tiling**: each chunk is split into a grid of tiles which
//!   overlap by `overlap` latent pixels on shared edges. Tiles are decoded
//!   independently and recombined with a linear cross-fade across every
//!   overlap band.
//!
//! Both blends are seam-smoothing approximations. The decoder is only
//! approximately spatially local, so tiled output is close to, not equal to,
//! a full decode.

use candle_core::{DType, Device, IndexOp, Result, Tensor};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, info, warn};

use crate::config::LATENT_CHANNELS;
use crate::device::DeviceContext;

/// The VAE decoder capability: `[B, 12, T, h, w]` latents to
/// `[B, 3, T', h * s, w * s]` frames in [-1, 1].
pub trait VideoDecoder {
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;

    /// Dtype latents are cast to before decoding.
    fn dtype(&self) -> DType {
        DType::BF16
    }

    fn move_to(&mut self, _device: &Device) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid tiling: {0}")]
    InvalidTiling(String),

    #[error("Decoder failed on {stage}")]
    DecodeFailure {
        stage: String,
        #[source]
        source: candle_core::Error,
    },

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

// =============================================================================
// Tile planning
// =============================================================================

/// Spatial tiling parameters, in latent pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpatialTiling {
    pub num_tiles_w: usize,
    pub num_tiles_h: usize,
    /// Width of the shared band between horizontally adjacent tiles.
    pub overlap_w: usize,
    /// Height of the shared band between vertically adjacent tiles.
    pub overlap_h: usize,
    /// Tile edges fall on multiples of this and no tile is smaller.
    pub min_block_size: usize,
}

impl SpatialTiling {
    pub fn new(num_tiles_w: usize, num_tiles_h: usize, overlap: usize, min_block_size: usize) -> Self {
        Self {
            num_tiles_w,
            num_tiles_h,
            overlap_w: overlap,
            overlap_h: overlap,
            min_block_size,
        }
    }
}

impl Default for SpatialTiling {
    fn default() -> Self {
        Self::new(4, 4, 16, 1)
    }
}

/// A rectangle in latent pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileRect {
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileDescriptor {
    pub row: usize,
    pub col: usize,
    /// Region decoded for this tile, overlap included.
    pub bounds: TileRect,
    /// Region this tile owns outright.
    pub core: TileRect,
}

/// Split of one spatial axis into core spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisSplit {
    pub len: usize,
    pub cores: Vec<Range<usize>>,
    /// Each core is extended by this much on every interior edge.
    pub half_overlap: usize,
}

impl AxisSplit {
    pub fn new(
        len: usize,
        num_tiles: usize,
        overlap: usize,
        min_block_size: usize,
    ) -> std::result::Result<Self, DecodeError> {
        if num_tiles == 0 || min_block_size == 0 {
            return Err(DecodeError::InvalidTiling(format!(
                "num_tiles ({num_tiles}) and min_block_size ({min_block_size}) must be positive"
            )));
        }
        if len == 0 {
            return Err(DecodeError::ShapeMismatch(
                "cannot tile an empty axis".to_string(),
            ));
        }

        let n = num_tiles.min((len / min_block_size).max(1));
        if n < num_tiles {
            debug!(len, num_tiles, min_block_size, n, "reduced tile count");
        }
        let mut edges: Vec<usize> = (0..n)
            .map(|k| (k * len / n) / min_block_size * min_block_size)
            .collect();
        edges.push(len);
        let cores: Vec<Range<usize>> = edges.windows(2).map(|e| e[0]..e[1]).collect();

        let min_core = cores.iter().map(|r| r.len()).min().unwrap_or(len);
        let half_overlap = if n > 1 { (overlap / 2).min(min_core / 2) } else { 0 };
        if n > 1 && half_overlap < overlap / 2 {
            warn!(
                overlap,
                clamped = 2 * half_overlap,
                "overlap larger than the smallest tile, clamping"
            );
        }

        Ok(Self {
            len,
            cores,
            half_overlap,
        })
    }

    pub fn num_tiles(&self) -> usize {
        self.cores.len()
    }

    /// Core span `k` extended by the half overlap on interior edges.
    pub fn bounds(&self, k: usize) -> Range<usize> {
        let core = &self.cores[k];
        let start = if k > 0 {
            core.start - self.half_overlap
        } else {
            0
        };
        let end = if k + 1 < self.cores.len() {
            core.end + self.half_overlap
        } else {
            self.len
        };
        start..end
    }

    /// Blend weights over the decoded extent of tile `k`, with `scale`
    /// output pixels per latent pixel. 1 inside the core, a linear ramp
    /// `x / band` up across the leading band and its complement down across
    /// the trailing band, so neighbouring weights sum to 1.
    pub fn weights(&self, k: usize, scale: usize) -> Vec<f32> {
        let len = self.bounds(k).len() * scale;
        let band = 2 * self.half_overlap * scale;
        let mut w = vec![1f32; len];
        if band == 0 {
            return w;
        }
        if k > 0 {
            for (x, v) in w.iter_mut().take(band).enumerate() {
                *v *= x as f32 / band as f32;
            }
        }
        if k + 1 < self.cores.len() {
            for (x, v) in w[len - band..].iter_mut().enumerate() {
                *v *= 1.0 - x as f32 / band as f32;
            }
        }
        w
    }
}

/// Tile grid over a latent frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlan {
    pub rows: AxisSplit,
    pub cols: AxisSplit,
}

impl TilePlan {
    pub fn new(height: usize, width: usize, tiling: &SpatialTiling) -> std::result::Result<Self, DecodeError> {
        Ok(Self {
            rows: AxisSplit::new(height, tiling.num_tiles_h, tiling.overlap_h, tiling.min_block_size)?,
            cols: AxisSplit::new(width, tiling.num_tiles_w, tiling.overlap_w, tiling.min_block_size)?,
        })
    }

    pub fn num_tiles(&self) -> usize {
        self.rows.num_tiles() * self.cols.num_tiles()
    }

    /// Tiles in row-major order.
    pub fn tiles(&self) -> Vec<TileDescriptor> {
        let mut tiles = Vec::with_capacity(self.num_tiles());
        for row in 0..self.rows.num_tiles() {
            for col in 0..self.cols.num_tiles() {
                tiles.push(TileDescriptor {
                    row,
                    col,
                    bounds: TileRect {
                        rows: self.rows.bounds(row),
                        cols: self.cols.bounds(col),
                    },
                    core: TileRect {
                        rows: self.rows.cores[row].clone(),
                        cols: self.cols.cores[col].clone(),
                    },
                });
            }
        }
        tiles
    }
}

/// Convenience wrapper over [`TilePlan::tiles`].
pub fn plan_tiles(
    height: usize,
    width: usize,
    tiling: &SpatialTiling,
) -> std::result::Result<Vec<TileDescriptor>, DecodeError> {
    Ok(TilePlan::new(height, width, tiling)?.tiles())
}

// =============================================================================
// Decoding
// =============================================================================

/// Temporal and spatial tiling of a decode. Both off means one decoder call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TiledDecodeOptions {
    pub tiling: Option<SpatialTiling>,
    pub per_batch: Option<usize>,
}

/// Latent frame ranges for chunks of `per_batch` frames.
pub fn chunk_ranges(num_frames: usize, per_batch: usize) -> Vec<Range<usize>> {
    (0..num_frames)
        .step_by(per_batch.max(1))
        .map(|start| start..(start + per_batch).min(num_frames))
        .collect()
}

/// Check a latent is `[B, 12, T, H, W]` with every extent positive.
pub fn validate_latents(latents: &Tensor) -> std::result::Result<(usize, usize, usize, usize), DecodeError> {
    let (b, c, t, h, w) = latents.dims5().map_err(|_| {
        DecodeError::ShapeMismatch(format!(
            "latents must be [B, C, T, H, W], got {:?}",
            latents.dims()
        ))
    })?;
    if c != LATENT_CHANNELS {
        return Err(DecodeError::ShapeMismatch(format!(
            "latents must have {LATENT_CHANNELS} channels, got {c}"
        )));
    }
    if b == 0 || t == 0 || h == 0 || w == 0 {
        return Err(DecodeError::ShapeMismatch(format!(
            "latent extents must be positive, got {:?}",
            latents.dims()
        )));
    }
    Ok((b, t, h, w))
}

fn run_decoder(
    decoder: &dyn VideoDecoder,
    latents: &Tensor,
    stage: impl FnOnce() -> String,
) -> std::result::Result<Tensor, DecodeError> {
    decoder
        .decode(latents)
        .map_err(|source| DecodeError::DecodeFailure {
            stage: stage(),
            source,
        })
}

/// Output pixels per latent pixel, checked to be a positive integer.
fn scale_of(input: usize, output: usize, axis: &str) -> std::result::Result<usize, DecodeError> {
    if output == 0 || output % input != 0 {
        return Err(DecodeError::ShapeMismatch(format!(
            "decoder output {axis} {output} is not a multiple of input {axis} {input}"
        )));
    }
    Ok(output / input)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TiledDecoder {
    pub options: TiledDecodeOptions,
}

impl TiledDecoder {
    pub fn new(options: TiledDecodeOptions) -> Self {
        Self { options }
    }

    /// Decode `latents` to raw decoder frames `[B, 3, T', H, W]`.
    pub fn decode(
        &self,
        decoder: &dyn VideoDecoder,
        latents: &Tensor,
    ) -> std::result::Result<Tensor, DecodeError> {
        let mut chunks = self.decode_chunks(decoder, latents)?;
        if chunks.len() == 1 {
            return Ok(chunks.remove(0));
        }
        Ok(Tensor::cat(&chunks, 2)?)
    }

    /// Decode chunk by chunk, blending each chunk boundary into the earlier
    /// chunk's last frame. Without `per_batch` the whole latent is one chunk.
    pub fn decode_chunks(
        &self,
        decoder: &dyn VideoDecoder,
        latents: &Tensor,
    ) -> std::result::Result<Vec<Tensor>, DecodeError> {
        let (_b, t, _h, _w) = validate_latents(latents)?;
        let per_batch = match self.options.per_batch {
            Some(0) => {
                return Err(DecodeError::InvalidTiling(
                    "per_batch must be positive".to_string(),
                ));
            }
            Some(n) => n,
            None => t,
        };

        let ranges = chunk_ranges(t, per_batch);
        let mut decoded: Vec<Tensor> = Vec::with_capacity(ranges.len());
        for (index, range) in ranges.iter().enumerate() {
            let chunk = latents.i((.., .., range.clone(), .., ..))?;
            let frames = self.decode_chunk(decoder, &chunk, index)?;
            debug!(chunk = index, frames = ?frames.dims(), "decoded chunk");

            if let Some(previous) = decoded.last_mut() {
                *previous = blend_boundary(previous, &frames)?;
            }
            decoded.push(frames);
        }
        Ok(decoded)
    }

    /// Decode one temporal chunk, tiled when spatial tiling is set.
    pub fn decode_chunk(
        &self,
        decoder: &dyn VideoDecoder,
        chunk: &Tensor,
        index: usize,
    ) -> std::result::Result<Tensor, DecodeError> {
        let (_b, _c, _t, h, w) = chunk.dims5()?;
        let plan = match &self.options.tiling {
            Some(tiling) => TilePlan::new(h, w, tiling)?,
            None => return run_decoder(decoder, chunk, || format!("chunk {index}")),
        };
        if plan.num_tiles() == 1 {
            return run_decoder(decoder, chunk, || format!("chunk {index}"));
        }
        decode_tiled(decoder, chunk, &plan, index)
    }
}

/// Decode every tile of `plan` and recombine with cross-faded overlaps.
fn decode_tiled(
    decoder: &dyn VideoDecoder,
    chunk: &Tensor,
    plan: &TilePlan,
    chunk_index: usize,
) -> std::result::Result<Tensor, DecodeError> {
    let (_b, _c, _t, h, w) = chunk.dims5()?;
    let mut scale: Option<(usize, usize)> = None;
    let mut out_frames: Option<usize> = None;
    let mut output: Option<Tensor> = None;

    for row in 0..plan.rows.num_tiles() {
        let rows = plan.rows.bounds(row);
        let mut row_acc: Option<Tensor> = None;

        for col in 0..plan.cols.num_tiles() {
            let cols = plan.cols.bounds(col);
            let tile = chunk.i((.., .., .., rows.clone(), cols.clone()))?;
            let decoded = run_decoder(decoder, &tile, || {
                format!("chunk {chunk_index} tile ({row}, {col})")
            })?;
            let (_db, _dc, dt, dh, dw) = decoded.dims5()?;

            let (sh, sw) = match scale {
                Some(s) => s,
                None => {
                    let s = (
                        scale_of(rows.len(), dh, "height")?,
                        scale_of(cols.len(), dw, "width")?,
                    );
                    scale = Some(s);
                    s
                }
            };
            if dh != rows.len() * sh || dw != cols.len() * sw {
                return Err(DecodeError::ShapeMismatch(format!(
                    "tile ({row}, {col}) decoded to {dh}x{dw}, expected {}x{}",
                    rows.len() * sh,
                    cols.len() * sw
                )));
            }
            if *out_frames.get_or_insert(dt) != dt {
                return Err(DecodeError::ShapeMismatch(format!(
                    "tile ({row}, {col}) decoded to {dt} frames, other tiles to {out_frames:?}"
                )));
            }

            let decoded = decoded.to_dtype(DType::F32)?;
            let wcol = plan.cols.weights(col, sw);
            let wcol = Tensor::from_vec(wcol, (1, 1, 1, 1, dw), decoded.device())?;
            let weighted = decoded
                .broadcast_mul(&wcol)?
                .pad_with_zeros(4, cols.start * sw, (w - cols.end) * sw)?;
            row_acc = Some(match row_acc {
                Some(acc) => (acc + weighted)?,
                None => weighted,
            });
        }

        let Some(row_acc) = row_acc else { continue };
        let sh = scale.map(|s| s.0).unwrap_or(1);
        let wrow = plan.rows.weights(row, sh);
        let wrow = Tensor::from_vec(wrow, (1, 1, 1, rows.len() * sh, 1), row_acc.device())?;
        let weighted = row_acc
            .broadcast_mul(&wrow)?
            .pad_with_zeros(3, rows.start * sh, (h - rows.end) * sh)?;
        output = Some(match output {
            Some(acc) => (acc + weighted)?,
            None => weighted,
        });
    }

    output.ok_or_else(|| DecodeError::InvalidTiling("tile plan produced no tiles".to_string()))
}

/// Replace the last frame of `previous` with its mean with the first frame
/// of `next`. `next` keeps its own first frame.
pub fn blend_boundary(previous: &Tensor, next: &Tensor) -> Result<Tensor> {
    let tp = previous.dim(2)?;
    let last = previous.narrow(2, tp - 1, 1)?;
    let first = next.narrow(2, 0, 1)?.to_dtype(previous.dtype())?;
    let blended = (last + first)?.affine(0.5, 0.0)?;
    if tp == 1 {
        return Ok(blended);
    }
    Tensor::cat(&[&previous.narrow(2, 0, tp - 1)?, &blended], 2)
}

/// f32, `(x + 1) / 2`, clamped to [0, 1].
pub fn postprocess(frames: &Tensor) -> Result<Tensor> {
    frames
        .to_dtype(DType::F32)?
        .affine(0.5, 0.5)?
        .clamp(0f32, 1f32)
}

/// `[B, C, T, H, W]` → `[(T * B), H, W, C]` so frames iterate time-major.
pub fn to_frame_layout(frames: &Tensor) -> Result<Tensor> {
    let (b, c, t, h, w) = frames.dims5()?;
    frames
        .permute((2, 0, 3, 4, 1))?
        .contiguous()?
        .reshape((t * b, h, w, c))
}

/// Decode latents into host frames `[(T * B), H, W, 3]` in [0, 1]: moves the
/// decoder to the compute device, decodes, moves it back to the offload
/// device, post-processes and hands frames to the intermediate device.
pub fn decode_to_frames(
    decoder: &mut dyn VideoDecoder,
    latents: &Tensor,
    options: &TiledDecodeOptions,
    ctx: &DeviceContext,
) -> std::result::Result<Tensor, DecodeError> {
    validate_latents(latents)?;
    let latents = latents.to_dtype(decoder.dtype())?.to_device(&ctx.compute)?;

    decoder.move_to(&ctx.compute)?;
    if options.tiling.is_some() {
        info!(options = ?options, "Decoding with tiling...");
    } else {
        info!("Decoding without tiling...");
    }
    let decoded = TiledDecoder::new(*options).decode(decoder, &latents);
    decoder.move_to(&ctx.offload)?;

    let frames = postprocess(&decoded?)?;
    Ok(to_frame_layout(&frames)?.to_device(&ctx.intermediate)?)
}

// =============================================================================
// Decode node settings
// =============================================================================

/// Settings of the size-driven decode node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecodeSettings {
    pub enable_vae_tiling: bool,
    pub auto_tile_size: bool,
    /// Latent frames per chunk.
    pub frame_batch_size: usize,
    /// Minimum tile height in output pixels.
    pub tile_sample_min_height: usize,
    /// Minimum tile width in output pixels.
    pub tile_sample_min_width: usize,
    pub tile_overlap_factor_height: f64,
    pub tile_overlap_factor_width: f64,
}

impl Default for DecodeSettings {
    fn default() -> Self {
        Self {
            enable_vae_tiling: false,
            auto_tile_size: true,
            frame_batch_size: 6,
            tile_sample_min_height: 240,
            tile_sample_min_width: 424,
            tile_overlap_factor_height: 0.1666,
            tile_overlap_factor_width: 0.2,
        }
    }
}

impl DecodeSettings {
    /// Auto sizing: tiles at least a third of the latent extent, 10% overlap.
    pub const AUTO_OVERLAP_FACTOR: f64 = 0.1;

    /// Tiling options for latent `[_, _, t, h, w]` decoded at
    /// `spatial_ratio` output pixels per latent pixel.
    pub fn resolve(
        &self,
        latent_dims: (usize, usize, usize),
        spatial_ratio: usize,
        ctx: &DeviceContext,
    ) -> TiledDecodeOptions {
        if !self.enable_vae_tiling {
            return TiledDecodeOptions::default();
        }
        let (t, h, w) = latent_dims;
        let ratio = spatial_ratio.max(1);
        let (min_h, min_w, factor_h, factor_w) = if self.auto_tile_size {
            (
                (h / 3).max(1),
                (w / 3).max(1),
                Self::AUTO_OVERLAP_FACTOR,
                Self::AUTO_OVERLAP_FACTOR,
            )
        } else {
            (
                (self.tile_sample_min_height / ratio).max(1),
                (self.tile_sample_min_width / ratio).max(1),
                self.tile_overlap_factor_height,
                self.tile_overlap_factor_width,
            )
        };

        let tiling = SpatialTiling {
            num_tiles_h: (h / min_h).max(1),
            num_tiles_w: (w / min_w).max(1),
            overlap_h: (min_h as f64 * factor_h).round() as usize,
            overlap_w: (min_w as f64 * factor_w).round() as usize,
            min_block_size: 1,
        };
        TiledDecodeOptions {
            tiling: Some(tiling),
            per_batch: Some(ctx.frame_batch_size(self.frame_batch_size, t)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cores_cover_axis_without_gaps() {
        for (len, n, mb) in [(60, 4, 1), (106, 4, 2), (13, 8, 1), (7, 64, 2), (33, 3, 4)] {
            let split = AxisSplit::new(len, n, 8, mb).unwrap();
            assert_eq!(split.cores.first().unwrap().start, 0);
            assert_eq!(split.cores.last().unwrap().end, len);
            for pair in split.cores.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
                assert!(!pair[0].is_empty());
            }
            for (k, core) in split.cores.iter().enumerate() {
                let b = split.bounds(k);
                assert!(b.start <= core.start && core.end <= b.end && b.end <= len);
            }
        }
    }

    #[test]
    fn min_block_size_limits_tile_count() {
        let split = AxisSplit::new(10, 8, 0, 4).unwrap();
        assert_eq!(split.num_tiles(), 2);
        assert!(split.cores.iter().all(|c| c.len() >= 4));
        assert!(split.cores[..1].iter().all(|c| c.end % 4 == 0));
    }

    #[test]
    fn overlap_is_clamped_to_smallest_core() {
        let split = AxisSplit::new(8, 4, 16, 1).unwrap();
        assert_eq!(split.half_overlap, 1);
    }

    #[test]
    fn weights_partition_unity_across_band() {
        let split = AxisSplit::new(40, 2, 8, 1).unwrap();
        let scale = 8;
        let left = split.weights(0, scale);
        let right = split.weights(1, scale);
        let band = 2 * split.half_overlap * scale;
        let left_band = &left[left.len() - band..];
        let right_band = &right[..band];
        for (a, b) in left_band.iter().zip(right_band) {
            assert!((a + b - 1.0).abs() < 1e-6);
        }
        assert_eq!(right[0], 0.0);
        assert_eq!(left[left.len() - band], 1.0);
        assert!(right_band.windows(2).all(|p| p[1] >= p[0]));
    }

    #[test]
    fn chunk_ranges_cover_time() {
        assert_eq!(chunk_ranges(12, 6), vec![0..6, 6..12]);
        assert_eq!(chunk_ranges(13, 6), vec![0..6, 6..12, 12..13]);
        assert_eq!(chunk_ranges(4, 6), vec![0..4]);
    }

    #[test]
    fn auto_tile_size_uses_thirds() {
        let settings = DecodeSettings {
            enable_vae_tiling: true,
            ..Default::default()
        };
        let options = settings.resolve((9, 60, 106), 8, &DeviceContext::cpu());
        let tiling = options.tiling.unwrap();
        assert_eq!((tiling.num_tiles_h, tiling.num_tiles_w), (3, 3));
        assert_eq!(tiling.overlap_h, 2);
        assert_eq!(tiling.overlap_w, 4);
        assert_eq!(options.per_batch, Some(6));
    }

    #[test]
    fn disabled_tiling_is_single_call() {
        let options = DecodeSettings::default().resolve((9, 60, 106), 8, &DeviceContext::cpu());
        assert_eq!(options, TiledDecodeOptions::default());
    }
}
