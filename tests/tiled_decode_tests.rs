//! Tests for the tiled VAE decode
//!
//! Tests cover:
//! - Tile planning (cores partition the frame, bounds contain cores)
//! - Spatial tiling against a full-frame decode
//! - Temporal chunking and boundary-frame blending
//! - Post-processing range and frame layout
//! - Shape validation and decoder failures

use candle_core::{D, DType, Device, IndexOp, Result, Tensor};
use candle_mochi::device::DeviceContext;
use candle_mochi::vae::*;
use std::cell::Cell;

// =============================================================================
// Helper functions
// =============================================================================

fn create_test_device() -> Device {
    Device::Cpu
}

fn latents(shape: (usize, usize, usize, usize, usize)) -> Result<Tensor> {
    Tensor::randn(0f32, 1.0, shape, &create_test_device())
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

/// Pointwise decoder with nearest-neighbour upsampling. Every output pixel
/// depends on exactly one latent pixel, so tiling introduces no error.
struct LocalDecoder {
    scale: usize,
    frames_per_latent: usize,
    calls: Cell<usize>,
    moves: usize,
}

impl LocalDecoder {
    fn new(scale: usize, frames_per_latent: usize) -> Self {
        Self {
            scale,
            frames_per_latent,
            calls: Cell::new(0),
            moves: 0,
        }
    }
}

impl VideoDecoder for LocalDecoder {
    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        self.calls.set(self.calls.get() + 1);
        let (b, _c, t, h, w) = latents.dims5()?;
        let (s, k) = (self.scale, self.frames_per_latent);
        let x = latents.narrow(1, 0, 3)?.to_dtype(DType::F32)?.tanh()?;
        let x = x
            .contiguous()?
            .reshape((b * 3, t, h, w))?
            .upsample_nearest2d(h * s, w * s)?
            .reshape((b, 3, t, 1, h * s, w * s))?;
        x.broadcast_as((b, 3, t, k, h * s, w * s))?
            .contiguous()?
            .reshape((b, 3, t * k, h * s, w * s))
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn move_to(&mut self, _device: &Device) -> Result<()> {
        self.moves += 1;
        Ok(())
    }
}

struct FailingDecoder;

impl VideoDecoder for FailingDecoder {
    fn decode(&self, _latents: &Tensor) -> Result<Tensor> {
        candle_core::bail!("out of memory")
    }
}

// =============================================================================
// Tile planning
// =============================================================================

#[test]
fn test_tile_cores_partition_frame() {
    let (h, w) = (60, 106);
    let tiles = plan_tiles(h, w, &SpatialTiling::default()).unwrap();
    assert_eq!(tiles.len(), 16);

    let mut covered = vec![0u8; h * w];
    for tile in &tiles {
        assert!(tile.bounds.rows.start <= tile.core.rows.start);
        assert!(tile.bounds.rows.end >= tile.core.rows.end);
        assert!(tile.bounds.cols.start <= tile.core.cols.start);
        assert!(tile.bounds.cols.end >= tile.core.cols.end);
        assert!(tile.bounds.rows.end <= h && tile.bounds.cols.end <= w);
        for r in tile.core.rows.clone() {
            for c in tile.core.cols.clone() {
                covered[r * w + c] += 1;
            }
        }
    }
    assert!(covered.iter().all(|&n| n == 1));
}

#[test]
fn test_tiles_are_row_major() {
    let tiles = plan_tiles(16, 16, &SpatialTiling::new(2, 3, 2, 1)).unwrap();
    let order: Vec<_> = tiles.iter().map(|t| (t.row, t.col)).collect();
    assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1)]);
}

#[test]
fn test_overlap_extends_interior_edges_only() {
    let tiles = plan_tiles(20, 20, &SpatialTiling::new(2, 2, 4, 1)).unwrap();
    let first = &tiles[0];
    assert_eq!(first.core.rows, 0..10);
    assert_eq!(first.bounds.rows, 0..12);
    let last = &tiles[3];
    assert_eq!(last.core.cols, 10..20);
    assert_eq!(last.bounds.cols, 8..20);
}

#[test]
fn test_zero_tiles_is_invalid() {
    let err = plan_tiles(8, 8, &SpatialTiling::new(0, 2, 0, 1)).unwrap_err();
    assert!(matches!(err, DecodeError::InvalidTiling(_)));
}

// =============================================================================
// Spatial tiling
// =============================================================================

#[test]
fn test_single_tile_matches_untiled() -> Result<()> {
    let z = latents((1, 12, 2, 6, 10))?;
    let decoder = LocalDecoder::new(8, 1);

    let untiled = TiledDecoder::new(TiledDecodeOptions::default())
        .decode(&decoder, &z)
        .unwrap();
    let tiled = TiledDecoder::new(TiledDecodeOptions {
        tiling: Some(SpatialTiling::new(1, 1, 0, 1)),
        per_batch: None,
    })
    .decode(&decoder, &z)
    .unwrap();

    assert_eq!(tiled.dims(), untiled.dims());
    assert!(max_abs_diff(&tiled, &untiled)? < 1e-5);
    Ok(())
}

#[test]
fn test_tiled_matches_untiled_for_local_decoder() -> Result<()> {
    let z = latents((1, 12, 2, 12, 18))?;
    let decoder = LocalDecoder::new(8, 1);

    let untiled = TiledDecoder::default().decode(&decoder, &z).unwrap();
    let tiled = TiledDecoder::new(TiledDecodeOptions {
        tiling: Some(SpatialTiling::new(3, 2, 4, 1)),
        per_batch: None,
    })
    .decode(&decoder, &z)
    .unwrap();

    assert_eq!(tiled.dims(), &[1, 3, 2, 96, 144]);
    assert!(max_abs_diff(&tiled, &untiled)? < 1e-5);
    Ok(())
}

#[test]
fn test_one_decoder_call_per_tile() -> Result<()> {
    let z = latents((1, 12, 3, 8, 8))?;
    let decoder = LocalDecoder::new(2, 1);
    TiledDecoder::new(TiledDecodeOptions {
        tiling: Some(SpatialTiling::new(2, 2, 2, 1)),
        per_batch: None,
    })
    .decode(&decoder, &z)
    .unwrap();
    assert_eq!(decoder.calls.get(), 4);
    Ok(())
}

#[test]
fn test_min_block_size_reduces_tiles() -> Result<()> {
    let z = latents((1, 12, 1, 8, 8))?;
    let decoder = LocalDecoder::new(2, 1);
    TiledDecoder::new(TiledDecodeOptions {
        tiling: Some(SpatialTiling::new(8, 8, 0, 4)),
        per_batch: None,
    })
    .decode(&decoder, &z)
    .unwrap();
    assert_eq!(decoder.calls.get(), 4);
    Ok(())
}

// =============================================================================
// Temporal chunking
// =============================================================================

#[test]
fn test_chunk_count_and_frame_count() -> Result<()> {
    let z = latents((1, 12, 12, 4, 4))?;
    let decoder = LocalDecoder::new(2, 6);

    let chunked = TiledDecoder::new(TiledDecodeOptions {
        tiling: None,
        per_batch: Some(6),
    });
    let chunks = chunked.decode_chunks(&decoder, &z).unwrap();
    assert_eq!(chunks.len(), 12 / 6);

    let whole = TiledDecoder::default().decode(&decoder, &z).unwrap();
    let joined = chunked.decode(&decoder, &z).unwrap();
    assert_eq!(joined.dim(2)?, whole.dim(2)?);
    assert_eq!(joined.dim(2)?, 72);
    Ok(())
}

#[test]
fn test_short_last_chunk() -> Result<()> {
    let z = latents((1, 12, 7, 4, 4))?;
    let decoder = LocalDecoder::new(1, 1);
    let chunks = TiledDecoder::new(TiledDecodeOptions {
        tiling: None,
        per_batch: Some(3),
    })
    .decode_chunks(&decoder, &z)
    .unwrap();
    let lengths: Vec<usize> = chunks.iter().map(|c| c.dim(2).unwrap()).collect();
    assert_eq!(lengths, vec![3, 3, 1]);
    Ok(())
}

#[test]
fn test_boundary_frame_is_mean_of_neighbours() -> Result<()> {
    let z = latents((1, 12, 12, 4, 4))?;
    let decoder = LocalDecoder::new(1, 1);

    let whole = TiledDecoder::default().decode(&decoder, &z).unwrap();
    let chunked = TiledDecoder::new(TiledDecodeOptions {
        tiling: None,
        per_batch: Some(6),
    })
    .decode(&decoder, &z)
    .unwrap();

    let expected = ((whole.i((.., .., 5))? + whole.i((.., .., 6))?)? * 0.5)?;
    assert!(max_abs_diff(&chunked.i((.., .., 5))?, &expected)? < 1e-6);
    // The next chunk keeps its own first frame.
    assert!(max_abs_diff(&chunked.i((.., .., 6))?, &whole.i((.., .., 6))?)? < 1e-6);
    assert!(max_abs_diff(&chunked.i((.., .., 4))?, &whole.i((.., .., 4))?)? < 1e-6);
    Ok(())
}

#[test]
fn test_chunking_and_tiling_combine() -> Result<()> {
    let z = latents((1, 12, 4, 8, 8))?;
    let decoder = LocalDecoder::new(2, 1);
    let out = TiledDecoder::new(TiledDecodeOptions {
        tiling: Some(SpatialTiling::new(2, 2, 2, 1)),
        per_batch: Some(2),
    })
    .decode(&decoder, &z)
    .unwrap();
    assert_eq!(out.dims(), &[1, 3, 4, 16, 16]);
    assert_eq!(decoder.calls.get(), 8);
    Ok(())
}

#[test]
fn test_zero_per_batch_is_invalid() -> Result<()> {
    let z = latents((1, 12, 2, 4, 4))?;
    let err = TiledDecoder::new(TiledDecodeOptions {
        tiling: None,
        per_batch: Some(0),
    })
    .decode(&LocalDecoder::new(1, 1), &z)
    .unwrap_err();
    assert!(matches!(err, DecodeError::InvalidTiling(_)));
    Ok(())
}

// =============================================================================
// Validation and failures
// =============================================================================

#[test]
fn test_rejects_bad_shapes() -> Result<()> {
    let decoder = LocalDecoder::new(1, 1);
    let device = create_test_device();

    let rank4 = Tensor::zeros((1, 12, 4, 4), DType::F32, &device)?;
    let wrong_channels = Tensor::zeros((1, 4, 2, 4, 4), DType::F32, &device)?;
    let empty_time = Tensor::zeros((1, 12, 0, 4, 4), DType::F32, &device)?;

    for z in [rank4, wrong_channels, empty_time] {
        let err = TiledDecoder::default().decode(&decoder, &z).unwrap_err();
        assert!(matches!(err, DecodeError::ShapeMismatch(_)), "{err}");
    }
    assert_eq!(decoder.calls.get(), 0);
    Ok(())
}

#[test]
fn test_decoder_failure_aborts() -> Result<()> {
    let z = latents((1, 12, 4, 4, 4))?;
    let err = TiledDecoder::new(TiledDecodeOptions {
        tiling: Some(SpatialTiling::new(2, 2, 0, 1)),
        per_batch: Some(2),
    })
    .decode(&FailingDecoder, &z)
    .unwrap_err();
    match err {
        DecodeError::DecodeFailure { stage, .. } => assert_eq!(stage, "chunk 0 tile (0, 0)"),
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

// =============================================================================
// Post-processing
// =============================================================================

#[test]
fn test_postprocess_maps_and_clamps() -> Result<()> {
    let device = create_test_device();
    let x = Tensor::new(&[-2f32, -1.0, 0.0, 1.0, 3.0], &device)?;
    let y = postprocess(&x)?.to_vec1::<f32>()?;
    assert_eq!(y, vec![0.0, 0.0, 0.5, 1.0, 1.0]);
    Ok(())
}

#[test]
fn test_frame_layout_is_time_major() -> Result<()> {
    let device = create_test_device();
    let frames = Tensor::randn(0f32, 1.0, (2, 3, 4, 5, 6), &device)?;
    let out = to_frame_layout(&frames)?;
    assert_eq!(out.dims(), &[8, 5, 6, 3]);

    // Frame t * B + b is sample b at time t, channels last.
    let (t, b) = (2, 1);
    let expected = frames.i((b, .., t))?.permute((1, 2, 0))?;
    assert!(max_abs_diff(&out.i(t * 2 + b)?, &expected)? < 1e-6);
    Ok(())
}

#[test]
fn test_decode_to_frames_moves_decoder() -> Result<()> {
    let z = latents((2, 12, 3, 4, 4))?;
    let mut decoder = LocalDecoder::new(2, 1);
    let ctx = DeviceContext::cpu();

    let frames = decode_to_frames(&mut decoder, &z, &TiledDecodeOptions::default(), &ctx).unwrap();
    assert_eq!(frames.dims(), &[6, 8, 8, 3]);
    assert_eq!(frames.dtype(), DType::F32);
    let min = frames.flatten_all()?.min(0)?.to_scalar::<f32>()?;
    let max = frames.flatten_all()?.max(D::Minus1)?.to_scalar::<f32>()?;
    assert!((0.0..=1.0).contains(&min) && (0.0..=1.0).contains(&max));
    assert_eq!(decoder.moves, 2);
    Ok(())
}
