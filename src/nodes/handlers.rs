//! One handler per node kind. Inputs have already been validated and
//! defaulted by the registry.

use candle_core::{DType, Device};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use tracing::info;

use super::value::{MochiModel, MochiVae, ModelHandle, VaeHandle};
use super::{NodeContext, NodeError, NodeInputs, NodeKind, NodeValue};
use crate::conditioning::encode_image;
use crate::config::{CompileArgs, GenerationConfig};
use crate::loader::{ModuleOptions, WeightLoader};
use crate::sampler::{MochiSampler, SampleRequest};
use crate::text_encoder::{TextEncodeOptions, encode_text};
use crate::vae::{
    DecodeSettings, SpatialTiling, TiledDecodeOptions, decode_to_frames, validate_latents,
};

const DIT_DOWNLOAD_DIR: &str = "diffusion_models/mochi";
const VAE_DOWNLOAD_DIR: &str = "vae/mochi";
const DIT_DIR: &str = "diffusion_models";
const VAE_DIR: &str = "vae";

pub(super) fn dispatch(
    ctx: &NodeContext,
    kind: NodeKind,
    inputs: &NodeInputs,
) -> Result<Vec<NodeValue>, NodeError> {
    match kind {
        NodeKind::DownloadAndLoadMochiModel => download_and_load(ctx, inputs),
        NodeKind::MochiModelLoader => model_loader(ctx, inputs),
        NodeKind::MochiVAELoader => vae_loader(ctx, inputs),
        NodeKind::MochiTorchCompileSettings => compile_settings(inputs),
        NodeKind::MochiTextEncode => text_encode(ctx, inputs),
        NodeKind::MochiImageEncode => image_encode(ctx, inputs),
        NodeKind::MochiSampler => sample(ctx, inputs),
        NodeKind::MochiDecode => decode(ctx, inputs),
        NodeKind::MochiDecodeSpatialTiling => decode_spatial_tiling(ctx, inputs),
    }
}

// =============================================================================
// Loaders
// =============================================================================

fn load_transformer(
    ctx: &NodeContext,
    path: &Path,
    options: ModuleOptions,
) -> Result<ModelHandle, NodeError> {
    let loaded = WeightLoader::new(ctx.devices.compute.clone(), options.precision.dtype())
        .load_module(path, |vb| (ctx.transformer_factory)(vb, &options))?;
    info!(
        precision = %options.precision,
        attention_mode = options.attention_mode.as_str(),
        fp8_fast_mode = options.precision.fp8_fast_mode(),
        compile = options.compile_args.is_some(),
        "Mochi transformer ready"
    );

    let mut sampler = MochiSampler::new(ctx.vae_config.clone());
    if let Some(stats) = &ctx.latent_stats {
        sampler = sampler.with_latent_stats(stats.clone());
    }
    Ok(Rc::new(RefCell::new(MochiModel {
        transformer: loaded.module,
        options,
        sampler,
    })))
}

fn load_vae(ctx: &NodeContext, path: &Path, device: &Device) -> Result<VaeHandle, NodeError> {
    let loaded = WeightLoader::new(device.clone(), DType::BF16)
        .load_module(path, |vb| (ctx.vae_factory)(vb, &ctx.vae_config))?;
    Ok(Rc::new(RefCell::new(MochiVae {
        decoder: loaded.module,
        config: ctx.vae_config.clone(),
    })))
}

fn module_options(inputs: &NodeInputs) -> Result<ModuleOptions, NodeError> {
    Ok(ModuleOptions::parse(
        &inputs.string("precision")?,
        &inputs.string("attention_mode")?,
        inputs.opt_compile_args("compile_args")?,
    )?)
}

fn download_and_load(ctx: &NodeContext, inputs: &NodeInputs) -> Result<Vec<NodeValue>, NodeError> {
    ctx.devices.soft_empty_cache();
    let options = module_options(inputs)?;
    let dit_path = ctx.locator.resolve(DIT_DOWNLOAD_DIR, &inputs.string("model")?)?;
    let vae_path = ctx.locator.resolve(VAE_DOWNLOAD_DIR, &inputs.string("vae")?)?;

    let model = load_transformer(ctx, &dit_path, options)?;
    let vae = load_vae(ctx, &vae_path, &ctx.devices.compute)?;
    Ok(vec![NodeValue::Model(model), NodeValue::Vae(vae)])
}

fn model_loader(ctx: &NodeContext, inputs: &NodeInputs) -> Result<Vec<NodeValue>, NodeError> {
    ctx.devices.soft_empty_cache();
    let options = module_options(inputs)?;
    let path = ctx.locator.existing(DIT_DIR, &inputs.string("model_name")?)?;
    let model = load_transformer(ctx, &path, options)?;
    Ok(vec![NodeValue::Model(model)])
}

fn vae_loader(ctx: &NodeContext, inputs: &NodeInputs) -> Result<Vec<NodeValue>, NodeError> {
    ctx.devices.soft_empty_cache();
    let path = ctx.locator.existing(VAE_DIR, &inputs.string("model_name")?)?;
    let vae = load_vae(ctx, &path, &ctx.devices.offload)?;
    if inputs.opt_compile_args("torch_compile_args")?.is_some() {
        vae.borrow_mut().decoder.move_to(&ctx.devices.compute)?;
    }
    Ok(vec![NodeValue::Vae(vae)])
}

fn compile_settings(inputs: &NodeInputs) -> Result<Vec<NodeValue>, NodeError> {
    let args = CompileArgs {
        backend: inputs.string("backend")?.parse()?,
        fullgraph: inputs.boolean("fullgraph")?,
        mode: inputs.string("mode")?.parse()?,
        compile_dit: inputs.boolean("compile_dit")?,
        compile_final_layer: inputs.boolean("compile_final_layer")?,
    };
    Ok(vec![NodeValue::CompileArgs(args)])
}

// =============================================================================
// Encoders and sampler
// =============================================================================

fn text_encode(ctx: &NodeContext, inputs: &NodeInputs) -> Result<Vec<NodeValue>, NodeError> {
    let clip = inputs.clip("clip")?;
    let prompt = inputs.string("prompt")?;
    let options = TextEncodeOptions {
        strength: inputs.float("strength")?,
        force_offload: inputs.boolean("force_offload")?,
    };

    let conditioning = {
        let mut bundle = clip
            .try_borrow_mut()
            .map_err(|_| NodeError::HandleInUse("CLIP"))?;
        let bundle = &mut *bundle;
        encode_text(
            bundle.tokenizer.as_ref(),
            bundle.encoder.as_mut(),
            &prompt,
            &options,
            &ctx.devices,
        )?
    };
    Ok(vec![NodeValue::Conditioning(conditioning), NodeValue::Clip(clip)])
}

fn image_encode(ctx: &NodeContext, inputs: &NodeInputs) -> Result<Vec<NodeValue>, NodeError> {
    let image = inputs.image("image")?;
    let conditioning = encode_image(&image, inputs.float("strength")?, ctx.text_hidden_size)?;
    Ok(vec![NodeValue::Conditioning(conditioning)])
}

fn sample(ctx: &NodeContext, inputs: &NodeInputs) -> Result<Vec<NodeValue>, NodeError> {
    let model = inputs.model("model")?;
    let positive = inputs.conditioning("positive")?;
    let negative = inputs.conditioning("negative")?;
    let image_cond = inputs.opt_conditioning("image_cond")?;
    let config = GenerationConfig::new(
        inputs.size("width")?,
        inputs.size("height")?,
        inputs.size("num_frames")?,
        inputs.int("seed")?,
    )?
    .with_steps(inputs.size("steps")?)
    .with_cfg(inputs.float("cfg")?);

    let request = SampleRequest {
        positive: &positive,
        negative: &negative,
        image_cond: image_cond.as_ref(),
        image_strength: inputs.float("image_strength")?,
        config,
    };

    let mut model = model
        .try_borrow_mut()
        .map_err(|_| NodeError::HandleInUse("MOCHIMODEL"))?;
    let model = &mut *model;
    let latents = model
        .sampler
        .sample(model.transformer.as_mut(), &request, &ctx.devices)?;
    Ok(vec![NodeValue::Latent(latents)])
}

// =============================================================================
// Decoders
// =============================================================================

fn decode_with(
    ctx: &NodeContext,
    inputs: &NodeInputs,
    options: impl FnOnce(&MochiVae, (usize, usize, usize)) -> TiledDecodeOptions,
) -> Result<Vec<NodeValue>, NodeError> {
    let vae = inputs.vae("vae")?;
    let samples = inputs.latent("samples")?;
    let (_b, t, h, w) = validate_latents(&samples)?;

    let mut vae = vae
        .try_borrow_mut()
        .map_err(|_| NodeError::HandleInUse("MOCHIVAE"))?;
    let options = options(&*vae, (t, h, w));
    let frames = decode_to_frames(vae.decoder.as_mut(), &samples, &options, &ctx.devices)?;
    Ok(vec![NodeValue::Image(frames)])
}

fn decode(ctx: &NodeContext, inputs: &NodeInputs) -> Result<Vec<NodeValue>, NodeError> {
    let settings = DecodeSettings {
        enable_vae_tiling: inputs.boolean("enable_vae_tiling")?,
        auto_tile_size: inputs.boolean("auto_tile_size")?,
        frame_batch_size: inputs.size("frame_batch_size")?,
        tile_sample_min_height: inputs.size("tile_sample_min_height")?,
        tile_sample_min_width: inputs.size("tile_sample_min_width")?,
        tile_overlap_factor_height: inputs.float("tile_overlap_factor_height")?,
        tile_overlap_factor_width: inputs.float("tile_overlap_factor_width")?,
    };
    decode_with(ctx, inputs, |vae, dims| {
        settings.resolve(dims, vae.config.spatial_compression_ratio(), &ctx.devices)
    })
}

fn decode_spatial_tiling(ctx: &NodeContext, inputs: &NodeInputs) -> Result<Vec<NodeValue>, NodeError> {
    let options = if inputs.boolean("enable_vae_tiling")? {
        TiledDecodeOptions {
            tiling: Some(SpatialTiling::new(
                inputs.size("num_tiles_w")?,
                inputs.size("num_tiles_h")?,
                inputs.size("overlap")?,
                inputs.size("min_block_size")?,
            )),
            per_batch: Some(inputs.size("per_batch")?),
        }
    } else {
        TiledDecodeOptions::default()
    };
    decode_with(ctx, inputs, |_, _| options)
}
