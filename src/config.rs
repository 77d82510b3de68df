//! Configuration structures for Mochi components

use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hub repository holding the repackaged Mochi preview weights.
pub const MOCHI_HUB_REPO: &str = "kijai/Mochi_preview_comfy";

/// Transformer checkpoints offered by the download-and-load node.
pub const MOCHI_DIT_FILES: [&str; 4] = [
    "mochi_preview_dit_fp8_e4m3fn.safetensors",
    "mochi_preview_dit_bf16.safetensors",
    "mochi_preview_dit_GGUF_Q4_0_v2.safetensors",
    "mochi_preview_dit_GGUF_Q8_0.safetensors",
];

/// VAE checkpoints offered by the download-and-load node.
pub const MOCHI_VAE_FILES: [&str; 1] = ["mochi_preview_vae_bf16.safetensors"];

/// Number of latent channels produced by the Mochi VAE encoder.
pub const LATENT_CHANNELS: usize = 12;

/// Threshold noise used by the sampler for the linear-quadratic schedule.
pub const DEFAULT_THRESHOLD_NOISE: f64 = 0.025;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unsupported precision: {0:?}. Expected one of bf16, fp8_e4m3fn, fp8_e4m3fn_fast, fp16, fp32")]
    UnsupportedPrecision(String),
    #[error("Unsupported value {value:?} for {name}")]
    UnsupportedOption { name: &'static str, value: String },
    #[error("{name} = {value} is outside the allowed range [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("Invalid dimensions: height={height}, width={width}. Must be multiples of 8")]
    InvalidDimensions { height: usize, width: usize },
}

// =============================================================================
// Precision / attention / compile options
// =============================================================================

/// Weight precision selected on the loader nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "bf16")]
    Bf16,
    #[serde(rename = "fp8_e4m3fn")]
    Fp8E4m3fn,
    #[serde(rename = "fp8_e4m3fn_fast")]
    Fp8E4m3fnFast,
    #[serde(rename = "fp16")]
    Fp16,
    #[serde(rename = "fp32")]
    Fp32,
}

impl Precision {
    pub const ALL: [Precision; 5] = [
        Precision::Bf16,
        Precision::Fp8E4m3fn,
        Precision::Fp8E4m3fnFast,
        Precision::Fp16,
        Precision::Fp32,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Bf16 => "bf16",
            Precision::Fp8E4m3fn => "fp8_e4m3fn",
            Precision::Fp8E4m3fnFast => "fp8_e4m3fn_fast",
            Precision::Fp16 => "fp16",
            Precision::Fp32 => "fp32",
        }
    }

    /// Storage dtype for the transformer weights.
    pub fn dtype(&self) -> DType {
        match self {
            Precision::Bf16 => DType::BF16,
            Precision::Fp8E4m3fn | Precision::Fp8E4m3fnFast => DType::F8E4M3,
            Precision::Fp16 => DType::F16,
            Precision::Fp32 => DType::F32,
        }
    }

    /// fp8 weights with fp8 matmuls instead of upcasting per layer.
    pub fn fp8_fast_mode(&self) -> bool {
        matches!(self, Precision::Fp8E4m3fnFast)
    }
}

impl FromStr for Precision {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Precision::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ConfigError::UnsupportedPrecision(s.to_string()))
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attention kernel requested from the transformer factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionMode {
    FlashAttn,
    Sdpa,
    SageAttn,
    Comfy,
}

impl AttentionMode {
    pub const ALL: [AttentionMode; 4] = [
        AttentionMode::FlashAttn,
        AttentionMode::Sdpa,
        AttentionMode::SageAttn,
        AttentionMode::Comfy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionMode::FlashAttn => "flash_attn",
            AttentionMode::Sdpa => "sdpa",
            AttentionMode::SageAttn => "sage_attn",
            AttentionMode::Comfy => "comfy",
        }
    }
}

impl FromStr for AttentionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AttentionMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ConfigError::UnsupportedOption {
                name: "attention_mode",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileBackend {
    #[default]
    Inductor,
    Cudagraphs,
}

impl CompileBackend {
    pub const ALL: [CompileBackend; 2] = [CompileBackend::Inductor, CompileBackend::Cudagraphs];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompileBackend::Inductor => "inductor",
            CompileBackend::Cudagraphs => "cudagraphs",
        }
    }
}

impl FromStr for CompileBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CompileBackend::ALL
            .into_iter()
            .find(|b| b.as_str() == s)
            .ok_or_else(|| ConfigError::UnsupportedOption {
                name: "backend",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompileMode {
    #[default]
    Default,
    MaxAutotune,
    MaxAutotuneNoCudagraphs,
    ReduceOverhead,
}

impl CompileMode {
    pub const ALL: [CompileMode; 4] = [
        CompileMode::Default,
        CompileMode::MaxAutotune,
        CompileMode::MaxAutotuneNoCudagraphs,
        CompileMode::ReduceOverhead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompileMode::Default => "default",
            CompileMode::MaxAutotune => "max-autotune",
            CompileMode::MaxAutotuneNoCudagraphs => "max-autotune-no-cudagraphs",
            CompileMode::ReduceOverhead => "reduce-overhead",
        }
    }
}

impl FromStr for CompileMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CompileMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ConfigError::UnsupportedOption {
                name: "mode",
                value: s.to_string(),
            })
    }
}

/// Graph compilation settings. Candle has no ahead-of-time fusion, so these
/// are forwarded untouched to the module factories, which may ignore them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileArgs {
    #[serde(default)]
    pub backend: CompileBackend,
    #[serde(default)]
    pub fullgraph: bool,
    #[serde(default)]
    pub mode: CompileMode,
    #[serde(default = "default_true")]
    pub compile_dit: bool,
    #[serde(default = "default_true")]
    pub compile_final_layer: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CompileArgs {
    fn default() -> Self {
        Self {
            backend: CompileBackend::Inductor,
            fullgraph: false,
            mode: CompileMode::Default,
            compile_dit: true,
            compile_final_layer: true,
        }
    }
}

// =============================================================================
// VAE decoder configuration
// =============================================================================

/// Hyper-parameters of the Mochi causal video VAE decoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MochiVaeConfig {
    pub out_channels: usize,
    pub base_channels: usize,
    pub channel_multipliers: Vec<usize>,
    pub temporal_expansions: Vec<usize>,
    pub spatial_expansions: Vec<usize>,
    pub num_res_blocks: Vec<usize>,
    pub latent_dim: usize,
    pub has_attention: Vec<bool>,
    #[serde(default = "default_padding_mode")]
    pub padding_mode: String,
    #[serde(default)]
    pub output_norm: bool,
    #[serde(default = "default_nonlinearity")]
    pub nonlinearity: String,
    #[serde(default = "default_nonlinearity")]
    pub output_nonlinearity: String,
    #[serde(default = "default_true")]
    pub causal: bool,
}

fn default_padding_mode() -> String {
    "replicate".to_string()
}

fn default_nonlinearity() -> String {
    "silu".to_string()
}

impl Default for MochiVaeConfig {
    fn default() -> Self {
        Self {
            out_channels: 3,
            base_channels: 128,
            channel_multipliers: vec![1, 2, 4, 6],
            temporal_expansions: vec![1, 2, 3],
            spatial_expansions: vec![2, 2, 2],
            num_res_blocks: vec![3, 3, 4, 6, 3],
            latent_dim: LATENT_CHANNELS,
            has_attention: vec![false; 5],
            padding_mode: default_padding_mode(),
            output_norm: false,
            nonlinearity: default_nonlinearity(),
            output_nonlinearity: default_nonlinearity(),
            causal: true,
        }
    }
}

impl MochiVaeConfig {
    /// Pixels per latent pixel along height and width (8 for Mochi).
    pub fn spatial_compression_ratio(&self) -> usize {
        self.spatial_expansions.iter().product()
    }

    /// Frames per latent frame (6 for Mochi).
    pub fn temporal_compression_ratio(&self) -> usize {
        self.temporal_expansions.iter().product()
    }
}

// =============================================================================
// Generation configuration
// =============================================================================

/// Video size and sampling parameters accepted by the sampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub width: usize,
    pub height: usize,
    pub num_frames: usize,
    pub steps: usize,
    pub cfg: f64,
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            width: 848,
            height: 480,
            num_frames: 49,
            steps: 50,
            cfg: 4.5,
            seed: 0,
        }
    }
}

impl GenerationConfig {
    /// Create a new generation configuration with validation
    pub fn new(width: usize, height: usize, num_frames: usize, seed: u64) -> Result<Self, ConfigError> {
        if !height.is_multiple_of(8) || !width.is_multiple_of(8) {
            return Err(ConfigError::InvalidDimensions { height, width });
        }
        check_range("width", width as f64, 128.0, 2048.0)?;
        check_range("height", height as f64, 128.0, 2048.0)?;
        check_range("num_frames", num_frames as f64, 7.0, 1024.0)?;

        Ok(Self {
            width,
            height,
            num_frames,
            seed,
            ..Self::default()
        })
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_cfg(mut self, cfg: f64) -> Self {
        self.cfg = cfg;
        self
    }

    /// Latent shape `[1, 12, T, H/8, W/8]` for this video size.
    pub fn latent_shape(&self, vae: &MochiVaeConfig) -> (usize, usize, usize, usize, usize) {
        let t = (self.num_frames - 1) / vae.temporal_compression_ratio() + 1;
        let s = vae.spatial_compression_ratio();
        (1, vae.latent_dim, t, self.height / s, self.width / s)
    }
}

pub(crate) fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value < min || value > max || value.is_nan() {
        return Err(ConfigError::OutOfRange {
            name: name.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_tokens_round_trip() {
        for p in Precision::ALL {
            assert_eq!(p.as_str().parse::<Precision>().unwrap(), p);
        }
        assert_eq!(Precision::Fp8E4m3fn.dtype(), DType::F8E4M3);
        assert!(Precision::Fp8E4m3fnFast.fp8_fast_mode());
        assert!(!Precision::Bf16.fp8_fast_mode());
    }

    #[test]
    fn unknown_precision_is_rejected() {
        let err = "int4".parse::<Precision>().unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedPrecision(ref s) if s == "int4"));
    }

    #[test]
    fn compile_args_serde_names() {
        let args: CompileArgs =
            serde_json::from_str(r#"{"backend":"cudagraphs","mode":"max-autotune"}"#).unwrap();
        assert_eq!(args.backend, CompileBackend::Cudagraphs);
        assert_eq!(args.mode, CompileMode::MaxAutotune);
        assert!(args.compile_dit);
    }

    #[test]
    fn vae_compression_ratios() {
        let cfg = MochiVaeConfig::default();
        assert_eq!(cfg.spatial_compression_ratio(), 8);
        assert_eq!(cfg.temporal_compression_ratio(), 6);
    }

    #[test]
    fn generation_config_latent_shape() {
        let cfg = GenerationConfig::new(848, 480, 49, 0).unwrap();
        assert_eq!(cfg.latent_shape(&MochiVaeConfig::default()), (1, 12, 9, 60, 106));
        assert!(GenerationConfig::new(850, 480, 49, 0).is_err());
        assert!(GenerationConfig::new(848, 480, 3, 0).is_err());
    }
}
