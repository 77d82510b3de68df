//! Declarative node schemas: the typed inputs and outputs of every node kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::{
    AttentionMode, CompileBackend, CompileMode, ConfigError, MOCHI_DIT_FILES, MOCHI_VAE_FILES,
    Precision,
};

/// Category every node is listed under.
pub const CATEGORY: &str = "MochiWrapper";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    DownloadAndLoadMochiModel,
    MochiModelLoader,
    MochiVAELoader,
    MochiTorchCompileSettings,
    MochiTextEncode,
    MochiImageEncode,
    MochiSampler,
    MochiDecode,
    MochiDecodeSpatialTiling,
}

impl NodeKind {
    pub const ALL: [NodeKind; 9] = [
        NodeKind::DownloadAndLoadMochiModel,
        NodeKind::MochiModelLoader,
        NodeKind::MochiVAELoader,
        NodeKind::MochiTorchCompileSettings,
        NodeKind::MochiTextEncode,
        NodeKind::MochiImageEncode,
        NodeKind::MochiSampler,
        NodeKind::MochiDecode,
        NodeKind::MochiDecodeSpatialTiling,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::DownloadAndLoadMochiModel => "DownloadAndLoadMochiModel",
            NodeKind::MochiModelLoader => "MochiModelLoader",
            NodeKind::MochiVAELoader => "MochiVAELoader",
            NodeKind::MochiTorchCompileSettings => "MochiTorchCompileSettings",
            NodeKind::MochiTextEncode => "MochiTextEncode",
            NodeKind::MochiImageEncode => "MochiImageEncode",
            NodeKind::MochiSampler => "MochiSampler",
            NodeKind::MochiDecode => "MochiDecode",
            NodeKind::MochiDecodeSpatialTiling => "MochiDecodeSpatialTiling",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            NodeKind::DownloadAndLoadMochiModel => "(Down)load Mochi Model",
            NodeKind::MochiModelLoader => "Mochi Model Loader",
            NodeKind::MochiVAELoader => "Mochi VAE Loader",
            NodeKind::MochiTorchCompileSettings => "Mochi Torch Compile Settings",
            NodeKind::MochiTextEncode => "Mochi TextEncode",
            NodeKind::MochiImageEncode => "Mochi Image Encode",
            NodeKind::MochiSampler => "Mochi Sampler",
            NodeKind::MochiDecode => "Mochi Decode",
            NodeKind::MochiDecodeSpatialTiling => "Mochi VAE Decode Spatial Tiling",
        }
    }

    pub fn description(&self) -> Option<&'static str> {
        match self {
            NodeKind::DownloadAndLoadMochiModel => {
                Some("Downloads and loads the selected Mochi model from Huggingface")
            }
            NodeKind::MochiTorchCompileSettings => Some(
                "Compile settings; when connected to a loader, compilation of the selected layers is attempted",
            ),
            _ => None,
        }
    }

    pub fn schema(&self) -> NodeSchema {
        let (inputs, outputs) = match self {
            NodeKind::DownloadAndLoadMochiModel => (
                vec![
                    InputSpec::choice("model", &MOCHI_DIT_FILES, MOCHI_DIT_FILES[0])
                        .tooltip("Downloads from the Hub to 'models/diffusion_models/mochi'"),
                    InputSpec::choice("vae", &MOCHI_VAE_FILES, MOCHI_VAE_FILES[0])
                        .tooltip("Downloads from the Hub to 'models/vae/mochi'"),
                    InputSpec::choice("precision", &precision_choices(), "bf16"),
                    InputSpec::choice("attention_mode", &attention_choices(), "flash_attn"),
                    InputSpec::socket("trigger", SocketType::Conditioning)
                        .optional()
                        .tooltip("Dummy input for forcing execution order"),
                    InputSpec::socket("compile_args", SocketType::MochiCompileArgs).optional(),
                ],
                vec![
                    OutputSpec::new("mochi_model", SocketType::MochiModel),
                    OutputSpec::new("mochi_vae", SocketType::MochiVae),
                ],
            ),
            NodeKind::MochiModelLoader => (
                vec![
                    InputSpec::file("model_name", "diffusion_models"),
                    InputSpec::choice(
                        "precision",
                        &["fp8_e4m3fn", "fp8_e4m3fn_fast", "fp16", "fp32", "bf16"],
                        "fp8_e4m3fn",
                    ),
                    InputSpec::choice("attention_mode", &["sdpa", "flash_attn", "sage_attn", "comfy"], "sdpa"),
                    InputSpec::socket("trigger", SocketType::Conditioning).optional(),
                    InputSpec::socket("compile_args", SocketType::MochiCompileArgs).optional(),
                ],
                vec![OutputSpec::new("mochi_model", SocketType::MochiModel)],
            ),
            NodeKind::MochiVAELoader => (
                vec![
                    InputSpec::file("model_name", "vae"),
                    InputSpec::socket("torch_compile_args", SocketType::MochiCompileArgs).optional(),
                ],
                vec![OutputSpec::new("mochi_vae", SocketType::MochiVae)],
            ),
            NodeKind::MochiTorchCompileSettings => (
                vec![
                    InputSpec::choice("backend", &backend_choices(), "inductor"),
                    InputSpec::boolean("fullgraph", false).tooltip("Enable full graph mode"),
                    InputSpec::choice("mode", &mode_choices(), "default"),
                    InputSpec::boolean("compile_dit", true).tooltip("Compiles all transformer blocks"),
                    InputSpec::boolean("compile_final_layer", true),
                ],
                vec![OutputSpec::new("torch_compile_args", SocketType::MochiCompileArgs)],
            ),
            NodeKind::MochiTextEncode => (
                vec![
                    InputSpec::socket("clip", SocketType::Clip),
                    InputSpec::string("prompt", "", true),
                    InputSpec::float("strength", 1.0, 0.0, 10.0, 0.01).optional(),
                    InputSpec::boolean("force_offload", true).optional(),
                ],
                vec![
                    OutputSpec::new("conditioning", SocketType::Conditioning),
                    OutputSpec::new("clip", SocketType::Clip),
                ],
            ),
            NodeKind::MochiImageEncode => (
                vec![
                    InputSpec::socket("image", SocketType::Image),
                    InputSpec::float("strength", 1.0, 0.0, 10.0, 0.01),
                ],
                vec![OutputSpec::new("conditioning", SocketType::Conditioning)],
            ),
            NodeKind::MochiSampler => (
                vec![
                    InputSpec::socket("model", SocketType::MochiModel),
                    InputSpec::socket("positive", SocketType::Conditioning),
                    InputSpec::socket("negative", SocketType::Conditioning),
                    InputSpec::int("width", 848, 128, 2048, 8),
                    InputSpec::int("height", 480, 128, 2048, 8),
                    InputSpec::int("num_frames", 49, 7, 1024, 6),
                    InputSpec::int("steps", 50, 2, u64::MAX, 1),
                    InputSpec::float("cfg", 4.5, 0.0, 30.0, 0.01),
                    InputSpec::int("seed", 0, 0, u64::MAX, 1),
                    InputSpec::socket("image_cond", SocketType::Conditioning).optional(),
                    InputSpec::float("image_strength", 1.0, 0.0, 10.0, 0.01).optional(),
                ],
                vec![OutputSpec::new("samples", SocketType::Latent)],
            ),
            NodeKind::MochiDecode => (
                vec![
                    InputSpec::socket("vae", SocketType::MochiVae),
                    InputSpec::socket("samples", SocketType::Latent),
                    InputSpec::boolean("enable_vae_tiling", false)
                        .tooltip("Drastically reduces memory use but may introduce seams"),
                    InputSpec::boolean("auto_tile_size", true)
                        .tooltip("Auto size based on height and width"),
                    InputSpec::int("frame_batch_size", 6, 1, 64, 1)
                        .tooltip("Number of latent frames (6 frames each) to decode at once"),
                    InputSpec::int("tile_sample_min_height", 240, 16, 2048, 8),
                    InputSpec::int("tile_sample_min_width", 424, 16, 2048, 8),
                    InputSpec::float("tile_overlap_factor_height", 0.1666, 0.0, 1.0, 0.001),
                    InputSpec::float("tile_overlap_factor_width", 0.2, 0.0, 1.0, 0.001),
                ],
                vec![OutputSpec::new("images", SocketType::Image)],
            ),
            NodeKind::MochiDecodeSpatialTiling => (
                vec![
                    InputSpec::socket("vae", SocketType::MochiVae),
                    InputSpec::socket("samples", SocketType::Latent),
                    InputSpec::boolean("enable_vae_tiling", false)
                        .tooltip("Drastically reduces memory use but may introduce seams"),
                    InputSpec::int("num_tiles_w", 4, 2, 64, 2).tooltip("Number of horizontal tiles"),
                    InputSpec::int("num_tiles_h", 4, 2, 64, 2).tooltip("Number of vertical tiles"),
                    InputSpec::int("overlap", 16, 0, 256, 1)
                        .tooltip("Number of latent pixels of overlap between adjacent tiles"),
                    InputSpec::int("min_block_size", 1, 1, 256, 1)
                        .tooltip("Minimum number of latent pixels in each dimension when subdividing"),
                    InputSpec::int("per_batch", 6, 1, 256, 1)
                        .tooltip("Number of latent frames (6 frames each) per decoded chunk"),
                ],
                vec![OutputSpec::new("images", SocketType::Image)],
            ),
        };

        NodeSchema {
            kind: *self,
            display_name: self.display_name(),
            category: CATEGORY,
            description: self.description(),
            inputs,
            outputs,
        }
    }
}

impl FromStr for NodeKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| ConfigError::UnsupportedOption {
                name: "node",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn precision_choices() -> Vec<&'static str> {
    Precision::ALL.iter().map(Precision::as_str).collect()
}

fn attention_choices() -> Vec<&'static str> {
    AttentionMode::ALL.iter().map(AttentionMode::as_str).collect()
}

fn backend_choices() -> Vec<&'static str> {
    CompileBackend::ALL.iter().map(CompileBackend::as_str).collect()
}

fn mode_choices() -> Vec<&'static str> {
    CompileMode::ALL.iter().map(CompileMode::as_str).collect()
}

// =============================================================================
// Input / output specs
// =============================================================================

/// Value types passed between nodes by reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SocketType {
    #[serde(rename = "MOCHIMODEL")]
    MochiModel,
    #[serde(rename = "MOCHIVAE")]
    MochiVae,
    #[serde(rename = "MOCHICOMPILEARGS")]
    MochiCompileArgs,
    #[serde(rename = "CONDITIONING")]
    Conditioning,
    #[serde(rename = "CLIP")]
    Clip,
    #[serde(rename = "IMAGE")]
    Image,
    #[serde(rename = "LATENT")]
    Latent,
}

impl SocketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketType::MochiModel => "MOCHIMODEL",
            SocketType::MochiVae => "MOCHIVAE",
            SocketType::MochiCompileArgs => "MOCHICOMPILEARGS",
            SocketType::Conditioning => "CONDITIONING",
            SocketType::Clip => "CLIP",
            SocketType::Image => "IMAGE",
            SocketType::Latent => "LATENT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    Int {
        default: u64,
        min: u64,
        max: u64,
        step: u64,
    },
    Float {
        default: f64,
        min: f64,
        max: f64,
        step: f64,
    },
    Bool {
        default: bool,
    },
    Choice {
        options: Vec<&'static str>,
        default: &'static str,
    },
    String {
        default: &'static str,
        multiline: bool,
    },
    /// Name of a weights file under a models subdirectory.
    File {
        folder: &'static str,
    },
    Socket {
        socket: SocketType,
    },
}

impl ParamKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamKind::Int { .. } => "INT",
            ParamKind::Float { .. } => "FLOAT",
            ParamKind::Bool { .. } => "BOOLEAN",
            ParamKind::Choice { .. } | ParamKind::String { .. } | ParamKind::File { .. } => "STRING",
            ParamKind::Socket { socket } => socket.as_str(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputSpec {
    pub name: &'static str,
    #[serde(flatten)]
    pub kind: ParamKind,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tooltip: Option<&'static str>,
}

impl InputSpec {
    fn new(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            tooltip: None,
        }
    }

    pub fn int(name: &'static str, default: u64, min: u64, max: u64, step: u64) -> Self {
        Self::new(name, ParamKind::Int { default, min, max, step })
    }

    pub fn float(name: &'static str, default: f64, min: f64, max: f64, step: f64) -> Self {
        Self::new(name, ParamKind::Float { default, min, max, step })
    }

    pub fn boolean(name: &'static str, default: bool) -> Self {
        Self::new(name, ParamKind::Bool { default })
    }

    pub fn choice(name: &'static str, options: &[&'static str], default: &'static str) -> Self {
        Self::new(
            name,
            ParamKind::Choice {
                options: options.to_vec(),
                default,
            },
        )
    }

    pub fn string(name: &'static str, default: &'static str, multiline: bool) -> Self {
        Self::new(name, ParamKind::String { default, multiline })
    }

    pub fn file(name: &'static str, folder: &'static str) -> Self {
        Self::new(name, ParamKind::File { folder })
    }

    pub fn socket(name: &'static str, socket: SocketType) -> Self {
        Self::new(name, ParamKind::Socket { socket })
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn tooltip(mut self, tooltip: &'static str) -> Self {
        self.tooltip = Some(tooltip);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputSpec {
    pub name: &'static str,
    pub socket: SocketType,
}

impl OutputSpec {
    pub fn new(name: &'static str, socket: SocketType) -> Self {
        Self { name, socket }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSchema {
    pub kind: NodeKind,
    pub display_name: &'static str,
    pub category: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'static str>,
    pub inputs: Vec<InputSpec>,
    pub outputs: Vec<OutputSpec>,
}

impl NodeSchema {
    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.name == name)
    }
}
