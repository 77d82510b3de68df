//! Values flowing along node graph edges.

use candle_core::Tensor;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use super::NodeError;
use crate::conditioning::Conditioning;
use crate::config::{CompileArgs, MochiVaeConfig};
use crate::loader::ModuleOptions;
use crate::sampler::{MochiSampler, MochiTransformer};
use crate::text_encoder::{TextEncoder, Tokenizer};
use crate::vae::VideoDecoder;

/// A loaded transformer with the sampler settings that go with it.
pub struct MochiModel {
    pub transformer: Box<dyn MochiTransformer>,
    pub options: ModuleOptions,
    pub sampler: MochiSampler,
}

pub struct MochiVae {
    pub decoder: Box<dyn VideoDecoder>,
    pub config: MochiVaeConfig,
}

/// Tokenizer and encoder travelling together on a `CLIP` socket.
pub struct TextEncoderBundle {
    pub tokenizer: Box<dyn Tokenizer>,
    pub encoder: Box<dyn TextEncoder>,
}

pub type ModelHandle = Rc<RefCell<MochiModel>>;
pub type VaeHandle = Rc<RefCell<MochiVae>>;
pub type ClipHandle = Rc<RefCell<TextEncoderBundle>>;

#[derive(Clone)]
pub enum NodeValue {
    Int(u64),
    Float(f64),
    Bool(bool),
    String(String),
    /// `[3, H, W]`, `[B, 3, H, W]` or decoded frames `[N, H, W, 3]`, f32 in [0, 1].
    Image(Tensor),
    Conditioning(Conditioning),
    /// `[B, 12, T, H, W]`
    Latent(Tensor),
    Model(ModelHandle),
    Vae(VaeHandle),
    Clip(ClipHandle),
    CompileArgs(CompileArgs),
}

impl NodeValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeValue::Int(_) => "INT",
            NodeValue::Float(_) => "FLOAT",
            NodeValue::Bool(_) => "BOOLEAN",
            NodeValue::String(_) => "STRING",
            NodeValue::Image(_) => "IMAGE",
            NodeValue::Conditioning(_) => "CONDITIONING",
            NodeValue::Latent(_) => "LATENT",
            NodeValue::Model(_) => "MOCHIMODEL",
            NodeValue::Vae(_) => "MOCHIVAE",
            NodeValue::Clip(_) => "CLIP",
            NodeValue::CompileArgs(_) => "MOCHICOMPILEARGS",
        }
    }
}

impl fmt::Debug for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeValue::Int(v) => write!(f, "Int({v})"),
            NodeValue::Float(v) => write!(f, "Float({v})"),
            NodeValue::Bool(v) => write!(f, "Bool({v})"),
            NodeValue::String(v) => write!(f, "String({v:?})"),
            NodeValue::Image(t) => write!(f, "Image({:?})", t.dims()),
            NodeValue::Conditioning(c) => write!(f, "Conditioning({:?})", c.embeds.dims()),
            NodeValue::Latent(t) => write!(f, "Latent({:?})", t.dims()),
            NodeValue::CompileArgs(a) => write!(f, "CompileArgs({a:?})"),
            other => write!(f, "{}", other.type_name()),
        }
    }
}

impl From<u64> for NodeValue {
    fn from(v: u64) -> Self {
        NodeValue::Int(v)
    }
}

impl From<f64> for NodeValue {
    fn from(v: f64) -> Self {
        NodeValue::Float(v)
    }
}

impl From<bool> for NodeValue {
    fn from(v: bool) -> Self {
        NodeValue::Bool(v)
    }
}

impl From<&str> for NodeValue {
    fn from(v: &str) -> Self {
        NodeValue::String(v.to_string())
    }
}

impl From<Conditioning> for NodeValue {
    fn from(v: Conditioning) -> Self {
        NodeValue::Conditioning(v)
    }
}

impl From<CompileArgs> for NodeValue {
    fn from(v: CompileArgs) -> Self {
        NodeValue::CompileArgs(v)
    }
}

/// Named inputs of one node invocation. After validation every declared
/// parameter is present, defaults included; only optional sockets may be
/// absent.
#[derive(Debug, Clone, Default)]
pub struct NodeInputs {
    values: HashMap<String, NodeValue>,
}

macro_rules! getter {
    ($name:ident, $opt:ident, $variant:ident, $ty:ty, $label:literal) => {
        pub fn $opt(&self, name: &str) -> Result<Option<$ty>, NodeError> {
            match self.values.get(name) {
                None => Ok(None),
                Some(NodeValue::$variant(v)) => Ok(Some(v.clone())),
                Some(other) => Err(NodeError::WrongType {
                    input: name.to_string(),
                    expected: $label,
                    found: other.type_name(),
                }),
            }
        }

        pub fn $name(&self, name: &str) -> Result<$ty, NodeError> {
            self.$opt(name)?.ok_or_else(|| NodeError::MissingInput {
                input: name.to_string(),
            })
        }
    };
}

impl NodeInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<NodeValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<NodeValue>) {
        self.values.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&NodeValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    getter!(int, opt_int, Int, u64, "INT");
    getter!(float, opt_float, Float, f64, "FLOAT");
    getter!(boolean, opt_boolean, Bool, bool, "BOOLEAN");
    getter!(string, opt_string, String, String, "STRING");
    getter!(image, opt_image, Image, Tensor, "IMAGE");
    getter!(conditioning, opt_conditioning, Conditioning, Conditioning, "CONDITIONING");
    getter!(latent, opt_latent, Latent, Tensor, "LATENT");
    getter!(model, opt_model, Model, ModelHandle, "MOCHIMODEL");
    getter!(vae, opt_vae, Vae, VaeHandle, "MOCHIVAE");
    getter!(clip, opt_clip, Clip, ClipHandle, "CLIP");
    getter!(compile_args, opt_compile_args, CompileArgs, CompileArgs, "MOCHICOMPILEARGS");

    pub fn size(&self, name: &str) -> Result<usize, NodeError> {
        Ok(self.int(name)? as usize)
    }
}

impl FromIterator<(String, NodeValue)> for NodeInputs {
    fn from_iter<I: IntoIterator<Item = (String, NodeValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
