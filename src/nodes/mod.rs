//! Node registry
//!
//! Every node kind maps to a declarative [`NodeSchema`] and a handler.
//! [`Registry::invoke`] validates host inputs against the schema, fills
//! defaults and dispatches.

mod handlers;
pub mod schema;
pub mod value;

use candle_nn::VarBuilder;
use std::collections::HashMap;
use tracing::debug;

use crate::conditioning::EncodeError;
use crate::config::{ConfigError, MochiVaeConfig, check_range};
use crate::device::DeviceContext;
use crate::loader::{LoaderError, ModelLocator, ModuleOptions};
use crate::sampler::{LatentStats, MochiTransformer, SampleError};
use crate::vae::{DecodeError, VideoDecoder};

pub use schema::{CATEGORY, InputSpec, NodeKind, NodeSchema, OutputSpec, ParamKind, SocketType};
pub use value::{
    ClipHandle, MochiModel, MochiVae, ModelHandle, NodeInputs, NodeValue, TextEncoderBundle,
    VaeHandle,
};

/// Hidden width of the T5-XXL encoder.
pub const DEFAULT_TEXT_HIDDEN_SIZE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Missing required input {input:?}")]
    MissingInput { input: String },

    #[error("Unknown input {input:?} for node {node}")]
    UnknownInput { node: NodeKind, input: String },

    #[error("Input {input:?} expects {expected}, got {found}")]
    WrongType {
        input: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{0} handle is already in use")]
    HandleInUse(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Sample(#[from] SampleError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Builds a transformer from its weights.
pub type TransformerFactory =
    Box<dyn Fn(VarBuilder<'static>, &ModuleOptions) -> candle_core::Result<Box<dyn MochiTransformer>>>;

/// Builds a VAE decoder from its weights.
pub type VaeFactory =
    Box<dyn Fn(VarBuilder<'static>, &MochiVaeConfig) -> candle_core::Result<Box<dyn VideoDecoder>>>;

/// Everything node handlers need beyond their inputs.
pub struct NodeContext {
    pub devices: DeviceContext,
    pub locator: ModelLocator,
    pub transformer_factory: TransformerFactory,
    pub vae_factory: VaeFactory,
    pub vae_config: MochiVaeConfig,
    pub latent_stats: Option<LatentStats>,
    /// Width image conditioning rows are packed to.
    pub text_hidden_size: usize,
}

impl NodeContext {
    pub fn new(
        devices: DeviceContext,
        locator: ModelLocator,
        transformer_factory: TransformerFactory,
        vae_factory: VaeFactory,
    ) -> Self {
        Self {
            devices,
            locator,
            transformer_factory,
            vae_factory,
            vae_config: MochiVaeConfig::default(),
            latent_stats: None,
            text_hidden_size: DEFAULT_TEXT_HIDDEN_SIZE,
        }
    }

    pub fn with_latent_stats(mut self, stats: LatentStats) -> Self {
        self.latent_stats = Some(stats);
        self
    }

    pub fn with_text_hidden_size(mut self, hidden_size: usize) -> Self {
        self.text_hidden_size = hidden_size;
        self
    }
}

pub struct Registry {
    ctx: NodeContext,
    schemas: HashMap<NodeKind, NodeSchema>,
}

impl Registry {
    pub fn new(ctx: NodeContext) -> Self {
        let schemas = NodeKind::ALL.into_iter().map(|k| (k, k.schema())).collect();
        Self { ctx, schemas }
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut NodeContext {
        &mut self.ctx
    }

    /// Schemas of all node kinds, in declaration order.
    pub fn schemas(&self) -> Vec<&NodeSchema> {
        NodeKind::ALL.iter().filter_map(|k| self.schemas.get(k)).collect()
    }

    pub fn schema(&self, kind: NodeKind) -> Option<&NodeSchema> {
        self.schemas.get(&kind)
    }

    /// Validate `inputs`, fill defaults and run the node. Outputs follow the
    /// schema's output order.
    pub fn invoke(&self, kind: NodeKind, inputs: NodeInputs) -> Result<Vec<NodeValue>, NodeError> {
        let schema = kind.schema();
        let inputs = validate_inputs(&schema, inputs)?;
        debug!(node = %kind, "invoking node");
        handlers::dispatch(&self.ctx, kind, &inputs)
    }
}

/// Check every supplied input against `schema` and add defaults for absent
/// parameters.
pub fn validate_inputs(schema: &NodeSchema, mut inputs: NodeInputs) -> Result<NodeInputs, NodeError> {
    if let Some(unknown) = inputs.names().find(|n| schema.input(n).is_none()) {
        return Err(NodeError::UnknownInput {
            node: schema.kind,
            input: unknown.to_string(),
        });
    }

    for spec in &schema.inputs {
        if let Some(value) = inputs.get(spec.name) {
            check_value(spec, value)?;
        }
    }
    for spec in &schema.inputs {
        if inputs.contains(spec.name) {
            continue;
        }
        match default_value(&spec.kind) {
            Some(default) => inputs.insert(spec.name, default),
            None if spec.required => {
                return Err(NodeError::MissingInput {
                    input: spec.name.to_string(),
                });
            }
            None => {}
        }
    }
    Ok(inputs)
}

fn default_value(kind: &ParamKind) -> Option<NodeValue> {
    match kind {
        ParamKind::Int { default, .. } => Some(NodeValue::Int(*default)),
        ParamKind::Float { default, .. } => Some(NodeValue::Float(*default)),
        ParamKind::Bool { default } => Some(NodeValue::Bool(*default)),
        ParamKind::Choice { default, .. } => Some(NodeValue::from(*default)),
        ParamKind::String { default, .. } => Some(NodeValue::from(*default)),
        ParamKind::File { .. } | ParamKind::Socket { .. } => None,
    }
}

fn check_value(spec: &InputSpec, value: &NodeValue) -> Result<(), NodeError> {
    let wrong_type = || NodeError::WrongType {
        input: spec.name.to_string(),
        expected: spec.kind.type_name(),
        found: value.type_name(),
    };

    match (&spec.kind, value) {
        (ParamKind::Int { min, max, .. }, NodeValue::Int(v)) => {
            if v < min || v > max {
                return Err(ConfigError::OutOfRange {
                    name: spec.name.to_string(),
                    value: *v as f64,
                    min: *min as f64,
                    max: *max as f64,
                }
                .into());
            }
        }
        (ParamKind::Float { min, max, .. }, NodeValue::Float(v)) => {
            check_range(spec.name, *v, *min, *max)?;
        }
        (ParamKind::Bool { .. }, NodeValue::Bool(_)) => {}
        (ParamKind::Choice { options, .. }, NodeValue::String(v)) => {
            if !options.contains(&v.as_str()) {
                return Err(unsupported_choice(spec.name, v).into());
            }
        }
        (ParamKind::String { .. } | ParamKind::File { .. }, NodeValue::String(_)) => {}
        (ParamKind::Socket { socket }, value) if socket.as_str() == value.type_name() => {}
        _ => return Err(wrong_type()),
    }
    Ok(())
}

fn unsupported_choice(name: &'static str, value: &str) -> ConfigError {
    match name {
        "precision" => ConfigError::UnsupportedPrecision(value.to_string()),
        _ => ConfigError::UnsupportedOption {
            name,
            value: value.to_string(),
        },
    }
}
