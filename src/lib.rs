//! Candle-Mochi: Mochi video diffusion nodes for the Candle framework.
//!
//! This crate provides the glue around the Mochi preview networks: weight
//! loading, text and image conditioning, the linear-quadratic sampler and a
//! memory-bounded tiled VAE decode, exposed as a registry of graph nodes.
//! The networks themselves are reached through capability traits
//! ([`sampler::MochiTransformer`], [`vae::VideoDecoder`],
//! [`text_encoder::TextEncoder`]).

pub mod conditioning;
pub mod config;
pub mod device;
pub mod loader;
pub mod nodes;
pub mod sampler;
pub mod scheduler;
pub mod text_encoder;
pub mod utils;
pub mod vae;

pub use conditioning::{Conditioning, EncodeError};
pub use config::{ConfigError, GenerationConfig, MochiVaeConfig, Precision};
pub use device::DeviceContext;
pub use loader::{LoaderError, ModelLocator, WeightLoader};
pub use nodes::{NodeContext, NodeError, NodeKind, NodeValue, Registry};
pub use sampler::{MochiSampler, MochiTransformer, SampleError};
pub use scheduler::{ScheduleError, linear_quadratic_schedule};
pub use vae::{DecodeError, SpatialTiling, TiledDecodeOptions, TiledDecoder, VideoDecoder};
