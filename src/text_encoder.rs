//! Text conditioning
//!
//! - [`Tokenizer`] / [`TextEncoder`] capabilities the text node calls through
//! - [`HfTokenizer`]: adapter over a `tokenizers` T5 tokenizer
//! - [`T5Encoder`]: adapter over `candle-transformers`' T5 encoder
//! - [`encode_text`]: tokenize, pad to 256, encode, scale by strength

use candle_core::{DType, Device, Result, Tensor};
use candle_transformers::models::t5;
use std::path::Path;
use tracing::{debug, info};

use crate::conditioning::{Conditioning, EncodeError};
use crate::device::DeviceContext;
use crate::loader::{LoaderError, WeightLoader, load_model_config};

/// Maximum prompt length accepted by the Mochi transformer.
pub const MAX_PROMPT_TOKENS: usize = 256;

pub trait Tokenizer {
    /// Token ids of `text`, including any end-of-sequence token.
    fn tokenize(&self, text: &str) -> std::result::Result<Vec<u32>, EncodeError>;

    fn pad_token_id(&self) -> u32 {
        0
    }
}

pub trait TextEncoder {
    /// Hidden states `[B, L, D]` for `input_ids` `[B, L]`.
    fn encode(&mut self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    fn hidden_size(&self) -> usize;

    /// Move the weights to `device`. Encoders that cannot move keep their
    /// placement.
    fn move_to(&mut self, _device: &Device) -> Result<()> {
        Ok(())
    }
}

/// Options of the text encode node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextEncodeOptions {
    pub strength: f64,
    pub force_offload: bool,
}

impl Default for TextEncodeOptions {
    fn default() -> Self {
        Self {
            strength: 1.0,
            force_offload: true,
        }
    }
}

/// Encode `prompt` into a padded 256-position conditioning bundle.
///
/// Fails with [`EncodeError::PromptTooLong`] before touching the encoder
/// when the prompt has more than 256 tokens.
pub fn encode_text(
    tokenizer: &dyn Tokenizer,
    encoder: &mut dyn TextEncoder,
    prompt: &str,
    options: &TextEncodeOptions,
    ctx: &DeviceContext,
) -> std::result::Result<Conditioning, EncodeError> {
    let tokens = tokenizer.tokenize(prompt)?;
    if tokens.len() > MAX_PROMPT_TOKENS {
        return Err(EncodeError::PromptTooLong {
            tokens: tokens.len(),
            max: MAX_PROMPT_TOKENS,
        });
    }
    debug!(tokens = tokens.len(), "tokenized prompt");

    let mut ids = tokens.clone();
    ids.resize(MAX_PROMPT_TOKENS, tokenizer.pad_token_id());
    let mut mask = vec![1u8; tokens.len()];
    mask.resize(MAX_PROMPT_TOKENS, 0);

    let device = &ctx.text_encoder;
    let input_ids = Tensor::from_vec(ids, (1, MAX_PROMPT_TOKENS), device)?;
    let attention_mask = Tensor::from_vec(mask, (1, MAX_PROMPT_TOKENS), device)?;

    encoder.move_to(device)?;
    let encoded = encoder.encode(&input_ids, &attention_mask);
    if options.force_offload {
        encoder.move_to(&ctx.offload)?;
    }
    let embeds = encoded?.affine(options.strength, 0.0)?;
    Conditioning::new(embeds, attention_mask)
}

// =============================================================================
// Tokenizer adapter
// =============================================================================

pub struct HfTokenizer {
    tokenizer: tokenizers::Tokenizer,
    pad_id: u32,
}

impl HfTokenizer {
    /// Wrap `tokenizer` with its truncation and padding turned off, so the
    /// prompt length check sees every token.
    pub fn new(mut tokenizer: tokenizers::Tokenizer) -> std::result::Result<Self, EncodeError> {
        let pad_id = tokenizer.get_padding().map_or(0, |p| p.pad_id);
        tokenizer
            .with_truncation(None)
            .map_err(|e| EncodeError::Tokenizer(e.to_string()))?;
        tokenizer.with_padding(None);
        Ok(Self { tokenizer, pad_id })
    }

    pub fn from_file(path: impl AsRef<Path>) -> std::result::Result<Self, EncodeError> {
        let tokenizer = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| EncodeError::Tokenizer(e.to_string()))?;
        Self::new(tokenizer)
    }
}

impl Tokenizer for HfTokenizer {
    fn tokenize(&self, text: &str) -> std::result::Result<Vec<u32>, EncodeError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EncodeError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_id
    }
}

// =============================================================================
// T5 encoder adapter
// =============================================================================

/// T5-XXL encoder from `candle-transformers`. Padded positions are zeroed in
/// the output since the model itself attends over the full sequence.
pub struct T5Encoder {
    model: t5::T5EncoderModel,
    hidden_size: usize,
    device: Device,
    dtype: DType,
}

impl T5Encoder {
    /// Load `model.safetensors` weights with the `config.json` next to them.
    pub fn load(
        weights: impl AsRef<Path>,
        config: impl AsRef<Path>,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, LoaderError> {
        let config: t5::Config = load_model_config(config)?;
        let loaded = WeightLoader::new(device.clone(), dtype)
            .load_module(weights, |vb| t5::T5EncoderModel::load(vb, &config))?;
        info!(d_model = config.d_model, layers = config.num_layers, "Loaded T5 encoder");
        Ok(Self {
            model: loaded.module,
            hidden_size: config.d_model,
            device: loaded.device,
            dtype,
        })
    }
}

impl TextEncoder for T5Encoder {
    fn encode(&mut self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let input_ids = input_ids.to_device(&self.device)?;
        let hidden = self.model.forward(&input_ids)?;
        let mask = attention_mask
            .to_device(&self.device)?
            .to_dtype(hidden.dtype())?
            .unsqueeze(2)?;
        hidden.broadcast_mul(&mask)?.to_dtype(self.dtype)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WordTokenizer;

    impl Tokenizer for WordTokenizer {
        fn tokenize(&self, text: &str) -> std::result::Result<Vec<u32>, EncodeError> {
            Ok(text.split_whitespace().map(|_| 5).collect())
        }
    }

    struct OnesEncoder {
        calls: usize,
    }

    impl TextEncoder for OnesEncoder {
        fn encode(&mut self, input_ids: &Tensor, _mask: &Tensor) -> Result<Tensor> {
            self.calls += 1;
            let (b, l) = input_ids.dims2()?;
            Tensor::ones((b, l, 4), DType::F32, input_ids.device())
        }

        fn hidden_size(&self) -> usize {
            4
        }
    }

    #[test]
    fn prompt_is_padded_and_scaled() {
        let mut encoder = OnesEncoder { calls: 0 };
        let options = TextEncodeOptions {
            strength: 0.5,
            force_offload: true,
        };
        let cond = encode_text(
            &WordTokenizer,
            &mut encoder,
            "a cat on a mat",
            &options,
            &DeviceContext::cpu(),
        )
        .unwrap();
        assert_eq!(cond.embeds.dims(), &[1, 256, 4]);
        assert_eq!(cond.valid_tokens().unwrap(), vec![5]);
        let first = cond.embeds.get(0).unwrap().get(0).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(first, vec![0.5; 4]);
    }

    #[test]
    fn long_prompt_fails_before_encoding() {
        let mut encoder = OnesEncoder { calls: 0 };
        let prompt = vec!["w"; 257].join(" ");
        let err = encode_text(
            &WordTokenizer,
            &mut encoder,
            &prompt,
            &TextEncodeOptions::default(),
            &DeviceContext::cpu(),
        )
        .unwrap_err();
        assert!(matches!(err, EncodeError::PromptTooLong { tokens: 257, max: 256 }));
        assert_eq!(encoder.calls, 0);
    }

    struct LongEncoder;

    impl TextEncoder for LongEncoder {
        fn encode(&mut self, input_ids: &Tensor, _mask: &Tensor) -> Result<Tensor> {
            Tensor::ones((input_ids.dim(0)?, 300, 4), DType::F32, input_ids.device())
        }

        fn hidden_size(&self) -> usize {
            4
        }
    }

    #[test]
    fn encoder_length_mismatch_is_a_shape_error() {
        let err = encode_text(
            &WordTokenizer,
            &mut LongEncoder,
            "a cat",
            &TextEncodeOptions::default(),
            &DeviceContext::cpu(),
        )
        .unwrap_err();
        assert!(matches!(err, EncodeError::ShapeMismatch(_)));
    }

    const TRUNCATING_TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": {"direction": "Right", "max_length": 4, "strategy": "LongestFirst", "stride": 0},
        "padding": {"strategy": {"Fixed": 8}, "direction": "Right", "pad_to_multiple_of": null,
                    "pad_id": 3, "pad_type_id": 0, "pad_token": "<pad>"},
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "WhitespaceSplit"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": {"<unk>": 0, "w": 2, "<pad>": 3}, "unk_token": "<unk>"}
    }"#;

    #[test]
    fn hf_tokenizer_ignores_file_truncation_and_padding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        std::fs::write(&path, TRUNCATING_TOKENIZER).unwrap();

        let tokenizer = HfTokenizer::from_file(&path).unwrap();
        assert_eq!(tokenizer.tokenize("w w w w w w").unwrap(), vec![2; 6]);
        assert_eq!(tokenizer.pad_token_id(), 3);

        let prompt = vec!["w"; 257].join(" ");
        let err = encode_text(
            &tokenizer,
            &mut OnesEncoder { calls: 0 },
            &prompt,
            &TextEncodeOptions::default(),
            &DeviceContext::cpu(),
        )
        .unwrap_err();
        assert!(matches!(err, EncodeError::PromptTooLong { tokens: 257, .. }));
    }
}
