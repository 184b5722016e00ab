//! Model loading for the FLUX pipeline components
//!
//! - T5-XXL text encoder (sequence conditioning)
//! - CLIP text encoder (pooled conditioning)
//! - FLUX transformer, memory-mapped or rebuilt from LoRA-fused weights
//! - FLUX autoencoder (encode for reference images, decode for output)

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{clip, flux, t5};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokenizers::decoders::bpe::BPEDecoder;
use tokenizers::models::bpe::BPE;
use tokenizers::normalizers::{Lowercase, Sequence as NormalizerSequence, NFC};
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::pre_tokenizers::sequence::Sequence as PreTokenizerSequence;
use tokenizers::pre_tokenizers::split::{Split, SplitPattern};
use tokenizers::processors::template::TemplateProcessing;
use tokenizers::{AddedToken, SplitDelimiterBehavior, Tokenizer};
use tracing::info;

use crate::download::ModelVariant;
use crate::lora::LoraAdapter;

/// FLUX reads 256 T5 tokens
pub const T5_MAX_TOKENS: usize = 256;
/// CLIP context length
pub const CLIP_MAX_TOKENS: usize = 77;
const CLIP_BOS: u32 = 49406;
const CLIP_EOS: u32 = 49407;
const CLIP_END_OF_WORD: &str = "</w>";
/// Words, single digits and punctuation runs; everything else is dropped
const CLIP_WORD_PATTERN: &str =
    r"<\|startoftext\|>|<\|endoftext\|>|'s|'t|'re|'ve|'m|'ll|'d|[\p{L}]+|[\p{N}]|[^\s\p{L}\p{N}]+";

/// T5 text encoder (main text conditioning)
pub struct T5TextEncoder {
    model: t5::T5EncoderModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl T5TextEncoder {
    /// Load T5 from its HF config and (possibly sharded) safetensors weights
    pub fn load(
        config_path: &Path,
        weight_paths: &[PathBuf],
        tokenizer_path: &Path,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        info!(shards = weight_paths.len(), device = ?device, "Loading T5-XXL encoder");

        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| {
            anyhow::anyhow!("Failed to load T5 tokenizer from {:?}: {}", tokenizer_path, e)
        })?;

        let config = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read T5 config: {}", config_path.display()))?;
        let config: t5::Config = serde_json::from_str(&config)?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weight_paths, dtype, device)? };
        let model = t5::T5EncoderModel::load(vb, &config)?;

        info!("✓ T5 encoder loaded");

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
        })
    }

    /// Encode a prompt to `[1, 256, d_model]`
    pub fn encode(&mut self, prompt: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;

        let tokens = fit_t5_tokens(encoding.get_ids().to_vec());
        let token_ids = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;

        Ok(self.model.forward(&token_ids)?)
    }
}

/// Pad with 0 or truncate to [`T5_MAX_TOKENS`]
fn fit_t5_tokens(mut tokens: Vec<u32>) -> Vec<u32> {
    tokens.resize(T5_MAX_TOKENS, 0);
    tokens
}

/// CLIP text encoder (pooled conditioning vector)
pub struct ClipTextEncoder {
    model: clip::text_model::ClipTextTransformer,
    tokenizer: Tokenizer,
    device: Device,
}

impl ClipTextEncoder {
    /// Load CLIP ViT-L from `text_encoder/model.safetensors`
    ///
    /// `tokenizer_dir` holds `vocab.json` and `merges.txt`.
    pub fn load(model_path: &Path, tokenizer_dir: &Path, dtype: DType, device: &Device) -> Result<Self> {
        info!(path = %model_path.display(), device = ?device, "Loading CLIP encoder");

        let tokenizer = load_clip_tokenizer(tokenizer_dir)?;

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_path], dtype, device)? };

        let config = clip::text_model::ClipTextConfig {
            vocab_size: 49408,
            embed_dim: 768,
            activation: clip::text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            max_position_embeddings: CLIP_MAX_TOKENS,
            pad_with: Some("<|endoftext|>".to_string()),
            num_hidden_layers: 12,
            num_attention_heads: 12,
            projection_dim: 768,
        };
        let model = clip::text_model::ClipTextTransformer::new(vb.pp("text_model"), &config)?;

        info!("✓ CLIP encoder loaded");

        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
        })
    }

    /// Pooled embedding `[1, 768]` taken at the end-of-text token
    pub fn encode(&self, prompt: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;
        let tokens = encoding.get_ids().to_vec();

        if tokens.len() != CLIP_MAX_TOKENS {
            anyhow::bail!(
                "CLIP tokenization produced {} tokens, expected {}",
                tokens.len(),
                CLIP_MAX_TOKENS
            );
        }
        let eot_position = eot_position(&tokens);

        let token_ids = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
        let hidden_states = self.model.forward_with_mask(&token_ids, usize::MAX)?;

        Ok(hidden_states.i((0, eot_position))?.unsqueeze(0)?)
    }
}

/// First end-of-text token, or the last position
fn eot_position(tokens: &[u32]) -> usize {
    tokens
        .iter()
        .position(|&t| t == CLIP_EOS)
        .unwrap_or(tokens.len().saturating_sub(1))
}

/// CLIP BPE tokenizer from `vocab.json` + `merges.txt`, padded and truncated to 77
///
/// Text is NFC-normalized and lowercased, split into words, and every word
/// ends in `</w>` before BPE merges run.
fn load_clip_tokenizer(tokenizer_dir: &Path) -> Result<Tokenizer> {
    let vocab_path = tokenizer_dir.join("vocab.json");
    let merges_path = tokenizer_dir.join("merges.txt");

    if !vocab_path.exists() || !merges_path.exists() {
        anyhow::bail!(
            "BPE tokenizer requires vocab.json and merges.txt in {}",
            tokenizer_dir.display()
        );
    }

    let bpe = BPE::from_file(&vocab_path.to_string_lossy(), &merges_path.to_string_lossy())
        .end_of_word_suffix(CLIP_END_OF_WORD.to_string())
        .unk_token("<|endoftext|>".to_string())
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build BPE tokenizer: {}", e))?;

    let words = Split::new(
        SplitPattern::Regex(CLIP_WORD_PATTERN.to_string()),
        SplitDelimiterBehavior::Removed,
        true,
    )
    .map_err(|e| anyhow::anyhow!("Invalid CLIP word pattern: {}", e))?;

    let mut tokenizer = Tokenizer::new(bpe);
    tokenizer
        .with_normalizer(Some(NormalizerSequence::new(vec![NFC.into(), Lowercase.into()])))
        .with_pre_tokenizer(Some(PreTokenizerSequence::new(vec![
            words.into(),
            ByteLevel::new(false, true, false).into(),
        ])))
        .with_decoder(Some(BPEDecoder::new(CLIP_END_OF_WORD.to_string())));
    tokenizer.add_special_tokens(&[
        AddedToken::from("<|startoftext|>", true),
        AddedToken::from("<|endoftext|>", true),
    ]);

    let processor = TemplateProcessing::builder()
        .try_single("<|startoftext|> $A <|endoftext|>")
        .map_err(|e| anyhow::anyhow!("Template processing failed: {}", e))?
        .special_tokens(vec![("<|startoftext|>", CLIP_BOS), ("<|endoftext|>", CLIP_EOS)])
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build processor: {}", e))?;
    tokenizer.with_post_processor(Some(processor));

    tokenizer.with_padding(Some(tokenizers::PaddingParams {
        strategy: tokenizers::PaddingStrategy::Fixed(CLIP_MAX_TOKENS),
        pad_id: CLIP_EOS,
        pad_token: "<|endoftext|>".to_string(),
        ..Default::default()
    }));
    tokenizer
        .with_truncation(Some(tokenizers::TruncationParams {
            max_length: CLIP_MAX_TOKENS,
            ..Default::default()
        }))
        .map_err(|e| anyhow::anyhow!("Failed to set truncation: {}", e))?;

    Ok(tokenizer)
}

/// FLUX autoencoder
pub struct Autoencoder {
    model: flux::autoencoder::AutoEncoder,
}

impl Autoencoder {
    /// Load from `ae.safetensors`
    pub fn load(model_path: &Path, variant: ModelVariant, dtype: DType, device: &Device) -> Result<Self> {
        info!(path = %model_path.display(), "Loading autoencoder");

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[model_path], dtype, device)? };
        let config = match variant {
            ModelVariant::Schnell => flux::autoencoder::Config::schnell(),
            ModelVariant::Dev => flux::autoencoder::Config::dev(),
        };
        let model = flux::autoencoder::AutoEncoder::new(&config, vb)?;

        info!("✓ Autoencoder loaded");
        Ok(Self { model })
    }

    /// `[1, 3, H, W]` image in [-1, 1] to `[1, 16, H/8, W/8]` latents
    pub fn encode(&self, image: &Tensor) -> Result<Tensor> {
        Ok(self.model.encode(image)?)
    }

    /// `[1, 16, H/8, W/8]` latents to `[1, 3, H, W]` in [-1, 1]
    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        Ok(self.model.decode(latents)?)
    }
}

/// FLUX transformer
pub struct FluxTransformer {
    model: flux::model::Flux,
}

impl FluxTransformer {
    /// Load the transformer, fusing `loras` into its weights first.
    ///
    /// Without adapters the weights are memory-mapped. With adapters every
    /// tensor is read onto `device`, fused in order, and the model is built
    /// from the fused map.
    pub fn load(
        weights_path: &Path,
        variant: ModelVariant,
        loras: &[(LoraAdapter, f32)],
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        info!(
            path = %weights_path.display(),
            variant = ?variant,
            dtype = ?dtype,
            lora_count = loras.len(),
            "Loading FLUX transformer"
        );

        let config = match variant {
            ModelVariant::Schnell => flux::model::Config::schnell(),
            ModelVariant::Dev => flux::model::Config::dev(),
        };

        let vb = if loras.is_empty() {
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)? }
        } else {
            let mut weights: HashMap<String, Tensor> =
                candle_core::safetensors::load(weights_path, device).with_context(|| {
                    format!("Failed to read transformer weights: {}", weights_path.display())
                })?;
            for (adapter, strength) in loras {
                adapter.fuse_into(&mut weights, *strength).map_err(|e| {
                    crate::error::FluxGenError::LoraApplication {
                        path: adapter.path.clone(),
                        reason: format!("{e:#}"),
                    }
                })?;
            }
            VarBuilder::from_tensors(weights, dtype, device)
        };

        let model = flux::model::Flux::new(&config, vb)?;
        info!("✓ FLUX transformer loaded");
        Ok(Self { model })
    }

    pub fn model(&self) -> &flux::model::Flux {
        &self.model
    }
}
