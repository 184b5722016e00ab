//! Model file resolution
//!
//! A model id is either a HuggingFace Hub repository
//! (`black-forest-labs/FLUX.1-schnell`) or a local directory with the same
//! layout. Hub files are cached by `hf-hub`; local files are only checked for
//! existence.

use anyhow::{Context, Result};
use hf_hub::api::tokio::{ApiBuilder, ApiRepo};
use hf_hub::{Cache, Repo};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{classify_load_error, FluxGenError};

const AUTOENCODER_FILE: &str = "ae.safetensors";
const CLIP_WEIGHTS_FILE: &str = "text_encoder/model.safetensors";
const CLIP_VOCAB_FILE: &str = "tokenizer/vocab.json";
const CLIP_MERGES_FILE: &str = "tokenizer/merges.txt";
const T5_CONFIG_FILE: &str = "text_encoder_2/config.json";
const T5_INDEX_FILE: &str = "text_encoder_2/model.safetensors.index.json";
const T5_TOKENIZER_FILE: &str = "tokenizer_2/tokenizer.json";

/// FLUX.1 release the weights belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    /// Timestep-distilled, few steps, no guidance embedding
    Schnell,
    /// Guidance-distilled, shifted schedule
    Dev,
}

impl ModelVariant {
    /// Infer the variant from a model id; anything not naming schnell is dev
    pub fn from_model_id(model_id: &str) -> Self {
        if model_id.to_lowercase().contains("schnell") {
            Self::Schnell
        } else {
            Self::Dev
        }
    }

    pub fn transformer_file(&self) -> &'static str {
        match self {
            Self::Schnell => "flux1-schnell.safetensors",
            Self::Dev => "flux1-dev.safetensors",
        }
    }
}

/// Paths to every file the pipeline loads
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub variant: ModelVariant,
    pub transformer: PathBuf,
    pub autoencoder: PathBuf,
    pub clip_weights: PathBuf,
    pub t5_config: PathBuf,
    pub t5_weights: Vec<PathBuf>,
    pub t5_tokenizer: PathBuf,
    /// Directory with `vocab.json` + `merges.txt`
    pub clip_tokenizer_dir: PathBuf,
}

enum Source {
    Hub(Box<ApiRepo>),
    Local(PathBuf),
}

/// Resolves model files from the Hub or a local directory
pub struct ModelDownloader {
    model_id: String,
    source: Source,
}

impl ModelDownloader {
    /// Create a resolver for `model_id`.
    ///
    /// An existing directory is used as is; anything else is treated as a Hub
    /// repository, authenticated with `hf_token` or else the token saved by
    /// `huggingface-cli login`.
    pub fn new(model_id: &str, hf_token: Option<String>) -> Result<Self> {
        let local = Path::new(model_id);
        let source = if local.is_dir() {
            info!(path = %local.display(), "Using local model directory");
            Source::Local(local.to_path_buf())
        } else {
            let cache = Cache::default();
            let token = hub_token(hf_token, &cache);
            let api = ApiBuilder::from_cache(cache)
                .with_token(token)
                .build()
                .context("Failed to create HuggingFace API client")?;
            Source::Hub(Box::new(api.repo(Repo::model(model_id.to_string()))))
        };

        Ok(Self {
            model_id: model_id.to_string(),
            source,
        })
    }

    /// Resolve every file, downloading what is missing from the cache.
    ///
    /// Authentication failures come back as [`FluxGenError::Unauthorized`].
    pub async fn download_all(&self) -> Result<ModelFiles> {
        let result = self.resolve_all().await;
        match self.source {
            Source::Hub(_) => result.map_err(|e| classify_load_error(&self.model_id, e)),
            Source::Local(_) => result,
        }
    }

    async fn resolve_all(&self) -> Result<ModelFiles> {
        let variant = ModelVariant::from_model_id(&self.model_id);
        info!(model_id = %self.model_id, variant = ?variant, "Resolving model files");

        let (transformer, autoencoder, clip_weights, t5_config, t5_tokenizer, clip_vocab, _merges) = tokio::try_join!(
            self.get(variant.transformer_file()),
            self.get(AUTOENCODER_FILE),
            self.get(CLIP_WEIGHTS_FILE),
            self.get(T5_CONFIG_FILE),
            self.get(T5_TOKENIZER_FILE),
            self.get(CLIP_VOCAB_FILE),
            self.get(CLIP_MERGES_FILE),
        )?;
        let t5_weights = self.t5_shards().await?;

        let clip_tokenizer_dir = clip_vocab
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Could not determine tokenizer directory"))?
            .to_path_buf();

        info!("✓ All model files available");

        Ok(ModelFiles {
            variant,
            transformer,
            autoencoder,
            clip_weights,
            t5_config,
            t5_weights,
            t5_tokenizer,
            clip_tokenizer_dir,
        })
    }

    /// The T5 encoder is sharded; the index lists the shard files
    async fn t5_shards(&self) -> Result<Vec<PathBuf>> {
        let index_path = self.get(T5_INDEX_FILE).await?;
        let index = std::fs::read_to_string(&index_path)
            .with_context(|| format!("Failed to read {}", index_path.display()))?;
        let shards = shard_files(&index)?;

        let mut paths = Vec::with_capacity(shards.len());
        for shard in shards {
            paths.push(self.get(&format!("text_encoder_2/{shard}")).await?);
        }
        Ok(paths)
    }

    async fn get(&self, file: &str) -> Result<PathBuf> {
        match &self.source {
            Source::Local(dir) => {
                let path = dir.join(file);
                if !path.exists() {
                    return Err(FluxGenError::MissingModelFile(path).into());
                }
                Ok(path)
            }
            Source::Hub(repo) => {
                let path = repo
                    .get(file)
                    .await
                    .with_context(|| format!("Failed to download {} from {}", file, self.model_id))?;
                info!("  ✓ {}", file);
                Ok(path)
            }
        }
    }
}

/// An explicit token wins over the one stored next to the Hub cache
fn hub_token(explicit: Option<String>, cache: &Cache) -> Option<String> {
    explicit.or_else(|| cache.token())
}

/// Distinct shard file names from a safetensors index, in sorted order
fn shard_files(index_json: &str) -> Result<Vec<String>> {
    let index: serde_json::Value = serde_json::from_str(index_json)?;
    let weight_map = index
        .get("weight_map")
        .and_then(|m| m.as_object())
        .ok_or_else(|| anyhow::anyhow!("safetensors index has no weight_map"))?;

    let shards: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    if shards.is_empty() {
        anyhow::bail!("safetensors index lists no shards");
    }
    Ok(shards.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_from_model_id() {
        assert_eq!(
            ModelVariant::from_model_id("black-forest-labs/FLUX.1-schnell"),
            ModelVariant::Schnell
        );
        assert_eq!(
            ModelVariant::from_model_id("black-forest-labs/FLUX.1-dev"),
            ModelVariant::Dev
        );
        assert_eq!(ModelVariant::Dev.transformer_file(), "flux1-dev.safetensors");
    }

    #[test]
    fn test_shard_files() {
        let index = r#"{
            "metadata": {"total_size": 9524621312},
            "weight_map": {
                "encoder.block.0.layer.0.SelfAttention.k.weight": "model-00001-of-00002.safetensors",
                "encoder.final_layer_norm.weight": "model-00002-of-00002.safetensors",
                "shared.weight": "model-00001-of-00002.safetensors"
            }
        }"#;
        assert_eq!(
            shard_files(index).unwrap(),
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string()
            ]
        );
        assert!(shard_files(r#"{"metadata": {}}"#).is_err());
    }

    #[test]
    fn test_hub_token_falls_back_to_saved_login() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = Cache::new(tmp.path().join("hub"));
        assert_eq!(hub_token(None, &cache), None);

        std::fs::write(tmp.path().join("token"), "hf_saved\n").unwrap();
        assert_eq!(hub_token(None, &cache).as_deref(), Some("hf_saved"));
        assert_eq!(
            hub_token(Some("hf_env".to_string()), &cache).as_deref(),
            Some("hf_env")
        );
    }

    fn touch(dir: &Path, file: &str, contents: &str) {
        let path = dir.join(file);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn test_local_directory_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("FLUX.1-schnell");
        for file in [
            "flux1-schnell.safetensors",
            AUTOENCODER_FILE,
            CLIP_WEIGHTS_FILE,
            CLIP_VOCAB_FILE,
            CLIP_MERGES_FILE,
            T5_CONFIG_FILE,
            T5_TOKENIZER_FILE,
            "text_encoder_2/model-00001-of-00001.safetensors",
        ] {
            touch(&root, file, "");
        }
        touch(
            &root,
            T5_INDEX_FILE,
            r#"{"weight_map": {"shared.weight": "model-00001-of-00001.safetensors"}}"#,
        );

        let downloader = ModelDownloader::new(root.to_str().unwrap(), None).unwrap();
        let files = downloader.download_all().await.unwrap();

        assert_eq!(files.variant, ModelVariant::Schnell);
        assert_eq!(files.transformer, root.join("flux1-schnell.safetensors"));
        assert_eq!(files.clip_tokenizer_dir, root.join("tokenizer"));
        assert_eq!(files.t5_weights.len(), 1);
    }

    #[tokio::test]
    async fn test_local_directory_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = ModelDownloader::new(tmp.path().to_str().unwrap(), None).unwrap();
        let err = downloader.download_all().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FluxGenError>(),
            Some(FluxGenError::MissingModelFile(_))
        ));
    }
}
