//! LoRA (Low-Rank Adaptation) adapter loading and weight fusion
//!
//! A LoRA adapter stores a pair of low-rank matrices per targeted layer.
//! Fusing folds them into the base weight once, before the transformer is
//! built: W' = W + strength * (alpha / rank) * (B @ A)
//!
//! Adapters in Kohya naming (`lora_unet_double_blocks_0_img_attn_qkv`), the
//! native FLUX naming (`double_blocks.0.img_attn.qkv`, optionally behind a
//! `diffusion_model.` or `transformer.` prefix) and the diffusers/PEFT naming
//! (`transformer_blocks.0.attn.to_q`) are understood. Diffusers keeps q, k and
//! v as separate layers; their deltas land in row chunks of the fused FLUX
//! `qkv` / `linear1` weights.

use anyhow::{Context, Result};
use candle_core::safetensors::Load;
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Individual LoRA weight pair for a single layer
#[derive(Debug)]
pub struct LoraWeight {
    /// Transformer weight rows this pair applies to
    pub target: LoraTarget,
    /// Down projection (A) [rank, in_features]
    pub lora_down: Tensor,
    /// Up projection (B) [out_features, rank]
    pub lora_up: Tensor,
    pub alpha: f32,
    pub rank: usize,
}

impl LoraWeight {
    /// strength * (alpha / rank) * (up @ down), in F32
    pub fn delta(&self, strength: f32) -> Result<Tensor> {
        let scale = (self.alpha / self.rank as f32) * strength;
        let up = self.lora_up.to_dtype(DType::F32)?;
        let down = self.lora_down.to_dtype(DType::F32)?;
        Ok((up.matmul(&down)? * scale as f64)?)
    }
}

/// Rows of a FLUX weight a LoRA pair updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WeightSlice {
    /// The whole weight
    Full,
    /// The n-th block of delta-sized rows (q, k, v of a fused projection)
    Chunk(usize),
    /// The last delta-sized rows (MLP input of `single_blocks.N.linear1`)
    Tail,
    /// The whole weight with its two row halves swapped
    /// (diffusers stores the final modulation as scale, shift)
    SwappedHalves,
}

/// FLUX transformer layer plus the rows a pair updates
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoraTarget {
    /// e.g. "double_blocks.0.img_attn.qkv"
    pub layer: String,
    pub slice: WeightSlice,
}

impl LoraTarget {
    pub fn full(layer: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            slice: WeightSlice::Full,
        }
    }
}

/// Place a delta computed for `slice` into a zero delta of `base_dims`
pub fn expand_delta(delta: &Tensor, slice: WeightSlice, base_dims: &[usize]) -> Result<Tensor> {
    let (rows, cols) = delta.dims2()?;
    let (base_rows, base_cols) = match base_dims {
        [r, c] => (*r, *c),
        _ => anyhow::bail!("LoRA target weight is not 2-D: {:?}", base_dims),
    };
    if cols != base_cols {
        anyhow::bail!(
            "LoRA delta has {} input features, weight has {}",
            cols,
            base_cols
        );
    }

    let offset = match slice {
        WeightSlice::Full | WeightSlice::SwappedHalves => 0,
        WeightSlice::Chunk(index) => index * rows,
        WeightSlice::Tail => base_rows.saturating_sub(rows),
    };
    let fits = match slice {
        WeightSlice::Full | WeightSlice::SwappedHalves => rows == base_rows,
        WeightSlice::Chunk(_) | WeightSlice::Tail => offset + rows <= base_rows,
    };
    if !fits {
        anyhow::bail!(
            "LoRA delta [{rows}, {cols}] does not fit {slice:?} of weight {:?}",
            base_dims
        );
    }

    let delta = match slice {
        WeightSlice::SwappedHalves => {
            if rows % 2 != 0 {
                anyhow::bail!("cannot swap halves of {rows} rows");
            }
            let half = rows / 2;
            Tensor::cat(&[delta.narrow(0, half, half)?, delta.narrow(0, 0, half)?], 0)?
        }
        _ => delta.clone(),
    };
    Ok(delta.pad_with_zeros(0, offset, base_rows - offset - rows)?)
}

/// PEFT `adapter_config.json`, only the fields that affect fusion
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeftConfig {
    pub r: Option<usize>,
    pub lora_alpha: Option<f32>,
}

impl PeftConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read LoRA config: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse LoRA config: {}", path.display()))
    }
}

/// LoRA adapter containing all weights for a fine-tuned model
#[derive(Debug)]
pub struct LoraAdapter {
    pub name: String,
    pub path: PathBuf,
    /// Weight pairs keyed by the transformer rows they update
    pub weights: HashMap<LoraTarget, LoraWeight>,
    /// Adapter layers with no counterpart in the FLUX transformer
    pub skipped: Vec<String>,
}

impl LoraAdapter {
    /// Load a LoRA adapter from a safetensors file
    ///
    /// Alpha per layer comes from the `.alpha` tensor when present, then from
    /// `peft.lora_alpha`, then defaults to the rank.
    pub fn load<P: AsRef<Path>>(path: P, peft: Option<&PeftConfig>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading LoRA adapter");

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("lora")
            .to_string();

        let file_data = std::fs::read(path)
            .with_context(|| format!("Failed to read LoRA file: {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&file_data)
            .with_context(|| format!("Failed to parse safetensors: {}", path.display()))?;

        let mut alpha_values: HashMap<LoraTarget, f32> = HashMap::new();
        let mut down_tensors: HashMap<LoraTarget, Tensor> = HashMap::new();
        let mut up_tensors: HashMap<LoraTarget, Tensor> = HashMap::new();
        let mut skipped = Vec::new();

        for (key, view) in tensors.tensors() {
            let Some((base_name, role)) = split_lora_key(&key) else {
                debug!(key = %key, "Ignoring non-LoRA tensor");
                continue;
            };
            let Some(target) = lora_target(base_name) else {
                skipped.push(base_name.to_string());
                continue;
            };

            let tensor = view
                .load(device)
                .with_context(|| format!("Failed to load tensor: {}", key))?;

            match role {
                LoraRole::Alpha => {
                    let alpha = tensor
                        .to_dtype(DType::F32)?
                        .to_device(&Device::Cpu)?
                        .flatten_all()?
                        .get(0)?
                        .to_scalar::<f32>()?;
                    alpha_values.insert(target, alpha);
                }
                LoraRole::Down => {
                    down_tensors.insert(target, tensor);
                }
                LoraRole::Up => {
                    up_tensors.insert(target, tensor);
                }
            }
        }

        skipped.sort();
        skipped.dedup();
        if !skipped.is_empty() {
            warn!(
                count = skipped.len(),
                first = %skipped[0],
                "LoRA layers without a FLUX transformer counterpart will be skipped"
            );
        }

        let config_alpha = peft.and_then(|c| c.lora_alpha);
        let mut weights = HashMap::new();

        for (target, lora_down) in down_tensors {
            let Some(lora_up) = up_tensors.remove(&target) else {
                warn!(layer = %target.layer, "LoRA down tensor without matching up tensor");
                continue;
            };

            let (rank, _) = lora_down
                .dims2()
                .with_context(|| format!("LoRA down weight for {} is not 2-D", target.layer))?;
            if rank == 0 {
                anyhow::bail!("LoRA weight for {} has rank 0", target.layer);
            }
            if let Some(r) = peft.and_then(|c| c.r) {
                if r != rank {
                    warn!(layer = %target.layer, config_rank = r, tensor_rank = rank, "LoRA rank mismatch");
                }
            }
            let alpha = alpha_values
                .get(&target)
                .copied()
                .or(config_alpha)
                .unwrap_or(rank as f32);

            debug!(layer = %target.layer, slice = ?target.slice, rank, alpha, "Loaded LoRA weight pair");

            weights.insert(
                target.clone(),
                LoraWeight {
                    target,
                    lora_down,
                    lora_up,
                    alpha,
                    rank,
                },
            );
        }

        for target in up_tensors.keys() {
            warn!(layer = %target.layer, "LoRA up tensor without matching down tensor");
        }

        info!(
            name = %name,
            weight_pairs = weights.len(),
            "✓ LoRA adapter loaded"
        );

        Ok(Self {
            name,
            path: path.to_path_buf(),
            weights,
            skipped,
        })
    }

    pub fn weight_count(&self) -> usize {
        self.weights.len()
    }

    /// Fold this adapter into `weights` at the given strength.
    ///
    /// `weights` is keyed by transformer tensor name (`<layer>.weight`).
    /// Deltas for the same weight (diffusers q, k, v) are summed before the
    /// weight is updated once. Returns the number of updated weights; zero is
    /// an error.
    pub fn fuse_into(&self, weights: &mut HashMap<String, Tensor>, strength: f32) -> Result<usize> {
        let mut deltas: BTreeMap<String, Tensor> = BTreeMap::new();

        for (target, lora) in &self.weights {
            let name = format!("{}.weight", target.layer);
            let Some(base) = weights.get(&name) else {
                debug!(layer = %target.layer, "No base weight for LoRA layer");
                continue;
            };

            let delta = lora.delta(strength)?.to_device(base.device())?;
            let delta = expand_delta(&delta, target.slice, base.dims())
                .with_context(|| format!("shape mismatch for {name}"))?;

            let summed = match deltas.remove(&name) {
                Some(previous) => (previous + delta)?,
                None => delta,
            };
            deltas.insert(name, summed);
        }

        if deltas.is_empty() {
            anyhow::bail!("no LoRA layer matched a FLUX transformer weight");
        }

        let fused = deltas.len();
        for (name, delta) in deltas {
            let Some(base) = weights.get(&name) else {
                continue;
            };
            let updated = (base.to_dtype(DType::F32)? + delta)?.to_dtype(base.dtype())?;
            weights.insert(name, updated);
        }

        info!(name = %self.name, strength, fused, "✓ LoRA fused");
        Ok(fused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoraRole {
    Down,
    Up,
    Alpha,
}

/// Split a tensor key into its layer base name and role
///
/// "x.lora_down.weight" / "x.lora_A.weight" -> ("x", Down)
fn split_lora_key(key: &str) -> Option<(&str, LoraRole)> {
    if let Some(base) = key.strip_suffix(".alpha") {
        return Some((base, LoraRole::Alpha));
    }
    let key = key.strip_suffix(".weight").unwrap_or(key);
    for (suffix, role) in [
        (".lora_down", LoraRole::Down),
        (".lora_A", LoraRole::Down),
        (".lora_up", LoraRole::Up),
        (".lora_B", LoraRole::Up),
    ] {
        if let Some(base) = key.strip_suffix(suffix) {
            return Some((base, role));
        }
    }
    None
}

/// Submodules of a FLUX double/single block, in Kohya underscore form
const BLOCK_SUBMODULES: [&str; 7] = [
    "img_attn", "txt_attn", "img_mlp", "txt_mlp", "img_mod", "txt_mod", "modulation",
];

/// Kohya names of layers outside the blocks
const TOP_LEVEL_LAYERS: [(&str, &str); 11] = [
    ("img_in", "img_in"),
    ("txt_in", "txt_in"),
    ("time_in_in_layer", "time_in.in_layer"),
    ("time_in_out_layer", "time_in.out_layer"),
    ("vector_in_in_layer", "vector_in.in_layer"),
    ("vector_in_out_layer", "vector_in.out_layer"),
    ("guidance_in_in_layer", "guidance_in.in_layer"),
    ("guidance_in_out_layer", "guidance_in.out_layer"),
    ("final_layer_linear", "final_layer.linear"),
    ("final_layer_adaLN_modulation_1", "final_layer.adaLN_modulation.1"),
    ("final_layer_adaln_modulation_1", "final_layer.adaLN_modulation.1"),
];

/// Map an adapter layer name to the FLUX transformer rows it targets.
///
/// Returns `None` for layers the transformer does not have (text encoder
/// LoRAs, unknown modules).
pub fn lora_target(key: &str) -> Option<LoraTarget> {
    let mut name = key;
    for prefix in ["base_model.model.", "diffusion_model.", "transformer.", "model."] {
        if let Some(stripped) = name.strip_prefix(prefix) {
            name = stripped;
        }
    }

    if let Some(kohya) = name.strip_prefix("lora_unet_") {
        return kohya_to_flux(kohya).map(LoraTarget::full);
    }

    let native = name.starts_with("double_blocks.")
        || name.starts_with("single_blocks.")
        || TOP_LEVEL_LAYERS.iter().any(|(_, flux)| name == *flux);
    if native {
        return Some(LoraTarget::full(name));
    }

    diffusers_to_flux(name)
}

/// Diffusers layers inside `transformer_blocks.N`
const DOUBLE_BLOCK_LAYERS: [(&str, &str, WeightSlice); 14] = [
    ("norm1.linear", "img_mod.lin", WeightSlice::Full),
    ("norm1_context.linear", "txt_mod.lin", WeightSlice::Full),
    ("attn.to_q", "img_attn.qkv", WeightSlice::Chunk(0)),
    ("attn.to_k", "img_attn.qkv", WeightSlice::Chunk(1)),
    ("attn.to_v", "img_attn.qkv", WeightSlice::Chunk(2)),
    ("attn.to_out.0", "img_attn.proj", WeightSlice::Full),
    ("attn.add_q_proj", "txt_attn.qkv", WeightSlice::Chunk(0)),
    ("attn.add_k_proj", "txt_attn.qkv", WeightSlice::Chunk(1)),
    ("attn.add_v_proj", "txt_attn.qkv", WeightSlice::Chunk(2)),
    ("attn.to_add_out", "txt_attn.proj", WeightSlice::Full),
    ("ff.net.0.proj", "img_mlp.0", WeightSlice::Full),
    ("ff.net.2", "img_mlp.2", WeightSlice::Full),
    ("ff_context.net.0.proj", "txt_mlp.0", WeightSlice::Full),
    ("ff_context.net.2", "txt_mlp.2", WeightSlice::Full),
];

/// Diffusers layers inside `single_transformer_blocks.N`
const SINGLE_BLOCK_LAYERS: [(&str, &str, WeightSlice); 6] = [
    ("norm.linear", "modulation.lin", WeightSlice::Full),
    ("attn.to_q", "linear1", WeightSlice::Chunk(0)),
    ("attn.to_k", "linear1", WeightSlice::Chunk(1)),
    ("attn.to_v", "linear1", WeightSlice::Chunk(2)),
    ("proj_mlp", "linear1", WeightSlice::Tail),
    ("proj_out", "linear2", WeightSlice::Full),
];

/// Diffusers layers outside the blocks
const DIFFUSERS_TOP_LEVEL_LAYERS: [(&str, &str, WeightSlice); 10] = [
    ("x_embedder", "img_in", WeightSlice::Full),
    ("context_embedder", "txt_in", WeightSlice::Full),
    ("time_text_embed.timestep_embedder.linear_1", "time_in.in_layer", WeightSlice::Full),
    ("time_text_embed.timestep_embedder.linear_2", "time_in.out_layer", WeightSlice::Full),
    ("time_text_embed.text_embedder.linear_1", "vector_in.in_layer", WeightSlice::Full),
    ("time_text_embed.text_embedder.linear_2", "vector_in.out_layer", WeightSlice::Full),
    ("time_text_embed.guidance_embedder.linear_1", "guidance_in.in_layer", WeightSlice::Full),
    ("time_text_embed.guidance_embedder.linear_2", "guidance_in.out_layer", WeightSlice::Full),
    ("proj_out", "final_layer.linear", WeightSlice::Full),
    ("norm_out.linear", "final_layer.adaLN_modulation.1", WeightSlice::SwappedHalves),
];

type LayerTable = [(&'static str, &'static str, WeightSlice)];

fn lookup(table: &LayerTable, layer: &str) -> Option<(&'static str, WeightSlice)> {
    table
        .iter()
        .find(|(diffusers, _, _)| *diffusers == layer)
        .map(|(_, flux, slice)| (*flux, *slice))
}

fn diffusers_to_flux(name: &str) -> Option<LoraTarget> {
    let (block, rest, table): (&str, &str, &LayerTable) =
        if let Some(rest) = name.strip_prefix("transformer_blocks.") {
            ("double_blocks", rest, &DOUBLE_BLOCK_LAYERS[..])
        } else if let Some(rest) = name.strip_prefix("single_transformer_blocks.") {
            ("single_blocks", rest, &SINGLE_BLOCK_LAYERS[..])
        } else {
            let (layer, slice) = lookup(&DIFFUSERS_TOP_LEVEL_LAYERS, name)?;
            return Some(LoraTarget {
                layer: layer.to_string(),
                slice,
            });
        };

    let (index, layer) = rest.split_once('.')?;
    let index: usize = index.parse().ok()?;
    let (layer, slice) = lookup(table, layer)?;
    Some(LoraTarget {
        layer: format!("{block}.{index}.{layer}"),
        slice,
    })
}

fn kohya_to_flux(name: &str) -> Option<String> {
    if let Some((_, flux)) = TOP_LEVEL_LAYERS.iter().find(|(kohya, _)| *kohya == name) {
        return Some(flux.to_string());
    }

    let (block, rest) = if let Some(rest) = name.strip_prefix("double_blocks_") {
        ("double_blocks", rest)
    } else if let Some(rest) = name.strip_prefix("single_blocks_") {
        ("single_blocks", rest)
    } else {
        return None;
    };

    let (index, layer) = rest.split_once('_')?;
    index.parse::<usize>().ok()?;

    let layer = BLOCK_SUBMODULES
        .iter()
        .find_map(|sub| {
            layer
                .strip_prefix(sub)
                .and_then(|r| r.strip_prefix('_'))
                .map(|r| format!("{sub}.{r}"))
        })
        .unwrap_or_else(|| layer.to_string());

    Some(format!("{block}.{index}.{layer}"))
}
