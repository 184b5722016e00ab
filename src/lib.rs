//! FLUX.1 image generation from the command line
//!
//! Configures and runs a FLUX.1 text-to-image pipeline built on the Candle
//! ML framework.
//!
//! ## Features
//!
//! - **Hub or local weights**: model files resolved through the HuggingFace cache
//! - **LoRA fusion**: several adapters, each with its own scale, fused before inference
//! - **Reference images**: initial latents conditioned on an input image
//! - **Device placement**: CUDA with BF16 by default, CPU offload for text encoders
//!
//! ## Usage
//!
//! ```rust,ignore
//! use flux_gen::config::{GenerationConfig, LoraSpec};
//! use flux_gen::generate::run_generation;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GenerationConfig {
//!         prompt: "a cat sitting on a windowsill".to_string(),
//!         loras: vec![LoraSpec {
//!             path: "path/to/lora.safetensors".into(),
//!             scale: 0.8,
//!         }],
//!         seed: Some(42),
//!         ..Default::default()
//!     };
//!
//!     let path = run_generation(&config).await?;
//!     println!("{}", path.display());
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod device;
pub mod download;
pub mod env;
pub mod error;
pub mod generate;
pub mod io;
pub mod lora;
pub mod memory;
pub mod models;
pub mod pipeline;
