//! CLI entry point for FLUX.1 image generation

use anyhow::Result;
use clap::Parser;
use flux_gen::cli::{Cli, Commands};
use flux_gen::config::RuntimeConfig;
use flux_gen::device::report_hf_token_status;
use flux_gen::download::ModelDownloader;
use flux_gen::generate::run_generation;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.into_command() {
        Commands::Download(args) => {
            println!();
            println!("════════════════════════════════════════════════════════");
            println!("📥 Downloading {}", args.model_id);
            println!("════════════════════════════════════════════════════════");
            println!();

            let runtime = RuntimeConfig::from_env();
            report_hf_token_status(&runtime);

            let files = ModelDownloader::new(&args.model_id, runtime.hf_token)?
                .download_all()
                .await?;

            println!();
            println!("✓ All model files available ({:?})", files.variant);
            println!();
            println!("Model locations:");
            println!("  Transformer: {}", files.transformer.display());
            println!("  VAE:         {}", files.autoencoder.display());
            println!("  CLIP:        {}", files.clip_weights.display());
            for shard in &files.t5_weights {
                println!("  T5:          {}", shard.display());
            }
            println!();
        }

        Commands::Generate(args) => {
            let config = args.into_config()?;

            println!();
            println!("════════════════════════════════════════════════════════");
            println!("🚀 FLUX generation: {}", config.model_id);
            println!("════════════════════════════════════════════════════════");
            println!("  Size:  {}x{}", config.width, config.height);
            println!("  Steps: {}", config.num_inference_steps);
            for lora in &config.loras {
                println!("  LoRA:  {} (scale {})", lora.path.display(), lora.scale);
            }
            if let Some(reference) = &config.reference_image {
                println!(
                    "  Reference: {} (scale {})",
                    reference.path.display(),
                    reference.scale
                );
            }
            println!();

            let output_path = run_generation(&config).await?;

            println!();
            println!("✨ Saved: {}", output_path.display());
            println!();
        }
    }

    Ok(())
}
