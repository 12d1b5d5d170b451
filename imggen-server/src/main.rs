use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hf_hub::api::tokio::{Api, ApiBuilder};
use imggen_core::lora::LoraStore;
use imggen_core::{prefetch_model, DeviceMap, Generator, GeneratorSettings, HubSource, Registry};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod handlers;

use handlers::{router, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about = "Text-to-image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 7860)]
    port: u16,

    /// Directory for LoRA files, merged weights and `model_info.json`
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,

    /// JSON model registry replacing the built-in catalog
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Trade speed for memory: sliced attention, fp16 weights, fewer default steps
    #[arg(long)]
    low_memory: bool,

    /// Model id to load before accepting requests
    #[arg(long)]
    preload: Option<String>,

    /// Download every registered model, then exit
    #[arg(long)]
    download_models: bool,

    /// Hugging Face access token for gated repositories
    #[arg(long, env = "HF_TOKEN")]
    hf_token: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_api(token: Option<String>) -> Result<Api> {
    let mut builder = ApiBuilder::new();
    // Without a flag the token cached by `huggingface-cli login` is kept.
    if let Some(token) = token {
        builder = builder.with_token(Some(token));
    }
    builder.build().context("failed to create hub client")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let registry = match &args.registry {
        Some(path) => Registry::load(path)?,
        None => Registry::builtin(),
    };
    registry.save_model_info(&args.models_dir)?;
    let settings = GeneratorSettings {
        device_map: DeviceMap::from_cpu_flag(args.cpu),
        low_memory: args.low_memory,
    };
    let api = build_api(args.hf_token.clone())?;

    if args.download_models {
        for model in &registry.models {
            let fetched =
                prefetch_model(model, &api, settings.device_map, settings.low_memory).await;
            if let Err(err) = fetched {
                warn!(model_id = %model.id, error = %format!("{err:#}"), "Download failed");
            }
        }
        info!("Model downloads finished");
        return Ok(());
    }

    let source = HubSource::new(api.clone(), args.models_dir.join("merged"));
    let loras = LoraStore::new(args.models_dir.join("loras"), Some(api));
    let generator = Generator::new(Arc::new(registry), source, loras, settings);

    if let Some(model_id) = args.preload.as_deref() {
        let loaded = generator.preload(Some(model_id)).await?;
        info!(model_id = %loaded, "Model preloaded");
    }

    let app = router(Arc::new(AppState { generator }));

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(
        address = %listener.local_addr()?,
        device = %settings.device_map,
        low_memory = settings.low_memory,
        "Started server"
    );
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
