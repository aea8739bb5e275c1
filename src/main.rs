//! colossus: local model-serving runtime.
//!
//! Serves an Ollama-style HTTP API over local model files, and exposes the
//! same engine through a few one-shot subcommands.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use colossus::catalog::{ModelCatalog, ModelSource};
use colossus::config::{Cli, Command, Config};
use colossus::format;
use colossus::gpu::device::detect_accelerators;
use colossus::inference::chat::{interact, Conversation};
use colossus::inference::{
    EngineConfig, EngineFactory, EngineKind, GenerateOptions, GenerateRequest, InferenceEngine,
    ModelOptions,
};
use colossus::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "colossus=debug,tower_http=debug"
    } else {
        "colossus=info,tower_http=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let mut config = Config::load(&cli.config)?;
    if let Some(models) = &cli.models {
        config.models.models_path = models.clone();
    }
    apply_env(&mut config.engine);

    match cli.command {
        Command::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| config.server.listen.clone());
            serve(config, listen).await
        }
        Command::List => list(&config),
        Command::Show { path } => {
            let descriptor = format::decode(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
            Ok(())
        }
        Command::Run {
            model,
            prompt,
            temperature,
            max_tokens,
            seed,
        } => {
            let mut request = GenerateRequest::new(model, prompt);
            request.stream = true;
            request.options.temperature = temperature;
            request.options.num_predict = max_tokens;
            request.options.seed = seed;
            run(config, request).await
        }
        Command::Chat {
            model,
            system,
            temperature,
            max_tokens,
            seed,
        } => {
            let options = GenerateOptions {
                temperature,
                num_predict: max_tokens,
                seed,
                ..Default::default()
            };
            chat(config, model, Conversation::new(system), options).await
        }
        Command::Gpu { json } => {
            let accel = tokio::task::spawn_blocking(detect_accelerators).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&accel)?);
            } else if !accel.is_available() {
                println!("No accelerators detected");
            } else {
                let driver = accel.driver_version.as_deref().unwrap_or("unknown");
                println!("{} (driver {driver})", accel.kind);
                for dev in &accel.devices {
                    println!(
                        "  [{}] {}  {} MiB total, {} MiB free",
                        dev.id,
                        dev.name,
                        dev.total_vram / (1024 * 1024),
                        dev.free_vram / (1024 * 1024)
                    );
                }
            }
            Ok(())
        }
    }
}

/// Fold the engine environment variables into `engine`. Only the binary
/// reads them.
fn apply_env(engine: &mut EngineConfig) {
    if let Ok(value) = std::env::var("COLOSSUS_INFERENCE_ENGINE") {
        match value.parse::<EngineKind>() {
            Ok(kind) => engine.kind = kind,
            Err(e) => warn!(error = %e, "Ignoring COLOSSUS_INFERENCE_ENGINE"),
        }
    }

    if let Ok(value) = std::env::var("COLOSSUS_FORCE_LLAMACPP") {
        if matches!(value.trim(), "1" | "true" | "yes") {
            engine.kind = EngineKind::Native;
            engine.force_native = true;
        }
    }

    if let Ok(value) = std::env::var("COLOSSUS_GPU_LAYERS") {
        match value.trim().parse::<u32>() {
            Ok(layers) => engine.gpu_layers = Some(layers),
            Err(e) => warn!(error = %e, value = %value, "Ignoring COLOSSUS_GPU_LAYERS"),
        }
    }
}

async fn serve(config: Config, listen: String) -> anyhow::Result<()> {
    info!("colossus v{}", env!("CARGO_PKG_VERSION"));

    let factory = EngineFactory::new(config.engine.clone());
    let engine = factory.create();
    let load_options = factory.default_options(engine.kind());

    info!(
        engine = %engine.kind(),
        models = %config.models.models_path.display(),
        context_size = load_options.context_size,
        gpu_layers = load_options.gpu_layers,
        "Configuration loaded"
    );

    let catalog = ModelCatalog::new(&config.models.models_path);
    let state = Arc::new(AppState::new(engine.clone(), catalog, load_options));
    let app = build_router(state);

    info!(addr = %listen, "Starting server");
    let listener = TcpListener::bind(&listen).await?;
    info!("Listening on {listen}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    tokio::task::spawn_blocking(move || engine.shutdown()).await??;
    Ok(())
}

fn list(config: &Config) -> anyhow::Result<()> {
    let catalog = ModelCatalog::new(&config.models.models_path);
    let entries = catalog.list()?;
    if entries.is_empty() {
        println!("No models in {}", catalog.root().display());
        return Ok(());
    }

    println!("{:<40} {:<12} {:>10}", "NAME", "DIGEST", "SIZE (MB)");
    for entry in entries {
        println!(
            "{:<40} {:<12} {:>10}",
            entry.name,
            entry.digest,
            entry.size / 1_000_000
        );
    }
    Ok(())
}

async fn run(config: Config, request: GenerateRequest) -> anyhow::Result<()> {
    let factory = EngineFactory::new(config.engine.clone());
    let engine = factory.create();
    let options = factory.default_options(engine.kind());
    let catalog = ModelCatalog::new(&config.models.models_path);

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        load_named(engine.as_ref(), &catalog, &request.model, &options)?;

        let mut stdout = std::io::stdout().lock();
        engine.generate_stream(&request, &mut |fragment| {
            stdout.write_all(fragment.text.as_bytes())?;
            if fragment.done {
                stdout.write_all(b"\n")?;
            }
            stdout.flush()?;
            Ok(())
        })?;

        engine.shutdown()?;
        Ok(())
    })
    .await?
}

async fn chat(
    config: Config,
    model: String,
    mut conversation: Conversation,
    options: GenerateOptions,
) -> anyhow::Result<()> {
    let factory = EngineFactory::new(config.engine.clone());
    let engine = factory.create();
    let load_options = factory.default_options(engine.kind());
    let catalog = ModelCatalog::new(&config.models.models_path);

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        load_named(engine.as_ref(), &catalog, &model, &load_options)?;
        println!("Chatting with '{model}' (type /bye to exit)");

        let mut stdin = std::io::stdin().lock();
        let mut stdout = std::io::stdout();
        interact(
            engine.as_ref(),
            &model,
            &options,
            &mut conversation,
            &mut stdin,
            &mut stdout,
        )?;

        engine.shutdown()?;
        Ok(())
    })
    .await?
}

/// Validate and load `model` for a one-shot command. The command line may
/// name a file directly; the catalog never does.
fn load_named(
    engine: &dyn InferenceEngine,
    catalog: &ModelCatalog,
    model: &str,
    options: &ModelOptions,
) -> anyhow::Result<()> {
    let direct = Path::new(model);
    let path = if direct.is_file() {
        direct.to_path_buf()
    } else {
        catalog.resolve(model)?
    };
    let descriptor = format::decode(&path)?;
    if !descriptor.valid {
        let reason = descriptor.error.map(|e| e.to_string()).unwrap_or_default();
        anyhow::bail!("{} is not a valid model: {reason}", path.display());
    }

    engine.load_model(model, &path, options)?;
    Ok(())
}
