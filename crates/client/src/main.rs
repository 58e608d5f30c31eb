mod cli;

use std::io::Write as _;
use std::sync::Arc;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use edgerun_core::{
    CancelToken, DeviceHint, EngineConfig, GenerationRequest, ModelCategory, ModelDescriptor,
    ModelRegistry, StopReason,
};
use edgerun_engine::{Runtime, RuntimeOptions};
use edgerun_kernel::Kernel;
use edgerun_store::{ModelCache, ModelDownloader};

use crate::cli::{Cli, Command};

fn build_kernel() -> Arc<dyn Kernel> {
    #[cfg(feature = "native-kernel")]
    {
        Arc::new(edgerun_kernel::NativeKernel)
    }
    #[cfg(not(feature = "native-kernel"))]
    {
        Arc::new(edgerun_kernel::MockKernel::new())
    }
}

fn descriptor(id: &str, url: String, sha256: Option<String>, size: u64) -> ModelDescriptor {
    ModelDescriptor {
        id: id.to_string(),
        name: id.to_string(),
        size_bytes: size,
        url,
        sha256,
        format: "gguf".to_string(),
        quantization: "unknown".to_string(),
        category: ModelCategory::Text,
    }
}

fn spawn_ctrl_c_cancel(cancel: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
}

fn download_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total.max(1));
    bar.set_style(
        ProgressStyle::with_template(
            "{bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

async fn cmd_pull(
    namespace: &str,
    id: &str,
    url: String,
    sha256: Option<String>,
    size: u64,
) -> anyhow::Result<()> {
    let cache = ModelCache::open(namespace)?;
    let downloader = ModelDownloader::new(cache);
    let desc = descriptor(id, url, sha256, size);

    let cancel = CancelToken::new();
    spawn_ctrl_c_cancel(cancel.clone());

    let bar = download_bar(size);
    let bytes = downloader
        .ensure(
            &desc,
            |p| {
                if p.total_bytes > 0 {
                    bar.set_length(p.total_bytes);
                }
                bar.set_position(p.downloaded_bytes);
            },
            &cancel,
        )
        .await?;
    bar.finish();

    println!("pulled {id} ({} bytes)", bytes.len());
    Ok(())
}

async fn cmd_models(namespace: &str) -> anyhow::Result<()> {
    let cache = ModelCache::open(namespace)?;
    let entries = cache.list().await?;
    if entries.is_empty() {
        println!("no cached models");
        return Ok(());
    }
    for meta in &entries {
        println!(
            "{}  {} bytes  {}/{}  committed {}",
            meta.model_id, meta.size_bytes, meta.format, meta.precision, meta.committed_at
        );
    }
    println!("total: {} bytes", cache.total_size().await?);
    Ok(())
}

async fn cmd_rm(namespace: &str, id: &str) -> anyhow::Result<()> {
    let cache = ModelCache::open(namespace)?;
    if cache.delete(id).await? {
        println!("removed {id}");
    } else {
        println!("{id} was not cached");
    }
    Ok(())
}

async fn cmd_quota(namespace: &str) -> anyhow::Result<()> {
    let cache = ModelCache::open(namespace)?;
    let quota = cache.estimate_quota().await?;
    println!("cache used: {} bytes", quota.used_bytes);
    if quota.total_bytes > 0 {
        println!("volume: {} bytes ({} available)", quota.total_bytes, quota.available_bytes);
    } else {
        println!("volume quota unavailable on this platform");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    namespace: &str,
    model: &str,
    prompt: String,
    max_tokens: u32,
    temperature: f32,
    seed: Option<u64>,
    stop_sequences: Vec<String>,
    device: &str,
    max_context: u32,
    stats: bool,
) -> anyhow::Result<()> {
    let device = match device {
        "gpu" => DeviceHint::Gpu,
        "cpu" => DeviceHint::Cpu,
        "auto" => DeviceHint::Auto,
        other => anyhow::bail!("unknown device {other:?} (expected gpu, cpu, or auto)"),
    };

    let mut registry = ModelRegistry::new();
    // `run` only reads the cache; the placeholder URL makes any accidental
    // network fetch fail loudly with a hint to pull first.
    registry.register(descriptor(
        model,
        format!("http://invalid.localhost/{model}"),
        None,
        0,
    ))?;

    let mut config = EngineConfig::for_model(model);
    config.device = device;
    config.max_context_length = max_context;
    config.cache_namespace = namespace.to_string();

    let mut options = RuntimeOptions::new(build_kernel());
    options.registry = registry;

    let runtime = Runtime::init(config, options).await.map_err(|err| {
        anyhow::anyhow!("{err} (pull the model first with `edgerun pull --id {model} --url …`)")
    })?;
    eprintln!("backend: {}", runtime.backend());

    let request = GenerationRequest {
        max_tokens,
        temperature,
        seed,
        stop_sequences,
        ..GenerationRequest::for_prompt(prompt)
    };

    let cancel = CancelToken::new();
    spawn_ctrl_c_cancel(cancel.clone());

    let mut stream = runtime.generate_stream(request)?;
    let mut cancel_sent = false;
    let mut final_stats = None;
    let mut tokens_generated = 0;
    loop {
        tokio::select! {
            chunk = stream.next() => {
                let Some(chunk) = chunk else { break };
                print!("{}", chunk.token);
                let _ = std::io::stdout().flush();
                tokens_generated = chunk.tokens_generated;
                if chunk.done {
                    if let Some(error) = chunk.error {
                        println!();
                        runtime.dispose().await;
                        return Err(anyhow::anyhow!("{error}"));
                    }
                    final_stats = chunk.stats;
                    break;
                }
            }
            _ = cancel.cancelled(), if !cancel_sent => {
                cancel_sent = true;
                let _ = runtime.cancel_generation().await;
            }
        }
    }
    println!();

    if let Some(final_stats) = final_stats {
        if stats {
            eprintln!(
                "{tokens_generated} tokens in {} ms ({:.1} tok/s), stopped: {:?}",
                final_stats.time_ms, final_stats.tokens_per_second, final_stats.stop_reason
            );
        }
        if final_stats.stop_reason == StopReason::Cancelled {
            eprintln!("(cancelled)");
        }
    }

    runtime.dispose().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Pull {
            id,
            url,
            sha256,
            size,
        } => cmd_pull(&cli.cache_namespace, &id, url, sha256, size).await,
        Command::Models => cmd_models(&cli.cache_namespace).await,
        Command::Rm { id } => cmd_rm(&cli.cache_namespace, &id).await,
        Command::Quota => cmd_quota(&cli.cache_namespace).await,
        Command::Run {
            model,
            prompt,
            max_tokens,
            temperature,
            seed,
            stop_sequences,
            device,
            max_context,
            stats,
        } => {
            cmd_run(
                &cli.cache_namespace,
                &model,
                prompt,
                max_tokens,
                temperature,
                seed,
                stop_sequences,
                &device,
                max_context,
                stats,
            )
            .await
        }
    }
}
