use clap::{Parser, Subcommand};

fn parse_sha256(input: &str) -> Result<String, String> {
    let s = input.trim().to_ascii_lowercase();
    if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!("invalid sha256 (need 64 hex characters): {input:?}"));
    }
    Ok(s)
}

#[derive(Debug, Parser)]
#[command(name = "edgerun", version, about = "On-device LLM runtime client")]
pub struct Cli {
    /// Cache namespace for model storage.
    #[arg(long, env = "EDGERUN_CACHE_NAMESPACE", default_value = "default", global = true)]
    pub cache_namespace: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download a model into the cache.
    Pull {
        /// Model id to store it under.
        #[arg(long)]
        id: String,

        /// Download URL.
        #[arg(long, env = "EDGERUN_MODEL_URL")]
        url: String,

        /// Expected SHA-256 (lower-case hex). Verified before commit.
        #[arg(long, value_parser = parse_sha256)]
        sha256: Option<String>,

        /// Declared size in bytes, used for progress when the server does
        /// not send a length.
        #[arg(long, default_value_t = 0)]
        size: u64,
    },

    /// List cached models.
    Models,

    /// Remove a cached model.
    Rm {
        /// Model id to remove.
        id: String,
    },

    /// Show cache usage and filesystem quota.
    Quota,

    /// Generate text from a cached model.
    Run {
        /// Model id (must be pulled first unless running the mock backend).
        #[arg(long, env = "EDGERUN_MODEL_ID")]
        model: String,

        /// Prompt text.
        #[arg(long)]
        prompt: String,

        /// Token budget.
        #[arg(long, default_value_t = 100)]
        max_tokens: u32,

        /// Sampling temperature (0 is deterministic for a fixed seed).
        #[arg(long, default_value_t = 0.7)]
        temperature: f32,

        /// Sampler seed.
        #[arg(long)]
        seed: Option<u64>,

        /// Stop sequence; may be given multiple times.
        #[arg(long = "stop")]
        stop_sequences: Vec<String>,

        /// Device selection: gpu, cpu, or auto.
        #[arg(long, default_value = "auto")]
        device: String,

        /// Maximum context length in tokens.
        #[arg(long, default_value_t = 2048)]
        max_context: u32,

        /// Print final generation stats.
        #[arg(long, default_value_t = false)]
        stats: bool,
    },
}
