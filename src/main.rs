//! Report server binary entry point
//!
//! ```text
//! report-server --weights model.safetensors --vocab vocab.json
//!
//! curl http://localhost:5000/health
//! curl -F image=@chest.png http://localhost:5000/generate-report
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use report_decoder::server::{start_server, AppState};
use report_decoder::{GenerationConfig, InferenceContext, PreprocessConfig};

/// Serve image-to-report generation over HTTP
#[derive(Parser, Debug)]
#[command(name = "report-server", version)]
struct Cli {
    /// Address to bind
    #[arg(long, env = "REPORT_SERVER_ADDR", default_value = "0.0.0.0:5000")]
    addr: String,

    /// Model weights (safetensors)
    #[arg(short, long, env = "REPORT_WEIGHTS")]
    weights: Option<PathBuf>,

    /// Vocabulary JSON (word -> id); built-in radiology vocabulary if omitted
    #[arg(long, env = "REPORT_VOCAB")]
    vocab: Option<PathBuf>,

    /// Refuse to start on random weights
    #[arg(long)]
    require_weights: bool,

    /// Seed for random initialization when no weights are loaded
    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 3)]
    beam_width: usize,

    #[arg(long, default_value_t = 100)]
    max_steps: usize,

    #[arg(long, default_value_t = 0.7)]
    length_penalty: f32,

    /// Recompute every prefix instead of using the KV cache
    #[arg(long)]
    no_kv_cache: bool,

    /// Per-request generation timeout in seconds (0 disables)
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Square size images are resized to
    #[arg(long, default_value_t = 512)]
    input_size: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "report_decoder=info,report_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let generation = GenerationConfig {
        beam_width: cli.beam_width,
        max_steps: cli.max_steps,
        length_penalty: cli.length_penalty,
        use_kv_cache: !cli.no_kv_cache,
        ..Default::default()
    };
    let preprocess = PreprocessConfig {
        input_size: cli.input_size,
        ..Default::default()
    };

    let context = InferenceContext::load(
        cli.vocab.as_deref(),
        cli.weights.as_deref(),
        cli.require_weights,
        cli.seed,
        generation,
        preprocess,
    )
    .context("Failed to load model")?;

    let mut state = AppState::new(Arc::new(context));
    if cli.timeout_secs > 0 {
        state = state.with_timeout(Duration::from_secs(cli.timeout_secs));
    }

    start_server(&cli.addr, state)
        .await
        .with_context(|| format!("Server on {} failed", cli.addr))?;

    Ok(())
}
