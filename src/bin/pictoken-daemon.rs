//! Generation daemon: loads the checkpoint and serves the line-JSON
//! protocol on a Unix socket.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::UnixListener;
use tracing_subscriber::EnvFilter;

use pictoken_rs::manager::{GenerationManager, ManagerConfig};
use pictoken_rs::serve;

#[derive(Parser, Debug)]
#[command(name = "pictoken-daemon", about = "Text-to-image token generation daemon")]
struct Args {
    /// Path to the safetensors checkpoint.
    #[arg(long)]
    checkpoint: PathBuf,

    /// Optional JSON config overriding the default model shape.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unix socket to listen on.
    #[arg(long, default_value = "/tmp/pictoken.sock")]
    socket: PathBuf,

    /// CUDA device ordinal.
    #[arg(long, default_value_t = 0)]
    device: usize,

    /// Compute dtype: f32, f16 or bf16.
    #[arg(long, default_value = "f32")]
    dtype: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pictoken_rs=info,pictoken_daemon=info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<ManagerConfig>(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => serde_json::from_value(serde_json::json!({
            "checkpoint": &args.checkpoint,
        }))?,
    };
    config.checkpoint = args.checkpoint.clone();
    config.cuda_device = args.device;
    config.dtype = args.dtype.clone();

    let manager = Arc::new(GenerationManager::load(config).context("loading model")?);

    if args.socket.exists() {
        std::fs::remove_file(&args.socket)
            .with_context(|| format!("removing stale socket {}", args.socket.display()))?;
    }
    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("binding {}", args.socket.display()))?;
    tracing::info!(socket = %args.socket.display(), "listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            if let Err(e) = serve::handle_connection(stream, manager).await {
                tracing::warn!(error = %e, "connection failed");
            }
        });
    }
}
