//! Guaradict server binary.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gdict_common::DEFAULT_MAX_FRAME_SIZE;
use gdict_engine::MemoryDictionary;
use gdict_server::{Server, DEFAULT_LISTEN_ADDR};

/// In-memory Guaradict key-value server
#[derive(Parser, Debug)]
#[command(name = "gdict-server", version)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Dictionary shard count (rounded up to a power of two; 0 = 4 per CPU)
    #[arg(long, default_value_t = 0)]
    shards: usize,

    /// Largest accepted frame in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let dictionary = if args.shards == 0 {
        MemoryDictionary::new()
    } else {
        MemoryDictionary::with_shard_count(args.shards)
    };
    info!(shards = dictionary.shard_count(), "dictionary ready");

    let server = Server::bind(args.listen.as_str(), Arc::new(dictionary))
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?
        .with_max_frame_size(args.max_frame_size);

    server
        .serve_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server failed")?;

    Ok(())
}
