//! Guaradict command-line client.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gdict_client::{Driver, DriverConfig, Endpoint, Event};

/// Command-line client for a Guaradict server
#[derive(Parser, Debug)]
#[command(name = "gdict", version)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:13141")]
    endpoint: String,

    /// JSON driver config; its endpoint wins over --endpoint
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Per-operation timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        /// The key to get
        key: String,
    },

    /// Set a key-value pair
    Set {
        /// The key to set
        key: String,

        /// The value to set
        value: String,
    },

    /// Delete a key
    Del {
        /// The key to delete
        key: String,
    },

    /// Ping the server
    Ping {
        /// Number of round trips
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },

    /// Print key changes made by other clients until Ctrl-C
    Watch,

    /// Connect, set my-key, read it back, and disconnect, printing events
    Demo,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let driver = Driver::with_config(load_config(&args)?).context("invalid driver config")?;

    match args.command {
        Commands::Demo => return demo(&driver).await,
        Commands::Watch => return watch(&driver).await,
        _ => {}
    }

    let handle = driver
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", driver.config().endpoint))?;

    let outcome = match args.command {
        Commands::Get { key } => driver.get(handle, key).await.map(|value| match value {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(nil)"),
        }),
        Commands::Set { key, value } => driver.set(handle, key, value).await.map(|()| println!("OK")),
        Commands::Del { key } => driver
            .delete(handle, key)
            .await
            .map(|removed| println!("{}", u8::from(removed))),
        Commands::Ping { count } => {
            let mut result = Ok(());
            for _ in 0..count {
                match driver.ping(handle).await {
                    Ok(rtt) => println!("PONG {rtt:?}"),
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                }
            }
            result
        }
        Commands::Watch | Commands::Demo => Ok(()),
    };

    driver.disconnect(handle).await?;
    outcome.context("request failed")
}

fn load_config(args: &Args) -> anyhow::Result<DriverConfig> {
    let mut config = match &args.config {
        Some(path) => DriverConfig::load(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let endpoint: Endpoint = args.endpoint.parse()?;
            DriverConfig::new(endpoint)
        }
    };
    if let Some(ms) = args.timeout_ms {
        if ms == 0 {
            bail!("--timeout-ms must be greater than zero");
        }
        config.operation_timeout = Duration::from_millis(ms);
    }
    Ok(config)
}

async fn watch(driver: &Driver) -> anyhow::Result<()> {
    let mut events = driver.subscribe();
    let handle = driver.connect().await.context("failed to connect")?;
    println!("watching {} (Ctrl-C to stop)", driver.config().endpoint);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Event::KeyChanged { key, value: Some(value), .. }) => {
                    println!("SET {} = {}", String::from_utf8_lossy(&key), String::from_utf8_lossy(&value));
                }
                Some(Event::KeyChanged { key, value: None, .. }) => {
                    println!("DEL {}", String::from_utf8_lossy(&key));
                }
                Some(Event::Failed { reason, .. }) => bail!("connection lost: {reason}"),
                Some(_) => {}
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    driver.disconnect(handle).await?;
    Ok(())
}

async fn demo(driver: &Driver) -> anyhow::Result<()> {
    let mut events = driver.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("event: {event:?}");
            if matches!(event, Event::Disconnected { .. }) {
                break;
            }
        }
    });

    let handle = driver.connect().await.context("failed to connect")?;
    println!("connected: {handle}");

    driver.set(handle, "my-key", "val").await?;
    println!("set my-key = val");

    match driver.get(handle, "my-key").await? {
        Some(value) => println!("get my-key = {}", String::from_utf8_lossy(&value)),
        None => println!("get my-key = (nil)"),
    }

    driver.disconnect(handle).await?;
    println!("disconnected: {handle}");

    printer.await.context("event printer panicked")?;
    Ok(())
}
