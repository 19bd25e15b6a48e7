use anyhow::{Context, bail};
use clap::Parser;
use futures::stream::{FuturesUnordered, StreamExt};
use pdfrelay_client::{ClientConfig, FrontEndClient};
use pdfrelay_core::{
    ChunkSize,
    channel::{ConnectOptions, DEFAULT_TLS_DOMAIN},
    types::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE},
};
use std::{path::PathBuf, time::Instant};
use tracing_subscriber::EnvFilter;

/// Uploads a PDF to the dispatcher one or more times, concurrently, and
/// reports how long the whole batch took.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "pdfrelay-client",
    version,
    about = "Converts a PDF to text through a pdfrelay dispatcher"
)]
struct CliArgs {
    /// Dispatcher address.
    ///
    /// Environment variable: `DISPATCHER_ADDRESS`
    #[arg(long, env = "DISPATCHER_ADDRESS", default_value = "localhost:1313")]
    address: String,

    /// Size of each uploaded fragment, in bytes.
    ///
    /// Environment variable: `CHUNK_SIZE`
    #[arg(long, env = "CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// PDF to convert.
    #[arg(long)]
    file: PathBuf,

    /// Directory for the resulting text files.
    ///
    /// Environment variable: `TXT_DIR`
    #[arg(long, env = "TXT_DIR", default_value = "./")]
    txt_dir: PathBuf,

    /// Root certificate for the dispatcher. Enables TLS.
    ///
    /// Environment variable: `ROOT_CERTIFICATE`
    #[arg(long, env = "ROOT_CERTIFICATE")]
    root_certificate: Option<PathBuf>,

    /// Server name expected in the dispatcher certificate.
    ///
    /// Environment variable: `TLS_DOMAIN`
    #[arg(long, env = "TLS_DOMAIN", default_value = DEFAULT_TLS_DOMAIN)]
    tls_domain: String,

    /// Gzip-compress uploads.
    #[arg(long, default_value_t = false)]
    compress: bool,

    /// Use `Submit` + `Fetch` instead of `ProcessSync`.
    #[arg(long = "async", default_value_t = false)]
    async_mode: bool,

    /// Number of concurrent calls.
    #[arg(long, default_value_t = 1)]
    iters: usize,

    /// Write the elapsed seconds to this file instead of stdout.
    #[arg(long)]
    result_fn: Option<PathBuf>,

    /// Largest gRPC message accepted or sent, in bytes.
    ///
    /// Environment variable: `MAX_MESSAGE_BYTES`
    #[arg(long, env = "MAX_MESSAGE_BYTES", default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_bytes: usize,
}

impl TryFrom<&CliArgs> for ClientConfig {
    type Error = anyhow::Error;

    fn try_from(args: &CliArgs) -> Result<Self, Self::Error> {
        if args.iters == 0 {
            bail!("--iters must be greater than 0");
        }
        Ok(Self {
            connect: ConnectOptions {
                address: args.address.clone(),
                root_certificate: args.root_certificate.clone(),
                tls_domain: args.tls_domain.clone(),
                compress: args.compress,
            },
            chunk_size: ChunkSize::new(args.chunk_size)?,
            txt_dir: args.txt_dir.clone(),
            max_message_size: args.max_message_bytes,
        })
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ClientConfig::try_from(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let client = FrontEndClient::connect(config)
        .await
        .with_context(|| format!("failed to connect to {}", args.address))?;

    let start = Instant::now();
    let mut calls = FuturesUnordered::new();
    for call in 0..args.iters {
        let client = client.clone();
        let file = args.file.clone();
        let async_mode = args.async_mode;
        calls.push(tokio::spawn(async move {
            let out = client.result_path(&file, call);
            if async_mode {
                client.process_async(&file, &out).await
            } else {
                client.process_sync(&file, &out).await
            }
        }));
    }

    let mut failures = 0;
    while let Some(joined) = calls.next().await {
        match joined? {
            Ok(out) => tracing::info!("text written to {}", out.display()),
            Err(e) => {
                failures += 1;
                tracing::error!("call failed: {e}");
            }
        }
    }
    let elapsed = start.elapsed().as_secs_f64();

    match &args.result_fn {
        Some(path) => tokio::fs::write(path, format!("{elapsed}\n"))
            .await
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{elapsed}"),
    }

    if failures > 0 {
        bail!("{failures} of {} calls failed", args.iters);
    }
    Ok(())
}
