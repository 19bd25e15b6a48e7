//! Command-line and environment configuration for both server roles.
//!
//! Raw arguments are parsed by `clap` into [`CliArgs`] and then validated into
//! the typed [`DispatcherConfig`] / [`WorkerConfig`] the services consume.

use crate::server::pool::{proxy::WorkerEndpoint, strategy::Selection};
use clap::{Args, Parser, Subcommand};
use core::time::Duration;
use pdfrelay_core::{
    ChunkSize, Error, Result,
    channel::{ConnectOptions, DEFAULT_TLS_DOMAIN},
    types::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE},
};
use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
};
use tonic::transport::{Identity, ServerTlsConfig};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "pdfrelay-server",
    version,
    about = "Relays PDF uploads to pdftotext workers over gRPC"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the dispatcher that clients talk to.
    Serve(DispatcherArgs),
    /// Run a worker that converts PDFs to text.
    WorkerServe(WorkerArgs),
}

/// Listener settings shared by both roles.
#[derive(Args, Debug, Clone)]
pub struct ListenArgs {
    /// Port to listen on.
    ///
    /// Environment variable: `PORT`
    #[arg(long, env = "PORT", default_value_t = 1313)]
    pub port: u16,

    /// Interface to bind.
    ///
    /// Environment variable: `HOST`
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// PEM certificate. Enables TLS together with `--key`.
    ///
    /// Environment variable: `TLS_CERTIFICATE`
    #[arg(long, env = "TLS_CERTIFICATE")]
    pub certificate: Option<PathBuf>,

    /// PEM private key for `--certificate`.
    ///
    /// Environment variable: `TLS_KEY`
    #[arg(long, env = "TLS_KEY")]
    pub key: Option<PathBuf>,

    /// Largest gRPC message accepted or sent, in bytes. Must exceed the chunk
    /// size and the largest extracted text.
    ///
    /// Environment variable: `MAX_MESSAGE_BYTES`
    #[arg(long, env = "MAX_MESSAGE_BYTES", default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_bytes: usize,

    /// How long to wait for in-flight work after a shutdown signal.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct DispatcherArgs {
    #[command(flatten)]
    pub listen: ListenArgs,

    /// Size of each streamed fragment sent to workers and clients, in bytes.
    ///
    /// Environment variable: `CHUNK_SIZE`
    #[arg(long, env = "CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Gzip-compress requests sent to workers.
    ///
    /// Environment variable: `COMPRESS`
    #[arg(long, env = "COMPRESS", default_value_t = false)]
    pub compress: bool,

    /// Worker address (`host:port`). Repeat the flag or separate with commas.
    ///
    /// Environment variable: `WORKERS`
    #[arg(long = "worker", env = "WORKERS", value_delimiter = ',', required = true)]
    pub workers: Vec<String>,

    /// Root certificate used to verify workers. Enables TLS towards workers.
    ///
    /// Environment variable: `WORKER_ROOT_CERTIFICATE`
    #[arg(long, env = "WORKER_ROOT_CERTIFICATE")]
    pub worker_root_certificate: Option<PathBuf>,

    /// Server name expected in worker certificates.
    ///
    /// Environment variable: `WORKER_TLS_DOMAIN`
    #[arg(long, env = "WORKER_TLS_DOMAIN", default_value = DEFAULT_TLS_DOMAIN)]
    pub worker_tls_domain: String,

    /// Root of the `incoming/` and `outgoing/` staging directories.
    ///
    /// Environment variable: `STAGING_DIR`
    #[arg(long, env = "STAGING_DIR", default_value = "/tmp/pdftotext")]
    pub staging_dir: PathBuf,

    /// How the next worker is chosen.
    ///
    /// Environment variable: `SELECTION`
    #[arg(long, env = "SELECTION", value_enum, default_value_t = Selection::RoundRobin)]
    pub selection: Selection,

    /// Give up on a `Fetch` after this many seconds. `0` waits forever.
    ///
    /// Environment variable: `FETCH_TIMEOUT_SECS`
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value_t = 0)]
    pub fetch_timeout_secs: u64,

    /// Evict finished jobs that were not fetched within this many seconds.
    /// `0` keeps them forever.
    ///
    /// Environment variable: `JOB_TTL_SECS`
    #[arg(long, env = "JOB_TTL_SECS", default_value_t = 3600)]
    pub job_ttl_secs: u64,

    /// How often the job reaper runs.
    ///
    /// Environment variable: `REAP_INTERVAL_SECS`
    #[arg(long, env = "REAP_INTERVAL_SECS", default_value_t = 60)]
    pub reap_interval_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub listen: ListenArgs,

    /// Directory holding uploads and extracted text while a call runs.
    ///
    /// Environment variable: `WORKER_STAGING_DIR`
    #[arg(long, env = "WORKER_STAGING_DIR", default_value = "/tmp/pdftotext/worker")]
    pub staging_dir: PathBuf,

    /// Program invoked as `<extractor> [args...] <input> <output>`.
    ///
    /// Environment variable: `EXTRACTOR`
    #[arg(long, env = "EXTRACTOR", default_value = "pdftotext")]
    pub extractor: String,

    /// Extra argument passed to the extractor before the paths. Repeatable.
    #[arg(long = "extractor-arg", allow_hyphen_values = true)]
    pub extractor_args: Vec<String>,
}

/// Certificate and key files for a TLS listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsIdentity {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

impl TlsIdentity {
    /// Reads both PEM files into a server TLS configuration.
    pub async fn load(&self) -> Result<ServerTlsConfig> {
        let certificate = read_pem(&self.certificate).await?;
        let key = read_pem(&self.key).await?;
        Ok(ServerTlsConfig::new().identity(Identity::from_pem(certificate, key)))
    }
}

async fn read_pem(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        Error::configuration(format!("failed to read {}: {e}", path.display()))
    })
}

#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub addr: SocketAddr,
    pub tls: Option<TlsIdentity>,
    pub max_message_size: usize,
    pub shutdown_timeout: Duration,
}

impl TryFrom<ListenArgs> for ListenConfig {
    type Error = Error;

    fn try_from(args: ListenArgs) -> Result<Self> {
        if args.port == 0 {
            return Err(Error::configuration("PORT must be greater than 0"));
        }
        let tls = match (args.certificate, args.key) {
            (Some(certificate), Some(key)) => Some(TlsIdentity { certificate, key }),
            (None, None) => None,
            _ => {
                return Err(Error::configuration(
                    "TLS_CERTIFICATE and TLS_KEY must be given together",
                ));
            }
        };
        if args.max_message_bytes <= ChunkSize::MAX {
            return Err(Error::configuration(format!(
                "MAX_MESSAGE_BYTES ({}) must exceed the largest chunk ({} bytes)",
                args.max_message_bytes,
                ChunkSize::MAX
            )));
        }

        Ok(Self {
            addr: SocketAddr::new(args.host, args.port),
            tls,
            max_message_size: args.max_message_bytes,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        })
    }
}

/// Validated dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub listen: ListenConfig,
    pub chunk_size: ChunkSize,
    pub workers: Vec<WorkerEndpoint>,
    pub staging_dir: PathBuf,
    pub selection: Selection,
    /// `None` waits for jobs indefinitely.
    pub fetch_timeout: Option<Duration>,
    /// `None` disables the job reaper.
    pub job_ttl: Option<Duration>,
    pub reap_interval: Duration,
}

impl TryFrom<DispatcherArgs> for DispatcherConfig {
    type Error = Error;

    fn try_from(args: DispatcherArgs) -> Result<Self> {
        let listen = ListenConfig::try_from(args.listen)?;
        let chunk_size = ChunkSize::new(args.chunk_size)?;

        let addresses: Vec<String> = args
            .workers
            .into_iter()
            .map(|w| w.trim().to_string())
            .filter(|w| !w.is_empty())
            .collect();
        if addresses.is_empty() {
            return Err(Error::configuration("at least one worker address is required"));
        }
        let workers = addresses
            .into_iter()
            .map(|address| WorkerEndpoint {
                connect: ConnectOptions {
                    address,
                    root_certificate: args.worker_root_certificate.clone(),
                    tls_domain: args.worker_tls_domain.clone(),
                    compress: args.compress,
                },
                chunk_size,
            })
            .collect();

        let job_ttl = (args.job_ttl_secs > 0).then(|| Duration::from_secs(args.job_ttl_secs));
        if job_ttl.is_some() && args.reap_interval_secs == 0 {
            return Err(Error::configuration(
                "REAP_INTERVAL_SECS must be greater than 0 when JOB_TTL_SECS is set",
            ));
        }

        Ok(Self {
            listen,
            chunk_size,
            workers,
            staging_dir: args.staging_dir,
            selection: args.selection,
            fetch_timeout: (args.fetch_timeout_secs > 0)
                .then(|| Duration::from_secs(args.fetch_timeout_secs)),
            job_ttl,
            reap_interval: Duration::from_secs(args.reap_interval_secs),
        })
    }
}

/// Validated worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub listen: ListenConfig,
    pub staging_dir: PathBuf,
    pub extractor: String,
    pub extractor_args: Vec<String>,
}

impl TryFrom<WorkerArgs> for WorkerConfig {
    type Error = Error;

    fn try_from(args: WorkerArgs) -> Result<Self> {
        if args.extractor.trim().is_empty() {
            return Err(Error::configuration("EXTRACTOR must not be empty"));
        }
        Ok(Self {
            listen: ListenConfig::try_from(args.listen)?,
            staging_dir: args.staging_dir,
            extractor: args.extractor,
            extractor_args: args.extractor_args,
        })
    }
}
