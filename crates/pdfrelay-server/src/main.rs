use anyhow::Context;
use clap::Parser;
use pdfrelay_server::server::{
    config::{CliArgs, Command, DispatcherConfig, ListenConfig, WorkerConfig},
    listener::{serve_dispatcher, serve_worker},
    service::{dispatcher::DispatchService, extract::CommandExtractor, worker::WorkerService},
    telemetry::init_telemetry,
};
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tokio_stream::wrappers::TcpListenerStream;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();

    let providers = init_telemetry()?;
    let result = match args.command {
        Command::Serve(args) => run_dispatcher(DispatcherConfig::try_from(args)?).await,
        Command::WorkerServe(args) => run_worker(WorkerConfig::try_from(args)?).await,
    };
    providers.shutdown();
    result
}

async fn run_dispatcher(config: DispatcherConfig) -> anyhow::Result<()> {
    let listener = bind(&config.listen).await?;
    log_startup_info("dispatcher", &config.listen, &config);

    let service = DispatchService::new(config.clone()).await?;
    serve_dispatcher(
        service,
        &config.listen,
        TcpListenerStream::new(listener),
        shutdown_signal(),
    )
    .await?;

    tracing::info!("Dispatcher shut down successfully");
    Ok(())
}

async fn run_worker(config: WorkerConfig) -> anyhow::Result<()> {
    let listener = bind(&config.listen).await?;
    log_startup_info("worker", &config.listen, &config);

    let extractor = CommandExtractor::new(config.extractor.clone(), config.extractor_args.clone());
    let service = WorkerService::new(config.staging_dir.clone(), Arc::new(extractor)).await?;
    serve_worker(
        service,
        &config.listen,
        TcpListenerStream::new(listener),
        shutdown_signal(),
    )
    .await?;

    tracing::info!("Worker shut down successfully");
    Ok(())
}

async fn bind(listen: &ListenConfig) -> anyhow::Result<TcpListener> {
    TcpListener::bind(listen.addr)
        .await
        .with_context(|| format!("failed to bind {}", listen.addr))
}

fn log_startup_info(role: &str, listen: &ListenConfig, config: &impl core::fmt::Debug) {
    let tls = if listen.tls.is_some() { "TLS" } else { "plaintext" };
    if cfg!(debug_assertions) {
        tracing::info!("Starting {role} on {} ({tls}) with full config: {config:#?}", listen.addr);
    } else {
        tracing::info!("Starting {role} on {} ({tls})", listen.addr);
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
