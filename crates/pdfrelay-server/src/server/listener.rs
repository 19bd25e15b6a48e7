//! tonic server setup shared by the dispatcher and worker roles.
//!
//! Both servers register the gRPC health service and v1 server reflection,
//! accept and offer zstd, gzip and deflate, raise the message size limits,
//! and shut down gracefully when `signal` resolves.

use crate::server::{
    config::ListenConfig,
    service::{dispatcher::DispatchService, worker::WorkerService},
};
use futures::Stream;
use pdfrelay_core::{
    Error, Result,
    proto::{
        FILE_DESCRIPTOR_SET, text_dispatcher_server::TextDispatcherServer,
        text_worker_server::TextWorkerServer,
    },
};
use tokio::io::{AsyncRead, AsyncWrite};
use tonic::{
    codec::CompressionEncoding,
    transport::{Server, server::Connected},
};

const ENCODINGS: [CompressionEncoding; 3] = [
    CompressionEncoding::Zstd,
    CompressionEncoding::Gzip,
    CompressionEncoding::Deflate,
];

/// Serves `TextDispatcher` on `incoming` until `signal` resolves, then marks
/// the service not serving and drains it.
pub async fn serve_dispatcher<I, IO, IE, F>(
    service: DispatchService,
    listen: &ListenConfig,
    incoming: I,
    signal: F,
) -> Result<()>
where
    I: Stream<Item = core::result::Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
    F: Future<Output = ()>,
{
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<TextDispatcherServer<DispatchService>>()
        .await;

    let mut grpc = TextDispatcherServer::new(service.clone())
        .max_decoding_message_size(listen.max_message_size)
        .max_encoding_message_size(listen.max_message_size);
    for encoding in ENCODINGS {
        grpc = grpc.accept_compressed(encoding).send_compressed(encoding);
    }

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|e| Error::configuration(format!("failed to build reflection service: {e}")))?;

    let shutdown = async {
        signal.await;
        tracing::info!("shutdown signal received, terminating gracefully");
        health_reporter
            .set_not_serving::<TextDispatcherServer<DispatchService>>()
            .await;
        service.shutdown().await;
    };

    builder(listen)
        .await?
        .add_service(health_service)
        .add_service(reflection)
        .add_service(grpc)
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await
        .map_err(|e| Error::transport("dispatcher server failed", e))
}

/// Serves `TextWorker` on `incoming` until `signal` resolves.
pub async fn serve_worker<I, IO, IE, F>(
    service: WorkerService,
    listen: &ListenConfig,
    incoming: I,
    signal: F,
) -> Result<()>
where
    I: Stream<Item = core::result::Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
    F: Future<Output = ()>,
{
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<TextWorkerServer<WorkerService>>()
        .await;

    let mut grpc = TextWorkerServer::new(service.clone())
        .max_decoding_message_size(listen.max_message_size)
        .max_encoding_message_size(listen.max_message_size);
    for encoding in ENCODINGS {
        grpc = grpc.accept_compressed(encoding).send_compressed(encoding);
    }

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()
        .map_err(|e| Error::configuration(format!("failed to build reflection service: {e}")))?;

    let shutdown = async {
        signal.await;
        tracing::info!("shutdown signal received, terminating gracefully");
        health_reporter
            .set_not_serving::<TextWorkerServer<WorkerService>>()
            .await;
        service.shutdown();
    };

    builder(listen)
        .await?
        .add_service(health_service)
        .add_service(reflection)
        .add_service(grpc)
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await
        .map_err(|e| Error::transport("worker server failed", e))
}

async fn builder(listen: &ListenConfig) -> Result<Server> {
    let builder = Server::builder().http2_adaptive_window(Some(true));
    match &listen.tls {
        Some(identity) => builder
            .tls_config(identity.load().await?)
            .map_err(|e| Error::configuration(format!("invalid TLS identity: {e}"))),
        None => Ok(builder),
    }
}
