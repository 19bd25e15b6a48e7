//! Dispatcher, workers and front-end client wired together over loopback.

use core::time::Duration;
use pdfrelay_client::{ClientConfig, FrontEndClient};
use pdfrelay_core::{
    ChunkSize, Error, JobId, Result,
    channel::ConnectOptions,
    proto::{JobRequest, JobState as WireJobState, text_dispatcher_client::TextDispatcherClient},
    types::DEFAULT_MAX_MESSAGE_SIZE,
};
use pdfrelay_server::server::{
    config::{DispatcherConfig, ListenConfig},
    listener::{serve_dispatcher, serve_worker},
    pool::{proxy::WorkerEndpoint, strategy::Selection},
    service::{dispatcher::DispatchService, extract::Extractor, worker::WorkerService},
};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::Notify};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;

/// Prefixes the upload with `[tag]` so tests can tell which worker ran it.
/// `pad` extra bytes are appended to make the text larger than the upload.
struct Tag {
    tag: String,
    gate: Option<Arc<Notify>>,
    fail: bool,
    pad: usize,
}

#[tonic::async_trait]
impl Extractor for Tag {
    async fn extract(&self, input: &Path, output: &Path) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            return Err(Error::Extraction {
                reason: "not a pdf".into(),
            });
        }
        let mut text = format!("[{}]", self.tag).into_bytes();
        text.extend(tokio::fs::read(input).await.unwrap());
        text.extend(body(self.pad, 0));
        tokio::fs::write(output, text).await.unwrap();
        Ok(())
    }
}

fn listen_config(addr: SocketAddr) -> ListenConfig {
    ListenConfig {
        addr,
        tls: None,
        max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        shutdown_timeout: Duration::from_secs(1),
    }
}

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

struct Cluster {
    client: FrontEndClient,
    addr: SocketAddr,
    staging: PathBuf,
    worker_dirs: Vec<PathBuf>,
    shutdown: CancellationToken,
    dir: TempDir,
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Cluster {
    async fn start(workers: Vec<Tag>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = CancellationToken::new();

        let mut endpoints = Vec::new();
        let mut worker_dirs = Vec::new();
        for (i, extractor) in workers.into_iter().enumerate() {
            let staging = dir.path().join(format!("worker{i}"));
            let service = WorkerService::new(staging.clone(), Arc::new(extractor))
                .await
                .unwrap();
            let (listener, addr) = bind().await;
            let signal = shutdown.clone().cancelled_owned();
            tokio::spawn(async move {
                serve_worker(
                    service,
                    &listen_config(addr),
                    TcpListenerStream::new(listener),
                    signal,
                )
                .await
                .unwrap();
            });
            endpoints.push(WorkerEndpoint {
                connect: ConnectOptions::plaintext(addr.to_string()),
                chunk_size: ChunkSize::new(64).unwrap(),
            });
            worker_dirs.push(staging);
        }

        let (listener, addr) = bind().await;
        let staging = dir.path().join("dispatcher");
        let config = DispatcherConfig {
            listen: listen_config(addr),
            chunk_size: ChunkSize::new(64).unwrap(),
            workers: endpoints,
            staging_dir: staging.clone(),
            selection: Selection::RoundRobin,
            fetch_timeout: None,
            job_ttl: None,
            reap_interval: Duration::from_secs(60),
        };
        let service = DispatchService::new(config.clone()).await.unwrap();
        let signal = shutdown.clone().cancelled_owned();
        tokio::spawn(async move {
            serve_dispatcher(
                service,
                &config.listen,
                TcpListenerStream::new(listener),
                signal,
            )
            .await
            .unwrap();
        });

        let client = FrontEndClient::connect(ClientConfig {
            connect: ConnectOptions::plaintext(addr.to_string()),
            chunk_size: ChunkSize::new(100).unwrap(),
            txt_dir: dir.path().to_path_buf(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        })
        .await
        .unwrap();

        Self {
            client,
            addr,
            staging,
            worker_dirs,
            shutdown,
            dir,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    async fn pdf(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.path(name);
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    async fn assert_staging_empty(&self) {
        let mut dirs = vec![self.staging.join("incoming"), self.staging.join("outgoing")];
        dirs.extend(self.worker_dirs.iter().cloned());
        for dir in dirs {
            let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
            assert!(
                entries.next_entry().await.unwrap().is_none(),
                "{} is not empty",
                dir.display()
            );
        }
    }
}

fn worker(tag: &str) -> Tag {
    Tag {
        tag: tag.to_string(),
        gate: None,
        fail: false,
        pad: 0,
    }
}

fn body(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
}

fn tagged(tag: &str, content: &[u8]) -> Vec<u8> {
    let mut text = format!("[{tag}]").into_bytes();
    text.extend_from_slice(content);
    text
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_round_trip() {
    let cluster = Cluster::start(vec![worker("w0")]).await;
    let content = body(1000, 7);
    let pdf = cluster.pdf("doc.pdf", &content).await;
    let out = cluster.path("doc.txt");

    let written = cluster.client.process_sync(&pdf, &out).await.unwrap();

    assert_eq!(written, out);
    assert_eq!(tokio::fs::read(&out).await.unwrap(), tagged("w0", &content));
    cluster.assert_staging_empty().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn submit_then_fetch_once() {
    let cluster = Cluster::start(vec![worker("w0")]).await;
    let content = body(333, 1);
    let pdf = cluster.pdf("doc.pdf", &content).await;
    let out = cluster.path("doc.txt");

    let id = cluster.client.submit(&pdf).await.unwrap();
    let written = cluster.client.fetch(&id, &out).await.unwrap();

    assert_eq!(written, out);
    assert_eq!(tokio::fs::read(&out).await.unwrap(), tagged("w0", &content));
    cluster.assert_staging_empty().await;

    let again = cluster.client.fetch(&id, &cluster.path("again.txt")).await;
    assert_eq!(again.unwrap_err(), Error::UnknownJob { id: id.to_string() });
    assert!(!cluster.path("again.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_waits_for_a_running_job() {
    let gate = Arc::new(Notify::new());
    let cluster = Cluster::start(vec![Tag {
        gate: Some(Arc::clone(&gate)),
        ..worker("slow")
    }])
    .await;
    let pdf = cluster.pdf("doc.pdf", b"%PDF-1.4").await;
    let out = cluster.path("doc.txt");

    let id = cluster.client.submit(&pdf).await.unwrap();
    let mut state = cluster.client.status(&id).await.unwrap().state();
    for _ in 0..50 {
        if state == WireJobState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        state = cluster.client.status(&id).await.unwrap().state();
    }
    assert_eq!(state, WireJobState::Running);

    let fetch = tokio::spawn({
        let client = cluster.client.clone();
        let id = id.clone();
        let out = out.clone();
        async move { client.fetch(&id, &out).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!fetch.is_finished());

    gate.notify_one();
    fetch.await.unwrap().unwrap();
    assert_eq!(
        tokio::fs::read(&out).await.unwrap(),
        tagged("slow", b"%PDF-1.4")
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_job_fails_fast() {
    let cluster = Cluster::start(vec![worker("w0")]).await;
    let id = JobId::from("no-such-job");

    let fetched = tokio::time::timeout(
        Duration::from_secs(5),
        cluster.client.fetch(&id, &cluster.path("x.txt")),
    )
    .await
    .unwrap();
    assert_eq!(fetched.unwrap_err(), Error::UnknownJob { id: id.to_string() });

    let status = cluster.client.status(&id).await;
    assert_eq!(status.unwrap_err(), Error::UnknownJob { id: id.to_string() });
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_jobs_stay_isolated() {
    let cluster = Cluster::start(vec![worker("w0"), worker("w1")]).await;

    let mut calls = Vec::new();
    for i in 0..8u8 {
        let content = body(500 + usize::from(i) * 37, i);
        let pdf = cluster.pdf(&format!("doc{i}.pdf"), &content).await;
        let out = cluster.path(&format!("doc{i}.txt"));
        let client = cluster.client.clone();
        calls.push(tokio::spawn(async move {
            client.process_async(&pdf, &out).await.unwrap();
            (content, tokio::fs::read(&out).await.unwrap())
        }));
    }

    for call in calls {
        let (content, text) = call.await.unwrap();
        assert!(
            text == tagged("w0", &content) || text == tagged("w1", &content),
            "result does not match its upload"
        );
    }
    cluster.assert_staging_empty().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn worker_failure_reaches_the_client() {
    let cluster = Cluster::start(vec![Tag {
        fail: true,
        ..worker("bad")
    }])
    .await;
    let pdf = cluster.pdf("doc.pdf", b"garbage").await;

    let sync = cluster
        .client
        .process_sync(&pdf, &cluster.path("sync.txt"))
        .await
        .unwrap_err();
    assert!(matches!(&sync, Error::Remote { message } if message.contains("not a pdf")));

    let id = cluster.client.submit(&pdf).await.unwrap();
    let fetched = cluster
        .client
        .fetch(&id, &cluster.path("async.txt"))
        .await
        .unwrap_err();
    assert!(matches!(&fetched, Error::Remote { message } if message.contains("not a pdf")));
    assert!(!cluster.path("async.txt").exists());
    cluster.assert_staging_empty().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn round_robin_alternates_workers() {
    let cluster = Cluster::start(vec![worker("w0"), worker("w1")]).await;
    let pdf = cluster.pdf("doc.pdf", b"x").await;

    let mut tags = Vec::new();
    for call in 0..4 {
        let out = cluster.client.result_path(&pdf, call);
        cluster.client.process_sync(&pdf, &out).await.unwrap();
        tags.push(tokio::fs::read(&out).await.unwrap());
    }

    assert_eq!(
        tags,
        vec![
            tagged("w0", b"x"),
            tagged("w1", b"x"),
            tagged("w0", b"x"),
            tagged("w1", b"x"),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn round_robin_advances_past_failed_dispatch() {
    let cluster = Cluster::start(vec![
        Tag {
            fail: true,
            ..worker("bad")
        },
        worker("w1"),
    ])
    .await;
    let pdf = cluster.pdf("doc.pdf", b"x").await;

    let mut outcomes = Vec::new();
    for call in 0..4 {
        let out = cluster.client.result_path(&pdf, call);
        outcomes.push(match cluster.client.process_sync(&pdf, &out).await {
            Ok(_) => Some(tokio::fs::read(&out).await.unwrap()),
            Err(e) => {
                assert!(matches!(&e, Error::Remote { message } if message.contains("not a pdf")));
                None
            }
        });
    }

    assert_eq!(
        outcomes,
        vec![None, Some(tagged("w1", b"x")), None, Some(tagged("w1", b"x"))]
    );
    cluster.assert_staging_empty().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn broken_fetch_stream_keeps_job_fetchable() {
    // Far beyond what the HTTP/2 windows can buffer, so the dispatcher is
    // still sending when the stream goes away.
    let pad = 6 << 20;
    let cluster = Cluster::start(vec![Tag { pad, ..worker("w0") }]).await;
    let pdf = cluster.pdf("doc.pdf", b"%PDF-1.4").await;
    let id = cluster.client.submit(&pdf).await.unwrap();

    let channel = ConnectOptions::plaintext(cluster.addr.to_string())
        .connect()
        .await
        .unwrap();
    let mut raw = TextDispatcherClient::new(channel);
    let mut stream = raw
        .fetch(JobRequest {
            job_id: id.to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    let first = stream.message().await.unwrap().unwrap();
    assert!(!first.content.is_empty());
    drop(stream);
    drop(raw);

    // The claim is released once the dispatcher notices the reset.
    let out = cluster.path("doc.txt");
    let mut fetched = cluster.client.fetch(&id, &out).await;
    for _ in 0..200 {
        if !matches!(fetched, Err(Error::UnknownJob { .. })) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        fetched = cluster.client.fetch(&id, &out).await;
    }
    assert_eq!(fetched.unwrap(), out);

    let mut expected = tagged("w0", b"%PDF-1.4");
    expected.extend(body(pad, 0));
    assert_eq!(tokio::fs::read(&out).await.unwrap(), expected);
    cluster.assert_staging_empty().await;

    let again = cluster.client.fetch(&id, &cluster.path("again.txt")).await;
    assert_eq!(again.unwrap_err(), Error::UnknownJob { id: id.to_string() });
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_upload_round_trips() {
    let cluster = Cluster::start(vec![worker("w0")]).await;
    let pdf = cluster.pdf("empty.pdf", b"").await;

    let out = cluster.path("sync.txt");
    cluster.client.process_sync(&pdf, &out).await.unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), tagged("w0", b""));

    let out = cluster.path("async.txt");
    cluster.client.process_async(&pdf, &out).await.unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), tagged("w0", b""));
    cluster.assert_staging_empty().await;
}
