//! Chunked file transfer.
//!
//! A file travels between tiers as an ordered stream of [`Chunk`] messages,
//! each at most [`ChunkSize`] bytes long. There is no sequence number on the
//! wire: the order in which chunks arrive is the order in which they are
//! written, so every implementation relies on the in-order delivery of the
//! underlying gRPC stream.
//!
//! ## Operations
//!
//! - [`send_file`] - reads a file and emits one chunk per full (or final
//!   partial) read. A zero-length file emits no chunks.
//! - [`receive_file`] - creates the destination and appends chunks until the
//!   stream ends normally. On error the partially written file is left on
//!   disk; removing it is the caller's job.
//! - [`upload`] - runs [`send_file`] concurrently with a client-streaming call
//!   and returns the call's single reply.
//!
//! The stream endpoints are abstracted by [`ChunkSink`] and [`ChunkSource`] so
//! the same logic serves server-side request streams, server-streamed
//! responses and client-side uploads.

use crate::{ChunkSize, Error, Result, proto::Chunk};
use bytes::Bytes;
use core::future::Future;
use std::path::{Path, PathBuf};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Response, Status, Streaming};

/// Number of chunks buffered between the file reader and an outgoing stream.
pub const UPLOAD_BUFFER_SIZE: usize = 8;

/// Something chunks can be written to, in order.
pub trait ChunkSink: Send {
    fn send_chunk(&mut self, chunk: Chunk) -> impl Future<Output = Result<()>> + Send;
}

/// Something chunks can be read from, in order. `Ok(None)` marks the normal
/// end of the stream.
pub trait ChunkSource: Send {
    fn next_chunk(&mut self) -> impl Future<Output = Result<Option<Chunk>>> + Send;
}

impl ChunkSink for mpsc::Sender<Chunk> {
    async fn send_chunk(&mut self, chunk: Chunk) -> Result<()> {
        self.send(chunk).await.map_err(|_| Error::Transport {
            context: "failed to send chunk via stream: receiver closed".to_string(),
        })
    }
}

impl ChunkSink for mpsc::Sender<core::result::Result<Chunk, Status>> {
    async fn send_chunk(&mut self, chunk: Chunk) -> Result<()> {
        self.send(Ok(chunk)).await.map_err(|_| Error::Transport {
            context: "failed to send chunk via stream: client disconnected".to_string(),
        })
    }
}

impl ChunkSource for mpsc::Receiver<Chunk> {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        Ok(self.recv().await)
    }
}

impl ChunkSource for Streaming<Chunk> {
    async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        self.message().await.map_err(|status| {
            Error::transport(
                "failed unexpectedly while reading chunks from stream",
                status.message(),
            )
        })
    }
}

/// Counters for one transfer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    pub chunks: u64,
    pub bytes: u64,
}

impl TransferStats {
    fn record(&mut self, len: usize) {
        self.chunks += 1;
        self.bytes += len as u64;
    }
}

/// Handle to a completely received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub path: PathBuf,
    pub stats: TransferStats,
}

/// Streams the file at `path` into `sink`, one chunk per `chunk_size` bytes.
///
/// When `delete_after` is set the file is removed once every chunk has been
/// emitted.
///
/// # Errors
///
/// - [`Error::Io`] if the file cannot be opened or read. Chunks already
///   emitted are not retracted.
/// - Whatever the sink reports when a chunk cannot be delivered.
/// - [`Error::Cleanup`] if the transfer succeeded but the file could not be
///   removed.
pub async fn send_file<S>(
    sink: &mut S,
    path: &Path,
    chunk_size: ChunkSize,
    delete_after: bool,
) -> Result<TransferStats>
where
    S: ChunkSink + ?Sized,
{
    let mut file = File::open(path)
        .await
        .map_err(|e| Error::io(format!("failed to open file {}", path.display()), &e))?;

    let mut buf = vec![0_u8; chunk_size.get()];
    let mut stats = TransferStats::default();

    loop {
        let read = fill(&mut file, &mut buf)
            .await
            .map_err(|e| Error::io(format!("failed to read from {}", path.display()), &e))?;
        if read == 0 {
            break;
        }

        sink.send_chunk(Chunk {
            content: Bytes::copy_from_slice(&buf[..read]),
        })
        .await?;
        stats.record(read);

        // A short fill means end of input was reached.
        if read < buf.len() {
            break;
        }
    }
    drop(file);

    if delete_after {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| Error::cleanup(path, &e))?;
    }

    tracing::trace!(
        path = %path.display(),
        chunks = stats.chunks,
        bytes = stats.bytes,
        "file sent"
    );
    Ok(stats)
}

/// Writes every chunk yielded by `source` to a new file at `path`.
///
/// # Errors
///
/// [`Error::Io`] if the file cannot be created or written, or the source's
/// error if the stream breaks. The partial file stays on disk in both cases.
pub async fn receive_file<S>(source: &mut S, path: &Path) -> Result<ReceivedFile>
where
    S: ChunkSource + ?Sized,
{
    let mut file = File::create(path)
        .await
        .map_err(|e| Error::io(format!("failed to create file {}", path.display()), &e))?;
    let mut stats = TransferStats::default();

    while let Some(chunk) = source.next_chunk().await? {
        file.write_all(&chunk.content)
            .await
            .map_err(|e| Error::io(format!("failed to write into file {}", path.display()), &e))?;
        stats.record(chunk.content.len());
    }

    file.flush()
        .await
        .map_err(|e| Error::io(format!("failed to flush file {}", path.display()), &e))?;

    tracing::trace!(
        path = %path.display(),
        chunks = stats.chunks,
        bytes = stats.bytes,
        "file received"
    );
    Ok(ReceivedFile {
        path: path.to_path_buf(),
        stats,
    })
}

/// Uploads `path` through a client-streaming call and returns its reply.
///
/// `call` receives the request stream and must return the call future, e.g.
/// `|stream| async move { client.process(stream).await }`. The file is read
/// while the call is in flight. If reading fails the call is dropped before
/// the request stream ends, so the peer never sees a truncated file as a
/// complete one. The source file is never deleted.
///
/// # Errors
///
/// The local read error, or [`Error::Transport`] carrying the call's status.
pub async fn upload<T, F, Fut>(path: &Path, chunk_size: ChunkSize, call: F) -> Result<T>
where
    F: FnOnce(ReceiverStream<Chunk>) -> Fut,
    Fut: Future<Output = core::result::Result<Response<T>, Status>>,
{
    let (tx, rx) = mpsc::channel(UPLOAD_BUFFER_SIZE);
    let call = call(ReceiverStream::new(rx));
    let send = async move {
        let mut tx = tx;
        send_file(&mut tx, path, chunk_size, false).await
    };
    tokio::pin!(call);
    tokio::pin!(send);

    tokio::select! {
        biased;
        reply = &mut call => reply
            .map(Response::into_inner)
            .map_err(|status| Error::transport("call ended before the upload completed", status.message())),
        sent = &mut send => {
            sent?;
            call.await
                .map(Response::into_inner)
                .map_err(|status| Error::transport("failed to receive upstream status response", status.message()))
        }
    }
}

/// Reads until `buf` is full or the file ends.
async fn fill(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tempfile::TempDir;
    use tokio_stream::StreamExt;

    impl ChunkSink for Vec<Chunk> {
        async fn send_chunk(&mut self, chunk: Chunk) -> Result<()> {
            self.push(chunk);
            Ok(())
        }
    }

    struct ScriptedSource {
        chunks: VecDeque<Chunk>,
        break_at_end: bool,
    }

    impl ScriptedSource {
        fn new(chunks: Vec<Chunk>) -> Self {
            Self {
                chunks: chunks.into(),
                break_at_end: false,
            }
        }

        fn broken(chunks: Vec<Chunk>) -> Self {
            Self {
                chunks: chunks.into(),
                break_at_end: true,
            }
        }
    }

    impl ChunkSource for ScriptedSource {
        async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
            match self.chunks.pop_front() {
                Some(chunk) => Ok(Some(chunk)),
                None if self.break_at_end => Err(Error::Transport {
                    context: "connection reset".to_string(),
                }),
                None => Ok(None),
            }
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn chunk(bytes: &'static [u8]) -> Chunk {
        Chunk {
            content: Bytes::from_static(bytes),
        }
    }

    #[tokio::test]
    async fn round_trip_is_byte_identical_with_ceil_chunks() {
        let dir = TempDir::new().unwrap();
        let size = ChunkSize::new(1024).unwrap();

        for len in [0, 1, 1023, 1024, 1025, 3 * 1024, 10_000] {
            let src = dir.path().join(format!("in-{len}.pdf"));
            let dst = dir.path().join(format!("out-{len}.pdf"));
            tokio::fs::write(&src, pattern(len)).await.unwrap();

            let mut sent = Vec::new();
            let stats = send_file(&mut sent, &src, size, false).await.unwrap();

            let expected_chunks = size.chunks_for(len as u64);
            assert_eq!(sent.len() as u64, expected_chunks, "len {len}");
            assert_eq!(stats.chunks, expected_chunks);
            assert_eq!(stats.bytes, len as u64);
            assert!(
                sent.iter()
                    .all(|c| !c.content.is_empty() && c.content.len() <= size.get())
            );

            let received = receive_file(&mut ScriptedSource::new(sent), &dst)
                .await
                .unwrap();
            assert_eq!(received.path, dst);
            assert_eq!(received.stats, stats);
            assert_eq!(tokio::fs::read(&dst).await.unwrap(), pattern(len));
            assert!(src.exists());
        }
    }

    #[tokio::test]
    async fn round_trip_over_channel_with_max_chunk() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("big.pdf");
        let dst = dir.path().join("copy.pdf");
        let len = ChunkSize::MAX * 2 + 17;
        tokio::fs::write(&src, pattern(len)).await.unwrap();
        let size = ChunkSize::new(ChunkSize::MAX).unwrap();

        let (mut tx, mut rx) = mpsc::channel(UPLOAD_BUFFER_SIZE);
        let sender = async move { send_file(&mut tx, &src, size, false).await };
        let (sent, received) = tokio::join!(sender, receive_file(&mut rx, &dst));

        assert_eq!(sent.unwrap().chunks, 3);
        assert_eq!(received.unwrap().stats.bytes, len as u64);
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), pattern(len));
    }

    #[tokio::test]
    async fn delete_after_removes_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("result.txt");
        tokio::fs::write(&src, b"hello").await.unwrap();

        let mut sent = Vec::new();
        send_file(&mut sent, &src, ChunkSize::default(), true)
            .await
            .unwrap();

        assert_eq!(sent.len(), 1);
        assert!(!src.exists());
    }

    #[tokio::test]
    async fn missing_source_is_io_error() {
        let dir = TempDir::new().unwrap();
        let mut sent = Vec::new();
        let err = send_file(
            &mut sent,
            &dir.path().join("missing.pdf"),
            ChunkSize::default(),
            false,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Io { .. }));
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn closed_sink_aborts_send() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in.pdf");
        tokio::fs::write(&src, pattern(64)).await.unwrap();

        let (mut tx, rx) = mpsc::channel::<Chunk>(1);
        drop(rx);
        let err = send_file(&mut tx, &src, ChunkSize::new(8).unwrap(), true)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport { .. }));
        // Deletion only happens after a complete transfer.
        assert!(src.exists());
    }

    #[tokio::test]
    async fn broken_stream_leaves_partial_file() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("partial.pdf");
        let mut source = ScriptedSource::broken(vec![chunk(b"abc"), chunk(b"def")]);

        let err = receive_file(&mut source, &dst).await.unwrap_err();

        assert!(matches!(err, Error::Transport { .. }));
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn empty_stream_creates_empty_file() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("empty.pdf");

        let received = receive_file(&mut ScriptedSource::new(Vec::new()), &dst)
            .await
            .unwrap();

        assert_eq!(received.stats, TransferStats::default());
        assert!(tokio::fs::read(&dst).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_returns_reply_after_whole_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in.pdf");
        tokio::fs::write(&src, pattern(5000)).await.unwrap();

        let (chunks, bytes) = upload(&src, ChunkSize::new(1000).unwrap(), |mut stream| async move {
            let mut chunks = 0;
            let mut bytes = 0;
            while let Some(chunk) = stream.next().await {
                chunks += 1;
                bytes += chunk.content.len();
            }
            Ok(Response::new((chunks, bytes)))
        })
        .await
        .unwrap();

        assert_eq!((chunks, bytes), (5, 5000));
    }

    #[tokio::test]
    async fn upload_read_failure_wins_over_reply() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.pdf");

        // The fake peer happily answers once the stream ends; the local read
        // error must still be reported instead of that reply.
        let err = upload(&missing, ChunkSize::default(), |mut stream| async move {
            while stream.next().await.is_some() {}
            Ok(Response::new(()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Io { .. }));
    }

    #[tokio::test]
    async fn upload_surfaces_call_status() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in.pdf");
        tokio::fs::write(&src, pattern(10)).await.unwrap();

        let err = upload(&src, ChunkSize::default(), |_stream| async move {
            Err::<Response<()>, _>(Status::unavailable("worker down"))
        })
        .await
        .unwrap_err();

        assert_eq!(
            err,
            Error::Transport {
                context: "call ended before the upload completed: worker down".to_string()
            }
        );
    }
}
