use crate::torrent::{BufferPool, Piece, PieceBuffer, PieceIndex, TorrentFile};
use bytes::Bytes;
use derive_more::Display;
use fx_handle::Handle;
use log::{debug, trace};
use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Mutex, RwLock};
use tokio::time;
use tokio_util::sync::CancellationToken;

const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'.');

/// A unique handle identifier of an [UrlDownloader].
pub type DownloaderHandle = Handle;

/// The result type of web seed operations.
pub type WebSeedResult<T> = std::result::Result<T, WebSeedError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum WebSeedError {
    /// The web seed responded with a status outside of the accepted 200/206 set.
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),
    /// The http request could not be executed.
    #[error("webseed request failed, {0}")]
    Request(String),
    /// A body read stalled beyond the read timeout.
    #[error("webseed read timed out")]
    Timeout,
    /// The response body ended before the requested range was served.
    #[error("webseed response ended unexpectedly")]
    UnexpectedEof,
    /// The downloader has been closed.
    #[error("the downloader has been closed")]
    Closed,
}

/// A completed piece or terminal failure emitted by an [UrlDownloader].
/// Ownership of the carried buffer transfers to the receiver of the result.
pub struct PieceResult {
    /// The handle of the originating downloader.
    pub downloader: DownloaderHandle,
    /// The piece-sized buffer of a successfully downloaded piece.
    pub buffer: Option<PieceBuffer>,
    /// The index of the downloaded piece.
    pub index: PieceIndex,
    /// The terminal error of the downloader, if any.
    pub error: Option<WebSeedError>,
    /// Indicates that this is the last piece of the downloader's range.
    pub done: bool,
}

impl Debug for PieceResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceResult")
            .field("downloader", &self.downloader)
            .field("buffer", &self.buffer)
            .field("index", &self.index)
            .field("error", &self.error)
            .field("done", &self.done)
            .finish()
    }
}

impl PartialEq for PieceResult {
    fn eq(&self, other: &Self) -> bool {
        self.downloader == other.downloader
            && self.index == other.index
            && self.error == other.error
            && self.done == other.done
            && self.buffer.as_deref() == other.buffer.as_deref()
    }
}

/// A single http range request covering a part of the downloader's piece range.
#[derive(Debug, Clone, PartialEq)]
struct DownloadJob {
    /// The file name appended to the web seed url in multi file mode.
    filename: String,
    /// The byte offset of the range within the file.
    range_begin: u64,
    /// The length of the range in bytes.
    length: u64,
}

/// Calculate the download jobs covering the byte span of pieces `[begin, end)`.
/// Each job addresses a single file of the torrent payload.
fn create_jobs(
    pieces: &[Piece],
    files: &[TorrentFile],
    begin: PieceIndex,
    end: PieceIndex,
) -> Vec<DownloadJob> {
    let span_begin = pieces[begin].offset;
    let span_end = pieces[end - 1].offset + pieces[end - 1].length as u64;

    files
        .iter()
        .filter(|file| {
            let file_end = file.offset + file.length;
            file_end > span_begin && file.offset < span_end
        })
        .map(|file| {
            let file_end = file.offset + file.length;
            let range_begin = span_begin.max(file.offset) - file.offset;
            let range_end = span_end.min(file_end) - file.offset;
            DownloadJob {
                filename: file.path.clone(),
                range_begin,
                length: range_end - range_begin,
            }
        })
        .collect()
}

/// Build the request url for the given job file name.
/// In single file mode the source url is used as-is, unless it ends with a slash.
/// In multi file mode the source url is treated as a directory prefix.
fn request_url(source: &str, filename: &str, multi_file: bool) -> String {
    let encoded: String = filename
        .split('/')
        .map(|segment| percent_encode(segment.as_bytes(), URL_ENCODE_RESERVED).to_string())
        .collect::<Vec<_>>()
        .join("/");

    if !multi_file {
        if source.ends_with('/') {
            return format!("{}{}", source, encoded);
        }
        return source.to_string();
    }

    if source.ends_with('/') {
        format!("{}{}", source, encoded)
    } else {
        format!("{}/{}", source, encoded)
    }
}

/// A web seed worker streaming the contiguous piece range `[begin, end)` from an
/// http endpoint into piece-sized buffers.
///
/// One [PieceResult] is emitted per completed piece, the result carrying the last
/// piece of the range has its done flag set. Any error terminates the downloader
/// after emitting a single error result.
#[derive(Debug, Display, Clone)]
#[display("{}", inner)]
pub struct UrlDownloader {
    inner: Arc<InnerUrlDownloader>,
}

impl UrlDownloader {
    /// Create a new downloader for the given url and piece range `[begin, end)`.
    pub fn new<S: AsRef<str>>(url: S, begin: PieceIndex, end: PieceIndex) -> Self {
        Self {
            inner: Arc::new(InnerUrlDownloader {
                handle: DownloaderHandle::new(),
                url: url.as_ref().to_string(),
                begin,
                end,
                current: Mutex::new(begin),
                cancellation_token: CancellationToken::new(),
                done: CancellationToken::new(),
            }),
        }
    }

    /// Get the unique handle of the downloader.
    pub fn handle(&self) -> DownloaderHandle {
        self.inner.handle
    }

    /// Get the first piece index of the downloader's range.
    pub fn begin(&self) -> PieceIndex {
        self.inner.begin
    }

    /// Get the end-exclusive piece index of the downloader's range.
    pub fn end(&self) -> PieceIndex {
        self.inner.end
    }

    /// Get the piece index the downloader is currently working on.
    pub async fn current(&self) -> PieceIndex {
        *self.inner.current.lock().await
    }

    /// Start the downloader.
    ///
    /// # Arguments
    ///
    /// * `client` - The http client used for the range requests.
    /// * `pieces` - The piece layout of the torrent, shared with its other readers.
    /// * `files` - The file layout of the torrent payload.
    /// * `multi_file` - Whether the torrent payload consists of multiple files.
    /// * `pool` - The buffer pool used for the piece buffers.
    /// * `result_tx` - The channel onto which piece results are emitted.
    /// * `read_timeout` - The stall guard timeout applied to each body read.
    pub fn start(
        &self,
        client: Client,
        pieces: Arc<RwLock<Vec<Piece>>>,
        files: Arc<Vec<TorrentFile>>,
        multi_file: bool,
        pool: BufferPool,
        result_tx: UnboundedSender<PieceResult>,
        read_timeout: Duration,
    ) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner
                .run(client, pieces, files, multi_file, pool, result_tx, read_timeout)
                .await;
        });
    }

    /// Close the downloader and await its termination.
    pub async fn close(&self) {
        self.inner.cancellation_token.cancel();
        self.inner.done.cancelled().await;
    }
}

#[derive(Debug, Display)]
#[display("{} [{}, {})", handle, begin, end)]
struct InnerUrlDownloader {
    handle: DownloaderHandle,
    url: String,
    begin: PieceIndex,
    end: PieceIndex,
    current: Mutex<PieceIndex>,
    cancellation_token: CancellationToken,
    done: CancellationToken,
}

impl InnerUrlDownloader {
    async fn run(
        &self,
        client: Client,
        pieces: Arc<RwLock<Vec<Piece>>>,
        files: Arc<Vec<TorrentFile>>,
        multi_file: bool,
        pool: BufferPool,
        result_tx: UnboundedSender<PieceResult>,
        read_timeout: Duration,
    ) {
        trace!("Url downloader {} started for {}", self, self.url);
        let result = self
            .stream_pieces(client, pieces, files, multi_file, pool, &result_tx, read_timeout)
            .await;

        match result {
            Ok(()) => debug!("Url downloader {} completed its range", self),
            Err(WebSeedError::Closed) => trace!("Url downloader {} has been closed", self),
            Err(e) => {
                debug!("Url downloader {} failed, {}", self, e);
                let index = *self.current.lock().await;
                let _ = result_tx.send(PieceResult {
                    downloader: self.handle,
                    buffer: None,
                    index,
                    error: Some(e),
                    done: false,
                });
            }
        }

        self.done.cancel();
    }

    async fn stream_pieces(
        &self,
        client: Client,
        pieces: Arc<RwLock<Vec<Piece>>>,
        files: Arc<Vec<TorrentFile>>,
        multi_file: bool,
        pool: BufferPool,
        result_tx: &UnboundedSender<PieceResult>,
        read_timeout: Duration,
    ) -> WebSeedResult<()> {
        // plan the jobs and the first piece buffer under the pieces lock
        let (jobs, mut buffer) = {
            let pieces = pieces.read().await;
            let current = *self.current.lock().await;
            (
                create_jobs(&pieces, &files, self.begin, self.end),
                pool.get(pieces[current].length),
            )
        };

        // position within the current piece buffer
        let mut n = 0usize;
        for job in jobs {
            let url = request_url(&self.url, &job.filename, multi_file);
            trace!(
                "Url downloader {} is requesting bytes {}-{} of {}",
                self,
                job.range_begin,
                job.range_begin + job.length - 1,
                url
            );
            let response = tokio::select! {
                _ = self.cancellation_token.cancelled() => return Err(WebSeedError::Closed),
                response = client
                    .get(&url)
                    .header(
                        "Range",
                        format!("bytes={}-{}", job.range_begin, job.range_begin + job.length - 1),
                    )
                    .send() => response.map_err(|e| WebSeedError::Request(e.to_string()))?,
            };
            let status = response.status().as_u16();
            if status != 200 && status != 206 {
                return Err(WebSeedError::UnexpectedStatus(status));
            }

            // position within the response body
            let mut m = 0u64;
            let mut response = response;
            while m < job.length {
                let chunk = self.read_chunk(&mut response, read_timeout).await?;

                let mut chunk_pos = 0usize;
                while chunk_pos < chunk.len() && m < job.length {
                    // each read is bounded by the piece and the job remainder
                    let read_size = (buffer.len() - n)
                        .min((job.length - m) as usize)
                        .min(chunk.len() - chunk_pos);
                    buffer[n..n + read_size]
                        .copy_from_slice(&chunk[chunk_pos..chunk_pos + read_size]);
                    n += read_size;
                    m += read_size as u64;
                    chunk_pos += read_size;

                    if n == buffer.len() {
                        // piece completed
                        let (index, done) = {
                            let mut current = self.current.lock().await;
                            let index = *current;
                            *current += 1;
                            (index, *current >= self.end)
                        };

                        self.send_piece(result_tx, buffer, index, done)?;
                        if done {
                            return Ok(());
                        }

                        n = 0;
                        let pieces = pieces.read().await;
                        buffer = pool.get(pieces[index + 1].length);
                    }
                }
            }
        }

        Ok(())
    }

    /// Read the next body chunk, guarded by the read timeout and the close signal.
    async fn read_chunk(
        &self,
        response: &mut reqwest::Response,
        read_timeout: Duration,
    ) -> WebSeedResult<Bytes> {
        tokio::select! {
            _ = self.cancellation_token.cancelled() => Err(WebSeedError::Closed),
            chunk = time::timeout(read_timeout, response.chunk()) => match chunk {
                Err(_) => Err(WebSeedError::Timeout),
                Ok(Err(e)) => Err(WebSeedError::Request(e.to_string())),
                Ok(Ok(None)) => Err(WebSeedError::UnexpectedEof),
                Ok(Ok(Some(chunk))) => Ok(chunk),
            },
        }
    }

    fn send_piece(
        &self,
        result_tx: &UnboundedSender<PieceResult>,
        buffer: PieceBuffer,
        index: PieceIndex,
        done: bool,
    ) -> WebSeedResult<()> {
        if self.cancellation_token.is_cancelled() {
            return Err(WebSeedError::Closed);
        }

        trace!("Url downloader {} completed piece {}", self, index);
        let _ = result_tx.send(PieceResult {
            downloader: self.handle,
            buffer: Some(buffer),
            index,
            error: None,
            done,
        });
        Ok(())
    }
}
