//! Fetching the raw bytes of a resource.
//!
//! The [`ResourceLoader`] streams a resource through a [`Transport`], reports progress, honours
//! cancellation at every read boundary and applies an optional [`PostProcessor`]. It consults a
//! [`ConnectivityOracle`] before ever contacting the transport.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheContents, CacheError};
use crate::config::Config;

mod filesystem;
mod http;

pub use filesystem::FilesystemTransport;
pub use http::HttpTransport;

/// The user agent sent with every HTTP request.
pub const USER_AGENT: &str = concat!("fastimage/", env!("CARGO_PKG_VERSION"));

/// The size of the chunks the response body is read in when its length is unknown.
pub const CHUNK_SIZE: usize = 10 * 1024;

/// Responses announcing more than this are accumulated in chunks instead of a fixed buffer.
const MAX_FIXED_BUFFER: u64 = 64 * 1024 * 1024;

/// An opened resource.
pub struct TransportResponse {
    /// The announced length of the body. `None` and `Some(0)` both mean unknown.
    pub content_length: Option<u64>,
    /// The body. Dropping it closes the underlying connection or file.
    pub body: Pin<Box<dyn AsyncRead + Send>>,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// The way raw bytes are retrieved for a key.
pub trait Transport: Send + Sync + 'static {
    /// Opens the resource identified by `url`.
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, CacheContents<TransportResponse>>;
}

/// Dispatches `file://` URLs and plain paths to the filesystem, and everything else to HTTP.
#[derive(Debug)]
pub struct DefaultTransport {
    pub http: HttpTransport,
    pub filesystem: FilesystemTransport,
}

impl Transport for DefaultTransport {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, CacheContents<TransportResponse>> {
        if FilesystemTransport::handles(url) {
            self.filesystem.open(url)
        } else {
            self.http.open(url)
        }
    }
}

/// Reports whether the device can currently reach the network.
pub trait ConnectivityOracle: Send + Sync + 'static {
    fn is_online(&self) -> bool;
}

/// An oracle that always reports connectivity.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl ConnectivityOracle for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// A switchable connectivity oracle.
#[derive(Debug)]
pub struct ConnectivityFlag(AtomicBool);

impl ConnectivityFlag {
    pub fn new(online: bool) -> Self {
        Self(AtomicBool::new(online))
    }

    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::Relaxed);
    }
}

impl Default for ConnectivityFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityOracle for ConnectivityFlag {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A transformation of the fetched bytes before they are cached, e.g. downscaling an image.
///
/// Returning no bytes marks the fetch as failed.
pub trait PostProcessor: Send + Sync + 'static {
    fn process(&self, raw: Bytes) -> Bytes;
}

impl<F> PostProcessor for F
where
    F: Fn(Bytes) -> Bytes + Send + Sync + 'static,
{
    fn process(&self, raw: Bytes) -> Bytes {
        self(raw)
    }
}

/// The progress of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub bytes_so_far: u64,
    /// The announced total, if known.
    pub total: Option<u64>,
}

impl Progress {
    /// The total, or `-1` if it is unknown.
    pub fn total_or_unknown(&self) -> i64 {
        self.total
            .and_then(|total| i64::try_from(total).ok())
            .unwrap_or(-1)
    }

    /// The completion in percent.
    ///
    /// Without a known total this is an estimate, reaching 80% after 20 KiB and 100% at
    /// 300 KiB.
    pub fn percent(&self) -> f32 {
        const KIB: f32 = 1024.0;

        let bytes = self.bytes_so_far as f32;
        let percent = match self.total {
            Some(total) if total > 0 => bytes * 100.0 / total as f32,
            _ => {
                let percent = bytes / (20.0 * KIB) * 80.0;
                if percent > 80.0 {
                    80.0 + (bytes - 20.0 * KIB) / (280.0 * KIB) * 20.0
                } else {
                    percent
                }
            }
        };
        if percent > 99.0 { 100.0 } else { percent }
    }
}

/// Streams resources from a [`Transport`].
#[derive(Clone)]
pub struct ResourceLoader {
    transport: Arc<dyn Transport>,
    connectivity: Arc<dyn ConnectivityOracle>,
    post_processor: Option<Arc<dyn PostProcessor>>,
    max_download: Option<Duration>,
}

impl std::fmt::Debug for ResourceLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLoader")
            .field("post_processor", &self.post_processor.is_some())
            .field("max_download", &self.max_download)
            .finish_non_exhaustive()
    }
}

impl ResourceLoader {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            connectivity: Arc::new(AlwaysOnline),
            post_processor: None,
            max_download: None,
        }
    }

    /// A loader fetching over HTTP and from the local filesystem, with the configured timeouts.
    pub fn from_config(config: &Config) -> CacheContents<Self> {
        let transport = DefaultTransport {
            http: HttpTransport::new(&config.timeouts)?,
            filesystem: FilesystemTransport,
        };
        Ok(Self::new(Arc::new(transport)).with_timeout(config.timeouts.max_download))
    }

    pub fn with_connectivity(mut self, connectivity: Arc<dyn ConnectivityOracle>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_post_processor(mut self, post_processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = Some(post_processor);
        self
    }

    /// Limits the total duration of a single fetch.
    pub fn with_timeout(mut self, max_download: Option<Duration>) -> Self {
        self.max_download = max_download;
        self
    }

    /// Consults the connectivity oracle, failing with [`CacheError::NoConnection`] when offline.
    pub fn check_connectivity(&self, key: &str) -> CacheContents<()> {
        if self.connectivity.is_online() {
            return Ok(());
        }
        tracing::debug!("Offline, not fetching `{}`", key);
        metric!(counter("download.fetch") += 1, "outcome" => "offline");
        Err(CacheError::NoConnection)
    }

    /// Fetches the raw bytes of `key`.
    ///
    /// `on_progress` is called after every read that produced bytes. Cancellation is checked
    /// before every read and once more after the last one, a cancelled fetch never reports
    /// partial success. The transport's handles are released on every exit path.
    pub async fn fetch<F>(
        &self,
        key: &str,
        on_progress: F,
        cancel: &CancellationToken,
    ) -> CacheContents<Bytes>
    where
        F: FnMut(Progress) + Send,
    {
        self.check_connectivity(key)?;
        self.fetch_online(key, on_progress, cancel).await
    }

    /// Like [`fetch`](Self::fetch), for callers that already consulted
    /// [`check_connectivity`](Self::check_connectivity).
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn fetch_online<F>(
        &self,
        key: &str,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> CacheContents<Bytes>
    where
        F: FnMut(Progress) + Send,
    {
        let start = Instant::now();
        let fetch = self.fetch_inner(key, &mut on_progress, cancel);
        let result = match self.max_download {
            Some(max_download) => match tokio::time::timeout(max_download, fetch).await {
                Ok(result) => result,
                Err(_) => Err(CacheError::Timeout(max_download)),
            },
            None => fetch.await,
        };
        let result = result.and_then(|raw| self.post_process(raw));

        match &result {
            Ok(raw) => {
                tracing::debug!("Fetched `{}` ({} bytes)", key, raw.len());
                metric!(counter("download.fetch") += 1, "outcome" => "success");
                metric!(time_raw("download.size") = raw.len() as u64);
                metric!(timer("download.duration") = start.elapsed());
            }
            Err(err) => {
                tracing::debug!(error = %err, "Failed to fetch `{}`", key);
                metric!(counter("download.fetch") += 1, "outcome" => err.as_tag());
            }
        }
        result
    }

    async fn fetch_inner(
        &self,
        key: &str,
        on_progress: &mut (dyn FnMut(Progress) + Send),
        cancel: &CancellationToken,
    ) -> CacheContents<Bytes> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            response = self.transport.open(key) => response?,
        };
        let TransportResponse {
            content_length,
            mut body,
        } = response;
        let total = content_length.filter(|len| *len > 0);
        let mut progress = Progress {
            bytes_so_far: 0,
            total,
        };

        let data = match total.and_then(|total| usize::try_from(total).ok()) {
            Some(total) if total as u64 <= MAX_FIXED_BUFFER => {
                let mut buf = vec![0; total];
                let mut filled = 0;
                while filled < total {
                    if cancel.is_cancelled() {
                        return Err(CacheError::Cancelled);
                    }
                    let n = body.read(&mut buf[filled..]).await.map_err(read_error)?;
                    if n == 0 {
                        tracing::warn!(
                            "Stream of `{}` ended after {} of {} bytes",
                            key,
                            filled,
                            total
                        );
                        break;
                    }
                    filled += n;
                    progress.bytes_so_far = filled as u64;
                    on_progress(progress);
                }
                buf.truncate(filled);
                buf
            }
            _ => {
                let mut data = Vec::new();
                let mut chunk = vec![0; CHUNK_SIZE];
                loop {
                    if cancel.is_cancelled() {
                        return Err(CacheError::Cancelled);
                    }
                    let n = body.read(&mut chunk).await.map_err(read_error)?;
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&chunk[..n]);
                    progress.bytes_so_far = data.len() as u64;
                    on_progress(progress);
                }
                data
            }
        };
        drop(body);

        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        if data.is_empty() {
            return Err(CacheError::EmptyResult);
        }
        Ok(Bytes::from(data))
    }

    fn post_process(&self, raw: Bytes) -> CacheContents<Bytes> {
        let Some(post_processor) = &self.post_processor else {
            return Ok(raw);
        };
        let processed = post_processor.process(raw);
        if processed.is_empty() {
            return Err(CacheError::EmptyResult);
        }
        Ok(processed)
    }
}

fn read_error(err: std::io::Error) -> CacheError {
    CacheError::TransportError(err.to_string())
}
