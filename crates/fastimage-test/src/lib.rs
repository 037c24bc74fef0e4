//! Helpers for testing the cache and the download coordinator.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the disk tier will silently write into
//!    a deleted directory. To avoid this, assign it to a variable in the test function
//!    (e.g. `let cache_dir = test::tempdir()`).
//!
//!  - When using [`ImageServer`], make sure that the server is held until all requests to it
//!    have been made. If the server is dropped, connections to it will be refused.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Router, middleware};
use bytes::Bytes;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// The size of the chunks the `/chunked/` endpoint streams its body in.
pub const STREAM_CHUNK: usize = 1024;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `fastimage` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("fastimage_service=trace,fastimagecli=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Deterministic fake image payload of the given length.
///
/// The payload starts with the PNG signature so that format sniffing decoders accept it.
pub fn image_bytes(len: usize) -> Vec<u8> {
    const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

    let mut data: Vec<u8> = PNG_SIGNATURE.iter().copied().take(len).collect();
    data.extend((data.len()..len).map(|i| (i % 251) as u8));
    data
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Serves the given router on an ephemeral localhost port.
    pub fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));

        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// An image server which counts every request it receives.
///
/// Routes:
///
///  - `/sized/:len/*name`: a body of `len` bytes with a `Content-Length` header.
///  - `/chunked/:len/*name`: a body of `len` bytes streamed in [`STREAM_CHUNK`] sized chunks
///    without a `Content-Length` header.
///  - `/delay/:time/:len/*name`: like `sized`, but only responds after the given delay
///    (in humantime format, e.g. `500ms`).
///  - `/respond_statuscode/:num/*tail`: responds with the given status code and no body.
pub struct ImageServer {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl ImageServer {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: extract::Request, next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.path().to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/sized/:len/*name",
                get(
                    |extract::Path((len, _)): extract::Path<(usize, String)>| async move {
                        sized_response(len)
                    },
                ),
            )
            .route(
                "/chunked/:len/*name",
                get(
                    |extract::Path((len, _)): extract::Path<(usize, String)>| async move {
                        chunked_response(len)
                    },
                ),
            )
            .route(
                "/delay/:time/:len/*name",
                get(
                    |extract::Path((time, len, _)): extract::Path<(String, usize, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap_or(Duration::ZERO);
                        tokio::time::sleep(duration).await;
                        sized_response(len)
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the number of requests made since the last call, and resets the counter.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the requests made per path since the last call, and resets the counter.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for ImageServer {
    fn default() -> Self {
        Self::new()
    }
}

fn sized_response(len: usize) -> Response {
    let body = image_bytes(len);
    (
        [(header::CONTENT_TYPE, "image/png")],
        body,
    )
        .into_response()
}

fn chunked_response(len: usize) -> Response {
    let body = image_bytes(len);
    let chunks: Vec<Result<Bytes, std::io::Error>> = body
        .chunks(STREAM_CHUNK)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();

    Response::builder()
        .header(header::CONTENT_TYPE, "image/png")
        .body(Body::from_stream(futures::stream::iter(chunks)))
        .unwrap()
}
