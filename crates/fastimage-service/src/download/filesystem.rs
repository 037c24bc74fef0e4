//! Support to load resources from the local filesystem.
//!
//! This is mostly useful for bundled resources and for testing.

use std::io;
use std::path::PathBuf;

use futures::future::BoxFuture;
use tokio::fs::File;
use url::Url;

use crate::caching::{CacheContents, CacheError};

use super::{Transport, TransportResponse};

/// Transport implementation that reads `file://` URLs and plain paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilesystemTransport;

impl FilesystemTransport {
    /// Whether `url` refers to the local filesystem.
    pub fn handles(url: &str) -> bool {
        url.starts_with("file://") || !url.contains("://")
    }

    fn path(url: &str) -> CacheContents<PathBuf> {
        if !url.starts_with("file://") {
            return Ok(PathBuf::from(url));
        }
        Url::parse(url)
            .ok()
            .and_then(|url| url.to_file_path().ok())
            .ok_or_else(|| CacheError::TransportError(format!("invalid file url `{url}`")))
    }

    async fn open_path(&self, url: &str) -> CacheContents<TransportResponse> {
        let path = Self::path(url)?;
        tracing::debug!("Loading {:?}", path);

        let file = File::open(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CacheError::TransportError("not found".into()),
            _ => CacheError::TransportError(e.to_string()),
        })?;
        let metadata = file.metadata().await?;
        if metadata.is_dir() {
            return Err(CacheError::TransportError("is a directory".into()));
        }

        Ok(TransportResponse {
            content_length: Some(metadata.len()),
            body: Box::pin(file),
        })
    }
}

impl Transport for FilesystemTransport {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, CacheContents<TransportResponse>> {
        Box::pin(self.open_path(url))
    }
}
