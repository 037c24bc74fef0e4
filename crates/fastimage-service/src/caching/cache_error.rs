use std::time::Duration;

use thiserror::Error;

/// An error that happens when serving a resource from the cache or fetching it from its remote
/// location.
///
/// Errors are never written to the disk tier. A failed key is simply fetched again the next
/// time it is requested.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The request had no usable key.
    #[error("invalid request: empty key")]
    InvalidRequest,
    /// The connectivity oracle reported that the device is offline.
    ///
    /// The transport was never contacted.
    #[error("no connection")]
    NoConnection,
    /// The resource could not be fetched from its remote location, because of connection
    /// loss, DNS resolution, a non-successful response or a failed read.
    ///
    /// The attached string contains the transport's error message.
    #[error("transport failed: {0}")]
    TransportError(String),
    /// The resource was fetched successfully, but the bytes could not be decoded.
    #[error("decoding failed: {0}")]
    DecodeError(String),
    /// The fetch produced no bytes, or the post-processing step discarded all of them.
    #[error("empty result")]
    EmptyResult,
    /// The fetch was cancelled before it completed.
    ///
    /// This is never reported to a slot.
    #[error("cancelled")]
    Cancelled,
    /// The fetch did not complete within the configured maximum duration.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// An unexpected local error, typically from the filesystem.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        let mut source: &dyn std::error::Error = &err;
        while let Some(inner) = source.source() {
            source = inner;
        }
        Self::TransportError(source.to_string())
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short, stable name of the error kind, used as a metrics tag.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid",
            Self::NoConnection => "offline",
            Self::TransportError(_) => "transport",
            Self::DecodeError(_) => "decode",
            Self::EmptyResult => "empty",
            Self::Cancelled => "cancelled",
            Self::Timeout(_) => "timeout",
            Self::InternalError => "internal",
        }
    }
}

/// The outcome of a cache or download operation, containing either `Ok(T)` or the reason why
/// the resource is unavailable.
pub type CacheContents<T = ()> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_internal() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        assert_eq!(CacheError::from(err), CacheError::InternalError);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            CacheError::TransportError("connection reset".into()).to_string(),
            "transport failed: connection reset"
        );
        assert_eq!(
            CacheError::Timeout(Duration::from_secs(2)).to_string(),
            "download timed out after 2s"
        );
        assert_eq!(CacheError::Cancelled.as_tag(), "cancelled");
    }
}
