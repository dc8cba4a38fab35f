use std::path::{Path, PathBuf};

/// Errors raised by the store, the fetcher and response synthesis.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decode metadata {}: {source}", path.display())]
    Meta {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading upstream body for {}: {source}", path.display())]
    Body {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("upstream {url}: {source}")]
    Upstream {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("no upstream origins configured")]
    NoOrigins,
    #[error("invalid Last-Modified header from {url}: {value:?}")]
    LastModified { url: String, value: String },
    #[error("stored status {0} is not a valid HTTP status")]
    InvalidStatus(u16),
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

impl CacheError {
    pub(crate) fn io(op: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| CacheError::Io { op, path, source }
    }

    /// True when the underlying failure is a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CacheError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}
