use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, ETAG, LAST_MODIFIED};
use reqwest::{Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::store::{CacheStore, EntryMeta};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE: Duration = Duration::from_secs(90);

fn user_agent() -> String {
    format!("{}/{}", crate::SOFTWARE, env!("CARGO_PKG_VERSION"))
}

/// `origin` without trailing slashes, one `/`, then `path` without leading slashes.
pub fn join_url(origin: &str, path: &str) -> String {
    format!(
        "{}/{}",
        origin.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Result of populating one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Origin URL whose response was stored.
    pub url: String,
    pub status: u16,
    pub bytes: u64,
}

/// Retrieves resources from the configured origins into the store.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    origins: Arc<[String]>,
    store: CacheStore,
}

impl Fetcher {
    pub fn new(origins: Vec<String>, timeout: Duration, store: CacheStore) -> Result<Self> {
        if origins.is_empty() {
            return Err(CacheError::NoOrigins);
        }
        let client = reqwest::Client::builder()
            .user_agent(user_agent())
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .pool_idle_timeout(POOL_IDLE)
            .timeout(timeout)
            .build()
            .map_err(CacheError::Client)?;
        Ok(Self {
            client,
            origins: origins.into(),
            store,
        })
    }

    /// Fetches `key` and persists it.
    ///
    /// Origins are tried in order until one answers 200. When none does, the
    /// last origin decides: a transport error is returned, any other status is
    /// stored as-is. The caller must hold the key exclusively.
    pub async fn fetch(&self, key: &CacheKey) -> Result<FetchOutcome> {
        let mut last = None;
        for origin in self.origins.iter() {
            let url = join_url(origin, key.upstream_path());
            match self.client.get(&url).send().await {
                Ok(response) if response.status() == StatusCode::OK => {
                    last = Some((url, Ok(response)));
                    break;
                }
                Ok(response) => {
                    tracing::warn!(
                        target: "mediacache::fetch",
                        key = %key,
                        url = %url,
                        status = response.status().as_u16(),
                        "origin did not return 200"
                    );
                    last = Some((url, Ok(response)));
                }
                Err(err) => {
                    tracing::warn!(
                        target: "mediacache::fetch",
                        key = %key,
                        url = %url,
                        error = %err,
                        "origin request failed"
                    );
                    last = Some((url, Err(err)));
                }
            }
        }

        let (url, response) = last.ok_or(CacheError::NoOrigins)?;
        let response = response.map_err(|source| CacheError::Upstream {
            url: url.clone(),
            source,
        })?;
        self.persist(key, url, response).await
    }

    async fn persist(&self, key: &CacheKey, url: String, response: Response) -> Result<FetchOutcome> {
        let status = response.status().as_u16();
        let last_modified = parse_last_modified(&url, &response)?;
        let meta = EntryMeta {
            source: url.clone(),
            status,
            content_type: header_string(&response, CONTENT_TYPE),
            last_modified,
            retrieved: Utc::now(),
            etag: header_string(&response, ETAG),
            size: response.content_length().unwrap_or(0),
        };

        let bytes = self
            .store
            .write(key, meta, response.bytes_stream())
            .await
            .inspect_err(|err| {
                tracing::warn!(
                    target: "mediacache::fetch",
                    key = %key,
                    url = %url,
                    error = %err,
                    "storing origin response failed"
                );
            })?;
        tracing::debug!(target: "mediacache::fetch", key = %key, url = %url, status, bytes, "stored");
        Ok(FetchOutcome { url, status, bytes })
    }
}

fn header_string(response: &Response, name: reqwest::header::HeaderName) -> String {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn parse_last_modified(url: &str, response: &Response) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = response.headers().get(LAST_MODIFIED) else {
        return Ok(None);
    };
    let invalid = || CacheError::LastModified {
        url: url.to_string(),
        value: String::from_utf8_lossy(raw.as_bytes()).into_owned(),
    };
    let text = raw.to_str().map_err(|_| invalid())?;
    if text.is_empty() {
        return Ok(None);
    }
    let parsed = httpdate::parse_http_date(text).map_err(|_| invalid())?;
    Ok(Some(DateTime::<Utc>::from(parsed)))
}
