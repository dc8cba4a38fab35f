//! Builds client responses from stored cache entries.

use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use chrono::Months;
use std::io::SeekFrom;
use std::time::SystemTime;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, Take};

use mediacache_core::{CacheError, CannedReplies, StoredEntry};

use crate::http_utils::{
    etag_matches, http_date_value, if_modified_since, if_none_match_tags, parse_single_byte_range,
    InvalidModifiedSince,
};

const CACHE_CONTROL: &str = "max-age=31536000";

/// Whether the entry was already cached when the request arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }

    fn header_value(self) -> HeaderValue {
        let value = format!(
            "{} {}; {}",
            mediacache_core::SOFTWARE,
            mediacache_core::VERSION,
            self.as_str()
        );
        HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("MediaCache"))
    }
}

/// Request headers that shape the reply.
#[derive(Debug, Clone, Default)]
pub struct Conditions {
    pub if_modified_since: Option<SystemTime>,
    pub etags: Vec<String>,
    pub range: Option<String>,
    pub head: bool,
}

impl Conditions {
    pub fn from_request(method: &Method, headers: &HeaderMap) -> Result<Self, InvalidModifiedSince> {
        Ok(Self {
            if_modified_since: if_modified_since(headers)?,
            etags: if_none_match_tags(headers),
            range: headers
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            head: method == Method::HEAD,
        })
    }
}

#[derive(Debug)]
pub enum ReplyBody {
    Empty,
    Text(Bytes),
    /// Length-limited reader positioned at the first byte to send.
    File { reader: Take<File>, len: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// The entry was read; counts as a use.
    Served,
    NotModified,
    /// Unsatisfiable or malformed `Range`; answered 400.
    BadRange,
}

#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ReplyBody,
    pub kind: ReplyKind,
}

impl Reply {
    fn text(status: StatusCode, mut headers: HeaderMap, kind: ReplyKind, text: String) -> Self {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(text.len()));
        Self {
            status,
            headers,
            body: ReplyBody::Text(Bytes::from(text)),
            kind,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Responder {
    replies: CannedReplies,
}

impl Responder {
    pub fn new(replies: CannedReplies) -> Self {
        Self { replies }
    }

    /// Synthesises the reply for a stored entry.
    pub async fn serve(
        &self,
        entry: StoredEntry,
        conditions: &Conditions,
        cache: CacheStatus,
    ) -> Result<Reply, CacheError> {
        let StoredEntry {
            meta,
            path,
            mut file,
            len,
        } = entry;
        let status = meta.status_code()?;
        let mut headers = HeaderMap::new();
        headers.insert("x-cache", cache.header_value());

        if status != StatusCode::OK {
            if let Some(text) = self.replies.for_status(meta.status) {
                return Ok(Reply::text(status, headers, ReplyKind::Served, text.to_string()));
            }
            insert_str(&mut headers, header::CONTENT_TYPE, &meta.content_type);
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            return Ok(file_reply(status, headers, file, len, conditions.head));
        }

        let last_modified = meta.last_modified.map(SystemTime::from);
        if let (Some(modified), Some(since)) = (last_modified, conditions.if_modified_since) {
            if modified < since {
                return Ok(not_modified(headers));
            }
        }
        if etag_matches(&conditions.etags, &meta.etag) {
            return Ok(not_modified(headers));
        }

        let range = match conditions.range.as_deref() {
            Some(raw) => match parse_single_byte_range(raw, len) {
                Ok(range) => Some(range),
                Err(err) => {
                    return Ok(Reply::text(
                        StatusCode::BAD_REQUEST,
                        headers,
                        ReplyKind::BadRange,
                        format!("Invalid range request: {err}"),
                    ));
                }
            },
            None => None,
        };

        insert_str(&mut headers, header::CONTENT_TYPE, &meta.content_type);
        if let Some(value) = last_modified.and_then(http_date_value) {
            headers.insert(header::LAST_MODIFIED, value);
        }
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));
        headers.insert(header::PRAGMA, HeaderValue::from_static("cache"));
        if let Some(value) = meta
            .retrieved
            .checked_add_months(Months::new(12))
            .and_then(|expires| http_date_value(expires.into()))
        {
            headers.insert(header::EXPIRES, value);
        }
        insert_str(&mut headers, header::ETAG, &meta.etag);
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

        let Some(range) = range else {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            return Ok(file_reply(StatusCode::OK, headers, file, len, conditions.head));
        };

        if let Ok(value) = HeaderValue::from_str(&range.content_range(len)) {
            headers.insert(header::CONTENT_RANGE, value);
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(range.len()));
        if !conditions.head {
            file.seek(SeekFrom::Start(range.start))
                .await
                .map_err(|source| CacheError::Io {
                    op: "seek content",
                    path,
                    source,
                })?;
        }
        Ok(file_reply(
            StatusCode::PARTIAL_CONTENT,
            headers,
            file,
            range.len(),
            conditions.head,
        ))
    }
}

fn insert_str(headers: &mut HeaderMap, name: header::HeaderName, value: &str) {
    if value.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn not_modified(headers: HeaderMap) -> Reply {
    Reply {
        status: StatusCode::NOT_MODIFIED,
        headers,
        body: ReplyBody::Empty,
        kind: ReplyKind::NotModified,
    }
}

fn file_reply(status: StatusCode, headers: HeaderMap, file: File, len: u64, head: bool) -> Reply {
    let body = if head {
        ReplyBody::Empty
    } else {
        ReplyBody::File {
            reader: file.take(len),
            len,
        }
    };
    Reply {
        status,
        headers,
        body,
        kind: ReplyKind::Served,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use futures_util::stream;
    use mediacache_core::{CacheKey, CacheStore, EntryMeta, KeyMode, KeyRules};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: CacheStore,
        key: CacheKey,
    }

    async fn fixture(status: u16, body: &'static [u8]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = KeyRules::new(KeyMode::Path, "/", false)
            .derive("/cat.png", None)
            .unwrap();
        let meta = EntryMeta {
            source: "https://origin.test/cat.png".into(),
            status,
            content_type: "image/png".into(),
            last_modified: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
            retrieved: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            etag: "\"v1\"".into(),
            size: 0,
        };
        let chunks = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(body))]);
        store.write(&key, meta, chunks).await.unwrap();
        Fixture { _dir: dir, store, key }
    }

    impl Fixture {
        async fn serve(&self, responder: &Responder, conditions: &Conditions) -> Reply {
            let entry = self.store.read(&self.key).await.unwrap();
            responder
                .serve(entry, conditions, CacheStatus::Hit)
                .await
                .unwrap()
        }
    }

    async fn drain(reply: Reply) -> Vec<u8> {
        match reply.body {
            ReplyBody::Empty => Vec::new(),
            ReplyBody::Text(text) => text.to_vec(),
            ReplyBody::File { mut reader, .. } => {
                let mut out = Vec::new();
                reader.read_to_end(&mut out).await.unwrap();
                out
            }
        }
    }

    fn header<'a>(reply: &'a Reply, name: &str) -> Option<&'a str> {
        reply.headers.get(name).and_then(|v| v.to_str().ok())
    }

    #[tokio::test]
    async fn full_reply_carries_cache_headers() {
        let fx = fixture(200, b"0123456789").await;
        let reply = fx.serve(&Responder::default(), &Conditions::default()).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.kind, ReplyKind::Served);
        assert_eq!(header(&reply, "content-type"), Some("image/png"));
        assert_eq!(header(&reply, "content-length"), Some("10"));
        assert_eq!(header(&reply, "cache-control"), Some("max-age=31536000"));
        assert_eq!(header(&reply, "pragma"), Some("cache"));
        assert_eq!(header(&reply, "etag"), Some("\"v1\""));
        assert_eq!(header(&reply, "accept-ranges"), Some("bytes"));
        assert_eq!(header(&reply, "last-modified"), Some("Wed, 01 May 2024 12:00:00 GMT"));
        assert_eq!(header(&reply, "expires"), Some("Sun, 01 Jun 2025 00:00:00 GMT"));
        assert_eq!(header(&reply, "x-cache"), Some("MediaCache v1.0.0; HIT"));
        assert_eq!(drain(reply).await, b"0123456789");
    }

    #[tokio::test]
    async fn older_entry_than_if_modified_since_is_not_modified() {
        let fx = fixture(200, b"data").await;
        let since = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        let conditions = Conditions {
            if_modified_since: Some(since.into()),
            ..Default::default()
        };
        let reply = fx.serve(&Responder::default(), &conditions).await;
        assert_eq!(reply.status, StatusCode::NOT_MODIFIED);
        assert_eq!(reply.kind, ReplyKind::NotModified);
        assert!(matches!(reply.body, ReplyBody::Empty));
    }

    #[tokio::test]
    async fn same_second_if_modified_since_serves_body() {
        let fx = fixture(200, b"data").await;
        let since = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let conditions = Conditions {
            if_modified_since: Some(since.into()),
            ..Default::default()
        };
        let reply = fx.serve(&Responder::default(), &conditions).await;
        assert_eq!(reply.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn matching_etag_is_not_modified() {
        let fx = fixture(200, b"data").await;
        let hit = Conditions {
            etags: vec!["\"v0\"".into(), "\"v1\"".into()],
            ..Default::default()
        };
        assert_eq!(
            fx.serve(&Responder::default(), &hit).await.status,
            StatusCode::NOT_MODIFIED
        );
        let miss = Conditions {
            etags: vec!["\"v2\"".into()],
            ..Default::default()
        };
        assert_eq!(fx.serve(&Responder::default(), &miss).await.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn range_reply_is_partial() {
        let fx = fixture(200, b"0123456789").await;
        let conditions = Conditions {
            range: Some("bytes=2-5".into()),
            ..Default::default()
        };
        let reply = fx.serve(&Responder::default(), &conditions).await;
        assert_eq!(reply.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(header(&reply, "content-range"), Some("bytes 2-5/10"));
        assert_eq!(header(&reply, "content-length"), Some("4"));
        assert_eq!(drain(reply).await, b"2345");
    }

    #[tokio::test]
    async fn bad_range_is_rejected() {
        let fx = fixture(200, b"0123456789").await;
        let conditions = Conditions {
            range: Some("bytes=20-30".into()),
            ..Default::default()
        };
        let reply = fx.serve(&Responder::default(), &conditions).await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
        assert_eq!(reply.kind, ReplyKind::BadRange);
        assert_eq!(header(&reply, "content-type"), Some("text/plain"));
        assert_eq!(drain(reply).await, b"Invalid range request: invalid range: start > end");
    }

    #[tokio::test]
    async fn stored_error_status_is_replayed() {
        let fx = fixture(404, b"origin says no").await;
        let reply = fx.serve(&Responder::default(), &Conditions::default()).await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
        assert_eq!(reply.kind, ReplyKind::Served);
        assert!(reply.headers.get("etag").is_none());
        assert_eq!(drain(reply).await, b"origin says no");
    }

    #[tokio::test]
    async fn canned_reply_replaces_stored_body() {
        let fx = fixture(404, b"origin says no").await;
        let responder = Responder::new(CannedReplies {
            not_found: Some("not here".into()),
            ..Default::default()
        });
        let reply = fx.serve(&responder, &Conditions::default()).await;
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
        assert_eq!(header(&reply, "content-type"), Some("text/plain"));
        assert_eq!(header(&reply, "x-cache"), Some("MediaCache v1.0.0; HIT"));
        assert_eq!(drain(reply).await, b"not here");
    }

    #[tokio::test]
    async fn head_keeps_headers_without_body() {
        let fx = fixture(200, b"0123456789").await;
        let conditions = Conditions {
            head: true,
            ..Default::default()
        };
        let reply = fx.serve(&Responder::default(), &conditions).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(header(&reply, "content-length"), Some("10"));
        assert!(matches!(reply.body, ReplyBody::Empty));
    }

    #[test]
    fn conditions_reject_bad_if_modified_since() {
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_MODIFIED_SINCE, HeaderValue::from_static("soon"));
        assert!(Conditions::from_request(&Method::GET, &headers).is_err());

        headers.clear();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=0-1"));
        let conditions = Conditions::from_request(&Method::HEAD, &headers).unwrap();
        assert!(conditions.head);
        assert_eq!(conditions.range.as_deref(), Some("bytes=0-1"));
    }
}
