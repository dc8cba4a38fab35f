use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{CacheError, Result};
use crate::key::CacheKey;

/// Suffix of the metadata sidecar next to each content file.
pub const META_SUFFIX: &str = ".meta";

/// Sidecar record describing one cached response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    #[serde(rename = "Source")]
    pub source: String,
    #[serde(rename = "Status")]
    pub status: u16,
    #[serde(rename = "ContentType")]
    pub content_type: String,
    #[serde(rename = "LastModified", with = "zero_time")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(rename = "Retrieved")]
    pub retrieved: DateTime<Utc>,
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "Size")]
    pub size: u64,
}

impl EntryMeta {
    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// JSON encoding with a trailing newline.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        let mut out = serde_json::to_vec(self)?;
        out.push(b'\n');
        Ok(out)
    }

    /// An entry is stale once it was retrieved more than `max_age` before `now`.
    pub fn is_stale_at(&self, max_age: Option<Duration>, now: DateTime<Utc>) -> bool {
        let Some(max_age) = max_age.filter(|age| !age.is_zero()) else {
            return false;
        };
        match (now - self.retrieved).to_std() {
            Ok(age) => age > max_age,
            // retrieved in the future
            Err(_) => false,
        }
    }

    pub fn is_stale(&self, max_age: Option<Duration>) -> bool {
        self.is_stale_at(max_age, Utc::now())
    }

    pub fn status_code(&self) -> Result<reqwest::StatusCode> {
        reqwest::StatusCode::from_u16(self.status).map_err(|_| CacheError::InvalidStatus(self.status))
    }
}

/// Absent timestamps are written as the zero time and read back as `None`.
mod zero_time {
    use chrono::{DateTime, Datelike, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const ZERO: &str = "0001-01-01T00:00:00Z";

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => s.serialize_str(&ts.to_rfc3339()),
            None => s.serialize_str(ZERO),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(d)? else {
            return Ok(None);
        };
        let ts = DateTime::parse_from_rfc3339(&raw)
            .map_err(serde::de::Error::custom)?
            .with_timezone(&Utc);
        Ok((ts.year() > 1).then_some(ts))
    }
}

/// An opened cache entry. The file handle stays valid even if the janitor
/// unlinks the entry while it is being streamed.
#[derive(Debug)]
pub struct StoredEntry {
    pub meta: EntryMeta,
    pub path: PathBuf,
    pub file: fs::File,
    /// Length of the content file on disk.
    pub len: u64,
}

/// Content files and their `.meta` sidecars in one flat directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(CacheError::io("create cache dir", &self.dir))
    }

    pub fn content_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    pub fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}{META_SUFFIX}", key.file_name()))
    }

    /// Both halves of the entry are present.
    pub async fn exists(&self, key: &CacheKey) -> bool {
        fs::metadata(self.meta_path(key)).await.is_ok()
            && fs::metadata(self.content_path(key)).await.is_ok()
    }

    pub async fn read_meta(&self, key: &CacheKey) -> Result<EntryMeta> {
        let path = self.meta_path(key);
        let raw = fs::read(&path).await.map_err(CacheError::io("read metadata", &path))?;
        EntryMeta::decode(&raw).map_err(|source| CacheError::Meta { path, source })
    }

    pub async fn is_stale(&self, key: &CacheKey, max_age: Option<Duration>) -> Result<bool> {
        Ok(self.read_meta(key).await?.is_stale(max_age))
    }

    /// Opens the entry for serving.
    pub async fn read(&self, key: &CacheKey) -> Result<StoredEntry> {
        let meta = self.read_meta(key).await?;
        let path = self.content_path(key);
        let file = fs::File::open(&path)
            .await
            .map_err(CacheError::io("open content", &path))?;
        let len = file
            .metadata()
            .await
            .map_err(CacheError::io("stat content", &path))?
            .len();
        Ok(StoredEntry {
            meta,
            path,
            file,
            len,
        })
    }

    /// Streams `body` into the content file, then writes the sidecar.
    ///
    /// A zero `meta.size` is replaced by the number of bytes written. On any
    /// failure both halves are removed before the error is returned.
    pub async fn write<S, E>(&self, key: &CacheKey, meta: EntryMeta, body: S) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.write_pair(key, meta, body).await {
            Ok(written) => Ok(written),
            Err(err) => {
                self.remove(key).await;
                Err(err)
            }
        }
    }

    async fn write_pair<S, E>(&self, key: &CacheKey, mut meta: EntryMeta, body: S) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let content = self.content_path(key);
        let mut file = fs::File::create(&content)
            .await
            .map_err(CacheError::io("create content", &content))?;

        let mut body = std::pin::pin!(body);
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| CacheError::Body {
                path: content.clone(),
                source: std::io::Error::other(err),
            })?;
            file.write_all(&chunk)
                .await
                .map_err(CacheError::io("write content", &content))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(CacheError::io("flush content", &content))?;
        drop(file);

        if meta.size == 0 {
            meta.size = written;
        }
        let meta_path = self.meta_path(key);
        let encoded = meta.encode().map_err(|source| CacheError::Meta {
            path: meta_path.clone(),
            source,
        })?;
        fs::write(&meta_path, encoded)
            .await
            .map_err(CacheError::io("write metadata", &meta_path))?;
        Ok(written)
    }

    /// Marks the entry as recently used by bumping the sidecar mtime.
    pub async fn touch(&self, key: &CacheKey) -> Result<()> {
        let path = self.meta_path(key);
        let target = path.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::File::options()
                .write(true)
                .open(&target)?
                .set_modified(SystemTime::now())
        })
        .await
        .map_err(|err| CacheError::Io {
            op: "touch metadata",
            path: path.clone(),
            source: std::io::Error::other(err),
        })?
        .map_err(CacheError::io("touch metadata", &path))
    }

    /// Deletes both halves; missing files are ignored.
    pub async fn remove(&self, key: &CacheKey) {
        for path in [self.meta_path(key), self.content_path(key)] {
            if let Err(err) = fs::remove_file(&path).await {
                if err.kind() != ErrorKind::NotFound {
                    tracing::warn!(
                        target: "mediacache::store",
                        key = %key,
                        path = %path.display(),
                        error = %err,
                        "failed to remove cache file"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KeyMode, KeyRules};
    use chrono::TimeZone;
    use futures_util::stream;

    fn key(name: &str) -> CacheKey {
        KeyRules::new(KeyMode::Path, "/", false)
            .derive(&format!("/{name}"), None)
            .unwrap()
    }

    fn meta() -> EntryMeta {
        EntryMeta {
            source: "https://origin.test/cat.png".into(),
            status: 200,
            content_type: "image/png".into(),
            last_modified: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
            retrieved: Utc::now(),
            etag: "\"abc\"".into(),
            size: 0,
        }
    }

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = std::io::Result<Bytes>> {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = key("cat.png");

        let written = store.write(&key, meta(), chunks(&["hello ", "world"])).await.unwrap();
        assert_eq!(written, 11);
        assert!(store.exists(&key).await);

        let entry = store.read(&key).await.unwrap();
        assert_eq!(entry.len, 11);
        assert_eq!(entry.meta.size, 11, "size falls back to bytes written");
        assert_eq!(entry.meta.etag, "\"abc\"");
        assert_eq!(
            std::fs::read(store.content_path(&key)).unwrap(),
            b"hello world"
        );
        let raw = std::fs::read(store.meta_path(&key)).unwrap();
        assert_eq!(raw.last(), Some(&b'\n'));
    }

    #[tokio::test]
    async fn declared_size_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = key("a");
        let mut m = meta();
        m.size = 42;
        store.write(&key, m, chunks(&["xy"])).await.unwrap();
        assert_eq!(store.read_meta(&key).await.unwrap().size, 42);
    }

    #[tokio::test]
    async fn failed_body_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = key("broken");
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::new(ErrorKind::ConnectionReset, "reset")),
        ]);

        let err = store.write(&key, meta(), body).await.unwrap_err();
        assert!(matches!(err, CacheError::Body { .. }), "{err}");
        assert!(!store.content_path(&key).exists());
        assert!(!store.meta_path(&key).exists());
        assert!(!store.exists(&key).await);
    }

    #[tokio::test]
    async fn half_pair_does_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = key("half");
        std::fs::write(store.content_path(&key), b"data").unwrap();
        assert!(!store.exists(&key).await);

        std::fs::remove_file(store.content_path(&key)).unwrap();
        std::fs::write(store.meta_path(&key), meta().encode().unwrap()).unwrap();
        assert!(!store.exists(&key).await);
    }

    #[tokio::test]
    async fn remove_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = key("gone");
        store.remove(&key).await;
        store.write(&key, meta(), chunks(&["x"])).await.unwrap();
        store.remove(&key).await;
        assert!(!store.exists(&key).await);
    }

    #[tokio::test]
    async fn touch_bumps_sidecar_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = key("old");
        store.write(&key, meta(), chunks(&["x"])).await.unwrap();

        let past = SystemTime::now() - Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(store.meta_path(&key))
            .unwrap()
            .set_modified(past)
            .unwrap();

        store.touch(&key).await.unwrap();
        let mtime = std::fs::metadata(store.meta_path(&key)).unwrap().modified().unwrap();
        assert!(mtime > past + Duration::from_secs(3000));
    }

    #[tokio::test]
    async fn stale_check_uses_retrieved_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let key = key("aging");
        let mut m = meta();
        m.retrieved = Utc::now() - chrono::Duration::hours(4);
        store.write(&key, m, chunks(&["x"])).await.unwrap();

        let three_hours = Some(Duration::from_secs(3 * 3600));
        assert!(store.is_stale(&key, three_hours).await.unwrap());
        assert!(!store.is_stale(&key, Some(Duration::from_secs(5 * 3600))).await.unwrap());
        assert!(!store.is_stale(&key, None).await.unwrap());
        assert!(!store.is_stale(&key, Some(Duration::ZERO)).await.unwrap());
    }

    #[test]
    fn absent_last_modified_uses_zero_time() {
        let mut m = meta();
        m.last_modified = None;
        let encoded = String::from_utf8(m.encode().unwrap()).unwrap();
        assert!(encoded.contains("\"LastModified\":\"0001-01-01T00:00:00Z\""), "{encoded}");
        assert!(encoded.contains("\"ETag\":"));
        assert_eq!(EntryMeta::decode(encoded.as_bytes()).unwrap(), m);
    }

    #[test]
    fn decodes_sidecars_written_by_other_deployments() {
        let raw = br#"{"Source":"https://example.com/a.png","Status":404,"ContentType":"text/html","LastModified":"0001-01-01T00:00:00Z","Retrieved":"2024-03-04T05:06:07.123456789+02:00","ETag":"","Size":9}"#;
        let m = EntryMeta::decode(raw).unwrap();
        assert_eq!(m.status, 404);
        assert_eq!(m.last_modified, None);
        assert_eq!(
            m.retrieved,
            Utc.with_ymd_and_hms(2024, 3, 4, 3, 6, 7).unwrap() + chrono::Duration::nanoseconds(123_456_789)
        );
        assert_eq!(m.status_code().unwrap(), reqwest::StatusCode::NOT_FOUND);
    }

    #[test]
    fn bogus_status_is_rejected() {
        let mut m = meta();
        m.status = 42;
        assert!(matches!(m.status_code(), Err(CacheError::InvalidStatus(42))));
    }
}
