use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::store::META_SUFFIX;

/// How request paths map onto cache slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyMode {
    /// The stripped path is the key and the file name; `/` is rejected.
    #[default]
    Path,
    /// `path?query` is the key; the file name is its hash.
    Query,
}

impl FromStr for KeyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "path" => Ok(KeyMode::Path),
            "query" => Ok(KeyMode::Query),
            other => Err(format!("unknown key mode {other:?} (expected path or query)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("path does not start with the configured prefix")]
    PrefixMismatch,
    #[error("path contains invalid characters")]
    InvalidCharacters,
    #[error("empty path")]
    Empty,
}

/// Identifies one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key: String,
    file_name: String,
    upstream_path: String,
}

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Name of the content file inside the cache directory.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Path requested from the origins.
    pub fn upstream_path(&self) -> &str {
        &self.upstream_path
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// URL-safe, unpadded base64 of the SHA-256 of `key`.
pub fn hashed_name(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct KeyRules {
    mode: KeyMode,
    prefix: String,
    forward_query: bool,
}

impl KeyRules {
    pub fn new(mode: KeyMode, prefix: impl Into<String>, forward_query: bool) -> Self {
        Self {
            mode,
            prefix: prefix.into(),
            forward_query,
        }
    }

    /// Derive the cache key for a request path and its raw query string.
    pub fn derive(&self, path: &str, query: Option<&str>) -> Result<CacheKey, KeyError> {
        let rest = if self.prefix.is_empty() {
            path
        } else {
            path.strip_prefix(self.prefix.as_str())
                .ok_or(KeyError::PrefixMismatch)?
        };
        if rest.is_empty() {
            return Err(KeyError::Empty);
        }

        match self.mode {
            KeyMode::Path => {
                if has_escape(rest) || rest.contains('/') || rest == "." {
                    return Err(KeyError::InvalidCharacters);
                }
                // a key ending in the sidecar suffix would alias another entry's metadata
                if rest.ends_with(META_SUFFIX) {
                    return Err(KeyError::InvalidCharacters);
                }
                Ok(CacheKey {
                    key: rest.to_string(),
                    file_name: rest.to_string(),
                    upstream_path: rest.to_string(),
                })
            }
            KeyMode::Query => {
                let query = query.unwrap_or("");
                let key = format!("{rest}?{query}");
                if has_escape(&key) {
                    return Err(KeyError::InvalidCharacters);
                }
                // The query only selects the cache slot unless forwarding is enabled.
                let upstream_path = if self.forward_query && !query.is_empty() {
                    key.clone()
                } else {
                    rest.to_string()
                };
                Ok(CacheKey {
                    file_name: hashed_name(&key),
                    key,
                    upstream_path,
                })
            }
        }
    }
}

fn has_escape(value: &str) -> bool {
    value.contains("..") || value.contains('~')
}
