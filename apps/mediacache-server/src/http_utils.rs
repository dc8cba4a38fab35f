use axum::http::{header, HeaderMap, HeaderValue};
use std::time::SystemTime;

/// Format a [`SystemTime`] as an RFC 7231 HTTP-date header value.
pub fn http_date_value(time: SystemTime) -> Option<HeaderValue> {
    let formatted = httpdate::fmt_http_date(time);
    HeaderValue::from_str(&formatted).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("error parsing If-Modified-Since header")]
pub struct InvalidModifiedSince;

/// Parsed `If-Modified-Since`; absent or empty is `None`, anything unparsable is an error.
pub fn if_modified_since(headers: &HeaderMap) -> Result<Option<SystemTime>, InvalidModifiedSince> {
    let Some(value) = headers.get(header::IF_MODIFIED_SINCE) else {
        return Ok(None);
    };
    let raw = value.to_str().map_err(|_| InvalidModifiedSince)?;
    if raw.is_empty() {
        return Ok(None);
    }
    httpdate::parse_http_date(raw)
        .map(Some)
        .map_err(|_| InvalidModifiedSince)
}

/// Tags listed in `If-None-Match`.
///
/// A `W/` at the very start of the header marks the whole list weak: it is
/// stripped once and re-applied to every tag.
pub fn if_none_match_tags(headers: &HeaderMap) -> Vec<String> {
    let Some(raw) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .filter(|raw| !raw.is_empty())
    else {
        return Vec::new();
    };
    let (weak, list) = match raw.strip_prefix("W/") {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    list.split(',')
        .map(|tag| {
            let tag = tag.trim();
            if weak {
                format!("W/{tag}")
            } else {
                tag.to_string()
            }
        })
        .collect()
}

/// Exact comparison against the stored validator. An empty stored ETag never matches.
pub fn etag_matches(tags: &[String], etag: &str) -> bool {
    !etag.is_empty() && tags.iter().any(|tag| tag == etag)
}

/// Inclusive byte range describing the slice `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ByteRangeError {
    #[error("invalid range format")]
    InvalidFormat,
    #[error("invalid start value")]
    InvalidStart,
    #[error("invalid end value")]
    InvalidEnd,
    #[error("invalid range: start position out of bounds")]
    OutOfBounds,
    #[error("invalid range: start > end")]
    StartAfterEnd,
}

/// Parse a single `start-end` range (the `bytes=` unit prefix is optional)
/// against a file of `len` bytes.
///
/// A missing start selects the last `end` bytes, a missing end runs to the
/// last byte, and an end past the file is clamped to its last byte.
pub fn parse_single_byte_range(value: &str, len: u64) -> Result<ByteRange, ByteRangeError> {
    let range = value.trim();
    let range = range.strip_prefix("bytes=").unwrap_or(range);

    let mut parts = range.split('-');
    let (Some(start_token), Some(end_token), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ByteRangeError::InvalidFormat);
    };
    let start_token = start_token.trim();
    let end_token = end_token.trim();

    if len == 0 {
        return Err(ByteRangeError::OutOfBounds);
    }
    let last = len - 1;

    if start_token.is_empty() {
        if end_token.is_empty() {
            return Err(ByteRangeError::InvalidFormat);
        }
        let suffix: u64 = end_token.parse().map_err(|_| ByteRangeError::InvalidEnd)?;
        if suffix == 0 {
            return Err(ByteRangeError::OutOfBounds);
        }
        let length = suffix.min(len);
        return Ok(ByteRange {
            start: len - length,
            end: last,
        });
    }

    let start: u64 = start_token.parse().map_err(|_| ByteRangeError::InvalidStart)?;
    let end = if end_token.is_empty() {
        last
    } else {
        let end: u64 = end_token.parse().map_err(|_| ByteRangeError::InvalidEnd)?;
        end.min(last)
    };
    if start > end {
        return Err(ByteRangeError::StartAfterEnd);
    }
    Ok(ByteRange { start, end })
}
