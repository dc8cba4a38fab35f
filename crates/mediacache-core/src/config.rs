use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::janitor::CleanPolicy;
use crate::key::{KeyMode, KeyRules};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("CACHE_UPSTREAM lists no origins")]
    NoUpstreams,
}

/// Replacement bodies for stored error statuses. Empty means pass through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CannedReplies {
    pub forbidden: Option<String>,
    pub not_found: Option<String>,
    pub internal_error: Option<String>,
    pub unavailable: Option<String>,
    pub gateway_timeout: Option<String>,
}

impl CannedReplies {
    pub fn for_status(&self, status: u16) -> Option<&str> {
        let reply = match status {
            403 => &self.forbidden,
            404 => &self.not_found,
            500 => &self.internal_error,
            503 => &self.unavailable,
            504 => &self.gateway_timeout,
            _ => return None,
        };
        reply.as_deref()
    }
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub listen: SocketAddr,
    pub cache_dir: PathBuf,
    pub upstreams: Vec<String>,
    pub prefix: String,
    pub replies: CannedReplies,
    pub print_stats: bool,
    pub max_files: u64,
    pub max_size_mb: u64,
    /// `None` disables expiry.
    pub max_age: Option<Duration>,
    pub clean: bool,
    pub dry_run: bool,
    pub key_mode: KeyMode,
    pub forward_query: bool,
    pub fetch_timeout: Duration,
    pub concurrency_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 3333)),
            cache_dir: PathBuf::from("./cache"),
            upstreams: vec!["https://example.com".to_string()],
            prefix: "/".to_string(),
            replies: CannedReplies::default(),
            print_stats: true,
            max_files: 10_000,
            max_size_mb: 1_000,
            max_age: Some(Duration::from_secs(3 * 3600)),
            clean: true,
            dry_run: false,
            key_mode: KeyMode::Path,
            forward_query: false,
            fetch_timeout: Duration::from_secs(60),
            concurrency_limit: 1024,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let reply = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let listen = match lookup("CACHE_LISTEN") {
            Some(raw) => parse_listen(&raw).ok_or_else(|| invalid("CACHE_LISTEN", &raw, "expected [host]:port"))?,
            None => defaults.listen,
        };
        let upstreams = match lookup("CACHE_UPSTREAM") {
            Some(raw) => {
                let list: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
                if list.is_empty() {
                    return Err(ConfigError::NoUpstreams);
                }
                list
            }
            None => defaults.upstreams,
        };

        let max_age_hours: i64 = parse_var(&lookup, "CACHE_MAX_AGE_HOURS", 3)?;
        let max_age = u64::try_from(max_age_hours)
            .ok()
            .filter(|h| *h > 0)
            .map(|h| Duration::from_secs(h * 3600));
        let fetch_timeout_secs: u64 = parse_var(&lookup, "CACHE_FETCH_TIMEOUT_SECS", 60)?;

        Ok(Self {
            listen,
            cache_dir: lookup("CACHE_DIR").map(PathBuf::from).unwrap_or(defaults.cache_dir),
            upstreams,
            prefix: lookup("CACHE_PREFIX").unwrap_or(defaults.prefix),
            replies: CannedReplies {
                forbidden: reply("CACHE_REPLY_403"),
                not_found: reply("CACHE_REPLY_404"),
                internal_error: reply("CACHE_REPLY_500"),
                unavailable: reply("CACHE_REPLY_503"),
                gateway_timeout: reply("CACHE_REPLY_504"),
            },
            print_stats: parse_flag(&lookup, "CACHE_PRINT_STATS", defaults.print_stats)?,
            max_files: parse_var(&lookup, "CACHE_MAX_FILES", defaults.max_files)?,
            max_size_mb: parse_var(&lookup, "CACHE_MAX_SIZE_MB", defaults.max_size_mb)?,
            max_age,
            clean: parse_flag(&lookup, "CACHE_CLEAN", defaults.clean)?,
            dry_run: parse_flag(&lookup, "CACHE_DRY_RUN", defaults.dry_run)?,
            key_mode: parse_var(&lookup, "CACHE_KEY_MODE", defaults.key_mode)?,
            forward_query: parse_flag(&lookup, "CACHE_FORWARD_QUERY", defaults.forward_query)?,
            fetch_timeout: Duration::from_secs(fetch_timeout_secs.max(1)),
            concurrency_limit: parse_var(&lookup, "CACHE_MAX_CONC", defaults.concurrency_limit)?,
        })
    }

    pub fn key_rules(&self) -> KeyRules {
        KeyRules::new(self.key_mode, self.prefix.clone(), self.forward_query)
    }

    pub fn clean_policy(&self) -> CleanPolicy {
        CleanPolicy {
            max_files: self.max_files,
            max_size_mb: self.max_size_mb as f64,
            max_age: self.max_age,
            dry_run: self.dry_run,
        }
    }
}

fn invalid(key: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: ToString,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|err: T::Err| invalid(key, &raw, err)),
        None => Ok(default),
    }
}

fn parse_flag<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => parse_bool(&raw).ok_or_else(|| invalid(key, &raw, "expected a boolean")),
        None => Ok(default),
    }
}

/// Accepts the usual spellings: `1 t T TRUE true True` and `0 f F FALSE false False`.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// `:port` binds every interface; `localhost:port` maps to loopback.
fn parse_listen(raw: &str) -> Option<SocketAddr> {
    let raw = raw.trim();
    if let Some(port) = raw.strip_prefix(':') {
        return port
            .parse::<u16>()
            .ok()
            .map(|port| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }
    if let Some(port) = raw.strip_prefix("localhost:") {
        return port
            .parse::<u16>()
            .ok()
            .map(|port| SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
    }
    raw.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<CacheConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CacheConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg, CacheConfig::default());
        assert_eq!(cfg.listen.to_string(), "0.0.0.0:3333");
        assert_eq!(cfg.max_age, Some(Duration::from_secs(10_800)));
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(60));
        assert_eq!(cfg.clean_policy().max_size_mb, 1000.0);
    }

    #[test]
    fn reads_every_variable() {
        let cfg = from_pairs(&[
            ("CACHE_LISTEN", "127.0.0.1:8080"),
            ("CACHE_DIR", "/var/cache/media"),
            ("CACHE_UPSTREAM", "https://a.test  https://b.test"),
            ("CACHE_PREFIX", "/media/"),
            ("CACHE_REPLY_404", "gone"),
            ("CACHE_REPLY_503", ""),
            ("CACHE_PRINT_STATS", "F"),
            ("CACHE_MAX_FILES", "5"),
            ("CACHE_MAX_SIZE_MB", "20"),
            ("CACHE_MAX_AGE_HOURS", "0"),
            ("CACHE_CLEAN", "0"),
            ("CACHE_DRY_RUN", "TRUE"),
            ("CACHE_KEY_MODE", "query"),
            ("CACHE_FORWARD_QUERY", "t"),
            ("CACHE_FETCH_TIMEOUT_SECS", "5"),
            ("CACHE_MAX_CONC", "64"),
        ])
        .unwrap();
        assert_eq!(cfg.listen.to_string(), "127.0.0.1:8080");
        assert_eq!(cfg.cache_dir, PathBuf::from("/var/cache/media"));
        assert_eq!(cfg.upstreams, vec!["https://a.test", "https://b.test"]);
        assert_eq!(cfg.prefix, "/media/");
        assert_eq!(cfg.replies.for_status(404), Some("gone"));
        assert_eq!(cfg.replies.for_status(503), None);
        assert_eq!(cfg.replies.for_status(418), None);
        assert!(!cfg.print_stats);
        assert_eq!((cfg.max_files, cfg.max_size_mb), (5, 20));
        assert_eq!(cfg.max_age, None);
        assert!(!cfg.clean && cfg.dry_run && cfg.forward_query);
        assert_eq!(cfg.key_mode, KeyMode::Query);
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(5));
        assert_eq!(cfg.concurrency_limit, 64);
        let key = cfg.key_rules().derive("/media/a.png", Some("w=1")).unwrap();
        assert_eq!(key.as_str(), "a.png?w=1");
    }

    #[test]
    fn go_style_listen_addresses() {
        assert_eq!(parse_listen(":80"), Some(SocketAddr::from(([0, 0, 0, 0], 80))));
        assert_eq!(
            parse_listen("localhost:9"),
            Some(SocketAddr::from(([127, 0, 0, 1], 9)))
        );
        assert_eq!(parse_listen("[::1]:3333").map(|a| a.port()), Some(3333));
        assert_eq!(parse_listen("nowhere"), None);
        assert_eq!(parse_listen(":99999"), None);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = from_pairs(&[("CACHE_MAX_FILES", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "CACHE_MAX_FILES", .. }), "{err}");
        let err = from_pairs(&[("CACHE_CLEAN", "yes")]).unwrap_err();
        assert!(err.to_string().contains("CACHE_CLEAN"));
        let err = from_pairs(&[("CACHE_KEY_MODE", "hash")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "CACHE_KEY_MODE", .. }));
        let err = from_pairs(&[("CACHE_LISTEN", "3333")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "CACHE_LISTEN", .. }));
    }

    #[test]
    fn blank_upstream_list_is_rejected() {
        assert_eq!(
            from_pairs(&[("CACHE_UPSTREAM", "   ")]).unwrap_err(),
            ConfigError::NoUpstreams
        );
    }

    #[test]
    fn negative_max_age_disables_expiry() {
        let cfg = from_pairs(&[("CACHE_MAX_AGE_HOURS", "-1")]).unwrap();
        assert_eq!(cfg.max_age, None);
    }

    #[test]
    fn bool_spellings() {
        for raw in ["1", "t", "T", "TRUE", "true", "True"] {
            assert_eq!(parse_bool(raw), Some(true), "{raw}");
        }
        for raw in ["0", "f", "F", "FALSE", "false", "False"] {
            assert_eq!(parse_bool(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_bool("yes"), None);
        assert_eq!(parse_bool("tRUE"), None);
    }
}
