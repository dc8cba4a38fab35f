//! Tracing setup for the MediaCache binary.
//!
//! Console output is filtered by `RUST_LOG` (default `info`). Setting
//! `CACHE_ACCESS_LOG_ROLL=1` additionally writes one line per served request
//! (target [`ACCESS_TARGET`]) to a rolling file.

use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Target of the per-request access events.
pub const ACCESS_TARGET: &str = "mediacache.access";

static ACCESS_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Minutely,
    Hourly,
    Daily,
}

impl Rotation {
    fn parse(raw: &str) -> Self {
        match raw.to_lowercase().as_str() {
            "hourly" => Rotation::Hourly,
            "minutely" => Rotation::Minutely,
            _ => Rotation::Daily,
        }
    }
}

/// Rolling access log settings; `None` from [`AccessLog::from_lookup`] means disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLog {
    pub dir: String,
    pub prefix: String,
    pub rotation: Rotation,
}

impl AccessLog {
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if lookup("CACHE_ACCESS_LOG_ROLL").as_deref() != Some("1") {
            return None;
        }
        Some(Self {
            dir: lookup("CACHE_ACCESS_LOG_DIR").unwrap_or_else(|| "logs".to_string()),
            prefix: lookup("CACHE_ACCESS_LOG_PREFIX").unwrap_or_else(|| "http-access".into()),
            rotation: Rotation::parse(
                &lookup("CACHE_ACCESS_LOG_ROTATION").unwrap_or_else(|| "daily".into()),
            ),
        })
    }
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(fmt::layer().with_filter(filter));

    let Some(access) = AccessLog::from_env() else {
        let _ = registry.try_init();
        return;
    };

    if std::fs::create_dir_all(&access.dir).is_err() {
        eprintln!("failed to create access log directory {}", access.dir);
    }
    let writer = match access.rotation {
        Rotation::Hourly => tracing_appender::rolling::hourly(&access.dir, &access.prefix),
        Rotation::Minutely => tracing_appender::rolling::minutely(&access.dir, &access.prefix),
        Rotation::Daily => tracing_appender::rolling::daily(&access.dir, &access.prefix),
    };
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = ACCESS_GUARD.set(guard);
    let targets = Targets::new().with_target(ACCESS_TARGET, tracing::Level::INFO);
    let access_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(nb)
        .with_filter(targets);
    let _ = registry.with(access_layer).try_init();
}
