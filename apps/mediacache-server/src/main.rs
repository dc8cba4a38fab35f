mod app_state;
mod bootstrap;
mod delivery;
mod http_utils;
mod maintenance;
mod proxy;
mod responder;
mod router;
mod tasks;
#[cfg(test)]
mod test_support;

use std::time::Duration;
use tracing::{error, info};

use mediacache_core::CacheConfig;

#[tokio::main]
async fn main() {
    mediacache_otel::init();

    let config = match CacheConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };

    info!(
        listen = %config.listen,
        upstreams = %config.upstreams.join(", "),
        cache_dir = %config.cache_dir.display(),
        prefix = %config.prefix,
        "{} {}",
        mediacache_core::SOFTWARE,
        mediacache_core::VERSION
    );

    let bootstrap::BootstrapOutput {
        router,
        background_tasks,
    } = match bootstrap::build(&config).await {
        Ok(output) => output,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    };
    let app = bootstrap::attach_http_layers(router, config.concurrency_limit);

    let listener = match tokio::net::TcpListener::bind(config.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(listen = %config.listen, "bind server socket: {err}");
            std::process::exit(1);
        }
    };
    info!("listening on {}", config.listen);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }

    info!("shutting down background tasks");
    background_tasks
        .shutdown_with_grace(Duration::from_secs(5))
        .await;
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                error!("install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
