//! kecho: a concurrent TCP echo server
//!
//! One acceptor thread hands every connection to its own worker, which
//! echoes back each received chunk until the peer closes. On SIGINT or
//! SIGTERM the acceptor stops, every live socket is shut down, and all
//! workers are joined before exit.

mod config;
mod runtime;
mod server;

use config::Config;
use runtime::ThreadPool;
use server::{EchoService, StopSignal};
use std::sync::Arc;
use std::thread;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        buffer_size = config.buffer_size,
        max_workers = ?config.max_workers,
        "Starting kecho server"
    );

    let listener = server::bind_listener(&config.listen, config.backlog)?;
    let stop = StopSignal::for_listener(&listener)?;
    let pool = Arc::new(ThreadPool::new(config.max_workers));
    let service = EchoService::new(pool.clone(), config.buffer_size);

    let acceptor = {
        let stop = stop.clone();
        thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || service.start(&listener, &stop))?
    };

    wait_for_signal()?;
    info!("Stop requested");
    stop.request();

    let report = acceptor
        .join()
        .map_err(|_| "acceptor thread panicked")?;
    info!(
        drained = report.drained,
        panicked = report.panicked,
        active = pool.active(),
        "Shutdown complete"
    );

    Ok(())
}

/// Block until SIGINT or SIGTERM arrives.
fn wait_for_signal() -> std::io::Result<()> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(shutdown_signal())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
