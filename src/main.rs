use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use banns::engine::{Engine, LogSink};
use banns::notify::NotifyHub;
use banns::server::{self, ServerOptions};
use banns::{jobs, observability};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts = ServerOptions::from_env();
    observability::init(opts.metrics_port)?;

    let tls_acceptor = server::load_tls_acceptor(opts.tls_cert.as_deref(), opts.tls_key.as_deref())?;

    std::fs::create_dir_all(&opts.data_dir)?;
    let engine = Arc::new(Engine::new(opts.wal_path(), Arc::new(NotifyHub::new()))?);

    tokio::spawn(jobs::run_reminder_dispatcher(
        engine.clone(),
        Arc::new(LogSink),
        opts.reminder_interval,
    ));
    tokio::spawn(jobs::run_compactor(engine.clone(), opts.compact_threshold));

    let addr = opts.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("banns listening on {addr}");
    info!("  data_dir: {}", opts.data_dir.display());
    info!("  max_connections: {}", opts.max_connections);
    info!("  reminder interval: {}s", opts.reminder_interval.as_secs());
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        opts.metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    server::serve(
        listener,
        engine,
        opts.password.clone(),
        tls_acceptor,
        opts.max_connections,
        server::shutdown_signal(),
    )
    .await;

    info!("banns stopped");
    Ok(())
}
