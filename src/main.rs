use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use offload_gateway::config::{BackendKind, Cli, Config};
use offload_gateway::device::host::HostBackend;
use offload_gateway::device::ComputeBackend;
use offload_gateway::metrics::OffloadMetrics;
use offload_gateway::offload::Gateway;
use offload_gateway::server::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "offload_gateway=debug,tower_http=debug"
    } else {
        "offload_gateway=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("offload-gateway v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    config.validate()?;
    let config = Arc::new(config);

    info!(
        backend = ?cli.backend,
        device = config.device.index,
        pooled = config.device.pool_sessions,
        module = %config.kernel.module_path.display(),
        max_concurrent = config.server.max_concurrent_requests,
        timeout_secs = config.server.request_timeout_secs,
        "Configuration loaded"
    );

    match cli.backend {
        BackendKind::Host => {
            let backend = HostBackend::with_capacity(config.device.host_memory_bytes);
            serve(Arc::new(backend), config).await
        }
        #[cfg(feature = "cuda")]
        BackendKind::Cuda => {
            let backend = offload_gateway::device::cuda::CudaBackend::new();
            serve(Arc::new(backend), config).await
        }
        #[cfg(not(feature = "cuda"))]
        BackendKind::Cuda => {
            anyhow::bail!("the cuda backend requires building with `--features cuda`")
        }
    }
}

async fn serve<B: ComputeBackend>(backend: Arc<B>, config: Arc<Config>) -> anyhow::Result<()> {
    let metrics = Arc::new(OffloadMetrics::new().context("registering metrics")?);
    let gateway = Arc::new(Gateway::new(backend, &config, metrics));

    // Build application state.
    let state = Arc::new(AppState::new(gateway.clone(), config.clone()));

    // Build the HTTP router.
    let app = build_router(state.clone());

    // Start the server.
    let listen_addr = config.server.listen.clone();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    gateway.shutdown();
    let stats = gateway.session_stats();
    info!(
        uptime_secs = state.start_time.elapsed().as_secs(),
        acquired = stats.acquired,
        released = stats.released,
        "Server stopped"
    );

    Ok(())
}
