use anyhow::{Context, Result};
use axum::Router;
use fragstore::{
    check::run_check,
    config::{ApiConfig, AppConfig, Mode, NodeConfig},
    handlers::AppState,
    routes,
    services::{
        distribution::{DistributionConfig, DistributionEngine},
        fragment_store::FragmentStore,
        metadata::{ServerDirectory, SqliteMetaStore},
    },
    transport::{NodeServer, NodeServerConfig, TransportClient, TransportClientConfig},
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{future::Future, io, path::Path, str::FromStr, sync::Arc};
use tokio::{fs, net::TcpListener};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env_and_args()?;
    tracing::info!("Starting fragstore with config: {:?}", cfg);

    match cfg.mode {
        Mode::Node(node) => run_node(node).await,
        Mode::Api(api) => {
            let meta = connect_meta(&cfg.database_url).await?;
            run_api(api, meta).await
        }
        Mode::Migrate => {
            let meta = connect_meta(&cfg.database_url).await?;
            meta.migrate().await?;
            tracing::info!("Database migration complete.");
            Ok(())
        }
        Mode::RegisterNode(server) => {
            let meta = connect_meta(&cfg.database_url).await?;
            meta.register_server(&server).await?;
            tracing::info!(id = %server.id, addr = %server.addr, "Storage node registered.");
            Ok(())
        }
        Mode::Check(check) => {
            let report = run_check(&check.server, &check.file).await?;
            tracing::info!(
                url = %report.url,
                size = report.size,
                md5 = %report.digest,
                upload = ?report.upload,
                download = ?report.download,
                "Files are equal."
            );
            Ok(())
        }
    }
}

/// Open the SQLite metadata store, creating the database file if needed.
async fn connect_meta(db_url: &str) -> Result<SqliteMetaStore> {
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).await?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database URL `{}`", db_url))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {}", db_url))?;

    Ok(SqliteMetaStore::new(Arc::new(pool)))
}

async fn run_api(cfg: ApiConfig, meta: SqliteMetaStore) -> Result<()> {
    // Reaching the server directory is a startup requirement.
    let servers = meta
        .list_servers()
        .await
        .context("reading the server directory")?;
    if servers.is_empty() {
        tracing::warn!("No storage nodes registered; writes will fail until one is added.");
    } else {
        tracing::info!("{} storage nodes registered", servers.len());
    }

    let transport = TransportClient::new(TransportClientConfig {
        chunk_size: cfg.chunk_size,
        connect_timeout: cfg.connect_timeout,
    });
    let engine = DistributionEngine::new(
        Arc::new(meta.clone()),
        Arc::new(meta.clone()),
        Arc::new(transport),
        DistributionConfig::new(cfg.fragment_count)?,
    );

    let state = AppState {
        engine,
        meta,
        size_limit: cfg.size_limit,
        spool_dir: cfg.spool_dir.clone(),
    };
    let app: Router = routes::routes::routes().with_state(state);

    let listener = TcpListener::bind(cfg.addr()).await?;
    tracing::info!("API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}

async fn run_node(cfg: NodeConfig) -> Result<()> {
    if !cfg.storage_dir.exists() {
        fs::create_dir_all(&cfg.storage_dir).await?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir.display());
    }

    let server = Arc::new(NodeServer::new(
        FragmentStore::new(&cfg.storage_dir),
        NodeServerConfig {
            chunk_size: cfg.chunk_size,
            ..NodeServerConfig::default()
        },
    ));

    let listener = TcpListener::bind(&cfg.addr).await?;
    tracing::info!("Storage node listening on {}", listener.local_addr()?);
    server.serve(listener, shutdown_signal()).await?;

    tracing::info!("Storage node stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = signal_or_pending(
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map(|mut sig| async move {
                sig.recv().await;
            }),
    );
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

/// Wait on an installed signal. A handler that failed to install never fires.
async fn signal_or_pending<F>(installed: io::Result<F>)
where
    F: Future<Output = ()>,
{
    match installed {
        Ok(signal) => signal.await,
        Err(err) => {
            tracing::error!("failed to install signal handler: {}", err);
            std::future::pending::<()>().await;
        }
    }
}
