use anyhow::Result;
use ingest_store::{
    app,
    config::AppConfig,
    db,
    services::{
        chunk_store::ChunkStore,
        file_storage::LocalFileStorage,
        registry::SessionRegistry,
        sweeper,
        upload_service::{UploadLimits, UploadService},
    },
    state::AppState,
};
use std::{io::ErrorKind, path::PathBuf, sync::Arc};
use tokio::{fs, net::TcpListener};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting ingest-store with config: {:?}", cfg);

    // --- Ensure storage directories exist ---
    for dir in [PathBuf::from(&cfg.storage_dir), cfg.chunk_dir(), cfg.files_dir()] {
        if !fs::try_exists(&dir).await? {
            fs::create_dir_all(&dir).await?;
            tracing::info!("Created storage directory at {}", dir.display());
        }
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let storage = LocalFileStorage::new(db.clone(), cfg.files_dir());
    storage.init(&[cfg.category.as_str()]).await?;

    let uploads = UploadService::new(
        Arc::new(SessionRegistry::new()),
        ChunkStore::new(cfg.chunk_dir()),
        Arc::new(storage),
        UploadLimits {
            max_file_size: cfg.max_file_size,
            category: cfg.category.clone(),
        },
    );

    if cfg.session_ttl.is_zero() {
        tracing::info!("Session expiry disabled");
    } else {
        sweeper::spawn(uploads.clone(), cfg.session_ttl, cfg.sweep_interval);
    }

    // --- Build router ---
    let state = AppState {
        uploads,
        db,
        storage_dir: cfg.storage_dir.clone().into(),
    };
    let app = app(state, cfg.max_chunk_bytes);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
