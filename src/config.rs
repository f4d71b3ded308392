use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub max_file_size: u64,
    pub max_chunk_bytes: usize,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub category: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked upload and assembly service")]
pub struct Args {
    /// Host to bind to (overrides INGEST_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides INGEST_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding chunks and stored files (overrides INGEST_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides INGEST_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Largest declared file size accepted at init, 0 for no limit
    /// (overrides INGEST_STORE_MAX_FILE_SIZE)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Request body limit for one chunk upload (overrides INGEST_STORE_MAX_CHUNK_BYTES)
    #[arg(long)]
    pub max_chunk_bytes: Option<usize>,

    /// Seconds of inactivity before an upload is expired, 0 disables expiry
    /// (overrides INGEST_STORE_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Seconds between idle sweeps (overrides INGEST_STORE_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Storage category for finished uploads (overrides INGEST_STORE_CATEGORY)
    #[arg(long)]
    pub category: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("INGEST_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("INGEST_STORE_PORT", 3000u16)?;
        let env_storage =
            env::var("INGEST_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/storage".into());
        let env_db = env::var("INGEST_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/ingest_store.db".into());
        let env_max_file = env_or("INGEST_STORE_MAX_FILE_SIZE", 500u64 * 1024 * 1024)?;
        let env_max_chunk = env_or("INGEST_STORE_MAX_CHUNK_BYTES", 64usize * 1024 * 1024)?;
        let env_ttl = env_or("INGEST_STORE_SESSION_TTL_SECS", 24u64 * 60 * 60)?;
        let env_sweep = env_or("INGEST_STORE_SWEEP_INTERVAL_SECS", 300u64)?;
        let env_category = env::var("INGEST_STORE_CATEGORY").unwrap_or_else(|_| "dicom".into());

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            max_file_size: args.max_file_size.unwrap_or(env_max_file),
            max_chunk_bytes: args.max_chunk_bytes.unwrap_or(env_max_chunk),
            session_ttl: Duration::from_secs(args.session_ttl_secs.unwrap_or(env_ttl)),
            sweep_interval: Duration::from_secs(
                args.sweep_interval_secs.unwrap_or(env_sweep).max(1),
            ),
            category: args.category.unwrap_or(env_category),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Where in-flight chunks live.
    pub fn chunk_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage_dir).join("chunks")
    }

    /// Root of the durable file store.
    pub fn files_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage_dir).join("files")
    }
}

/// Read and parse `key`, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
