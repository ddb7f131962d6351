use crate::{models::server::Server, transport::wire::MAX_CHUNK_SIZE};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr, time::Duration};
use uuid::Uuid;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub mode: Mode,
}

/// What the process runs as.
#[derive(Debug, Clone)]
pub enum Mode {
    Api(ApiConfig),
    Node(NodeConfig),
    Migrate,
    RegisterNode(Server),
    Check(CheckConfig),
}

/// HTTP edge + distribution engine settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub fragment_count: u32,
    pub size_limit: u64,
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    pub spool_dir: PathBuf,
}

impl ApiConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Smoke check target.
#[derive(Debug, Clone)]
pub struct CheckConfig {
    pub server: String,
    pub file: PathBuf,
}

/// Storage node settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub addr: String,
    pub storage_dir: PathBuf,
    pub chunk_size: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Distributed fragment store")]
pub struct Args {
    /// Metadata database URL (overrides OBJECT_STORE_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP API and the distribution engine
    Api {
        /// Host to bind to (overrides OBJECT_STORE_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to (overrides OBJECT_STORE_PORT)
        #[arg(long)]
        port: Option<u16>,

        /// Fragments per object (overrides OBJECT_STORE_FRAGMENTS)
        #[arg(long)]
        fragments: Option<u32>,

        /// Maximum object size in bytes (overrides OBJECT_STORE_SIZE_LIMIT)
        #[arg(long)]
        size_limit: Option<u64>,

        /// Transfer chunk size in bytes (overrides OBJECT_STORE_CHUNK_SIZE)
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Storage node connect timeout (overrides OBJECT_STORE_CONNECT_TIMEOUT_MS)
        #[arg(long)]
        connect_timeout_ms: Option<u64>,

        /// Directory for spooled uploads (overrides OBJECT_STORE_SPOOL_DIR)
        #[arg(long)]
        spool_dir: Option<PathBuf>,
    },

    /// Run a storage node
    Node {
        /// Listen address (overrides OBJECT_STORE_NODE_ADDR)
        #[arg(long)]
        addr: Option<String>,

        /// Directory where fragments are stored (overrides OBJECT_STORE_STORAGE_DIR)
        #[arg(long)]
        storage_dir: Option<PathBuf>,

        /// Transfer chunk size in bytes (overrides OBJECT_STORE_CHUNK_SIZE)
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Run migrations and exit
    Migrate,

    /// Add or update a storage node in the server directory
    RegisterNode {
        /// Stable node id
        #[arg(long)]
        id: Uuid,

        /// Address the node's transport listens on
        #[arg(long)]
        addr: String,

        /// Reported used space in bytes
        #[arg(long, default_value_t = 0)]
        used_space: i64,
    },

    /// Upload a file through a running API, download it and compare MD5
    Check {
        /// File to round-trip
        #[arg(long)]
        file: PathBuf,

        /// API base URL (overrides OBJECT_STORE_CHECK_SERVER)
        #[arg(long)]
        server: Option<String>,
    },
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<Self> {
        let database_url = match args.database_url {
            Some(url) => url,
            None => env_or(
                "OBJECT_STORE_DATABASE_URL",
                "sqlite://./data/meta/fragstore.db".to_string(),
            )?,
        };

        let mode = match args.command {
            Command::Api {
                host,
                port,
                fragments,
                size_limit,
                chunk_size,
                connect_timeout_ms,
                spool_dir,
            } => {
                let cfg = ApiConfig {
                    host: or_env(host, "OBJECT_STORE_HOST", "0.0.0.0".to_string())?,
                    port: or_env(port, "OBJECT_STORE_PORT", 8080)?,
                    fragment_count: or_env(fragments, "OBJECT_STORE_FRAGMENTS", 6)?,
                    size_limit: or_env(size_limit, "OBJECT_STORE_SIZE_LIMIT", 10 * 1024 * 1024 * 1024)?,
                    chunk_size: or_env(chunk_size, "OBJECT_STORE_CHUNK_SIZE", 64 * 1024)?,
                    connect_timeout: Duration::from_millis(or_env(
                        connect_timeout_ms,
                        "OBJECT_STORE_CONNECT_TIMEOUT_MS",
                        5000,
                    )?),
                    spool_dir: or_env(spool_dir, "OBJECT_STORE_SPOOL_DIR", env::temp_dir())?,
                };
                if cfg.fragment_count == 0 {
                    bail!("fragment count must be at least 1");
                }
                check_chunk_size(cfg.chunk_size)?;
                Mode::Api(cfg)
            }
            Command::Node {
                addr,
                storage_dir,
                chunk_size,
            } => {
                let cfg = NodeConfig {
                    addr: or_env(addr, "OBJECT_STORE_NODE_ADDR", "0.0.0.0:50051".to_string())?,
                    storage_dir: or_env(
                        storage_dir,
                        "OBJECT_STORE_STORAGE_DIR",
                        PathBuf::from("./data/fragments"),
                    )?,
                    chunk_size: or_env(chunk_size, "OBJECT_STORE_CHUNK_SIZE", 64 * 1024)?,
                };
                check_chunk_size(cfg.chunk_size)?;
                Mode::Node(cfg)
            }
            Command::Migrate => Mode::Migrate,
            Command::RegisterNode {
                id,
                addr,
                used_space,
            } => Mode::RegisterNode(Server::new(id, addr, used_space)),
            Command::Check { file, server } => Mode::Check(CheckConfig {
                server: or_env(
                    server,
                    "OBJECT_STORE_CHECK_SERVER",
                    "http://localhost:8080".to_string(),
                )?,
                file,
            }),
        };

        Ok(Self { database_url, mode })
    }
}

/// A chunk must be non-empty and fit a single transport frame.
fn check_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        bail!("chunk size must be at least 1 byte");
    }
    if chunk_size > MAX_CHUNK_SIZE {
        bail!(
            "chunk size {} exceeds the transport limit of {} bytes",
            chunk_size,
            MAX_CHUNK_SIZE
        );
    }
    Ok(())
}

/// CLI value if given, otherwise the environment, otherwise `default`.
fn or_env<T>(cli: Option<T>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match cli {
        Some(value) => Ok(value),
        None => env_or(key, default),
    }
}

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
