use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "TRANSFER_HUB_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments; built once at startup
/// and handed to each component.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub max_connections: u32,
    pub blob_dir: PathBuf,
    /// Base URL presigned blob links are issued against.
    pub public_url: String,
    pub signing_seed: Option<SigningSeed>,
    pub cleanup: CleanupConfig,
    pub policy: TransferPolicy,
    pub notifications: NotificationConfig,
    pub log_json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub batch: i64,
}

/// Time limits applied to transfer operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPolicy {
    pub upload_url_ttl: Duration,
    pub download_url_ttl: Duration,
    pub max_download_url_ttl: Duration,
    pub share_url_ttl: Duration,
    /// Bound on every object-store, queue and mail call.
    pub upstream_timeout: Duration,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            upload_url_ttl: minutes(5),
            download_url_ttl: minutes(5),
            max_download_url_ttl: minutes(10080),
            share_url_ttl: minutes(60),
            upstream_timeout: Duration::from_secs(10),
        }
    }
}

impl TransferPolicy {
    /// Download link lifetime for a requested number of minutes: absent or
    /// zero uses the default, anything above the cap is clamped.
    pub fn download_ttl(&self, requested_minutes: Option<u64>) -> Duration {
        match requested_minutes {
            None | Some(0) => self.download_url_ttl,
            Some(m) => minutes(m).min(self.max_download_url_ttl),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    /// Sender address. Sharing is disabled when unset.
    pub mail_from: Option<String>,
    pub spool_dir: PathBuf,
    pub queue_wait: Duration,
    pub queue_batch: usize,
    pub visibility_timeout: Duration,
    pub receive_backoff: Duration,
    pub publish_concurrency: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            mail_from: None,
            spool_dir: PathBuf::from("./data/outbox"),
            queue_wait: Duration::from_secs(20),
            queue_batch: 10,
            visibility_timeout: Duration::from_secs(60),
            receive_backoff: Duration::from_secs(5),
            publish_concurrency: 16,
        }
    }
}

/// 32-byte Ed25519 seed for presigned URL signatures, given as hex.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningSeed(pub [u8; 32]);

impl fmt::Debug for SigningSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSeed(<redacted>)")
    }
}

impl FromStr for SigningSeed {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).context("signing seed is not valid hex")?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow!("signing seed must be 32 bytes, got {}", b.len()))?;
        Ok(Self(seed))
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Ephemeral file transfer service")]
pub struct Args {
    /// Host to bind to (overrides TRANSFER_HUB_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TRANSFER_HUB_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides TRANSFER_HUB_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory where uploaded payloads are stored (overrides TRANSFER_HUB_BLOB_DIR)
    #[arg(long)]
    pub blob_dir: Option<String>,

    /// Base URL for presigned links (overrides TRANSFER_HUB_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Seconds between cleanup sweeps (overrides TRANSFER_HUB_CLEANUP_INTERVAL_SECS)
    #[arg(long)]
    pub cleanup_interval_secs: Option<u64>,

    /// Sender address for share notifications (overrides TRANSFER_HUB_MAIL_FROM)
    #[arg(long)]
    pub mail_from: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    pub log_json: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over values looked up through `env`.
    pub fn from_sources(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |name: &str| env(&format!("{}{}", ENV_PREFIX, name));

        // --- Environment fallback ---
        let host = args
            .host
            .or_else(|| lookup("HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = match args.port {
            Some(port) => port,
            None => parse_or(&lookup, "PORT", 8080)?,
        };
        let public_url = args
            .public_url
            .or_else(|| lookup("PUBLIC_URL"))
            .unwrap_or_else(|| default_public_url(&host, port));
        let signing_seed = lookup("SIGNING_SEED")
            .map(|raw| raw.parse::<SigningSeed>())
            .transpose()
            .context("parsing TRANSFER_HUB_SIGNING_SEED")?;

        let cleanup = CleanupConfig {
            interval: match args.cleanup_interval_secs {
                Some(secs) => Duration::from_secs(secs),
                None => secs(parse_or(&lookup, "CLEANUP_INTERVAL_SECS", 3600)?),
            },
            timeout: secs(parse_or(&lookup, "CLEANUP_TIMEOUT_SECS", 600)?),
            batch: parse_or(&lookup, "CLEANUP_BATCH", 500)?,
        };
        if cleanup.interval.is_zero() {
            anyhow::bail!("cleanup interval must be greater than zero");
        }

        let policy = TransferPolicy {
            upload_url_ttl: minutes(parse_or(&lookup, "UPLOAD_URL_MINUTES", 5)?),
            download_url_ttl: minutes(parse_or(&lookup, "DOWNLOAD_URL_MINUTES", 5)?),
            max_download_url_ttl: minutes(parse_or(&lookup, "DOWNLOAD_URL_MAX_MINUTES", 10080)?),
            share_url_ttl: minutes(parse_or(&lookup, "SHARE_URL_MINUTES", 60)?),
            upstream_timeout: secs(parse_or(&lookup, "UPSTREAM_TIMEOUT_SECS", 10)?),
        };

        let defaults = NotificationConfig::default();
        let notifications = NotificationConfig {
            mail_from: args
                .mail_from
                .or_else(|| lookup("MAIL_FROM"))
                .filter(|from| !from.trim().is_empty()),
            spool_dir: lookup("MAIL_SPOOL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.spool_dir),
            queue_wait: secs(parse_or(&lookup, "QUEUE_WAIT_SECS", 20)?),
            queue_batch: parse_or(&lookup, "QUEUE_BATCH", defaults.queue_batch)?,
            visibility_timeout: secs(parse_or(&lookup, "VISIBILITY_TIMEOUT_SECS", 60)?),
            receive_backoff: secs(parse_or(&lookup, "RECEIVE_BACKOFF_SECS", 5)?),
            publish_concurrency: parse_or(
                &lookup,
                "PUBLISH_CONCURRENCY",
                defaults.publish_concurrency,
            )?,
        };

        // --- Merge ---
        Ok(Self {
            host,
            port,
            database_url: args
                .database_url
                .or_else(|| lookup("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/transfer_hub.db".into()),
            max_connections: parse_or(&lookup, "MAX_CONNECTIONS", 5)?,
            blob_dir: args
                .blob_dir
                .or_else(|| lookup("BLOB_DIR"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/blobs")),
            public_url,
            signing_seed,
            cleanup,
            policy,
            notifications,
            log_json: args.log_json || parse_or(&lookup, "LOG_JSON", false)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow!("parsing {}{} value `{}`: {}", ENV_PREFIX, name, value, err)),
        None => Ok(default),
    }
}

fn default_public_url(host: &str, port: u16) -> String {
    let host = match host {
        "0.0.0.0" | "::" | "" => "127.0.0.1",
        other => other,
    };
    format!("http://{}:{}", host, port)
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}
