use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

const MIB: u64 = 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub remote: RemoteStoreConfig,
    pub limits: UploadLimits,
}

/// Endpoint and credentials of the remote multipart store.
#[derive(Clone)]
pub struct RemoteStoreConfig {
    pub auth_url: String,
    pub key_id: String,
    pub application_key: String,
    pub bucket_id: String,
    /// Per-request HTTP timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for RemoteStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStoreConfig")
            .field("auth_url", &self.auth_url)
            .field("key_id", &self.key_id)
            .field("application_key", &"<redacted>")
            .field("bucket_id", &self.bucket_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Bounds applied to every upload session, handed to the coordinator at construction.
#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub default_chunk_size: u64,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub max_chunks: u32,
    pub default_ttl: Duration,
    /// Deadline for each remote store call made on behalf of a session.
    pub remote_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            default_chunk_size: 5 * MIB,
            min_chunk_size: 5 * MIB,
            max_chunk_size: 100 * MIB,
            max_chunks: 10_000,
            default_ttl: Duration::from_secs(24 * 60 * 60),
            remote_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl UploadLimits {
    fn validate(&self) -> Result<()> {
        if self.min_chunk_size == 0 || self.min_chunk_size > self.max_chunk_size {
            bail!(
                "chunk size bounds [{}, {}] are inconsistent",
                self.min_chunk_size,
                self.max_chunk_size
            );
        }
        if !(self.min_chunk_size..=self.max_chunk_size).contains(&self.default_chunk_size) {
            bail!(
                "default chunk size {} outside [{}, {}]",
                self.default_chunk_size,
                self.min_chunk_size,
                self.max_chunk_size
            );
        }
        if self.max_chunks == 0 {
            bail!("max chunks must be at least 1");
        }
        if self.default_ttl.is_zero() {
            bail!("default TTL must be positive");
        }
        Ok(())
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked upload service")]
pub struct Args {
    /// Host to bind to (overrides CHUNKED_UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNKED_UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides CHUNKED_UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Remote store authorization endpoint (overrides CHUNKED_UPLOAD_B2_AUTH_URL)
    #[arg(long)]
    pub b2_auth_url: Option<String>,

    /// Remote store bucket id (overrides CHUNKED_UPLOAD_B2_BUCKET_ID)
    #[arg(long)]
    pub b2_bucket_id: Option<String>,

    /// Default chunk size in bytes (overrides CHUNKED_UPLOAD_DEFAULT_CHUNK_SIZE)
    #[arg(long)]
    pub default_chunk_size: Option<u64>,

    /// Maximum chunks per upload (overrides CHUNKED_UPLOAD_MAX_CHUNKS)
    #[arg(long)]
    pub max_chunks: Option<u32>,

    /// Default session TTL in seconds (overrides CHUNKED_UPLOAD_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `name` and parse it, falling back to `default` when unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let defaults = UploadLimits::default();

        // --- Environment fallback ---
        let env_host = env_or("CHUNKED_UPLOAD_HOST", "0.0.0.0");
        let env_port = env_parse("CHUNKED_UPLOAD_PORT", 3000u16)?;
        let env_db = env_or(
            "CHUNKED_UPLOAD_DATABASE_URL",
            "sqlite://./data/meta/uploads.db",
        );

        let remote_timeout = Duration::from_secs(env_parse(
            "CHUNKED_UPLOAD_REMOTE_TIMEOUT_SECS",
            defaults.remote_timeout.as_secs(),
        )?);

        let remote = RemoteStoreConfig {
            auth_url: args
                .b2_auth_url
                .unwrap_or_else(|| env_or("CHUNKED_UPLOAD_B2_AUTH_URL", "https://api.backblazeb2.com")),
            key_id: env_or("CHUNKED_UPLOAD_B2_KEY_ID", ""),
            application_key: env_or("CHUNKED_UPLOAD_B2_APPLICATION_KEY", ""),
            bucket_id: args
                .b2_bucket_id
                .unwrap_or_else(|| env_or("CHUNKED_UPLOAD_B2_BUCKET_ID", "")),
            timeout: remote_timeout,
        };

        let limits = UploadLimits {
            default_chunk_size: match args.default_chunk_size {
                Some(size) => size,
                None => env_parse(
                    "CHUNKED_UPLOAD_DEFAULT_CHUNK_SIZE",
                    defaults.default_chunk_size,
                )?,
            },
            min_chunk_size: env_parse("CHUNKED_UPLOAD_MIN_CHUNK_SIZE", defaults.min_chunk_size)?,
            max_chunk_size: env_parse("CHUNKED_UPLOAD_MAX_CHUNK_SIZE", defaults.max_chunk_size)?,
            max_chunks: match args.max_chunks {
                Some(max) => max,
                None => env_parse("CHUNKED_UPLOAD_MAX_CHUNKS", defaults.max_chunks)?,
            },
            default_ttl: Duration::from_secs(match args.session_ttl_secs {
                Some(secs) => secs,
                None => env_parse(
                    "CHUNKED_UPLOAD_SESSION_TTL_SECS",
                    defaults.default_ttl.as_secs(),
                )?,
            }),
            remote_timeout,
            sweep_interval: Duration::from_secs(env_parse(
                "CHUNKED_UPLOAD_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
        };
        limits.validate()?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            remote,
            limits,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_consistent() {
        let limits = UploadLimits::default();
        limits.validate().unwrap();
        assert_eq!(limits.default_chunk_size, 5_242_880);
        assert_eq!(limits.max_chunks, 10_000);
    }

    #[test]
    fn default_chunk_size_must_fit_bounds() {
        let limits = UploadLimits {
            default_chunk_size: 1024,
            ..UploadLimits::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn unset_variable_falls_back_to_default() {
        let value: u32 = env_parse("CHUNKED_UPLOAD_TEST_SURELY_UNSET", 7).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn credentials_are_redacted_in_debug_output() {
        let remote = RemoteStoreConfig {
            auth_url: "https://api.backblazeb2.com".into(),
            key_id: "key".into(),
            application_key: "super-secret".into(),
            bucket_id: "bucket".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(!format!("{remote:?}").contains("super-secret"));
    }
}
