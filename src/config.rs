use std::{env, net::SocketAddr, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid environment variable format for {0}: {1}")]
    InvalidVar(String, String),
    #[error(transparent)]
    DotEnvError(#[from] dotenvy::Error),
}

/// Which backend the repositories and file storage are wired to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    /// DynamoDB tables + S3 bucket.
    Aws,
    /// Process-local maps. Nothing survives a restart.
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aws" => Ok(StorageBackend::Aws),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!("unknown storage backend '{}'", other)),
        }
    }
}

/// Base URLs baked into rendered links.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Where this API is reachable; image URLs hang off it.
    pub public_base_url: String,
    /// Where the frontend's single-meme page lives.
    pub frontend_base_url: String,
}

impl LinkConfig {
    pub fn image_url(&self, public_id: &str) -> String {
        format!("{}/resources/images/{}", self.public_base_url.trim_end_matches('/'), public_id)
    }

    pub fn template_image_url(&self, public_id: &str) -> String {
        format!("{}/resources/templates/{}", self.public_base_url.trim_end_matches('/'), public_id)
    }

    pub fn single_view_url(&self, public_id: &str) -> String {
        format!("{}/memes/{}", self.frontend_base_url.trim_end_matches('/'), public_id)
    }
}

/// Bounds applied by the query normalizer.
#[derive(Clone, Copy, Debug)]
pub struct QueryLimits {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self { default_limit: 10, max_limit: 100 }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub backend: StorageBackend,
    pub meme_bucket_name: String,
    pub aws_region: String,
    // Optional endpoint for LocalStack
    pub localstack_endpoint: Option<String>,
    pub table_prefix: String,
    pub links: LinkConfig,
    pub caller_header: String,
    pub limits: QueryLimits,
    pub archive_fetch_concurrency: usize,
    pub max_upload_bytes: usize,
}

impl Default for Config {
    /// Local in-memory setup; what `Config::load` builds on.
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 3001)),
            backend: StorageBackend::Memory,
            meme_bucket_name: "memes".to_string(),
            aws_region: "ca-central-1".to_string(),
            localstack_endpoint: None,
            table_prefix: String::new(),
            links: LinkConfig {
                public_base_url: "http://localhost:3001".to_string(),
                frontend_base_url: "http://localhost:3000".to_string(),
            },
            caller_header: "x-username".to_string(),
            limits: QueryLimits::default(),
            archive_fetch_concurrency: 4,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (ignores errors, relies on env vars otherwise)
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let bind_address = parse_var(&lookup, "BIND_ADDRESS", defaults.bind_address)?;
        let backend = parse_var(&lookup, "STORAGE_BACKEND", StorageBackend::Aws)?;

        let meme_bucket_name = match (lookup("MEME_BUCKET_NAME"), backend) {
            (Some(name), _) => name,
            (None, StorageBackend::Memory) => defaults.meme_bucket_name,
            (None, StorageBackend::Aws) => {
                return Err(ConfigError::MissingVar("MEME_BUCKET_NAME".into()));
            }
        };

        let aws_region = lookup("AWS_DEFAULT_REGION").unwrap_or(defaults.aws_region);
        // Allow overriding endpoint for localstack/testing
        let localstack_endpoint = lookup("AWS_ENDPOINT_URL");
        let table_prefix = lookup("TABLE_PREFIX").unwrap_or_default();

        let links = LinkConfig {
            public_base_url: lookup("PUBLIC_BASE_URL").unwrap_or(defaults.links.public_base_url),
            frontend_base_url: lookup("FRONTEND_BASE_URL")
                .unwrap_or(defaults.links.frontend_base_url),
        };

        let caller_header = lookup("CALLER_HEADER")
            .unwrap_or(defaults.caller_header)
            .to_lowercase();
        axum::http::HeaderName::from_str(&caller_header)
            .map_err(|e| ConfigError::InvalidVar("CALLER_HEADER".into(), e.to_string()))?;

        let limits = QueryLimits {
            default_limit: parse_var(&lookup, "MEME_DEFAULT_LIMIT", defaults.limits.default_limit)?,
            max_limit: parse_var(&lookup, "MEME_MAX_LIMIT", defaults.limits.max_limit)?,
        };
        if limits.max_limit == 0 || limits.default_limit == 0 || limits.default_limit > limits.max_limit {
            return Err(ConfigError::InvalidVar(
                "MEME_DEFAULT_LIMIT".into(),
                format!(
                    "default limit {} must be within 1..={}",
                    limits.default_limit, limits.max_limit
                ),
            ));
        }

        let archive_fetch_concurrency =
            parse_var(&lookup, "ARCHIVE_FETCH_CONCURRENCY", defaults.archive_fetch_concurrency)?
                .max(1);
        let max_upload_bytes = parse_var(&lookup, "MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?;

        Ok(Config {
            bind_address,
            backend,
            meme_bucket_name,
            aws_region,
            localstack_endpoint,
            table_prefix,
            links,
            caller_header,
            limits,
            archive_fetch_concurrency,
            max_upload_bytes,
        })
    }

    /// Physical table name for a logical one, e.g. `memes` -> `dev_memes`.
    pub fn table_name(&self, logical: &str) -> String {
        format!("{}{}", self.table_prefix, logical)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidVar(key.into(), e.to_string())),
        None => Ok(default),
    }
}
