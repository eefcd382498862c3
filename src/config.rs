//! Runtime configuration.
//!
//! Secrets and connection strings come from the environment (optionally
//! loaded from a `.env` file); tunables and the label reference table come
//! from a TOML file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use slug::slugify;

use crate::error::ConfigError;
use crate::reconcile::normalize;

pub const DEFAULT_CONFIG_FILE: &str = "catalog-sync.toml";
pub const SPOTIFY_API_BASE: &str = "https://api.spotify.com/v1";
pub const SPOTIFY_ACCOUNTS_BASE: &str = "https://accounts.spotify.com";

/// Largest page the catalog's search endpoint accepts.
pub const MAX_PAGE_SIZE: u32 = 50;

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub database_url: String,
    pub credentials: Credentials,
    pub api_base: String,
    pub accounts_base: String,
    pub config_path: Option<PathBuf>,
}

/// Load the first `.env` found, falling back to `$PROJECT_ROOT/web/.env`.
pub fn load_dotenv() -> Option<PathBuf> {
    let env_paths = [
        PathBuf::from(".env"),
        PathBuf::from("web/.env"),
        PathBuf::from("../../web/.env"),
    ];

    for p in env_paths {
        if p.exists() {
            dotenvy::from_path(&p).ok();
            return Some(p);
        }
    }

    if let Ok(project_root) = std::env::var("PROJECT_ROOT") {
        let env_path = PathBuf::from(&project_root).join("web/.env");
        if env_path.exists() {
            dotenvy::from_path(&env_path).ok();
            return Some(env_path);
        }
    }

    None
}

fn required_env(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingEnv(key))
}

impl EnvConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: required_env("DATABASE_URL")?,
            credentials: Credentials {
                client_id: required_env("SPOTIFY_CLIENT_ID")?,
                client_secret: required_env("SPOTIFY_CLIENT_SECRET")?,
            },
            api_base: std::env::var("SPOTIFY_API_BASE")
                .unwrap_or_else(|_| SPOTIFY_API_BASE.to_string()),
            accounts_base: std::env::var("SPOTIFY_ACCOUNTS_BASE")
                .unwrap_or_else(|_| SPOTIFY_ACCOUNTS_BASE.to_string()),
            config_path: std::env::var("CATALOG_SYNC_CONFIG").ok().map(PathBuf::from),
        })
    }

    /// `migrate` only needs the database.
    pub fn database_url() -> Result<String, ConfigError> {
        required_env("DATABASE_URL")
    }
}

// ---------------------------------------------------------------------------
// File config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub page_size: u32,
    /// Safety cap on search pages per label.
    pub max_pages: u32,
    pub error_log: PathBuf,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            max_pages: 20,
            error_log: PathBuf::from("errors.log"),
        }
    }
}

/// One timeout per call class.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub auth_secs: u64,
    pub search_secs: u64,
    pub detail_secs: u64,
    pub db_write_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            auth_secs: 15,
            search_secs: 30,
            detail_secs: 30,
            db_write_secs: 60,
        }
    }
}

impl Timeouts {
    pub fn auth(&self) -> Duration {
        Duration::from_secs(self.auth_secs)
    }

    pub fn search(&self) -> Duration {
        Duration::from_secs(self.search_secs)
    }

    pub fn detail(&self) -> Duration {
        Duration::from_secs(self.detail_secs)
    }

    pub fn db_write(&self) -> Duration {
        Duration::from_secs(self.db_write_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    /// A 429 asking for a longer pause than this fails immediately.
    pub max_retry_after_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8000,
            jitter: 0.2,
            max_retry_after_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelSpec {
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl LabelSpec {
    pub fn slug(&self) -> String {
        match &self.slug {
            Some(s) if !s.trim().is_empty() => slugify(s),
            _ => slugify(&self.name),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncSettings,
    pub timeouts: Timeouts,
    pub retry: RetrySettings,
    pub labels: Vec<LabelSpec>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    pub fn parse(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        config.sync.page_size = config.sync.page_size.clamp(1, MAX_PAGE_SIZE);
        config.validate()?;
        Ok(config)
    }

    /// Explicit path, then `CATALOG_SYNC_CONFIG`, then `./catalog-sync.toml`.
    pub fn resolve_path(cli: Option<&Path>, env: Option<&Path>) -> PathBuf {
        cli.or(env)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.labels.is_empty() {
            return Err(ConfigError::Invalid("no [[labels]] configured".into()));
        }
        if self.sync.max_pages == 0 {
            return Err(ConfigError::Invalid("sync.max_pages must be at least 1".into()));
        }

        let mut slugs = HashSet::new();
        let mut keywords: Vec<(String, String)> = Vec::new();
        for label in &self.labels {
            if label.name.trim().is_empty() {
                return Err(ConfigError::Invalid("label with empty name".into()));
            }
            let slug = label.slug();
            if !slugs.insert(slug.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate label slug {:?}", slug)));
            }
            // compared in the form the keyword table matches on
            for kw in &label.keywords {
                let normalized = normalize(kw).trim().to_string();
                if normalized.is_empty() {
                    continue;
                }
                if let Some((_, owner)) = keywords.iter().find(|(k, _)| *k == normalized) {
                    return Err(ConfigError::Invalid(format!(
                        "keyword {:?} is listed under both {:?} and {:?}",
                        normalized, owner, label.name
                    )));
                }
                keywords.push((normalized, label.name.clone()));
            }
        }
        Ok(())
    }

    pub fn label(&self, name: &str) -> Option<&LabelSpec> {
        let wanted = slugify(name);
        self.labels
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(name) || l.slug() == wanted)
    }
}
