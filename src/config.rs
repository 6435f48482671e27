//! Configuration for intake-relay.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (INTAKE_STORAGE_PATH, INTAKE_QUEUE_PATH,
//!    EHR_API_URL, EHR_API_TOKEN, EHR_PAYLOAD_FORMAT)
//! 2. Config file (.intake/config.yaml)
//! 3. Defaults (./intake_submissions.json, ./intake_queue.jsonl, fhir)
//!
//! Config file discovery:
//! - Searches current directory and parents for .intake/config.yaml
//! - Paths in config file are relative to the config file's project root
//!
//! Configuration is resolved once and then passed around by value; a
//! running session never re-reads the environment.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::core::{PayloadFormat, RetryPolicy};

pub const STORAGE_PATH_ENV: &str = "INTAKE_STORAGE_PATH";
pub const QUEUE_PATH_ENV: &str = "INTAKE_QUEUE_PATH";
pub const EHR_URL_ENV: &str = "EHR_API_URL";
pub const EHR_TOKEN_ENV: &str = "EHR_API_TOKEN";
pub const EHR_FORMAT_ENV: &str = "EHR_PAYLOAD_FORMAT";

pub const DEFAULT_STORAGE_PATH: &str = "./intake_submissions.json";
pub const DEFAULT_QUEUE_PATH: &str = "./intake_queue.jsonl";

/// Credentials the surrounding session setup needs. Missing ones are
/// reported at startup but do not stop the process.
pub const REQUIRED_ENV: [&str; 4] = [
    "LIVEKIT_URL",
    "LIVEKIT_API_KEY",
    "LIVEKIT_API_SECRET",
    "OPENAI_API_KEY",
];

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub ehr: Option<EhrConfig>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub session: Option<SessionConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Durable store file (relative to project root)
    pub storage: Option<String>,
    /// Dead-letter queue file (relative to project root)
    pub queue: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EhrConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub format: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub flush_interval_seconds: Option<u64>,
    pub shutdown_grace_seconds: Option<u64>,
}

/// Resolved configuration with final values
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Durable store file
    pub storage_path: PathBuf,
    /// Dead-letter queue file
    pub queue_path: PathBuf,
    /// Remote endpoint settings
    pub ehr: EhrSettings,
    /// Delivery retry policy
    pub retry: RetryPolicy,
    /// Session timing
    pub session: SessionSettings,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct EhrSettings {
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub format: PayloadFormat,
    pub timeout_seconds: u64,
}

impl Default for EhrSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            format: PayloadFormat::Fhir,
            timeout_seconds: 10,
        }
    }
}

impl EhrSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub flush_interval_seconds: u64,
    pub shutdown_grace_seconds: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            flush_interval_seconds: 30,
            shutdown_grace_seconds: 15,
        }
    }
}

impl SessionSettings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            queue_path: PathBuf::from(DEFAULT_QUEUE_PATH),
            ehr: EhrSettings::default(),
            retry: RetryPolicy::default(),
            session: SessionSettings::default(),
            config_file: None,
        }
    }
}

impl ResolvedConfig {
    /// Configuration rooted in `dir`, everything else default
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            storage_path: dir.join("intake_submissions.json"),
            queue_path: dir.join("intake_queue.jsonl"),
            ..Default::default()
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".intake").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's project root
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Parse a payload format, falling back to fhir on unknown values
fn parse_format(value: &str, source: &str) -> PayloadFormat {
    value.parse().unwrap_or_else(|e| {
        warn!(%source, error = %e, "Unknown payload format, using fhir");
        PayloadFormat::Fhir
    })
}

/// Merge a parsed config file and an environment lookup into final values
fn resolve<F>(file: Option<(&Path, ConfigFile)>, env: F) -> ResolvedConfig
where
    F: Fn(&str) -> Option<String>,
{
    let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());
    let mut config = ResolvedConfig::default();

    if let Some((config_path, file)) = file {
        // Base directory is the parent of .intake/ (i.e., grandparent of config.yaml)
        let base_dir = config_path
            .parent()
            .and_then(|p| p.parent())
            .unwrap_or(Path::new("."));

        if let Some(ref storage) = file.paths.storage {
            config.storage_path = resolve_path(base_dir, storage);
        }
        if let Some(ref queue) = file.paths.queue {
            config.queue_path = resolve_path(base_dir, queue);
        }

        if let Some(ehr) = file.ehr {
            config.ehr.endpoint = ehr.url;
            config.ehr.token = ehr.token;
            if let Some(ref format) = ehr.format {
                config.ehr.format = parse_format(format, "config file");
            }
            if let Some(timeout) = ehr.timeout_seconds {
                config.ehr.timeout_seconds = timeout;
            }
        }

        if let Some(retry) = file.retry {
            config.retry = retry;
        }

        if let Some(session) = file.session {
            if let Some(interval) = session.flush_interval_seconds {
                config.session.flush_interval_seconds = interval;
            }
            if let Some(grace) = session.shutdown_grace_seconds {
                config.session.shutdown_grace_seconds = grace;
            }
        }

        config.config_file = Some(config_path.to_path_buf());
    }

    if let Some(storage) = env(STORAGE_PATH_ENV) {
        config.storage_path = PathBuf::from(storage);
    }
    if let Some(queue) = env(QUEUE_PATH_ENV) {
        config.queue_path = PathBuf::from(queue);
    }
    if let Some(url) = env(EHR_URL_ENV) {
        config.ehr.endpoint = Some(url);
    }
    if let Some(token) = env(EHR_TOKEN_ENV) {
        config.ehr.token = Some(token);
    }
    if let Some(format) = env(EHR_FORMAT_ENV) {
        config.ehr.format = parse_format(&format, EHR_FORMAT_ENV);
    }

    config
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let env = |key: &str| std::env::var(key).ok();

    match find_config_file() {
        Some(path) => {
            let file = load_config_file(&path)?;
            Ok(resolve(Some((&path, file)), env))
        }
        None => Ok(resolve(None, env)),
    }
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Required startup credentials absent from the environment
pub fn missing_required_env() -> Vec<&'static str> {
    missing_from(|key| std::env::var(key).ok())
}

fn missing_from<F>(env: F) -> Vec<&'static str>
where
    F: Fn(&str) -> Option<String>,
{
    REQUIRED_ENV
        .iter()
        .copied()
        .filter(|key| env(*key).map_or(true, |v| v.trim().is_empty()))
        .collect()
}
