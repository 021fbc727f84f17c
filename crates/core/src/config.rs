use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{OtqError, Result};
use crate::filter::FieldConventions;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub insecure: bool,
    pub headers: Vec<(String, String)>,
    pub logs_index: String,
    pub traces_index: String,
    pub metrics_index: String,
    pub document_timeout: Duration,
    pub aggregation_timeout: Duration,
    pub discovery_timeout: Duration,
    pub refresh_interval: Duration,
    pub auto_range_threshold: u64,
    pub max_aggregation_fields: usize,
    pub default_limit: usize,
    pub fields: FieldConventions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            api_key: None,
            insecure: false,
            headers: Vec::new(),
            logs_index: "logs-*".to_string(),
            traces_index: "traces-*".to_string(),
            metrics_index: "metrics-*".to_string(),
            document_timeout: Duration::from_secs(10),
            aggregation_timeout: Duration::from_secs(30),
            discovery_timeout: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(5),
            auto_range_threshold: 10_000,
            max_aggregation_fields: 50,
            default_limit: 100,
            fields: FieldConventions::default(),
        }
    }
}

impl Config {
    /// Defaults, then the config file, then `OTQ_*` variables.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(file_overrides) = load_file_overrides(path)? {
            apply_overrides(&mut cfg, file_overrides, "config file")?;
        }
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        Ok(cfg)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigOverrides {
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    api_key: Option<String>,
    insecure: Option<bool>,
    headers: Option<String>,
    logs_index: Option<String>,
    traces_index: Option<String>,
    metrics_index: Option<String>,
    document_timeout: Option<String>,
    aggregation_timeout: Option<String>,
    discovery_timeout: Option<String>,
    refresh_interval: Option<String>,
    auto_range_threshold: Option<u64>,
    max_aggregation_fields: Option<usize>,
    default_limit: Option<usize>,
    fields: Option<FieldConventions>,
}

pub fn config_file_path() -> PathBuf {
    if let Ok(path) = env::var("OTQ_CONFIG") {
        return PathBuf::from(path);
    }

    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let config_home = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(home).join(".config"));
    config_home.join("otq/config.toml")
}

fn load_file_overrides(path: &Path) -> Result<Option<ConfigOverrides>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| OtqError::Config(format!("failed reading {}: {e}", path.display())))?;
    let parsed: ConfigOverrides = toml::from_str(&raw)
        .map_err(|e| OtqError::Config(format!("failed parsing {}: {e}", path.display())))?;
    Ok(Some(parsed))
}

fn env_parsed<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| OtqError::Config(format!("bad {key} in environment: {e}"))),
        Err(_) => Ok(None),
    }
}

fn load_env_overrides() -> Result<ConfigOverrides> {
    Ok(ConfigOverrides {
        url: env::var("OTQ_URL").ok(),
        username: env::var("OTQ_USERNAME").ok(),
        password: env::var("OTQ_PASSWORD").ok(),
        api_key: env::var("OTQ_API_KEY").ok(),
        insecure: env_parsed("OTQ_INSECURE")?,
        headers: env::var("OTQ_HEADERS").ok(),
        logs_index: env::var("OTQ_LOGS_INDEX").ok(),
        traces_index: env::var("OTQ_TRACES_INDEX").ok(),
        metrics_index: env::var("OTQ_METRICS_INDEX").ok(),
        document_timeout: env::var("OTQ_DOCUMENT_TIMEOUT").ok(),
        aggregation_timeout: env::var("OTQ_AGGREGATION_TIMEOUT").ok(),
        discovery_timeout: env::var("OTQ_DISCOVERY_TIMEOUT").ok(),
        refresh_interval: env::var("OTQ_REFRESH_INTERVAL").ok(),
        auto_range_threshold: env_parsed("OTQ_AUTO_RANGE_THRESHOLD")?,
        max_aggregation_fields: env_parsed("OTQ_MAX_AGGREGATION_FIELDS")?,
        default_limit: env_parsed("OTQ_DEFAULT_LIMIT")?,
        fields: None,
    })
}

fn parse_duration(name: &str, value: &str, source: &str) -> Result<Duration> {
    let parsed = humantime::parse_duration(value).map_err(|e| {
        OtqError::Config(format!("bad {name} in {source}: {e} (value={value})"))
    })?;
    if parsed.is_zero() {
        return Err(OtqError::Config(format!(
            "bad {name} in {source}: must be greater than zero"
        )));
    }
    Ok(parsed)
}

fn apply_overrides(cfg: &mut Config, overrides: ConfigOverrides, source: &str) -> Result<()> {
    if let Some(v) = overrides.url {
        cfg.url = v.trim_end_matches('/').to_string();
    }
    if let Some(v) = overrides.username {
        cfg.username = Some(v);
    }
    if let Some(v) = overrides.password {
        cfg.password = Some(v);
    }
    if let Some(v) = overrides.api_key {
        cfg.api_key = Some(v);
    }
    if let Some(v) = overrides.insecure {
        cfg.insecure = v;
    }
    if let Some(v) = overrides.headers {
        cfg.headers = parse_headers(&v).map_err(|e| {
            OtqError::Config(format!("bad headers in {source}: {e} (value={v})"))
        })?;
    }
    if let Some(v) = overrides.logs_index {
        cfg.logs_index = v;
    }
    if let Some(v) = overrides.traces_index {
        cfg.traces_index = v;
    }
    if let Some(v) = overrides.metrics_index {
        cfg.metrics_index = v;
    }
    if let Some(v) = overrides.document_timeout {
        cfg.document_timeout = parse_duration("document_timeout", &v, source)?;
    }
    if let Some(v) = overrides.aggregation_timeout {
        cfg.aggregation_timeout = parse_duration("aggregation_timeout", &v, source)?;
    }
    if let Some(v) = overrides.discovery_timeout {
        cfg.discovery_timeout = parse_duration("discovery_timeout", &v, source)?;
    }
    if let Some(v) = overrides.refresh_interval {
        cfg.refresh_interval = parse_duration("refresh_interval", &v, source)?;
    }
    if let Some(v) = overrides.auto_range_threshold {
        cfg.auto_range_threshold = v;
    }
    if let Some(v) = overrides.max_aggregation_fields {
        cfg.max_aggregation_fields = v;
    }
    if let Some(v) = overrides.default_limit {
        if v == 0 {
            return Err(OtqError::Config(format!(
                "bad default_limit in {source}: must be greater than zero"
            )));
        }
        cfg.default_limit = v;
    }
    if let Some(v) = overrides.fields {
        cfg.fields = v;
    }
    Ok(())
}

/// Extra request headers as `key=value` pairs separated by commas.
fn parse_headers(raw: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for entry in raw.split(',') {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(OtqError::Config(
                "header entries must use key=value syntax".to_string(),
            ));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(OtqError::Config("header key cannot be empty".to_string()));
        }
        out.push((key.to_string(), value.trim().to_string()));
    }
    Ok(out)
}
