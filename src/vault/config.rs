use anyhow::{Result, anyhow};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::VaultError;
use crate::vault::key::Category;
use crate::vault::util::{DEFAULT_ARCHIVE_TIMEZONE, parse_timezone};

pub const DEFAULT_MAX_PART_SIZE_BYTES: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_CAMPAIGN_START: &str = "1950-01-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// Every finalized part is uploaded before `finalize_part` returns.
    Immediate,
    /// Finalized parts queue up until `upload_key` or `close_session`.
    Batch,
}

impl UploadMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Batch => "batch",
        }
    }
}

impl FromStr for UploadMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "batch" => Ok(Self::Batch),
            other => Err(anyhow!("invalid upload mode `{other}`: use `immediate` or `batch`")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultStoreConfig {
    pub max_part_size_bytes: u64,
    pub upload_mode: UploadMode,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    DEFAULT_ARCHIVE_TIMEZONE.to_string()
}

impl Default for VaultStoreConfig {
    fn default() -> Self {
        Self {
            max_part_size_bytes: DEFAULT_MAX_PART_SIZE_BYTES,
            upload_mode: UploadMode::Immediate,
            timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSchedulerConfig {
    pub chunk_years: u32,
    pub workers: usize,
    #[serde(default)]
    pub timeout_hours: Option<f64>,
    pub start_date: String,
    pub categories: Vec<String>,
}

impl Default for VaultSchedulerConfig {
    fn default() -> Self {
        Self {
            chunk_years: 5,
            workers: 5,
            timeout_hours: None,
            start_date: DEFAULT_CAMPAIGN_START.to_string(),
            categories: Category::defaults()
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultRemoteConfig {
    pub backend: String,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for VaultRemoteConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            root: None,
            url: None,
            token: None,
            max_retries: 3,
            retry_delay_ms: 500,
            retry_max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultExportConfig {
    pub enabled: bool,
    pub primary_key: String,
}

impl Default for VaultExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            primary_key: "path".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VaultConfig {
    pub store: VaultStoreConfig,
    pub scheduler: VaultSchedulerConfig,
    pub remote: VaultRemoteConfig,
    pub export: VaultExportConfig,
}

impl VaultConfig {
    pub fn categories(&self) -> Result<Vec<Category>> {
        self.scheduler
            .categories
            .iter()
            .map(|c| c.parse::<Category>())
            .collect()
    }

    pub fn campaign_start(&self) -> Result<NaiveDate> {
        NaiveDate::parse_from_str(self.scheduler.start_date.trim(), "%Y-%m-%d")
            .map_err(|err| anyhow!("invalid scheduler start date: {err}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialVaultConfig {
    store: Option<VaultStoreConfig>,
    scheduler: Option<VaultSchedulerConfig>,
    remote: Option<VaultRemoteConfig>,
    export: Option<VaultExportConfig>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u32(var: &str, fallback: u32) -> u32 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u32>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => match v.trim() {
            "1" | "true" | "TRUE" | "yes" | "on" => true,
            "0" | "false" | "FALSE" | "no" | "off" => false,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_opt_string(var: &str, fallback: Option<String>) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => fallback,
    }
}

fn env_opt_f64(var: &str, fallback: Option<f64>) -> Option<f64> {
    match env::var(var) {
        Ok(v) => v.trim().parse::<f64>().ok().or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_csv(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        Ok(v) => {
            let out = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>();
            if out.is_empty() { fallback.to_vec() } else { out }
        }
        Err(_) => fallback.to_vec(),
    }
}

pub fn validate(cfg: &VaultConfig) -> Result<()> {
    let invalid = |msg: String| -> anyhow::Error { VaultError::InvalidConfig(msg).into() };

    if cfg.store.max_part_size_bytes == 0 {
        return Err(invalid("store.max_part_size_bytes must be >= 1".into()));
    }
    parse_timezone(&cfg.store.timezone).map_err(|err| invalid(format!("store.timezone: {err}")))?;
    if cfg.scheduler.chunk_years == 0 {
        return Err(invalid("scheduler.chunk_years must be >= 1".into()));
    }
    if cfg.scheduler.workers == 0 {
        return Err(invalid("scheduler.workers must be >= 1".into()));
    }
    if let Some(hours) = cfg.scheduler.timeout_hours {
        if !(hours.is_finite() && hours > 0.0) {
            return Err(invalid("scheduler.timeout_hours must be a finite number > 0".into()));
        }
    }
    cfg.campaign_start().map_err(|err| invalid(err.to_string()))?;
    let categories = cfg.categories().map_err(|err| invalid(err.to_string()))?;
    if categories.is_empty() {
        return Err(invalid("scheduler.categories cannot be empty".into()));
    }
    match cfg.remote.backend.as_str() {
        "local" => {}
        "http" => {
            if cfg.remote.url.as_deref().is_none_or(|u| u.trim().is_empty()) {
                return Err(invalid("remote.url is required for the http backend".into()));
            }
        }
        other => return Err(VaultError::UnsupportedBackend(other.to_string()).into()),
    }
    if cfg.export.primary_key.trim().is_empty() {
        return Err(invalid("export.primary_key cannot be empty".into()));
    }
    Ok(())
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("COURTVAULT_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let home = dirs::home_dir()?;
    Some(home.join(".courtvault").join("courtvault.toml"))
}

fn merge_file_config(base: &mut VaultConfig) -> Result<()> {
    let Some(path) = resolve_config_path() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)?;
    let parsed: PartialVaultConfig = toml::from_str(&raw).map_err(|err| {
        VaultError::InvalidConfig(format!("failed to parse {}: {err}", path.display()))
    })?;
    if let Some(store) = parsed.store {
        base.store = store;
    }
    if let Some(scheduler) = parsed.scheduler {
        base.scheduler = scheduler;
    }
    if let Some(remote) = parsed.remote {
        base.remote = remote;
    }
    if let Some(export) = parsed.export {
        base.export = export;
    }
    Ok(())
}

pub fn load_config() -> Result<VaultConfig> {
    let mut cfg = VaultConfig::default();
    merge_file_config(&mut cfg)?;

    cfg.store.max_part_size_bytes =
        env_or_u64("COURTVAULT_MAX_PART_SIZE_BYTES", cfg.store.max_part_size_bytes);
    if let Ok(mode) = env::var("COURTVAULT_UPLOAD_MODE") {
        cfg.store.upload_mode = mode.parse()?;
    }
    cfg.store.timezone = env_or_string("COURTVAULT_TIMEZONE", &cfg.store.timezone);

    cfg.scheduler.chunk_years = env_or_u32("COURTVAULT_CHUNK_YEARS", cfg.scheduler.chunk_years);
    cfg.scheduler.workers =
        env_or_u64("COURTVAULT_WORKERS", cfg.scheduler.workers as u64) as usize;
    cfg.scheduler.timeout_hours =
        env_opt_f64("COURTVAULT_TIMEOUT_HOURS", cfg.scheduler.timeout_hours);
    cfg.scheduler.start_date = env_or_string("COURTVAULT_START_DATE", &cfg.scheduler.start_date);
    cfg.scheduler.categories = env_or_csv("COURTVAULT_CATEGORIES", &cfg.scheduler.categories);

    cfg.remote.backend = env_or_string("COURTVAULT_REMOTE_BACKEND", &cfg.remote.backend);
    cfg.remote.root = env_opt_string("COURTVAULT_REMOTE_ROOT", cfg.remote.root.take());
    cfg.remote.url = env_opt_string("COURTVAULT_REMOTE_URL", cfg.remote.url.take());
    cfg.remote.token = env_opt_string("COURTVAULT_REMOTE_TOKEN", cfg.remote.token.take());
    cfg.remote.max_retries = env_or_u32("COURTVAULT_REMOTE_MAX_RETRIES", cfg.remote.max_retries);

    cfg.export.enabled = env_or_bool("COURTVAULT_EXPORT_ENABLED", cfg.export.enabled);
    cfg.export.primary_key =
        env_or_string("COURTVAULT_EXPORT_PRIMARY_KEY", &cfg.export.primary_key);

    validate(&cfg)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = VaultConfig::default();
        validate(&cfg).unwrap();
        assert_eq!(cfg.store.max_part_size_bytes, 1024 * 1024 * 1024);
        assert_eq!(cfg.store.upload_mode, UploadMode::Immediate);
        assert_eq!(cfg.scheduler.chunk_years, 5);
        assert_eq!(cfg.categories().unwrap(), Category::defaults());
    }

    #[test]
    fn rejects_zero_workers_and_bad_backend() {
        let mut cfg = VaultConfig::default();
        cfg.scheduler.workers = 0;
        assert!(validate(&cfg).is_err());

        let mut cfg = VaultConfig::default();
        cfg.remote.backend = "ftp".into();
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("ftp"));

        let mut cfg = VaultConfig::default();
        cfg.remote.backend = "http".into();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_timeouts_that_are_not_finite_and_positive() {
        for hours in [0.0, -1.0, f64::INFINITY, f64::NAN] {
            let mut cfg = VaultConfig::default();
            cfg.scheduler.timeout_hours = Some(hours);
            let err = validate(&cfg).unwrap_err();
            assert!(err.to_string().contains("timeout_hours"), "{hours}: {err}");
        }
        let mut cfg = VaultConfig::default();
        cfg.scheduler.timeout_hours = Some(0.5);
        validate(&cfg).unwrap();
    }

    #[test]
    fn partial_toml_overrides_only_named_sections() {
        let raw = r#"
            [store]
            max_part_size_bytes = 4096
            upload_mode = "batch"
        "#;
        let parsed: PartialVaultConfig = toml::from_str(raw).unwrap();
        let store = parsed.store.unwrap();
        assert_eq!(store.max_part_size_bytes, 4096);
        assert_eq!(store.upload_mode, UploadMode::Batch);
        assert_eq!(store.timezone, DEFAULT_ARCHIVE_TIMEZONE);
        assert!(parsed.scheduler.is_none());
    }

    #[test]
    fn upload_mode_parses_case_insensitively() {
        assert_eq!("BATCH".parse::<UploadMode>().unwrap(), UploadMode::Batch);
        assert!("lazy".parse::<UploadMode>().is_err());
    }
}
