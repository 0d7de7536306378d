use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::index::StoreLimits;
use crate::parser::{default_rule_specs, LocalZone, MetadataRuleSpec};

/// 顶层配置；所有字段可省略
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ingest: IngestSection,
    pub store: StoreSection,
    pub query: QuerySection,
    pub parser: ParserSection,
    pub server: ServerSection,
    pub log: LogSection,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IngestSection {
    #[serde(default = "default_roots")]
    pub roots: Vec<PathBuf>,
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// 0 = 自动（CPU 核数）
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    #[serde(default = "default_tail_window_bytes")]
    pub tail_window_bytes: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_event_channel_size")]
    pub event_channel_size: usize,
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// 关闭后只靠定时扫描
    #[serde(default = "default_true")]
    pub watch: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries_per_key")]
    pub max_entries_per_key: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuerySection {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
    #[serde(default = "default_scan_cap")]
    pub scan_cap: usize,
    /// 命中 `(offset + limit) * overscan` 条后停止计数，total 标记为下界
    #[serde(default = "default_overscan")]
    pub overscan: usize,
    /// `+08:00` 这样的固定偏移或 `America/Los_Angeles` 这样的 IANA 时区；
    /// naive 时间戳与 “today/yesterday” 按它解释
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_around_tolerance_mins")]
    pub around_tolerance_mins: i64,
    #[serde(default = "default_empty_time_phrase")]
    pub empty_time_phrase: String,
    #[serde(default = "default_max_regex_bytes")]
    pub max_regex_bytes: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParserSection {
    #[serde(default = "default_rule_specs")]
    pub metadata_rules: Vec<MetadataRuleSpec>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
}

fn default_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("/var/log/centralized")]
}
fn default_patterns() -> Vec<String> {
    vec!["*.log".to_string()]
}
fn default_scan_interval_secs() -> u64 {
    30
}
fn default_max_file_size_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_tail_window_bytes() -> u64 {
    1024 * 1024
}
fn default_debounce_ms() -> u64 {
    500
}
fn default_event_channel_size() -> usize {
    4096
}
fn default_max_backoff_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_ttl_secs() -> u64 {
    86_400
}
fn default_max_entries_per_key() -> usize {
    5_000
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_limit() -> usize {
    100
}
fn default_max_limit() -> usize {
    500
}
fn default_scan_cap() -> usize {
    50_000
}
fn default_overscan() -> usize {
    20
}
fn default_timezone() -> String {
    "+00:00".to_string()
}
fn default_around_tolerance_mins() -> i64 {
    60
}
fn default_empty_time_phrase() -> String {
    "last 1 hour".to_string()
}
fn default_max_regex_bytes() -> usize {
    1 << 20
}
fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_report_interval_secs() -> u64 {
    300
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            patterns: default_patterns(),
            scan_interval_secs: default_scan_interval_secs(),
            workers: 0,
            max_file_size_bytes: default_max_file_size_bytes(),
            tail_window_bytes: default_tail_window_bytes(),
            debounce_ms: default_debounce_ms(),
            event_channel_size: default_event_channel_size(),
            state_file: None,
            max_backoff_secs: default_max_backoff_secs(),
            watch: true,
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_entries_per_key: default_max_entries_per_key(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            scan_cap: default_scan_cap(),
            overscan: default_overscan(),
            timezone: default_timezone(),
            around_tolerance_mins: default_around_tolerance_mins(),
            empty_time_phrase: default_empty_time_phrase(),
            max_regex_bytes: default_max_regex_bytes(),
        }
    }
}

impl Default for ParserSection {
    fn default() -> Self {
        Self {
            metadata_rules: default_rule_specs(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
            report_interval_secs: default_report_interval_secs(),
        }
    }
}

impl StoreSection {
    pub fn limits(&self) -> StoreLimits {
        StoreLimits {
            ttl_secs: self.ttl_secs,
            max_entries_per_key: self.max_entries_per_key,
        }
    }
}

impl QuerySection {
    pub fn tz(&self) -> Result<LocalZone, ConfigError> {
        LocalZone::parse(&self.timezone).ok_or_else(|| ConfigError::Invalid {
            field: "query.timezone",
            reason: format!(
                "expected an offset like +08:00 or a zone like America/Los_Angeles, got {:?}",
                self.timezone
            ),
        })
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

impl Config {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// `dirs::config_dir()/centralog/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("centralog").join("config.toml"))
    }

    /// 默认路径存在则加载，否则全部取默认值
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(p) if p.is_file() => Self::load(&p),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.roots.is_empty() {
            return Err(invalid("ingest.roots", "at least one root is required"));
        }
        if self.ingest.scan_interval_secs == 0 {
            return Err(invalid("ingest.scan_interval_secs", "must be positive"));
        }
        if self.ingest.tail_window_bytes == 0 {
            return Err(invalid("ingest.tail_window_bytes", "must be positive"));
        }
        if self.ingest.tail_window_bytes > self.ingest.max_file_size_bytes {
            return Err(invalid(
                "ingest.tail_window_bytes",
                "must not exceed max_file_size_bytes",
            ));
        }
        if self.store.ttl_secs == 0 || self.store.ttl_secs > StoreLimits::MAX_TTL_SECS {
            return Err(ConfigError::Invalid {
                field: "store.ttl_secs",
                reason: format!("must be in 1..={}", StoreLimits::MAX_TTL_SECS),
            });
        }
        if self.store.max_entries_per_key == 0 {
            return Err(invalid("store.max_entries_per_key", "must be positive"));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(invalid("store.sweep_interval_secs", "must be positive"));
        }
        if self.query.max_limit == 0 || self.query.default_limit > self.query.max_limit {
            return Err(invalid(
                "query.default_limit",
                "must not exceed a positive max_limit",
            ));
        }
        if self.query.scan_cap == 0 {
            return Err(invalid("query.scan_cap", "must be positive"));
        }
        if self.query.overscan == 0 {
            return Err(invalid("query.overscan", "must be positive"));
        }
        if !(0..=24 * 60).contains(&self.query.around_tolerance_mins) {
            return Err(invalid("query.around_tolerance_mins", "must be within 0..=1440"));
        }
        self.query.tz()?;
        for rule in &self.parser.metadata_rules {
            if let Err(e) = regex::Regex::new(&rule.pattern) {
                return Err(ConfigError::Invalid {
                    field: "parser.metadata_rules",
                    reason: format!("rule {:?}: {}", rule.name, e),
                });
            }
        }
        Ok(())
    }
}
