use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 日志级别（解析后归一化）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Unknown,
}

impl Level {
    pub const ALL: [Level; 6] = [
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
        Level::Critical,
        Level::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Critical => "CRITICAL",
            Level::Unknown => "UNKNOWN",
        }
    }

    /// 严格识别：大小写不敏感，含常见别名；无法识别返回 None
    pub fn parse_token(token: &str) -> Option<Level> {
        let t = token.trim().trim_end_matches(':');
        let level = match t.to_ascii_uppercase().as_str() {
            "DEBUG" | "TRACE" | "DBG" => Level::Debug,
            "INFO" | "INFORMATION" | "NOTICE" => Level::Info,
            "WARN" | "WARNING" => Level::Warn,
            "ERROR" | "ERR" => Level::Error,
            "CRITICAL" | "CRIT" | "FATAL" | "EMERG" | "EMERGENCY" | "ALERT" | "PANIC" => {
                Level::Critical
            }
            "UNKNOWN" => Level::Unknown,
            _ => return None,
        };
        Some(level)
    }

    /// 宽松归一化：无法识别的 token 一律映射为 UNKNOWN，不拒绝
    pub fn normalize(token: &str) -> Level {
        Self::parse_token(token).unwrap_or(Level::Unknown)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// metadata 值：字符串或整数
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Number(i64),
    Text(String),
}

impl MetaValue {
    /// 纯数字优先解析为 Number
    pub fn infer(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(n) => MetaValue::Number(n),
            Err(_) => MetaValue::Text(raw.to_string()),
        }
    }

    pub fn matches(&self, wanted: &str) -> bool {
        match self {
            MetaValue::Number(n) => wanted.trim().parse::<i64>().is_ok_and(|w| w == *n),
            MetaValue::Text(s) => s == wanted,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Number(n) => write!(f, "{n}"),
            MetaValue::Text(s) => f.write_str(s),
        }
    }
}

pub type Metadata = BTreeMap<String, MetaValue>;

/// `14` / `Refresh-14` / `[Refresh-14]` 统一为 `Refresh-14`
pub fn normalize_refresh_id(raw: &str) -> String {
    let t = raw.trim().trim_start_matches('[').trim_end_matches(']');
    if !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit()) {
        return format!("Refresh-{t}");
    }
    t.to_string()
}

/// 一条解析后的日志记录（创建后不可变）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub host: String,
    pub application: String,
    pub component: Option<String>,
    pub message: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub source_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_offset: Option<u64>,
    /// 文件代数：每次检测到轮转/截断 +1，避免新旧内容在同一 offset 上“撞 key”
    #[serde(skip)]
    pub source_epoch: u64,
}

impl LogRecord {
    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey {
            host: self.host.clone(),
            application: self.application.clone(),
            component: self.component.clone(),
        }
    }

    pub fn meta_str(&self, key: &str) -> Option<String> {
        self.metadata.get(key).map(|v| v.to_string())
    }
}

/// Index Store 分片键：(host, application, component)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CompositeKey {
    pub host: String,
    pub application: String,
    pub component: Option<String>,
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.host,
            self.application,
            self.component.as_deref().unwrap_or("-")
        )
    }
}

/// 去重键：优先 source_file + epoch + offset；无 offset 时回退为内容哈希
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Offset {
        file: Arc<str>,
        epoch: u64,
        offset: u64,
    },
    Content(u64),
}

impl RecordKey {
    pub fn of(record: &LogRecord) -> Self {
        match record.source_offset {
            Some(offset) => RecordKey::Offset {
                file: Arc::from(record.source_file.as_str()),
                epoch: record.source_epoch,
                offset,
            },
            None => RecordKey::Content(content_hash(record)),
        }
    }
}

fn content_hash(record: &LogRecord) -> u64 {
    use xxhash_rust::xxh3::Xxh3;

    let mut h = Xxh3::new();
    for part in [
        record.source_file.as_str(),
        record.host.as_str(),
        record.application.as_str(),
        record.component.as_deref().unwrap_or(""),
        record.message.as_str(),
    ] {
        h.update(part.as_bytes());
        h.update(&[0]);
    }
    h.update(&record.timestamp.timestamp_nanos_opt().unwrap_or(0).to_le_bytes());
    h.update(record.level.as_str().as_bytes());
    h.digest()
}
