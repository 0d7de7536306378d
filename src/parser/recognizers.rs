use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use super::level::{leading_level, sniff_level};
use super::timestamp::{parse_epoch, parse_syslog_timestamp, parse_timestamp, LocalZone};
use crate::core::{normalize_refresh_id, Level, MetaValue};

/// 识别器的输出：一行日志里能直接读出的结构
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Recognized {
    pub timestamp: Option<DateTime<Utc>>,
    pub level: Option<Level>,
    pub message: String,
    /// 行内声明的来源（覆盖路径推导）
    pub host: Option<String>,
    pub application: Option<String>,
    pub component: Option<String>,
    pub fields: Vec<(String, MetaValue)>,
}

impl Recognized {
    fn field(&mut self, key: &str, value: MetaValue) {
        self.fields.push((key.to_string(), value));
    }
}

/// 解释时间戳所需的环境：本地时区，以及补全缺失年份用的参考时刻
#[derive(Clone, Copy, Debug)]
pub struct TimeContext {
    pub zone: LocalZone,
    pub reference: DateTime<Utc>,
}

/// 可插拔的格式识别策略。不匹配返回 None，交给下一个识别器
pub trait LineRecognizer: Send + Sync {
    fn name(&self) -> &'static str;
    fn try_parse(&self, line: &str, tc: &TimeContext) -> Option<Recognized>;
}

/// 固定顺序（先匹配者胜）
pub fn default_recognizers() -> Vec<Box<dyn LineRecognizer>> {
    vec![
        Box::new(JsonRecognizer),
        Box::new(RouteRecognizer),
        Box::new(PipeRecognizer),
        Box::new(BracketRecognizer),
        Box::new(KeyValueRecognizer),
        Box::new(SyslogRecognizer),
        Box::new(IsoRecognizer),
    ]
}

const MESSAGE_KEYS: &[&str] = &["message", "msg", "text", "log"];
const LEVEL_KEYS: &[&str] = &["level", "severity", "loglevel", "lvl"];
const TIME_KEYS: &[&str] = &["timestamp", "time", "ts", "@timestamp", "datetime"];
const HOST_KEYS: &[&str] = &["host", "hostname"];
const APP_KEYS: &[&str] = &["application", "app", "service"];
const COMPONENT_KEYS: &[&str] = &["component"];

// ---------------------------------------------------------------------------
// JSON-per-line
// ---------------------------------------------------------------------------

pub struct JsonRecognizer;

fn json_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_meta(v: &serde_json::Value) -> Option<MetaValue> {
    match v {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(MetaValue::Text(s.clone())),
        serde_json::Value::Number(n) => Some(match n.as_i64() {
            Some(i) => MetaValue::Number(i),
            None => MetaValue::Text(n.to_string()),
        }),
        other => Some(MetaValue::Text(other.to_string())),
    }
}

impl LineRecognizer for JsonRecognizer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn try_parse(&self, line: &str, tc: &TimeContext) -> Option<Recognized> {
        let trimmed = line.trim();
        if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        let map = value.as_object()?;

        let take = |keys: &[&str]| keys.iter().find_map(|k| map.get(*k));

        let mut out = Recognized {
            message: take(MESSAGE_KEYS)
                .map(json_text)
                .unwrap_or_else(|| trimmed.to_string()),
            ..Default::default()
        };
        out.level = take(LEVEL_KEYS).map(|v| Level::normalize(&json_text(v)));
        out.timestamp = take(TIME_KEYS).and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_f64().and_then(parse_epoch),
            other => parse_timestamp(&json_text(other), tc.zone),
        });
        out.host = take(HOST_KEYS).map(json_text);
        out.application = take(APP_KEYS).map(json_text);
        out.component = take(COMPONENT_KEYS).map(json_text);

        let consumed = [MESSAGE_KEYS, LEVEL_KEYS, TIME_KEYS, HOST_KEYS, APP_KEYS, COMPONENT_KEYS];
        for (k, v) in map {
            if consumed.iter().any(|keys| keys.contains(&k.as_str())) {
                continue;
            }
            if let Some(mv) = json_meta(v) {
                out.field(k, mv);
            }
        }
        Some(out)
    }
}

// ---------------------------------------------------------------------------
// ROUTE|host|app|component|refresh|step_name|message
// ---------------------------------------------------------------------------

static RE_ROUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ROUTE\|([^|]+)\|([^|]+)\|([^|]+)\|([^|]+)\|([^|]+)\|(.*)$").expect("route regex")
});

pub struct RouteRecognizer;

impl LineRecognizer for RouteRecognizer {
    fn name(&self) -> &'static str {
        "route"
    }

    fn try_parse(&self, line: &str, tc: &TimeContext) -> Option<Recognized> {
        let caps = RE_ROUTE.captures(line)?;
        let prefix = &line[..caps.get(0)?.start()];
        let message = caps[6].trim().to_string();

        let mut out = Recognized {
            timestamp: prefix
                .split_whitespace()
                .next()
                .and_then(|t| parse_timestamp(t, tc.zone))
                .or_else(|| syslog_prefix_time(prefix, tc)),
            level: sniff_level(&message),
            host: Some(caps[1].trim().to_string()),
            application: Some(caps[2].trim().to_string()),
            component: Some(caps[3].trim().to_string()),
            message,
            ..Default::default()
        };
        out.field(
            "refresh_id",
            MetaValue::Text(normalize_refresh_id(&caps[4])),
        );
        out.field("step_name", MetaValue::Text(caps[5].trim().to_string()));
        Some(out)
    }
}

// ---------------------------------------------------------------------------
// loguru: `YYYY-MM-DD HH:mm:ss.SSS | LEVEL | name:func:line | message`
// ---------------------------------------------------------------------------

static RE_PIPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?)\s*\|\s*([A-Za-z]+)\s*\|\s*(.*)$")
        .expect("pipe regex")
});

static RE_ORIGIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([\w.<>-]+:[\w.<>-]+:\d+)\s*[|-]\s*(.*)$").expect("origin regex")
});

pub struct PipeRecognizer;

impl LineRecognizer for PipeRecognizer {
    fn name(&self) -> &'static str {
        "pipe"
    }

    fn try_parse(&self, line: &str, tc: &TimeContext) -> Option<Recognized> {
        let caps = RE_PIPE.captures(line)?;
        let rest = &caps[3];
        let mut out = Recognized {
            timestamp: parse_timestamp(&caps[1], tc.zone),
            level: Some(Level::normalize(&caps[2])),
            ..Default::default()
        };
        match RE_ORIGIN.captures(rest) {
            Some(origin) => {
                out.field("origin", MetaValue::Text(origin[1].to_string()));
                out.message = origin[2].trim().to_string();
            }
            None => out.message = rest.trim().to_string(),
        }
        Some(out)
    }
}

// ---------------------------------------------------------------------------
// `[YYYY-MM-DD HH:MM:SS] LEVEL message`
// ---------------------------------------------------------------------------

static RE_BRACKET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?)\]\s*(.*)$")
        .expect("bracket regex")
});

pub struct BracketRecognizer;

impl LineRecognizer for BracketRecognizer {
    fn name(&self) -> &'static str {
        "bracket"
    }

    fn try_parse(&self, line: &str, tc: &TimeContext) -> Option<Recognized> {
        let caps = RE_BRACKET.captures(line)?;
        let rest = caps.get(2).map_or("", |m| m.as_str());
        let (level, message) = match leading_level(rest) {
            Some((level, msg)) => (Some(level), msg),
            None => (sniff_level(rest), rest),
        };
        Some(Recognized {
            timestamp: parse_timestamp(&caps[1], tc.zone),
            level,
            message: message.trim().to_string(),
            ..Default::default()
        })
    }
}

// ---------------------------------------------------------------------------
// logfmt: `ts=... level=error msg="..." key=value`
// ---------------------------------------------------------------------------

static RE_KV: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_@][\w.@-]*)=("(?:[^"\\]|\\.)*"|\S*)"#).expect("kv regex")
});

pub struct KeyValueRecognizer;

impl LineRecognizer for KeyValueRecognizer {
    fn name(&self) -> &'static str {
        "keyvalue"
    }

    fn try_parse(&self, line: &str, tc: &TimeContext) -> Option<Recognized> {
        // 整行必须由 key=value 组成（允许空白分隔）
        let mut pairs = Vec::new();
        let mut covered = 0usize;
        for caps in RE_KV.captures_iter(line) {
            let whole = caps.get(0)?;
            if !line[covered..whole.start()].trim().is_empty() {
                return None;
            }
            covered = whole.end();
            let raw = &caps[2];
            let value = if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
                raw[1..raw.len() - 1].replace("\\\"", "\"")
            } else {
                raw.to_string()
            };
            pairs.push((caps[1].to_string(), value));
        }
        if pairs.len() < 2 || !line[covered..].trim().is_empty() {
            return None;
        }
        let has = |keys: &[&str]| pairs.iter().any(|(k, _)| keys.contains(&k.as_str()));
        if !has(LEVEL_KEYS) && !has(MESSAGE_KEYS) {
            return None;
        }

        let mut out = Recognized::default();
        for (k, v) in pairs {
            let key = k.as_str();
            if MESSAGE_KEYS.contains(&key) {
                out.message = v;
            } else if LEVEL_KEYS.contains(&key) {
                out.level = Some(Level::normalize(&v));
            } else if TIME_KEYS.contains(&key) {
                out.timestamp = parse_timestamp(&v, tc.zone)
                    .or_else(|| v.parse::<f64>().ok().and_then(parse_epoch));
            } else if HOST_KEYS.contains(&key) {
                out.host = Some(v);
            } else if APP_KEYS.contains(&key) {
                out.application = Some(v);
            } else if COMPONENT_KEYS.contains(&key) {
                out.component = Some(v);
            } else {
                out.fields.push((k, MetaValue::infer(&v)));
            }
        }
        Some(out)
    }
}

// ---------------------------------------------------------------------------
// ISO 前缀：`<iso> LEVEL [origin] message` 或 rsyslog `<iso> <host> <tag>: message`
// ---------------------------------------------------------------------------

static RE_ISO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?)\s+(.*)$",
    )
    .expect("iso regex")
});

static RE_SYSLOG_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+)\s+([^\s:\[]+)(?:\[(\d+)\])?:\s*(.*)$").expect("syslog tag regex")
});

static RE_BRACKET_ORIGIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([^\]\s]+)\]\s*(.*)$").expect("bracket origin regex"));

pub struct IsoRecognizer;

impl LineRecognizer for IsoRecognizer {
    fn name(&self) -> &'static str {
        "iso"
    }

    fn try_parse(&self, line: &str, tc: &TimeContext) -> Option<Recognized> {
        let caps = RE_ISO.captures(line)?;
        let timestamp = parse_timestamp(&caps[1], tc.zone)?;
        let rest = caps.get(2).map_or("", |m| m.as_str());
        let mut out = Recognized {
            timestamp: Some(timestamp),
            ..Default::default()
        };

        if let Some((level, after)) = leading_level(rest) {
            out.level = Some(level);
            match RE_BRACKET_ORIGIN.captures(after) {
                Some(o) => {
                    out.field("origin", MetaValue::Text(o[1].to_string()));
                    out.message = o[2].trim().to_string();
                }
                None => out.message = after.trim().to_string(),
            }
        } else {
            syslog_body(&mut out, rest);
        }
        Some(out)
    }
}

/// `host tag[pid]: message`；不符合时整段作为消息
fn syslog_body(out: &mut Recognized, rest: &str) {
    let Some(sys) = RE_SYSLOG_TAG.captures(rest) else {
        out.level = sniff_level(rest);
        out.message = rest.trim().to_string();
        return;
    };
    out.field("syslog_host", MetaValue::Text(sys[1].to_string()));
    out.field("tag", MetaValue::Text(sys[2].to_string()));
    if let Some(pid) = sys.get(3) {
        out.field("pid", MetaValue::infer(pid.as_str()));
    }
    let msg = sys[4].trim();
    match leading_level(msg) {
        Some((level, after)) => {
            out.level = Some(level);
            out.message = after.to_string();
        }
        None => {
            out.level = sniff_level(msg);
            out.message = msg.to_string();
        }
    }
}

// ---------------------------------------------------------------------------
// RFC 3164：`Jan 15 10:00:00 host tag[pid]: message`
// ---------------------------------------------------------------------------

static RE_SYSLOG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z][a-z]{2})\s+(\d{1,2})\s+(\d{2}:\d{2}:\d{2})\s+(.*)$").expect("syslog regex")
});

fn syslog_prefix_time(prefix: &str, tc: &TimeContext) -> Option<DateTime<Utc>> {
    let caps = RE_SYSLOG.captures(prefix.trim_start())?;
    parse_syslog_timestamp(&caps[1], &caps[2], &caps[3], tc.zone, tc.reference)
}

pub struct SyslogRecognizer;

impl LineRecognizer for SyslogRecognizer {
    fn name(&self) -> &'static str {
        "syslog"
    }

    fn try_parse(&self, line: &str, tc: &TimeContext) -> Option<Recognized> {
        let caps = RE_SYSLOG.captures(line)?;
        let timestamp = parse_syslog_timestamp(&caps[1], &caps[2], &caps[3], tc.zone, tc.reference)?;
        let mut out = Recognized {
            timestamp: Some(timestamp),
            ..Default::default()
        };
        syslog_body(&mut out, caps.get(4).map_or("", |m| m.as_str()));
        Some(out)
    }
}
