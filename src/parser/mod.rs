pub mod level;
pub mod metadata;
pub mod recognizers;
pub mod timestamp;

use chrono::{DateTime, Utc};

use crate::core::{normalize_refresh_id, Level, LogRecord, MetaValue, Metadata};

pub use metadata::{default_rule_specs, MetadataRule, MetadataRuleSpec};
pub use recognizers::{default_recognizers, LineRecognizer, Recognized, TimeContext};
pub use timestamp::LocalZone;

/// 解析一行时可用的“文件级”上下文（由 File Tracker 按路径推导）
#[derive(Clone, Debug)]
pub struct ParseContext {
    pub host: String,
    pub application: String,
    pub component: Option<String>,
    pub file_path: String,
    /// 路径推导出的 metadata（优先级最高）
    pub metadata: Metadata,
    pub epoch: u64,
    /// 本次扫描时间：无法识别时间戳的行回退到它
    pub scanned_at: DateTime<Utc>,
}

/// 行解析器：按固定顺序尝试识别器，先匹配者胜；再用抽取规则补充 metadata。
///
/// 永不报错：无法识别的行产出 `UNKNOWN` 级别记录，消息为原文；纯空白行丢弃。
pub struct LineParser {
    recognizers: Vec<Box<dyn LineRecognizer>>,
    rules: Vec<MetadataRule>,
    tz: LocalZone,
}

impl LineParser {
    pub fn new(
        recognizers: Vec<Box<dyn LineRecognizer>>,
        rules: Vec<MetadataRule>,
        tz: LocalZone,
    ) -> Self {
        Self {
            recognizers,
            rules,
            tz,
        }
    }

    /// 默认识别器 + 给定规则
    pub fn with_rules(specs: &[MetadataRuleSpec], tz: LocalZone) -> Result<Self, regex::Error> {
        let rules = specs
            .iter()
            .map(MetadataRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(default_recognizers(), rules, tz))
    }

    pub fn tz(&self) -> LocalZone {
        self.tz
    }

    pub fn recognizer_names(&self) -> Vec<&'static str> {
        self.recognizers.iter().map(|r| r.name()).collect()
    }

    pub fn parse(&self, raw: &str, ctx: &ParseContext, offset: Option<u64>) -> Option<LogRecord> {
        let line = raw.trim_end_matches(&['\n', '\r'][..]);
        if line.trim().is_empty() {
            return None;
        }

        let tc = TimeContext {
            zone: self.tz,
            reference: ctx.scanned_at,
        };
        let recognized = self.recognizers.iter().find_map(|r| r.try_parse(line, &tc));

        let mut metadata = ctx.metadata.clone();
        let mut record = LogRecord {
            timestamp: ctx.scanned_at,
            level: Level::Unknown,
            host: ctx.host.clone(),
            application: ctx.application.clone(),
            component: ctx.component.clone(),
            message: line.to_string(),
            metadata: Metadata::new(),
            source_file: ctx.file_path.clone(),
            source_offset: offset,
            source_epoch: ctx.epoch,
        };

        if let Some(r) = recognized {
            if let Some(ts) = r.timestamp {
                record.timestamp = ts;
            }
            record.level = r.level.unwrap_or(Level::Unknown);
            if !r.message.is_empty() {
                record.message = r.message;
            }
            if let Some(h) = r.host.filter(|s| !s.is_empty()) {
                record.host = h;
            }
            if let Some(a) = r.application.filter(|s| !s.is_empty()) {
                record.application = a;
            }
            if let Some(c) = r.component.filter(|s| !s.is_empty()) {
                record.component = Some(c);
            }
            for (k, v) in r.fields {
                metadata.entry(k).or_insert(v);
            }
        }

        for rule in &self.rules {
            rule.apply(line, &mut metadata);
        }
        if let Some(id) = metadata
            .get("refresh_id")
            .map(|v| normalize_refresh_id(&v.to_string()))
        {
            metadata.insert("refresh_id".into(), MetaValue::Text(id));
        }

        record.metadata = metadata;
        Some(record)
    }
}
