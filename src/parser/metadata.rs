use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{MetaValue, Metadata};

/// 配置形态：`{ name = "refresh_id", pattern = "..." }`
///
/// `pattern` 需包含与 `name` 同名的命名捕获组；没有同名组时取第一个捕获组。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRuleSpec {
    pub name: String,
    pub pattern: String,
}

impl MetadataRuleSpec {
    pub fn new(name: &str, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
        }
    }
}

pub fn default_rule_specs() -> Vec<MetadataRuleSpec> {
    vec![
        MetadataRuleSpec::new("refresh_id", r"\b(?P<refresh_id>Refresh-\d+)\b"),
        MetadataRuleSpec::new("step", r"(?i)\bstep\s*(?P<step>\d+)(?:/\d+)?\b"),
        MetadataRuleSpec::new(
            "duration_secs",
            r"(?i)\bin\s+(?P<duration_secs>\d+(?:\.\d+)?)\s*s(?:ec(?:ond)?s?)?\b",
        ),
    ]
}

/// 编译后的抽取规则：每条规则至多产出一个值
#[derive(Clone, Debug)]
pub struct MetadataRule {
    name: String,
    regex: Regex,
}

impl MetadataRule {
    pub fn compile(spec: &MetadataRuleSpec) -> Result<Self, regex::Error> {
        Ok(Self {
            name: spec.name.clone(),
            regex: Regex::new(&spec.pattern)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extract(&self, line: &str) -> Option<MetaValue> {
        let caps = self.regex.captures(line)?;
        let m = caps.name(&self.name).or_else(|| caps.get(1))?;
        let raw = m.as_str().trim();
        if raw.is_empty() {
            return None;
        }
        Some(MetaValue::infer(raw))
    }

    /// 只填充尚不存在的 key（路径/结构化字段优先）
    pub fn apply(&self, line: &str, metadata: &mut Metadata) {
        if metadata.contains_key(&self.name) {
            return;
        }
        if let Some(v) = self.extract(line) {
            metadata.insert(self.name.clone(), v);
        }
    }
}
