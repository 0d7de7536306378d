use std::sync::LazyLock;

use regex::Regex;

use crate::core::Level;

// 只认大写 token：正文里的 "error handling" 之类不算级别
static RE_LEVEL_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(TRACE|DEBUG|INFO|NOTICE|WARNING|WARN|ERROR|ERR|CRITICAL|CRIT|FATAL|EMERG|ALERT)\b")
        .expect("level token regex")
});

/// 在自由文本中嗅探第一个级别 token
pub fn sniff_level(text: &str) -> Option<Level> {
    RE_LEVEL_TOKEN
        .find(text)
        .and_then(|m| Level::parse_token(m.as_str()))
}

/// 行首（允许中括号/冒号包裹）的级别 token；返回级别与剩余文本
pub fn leading_level(text: &str) -> Option<(Level, &str)> {
    let trimmed = text.trim_start();
    let end = trimmed
        .find(|c: char| c.is_whitespace())
        .unwrap_or(trimmed.len());
    let token = trimmed[..end].trim_matches(|c| c == '[' || c == ']' || c == ':');
    if token.is_empty() {
        return None;
    }
    let level = Level::parse_token(token)?;
    Some((level, trimmed[end..].trim_start()))
}
