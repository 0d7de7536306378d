use std::path::Path;
use std::sync::Arc;

use wildmatch::WildMatch;

/// 发现阶段的文件名匹配接口
pub trait Matcher: Send + Sync {
    /// `name` 为文件名，`full` 为完整路径（含 `/` 的模式按完整路径匹配）
    fn matches(&self, name: &str, full: &str) -> bool;
}

/// 精确文件名匹配（`syslog`、`app.log`）；不匹配 `app.log.1` 这类轮转备份
pub struct ExactMatcher {
    name: String,
}

impl ExactMatcher {
    pub fn new(pattern: &str) -> Self {
        Self {
            name: pattern.to_string(),
        }
    }
}

impl Matcher for ExactMatcher {
    fn matches(&self, name: &str, _full: &str) -> bool {
        name == self.name
    }
}

/// 通配符匹配 (Glob)
pub struct GlobMatcher {
    wild: WildMatch,
    full_path: bool,
}

impl GlobMatcher {
    pub fn new(pattern: &str) -> Self {
        Self {
            wild: WildMatch::new(pattern),
            full_path: pattern.contains('/'),
        }
    }
}

impl Matcher for GlobMatcher {
    fn matches(&self, name: &str, full: &str) -> bool {
        if self.full_path {
            self.wild.matches(full)
        } else {
            self.wild.matches(name)
        }
    }
}

pub fn create_matcher(pattern: &str) -> Arc<dyn Matcher> {
    if pattern.contains('*') || pattern.contains('?') {
        Arc::new(GlobMatcher::new(pattern))
    } else {
        Arc::new(ExactMatcher::new(pattern))
    }
}

/// 多个模式取并集；空集合视为匹配一切
#[derive(Clone, Default)]
pub struct PatternSet {
    matchers: Vec<Arc<dyn Matcher>>,
}

impl PatternSet {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            matchers: patterns
                .iter()
                .map(|p| p.as_ref().trim())
                .filter(|p| !p.is_empty())
                .map(create_matcher)
                .collect(),
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        if self.matchers.is_empty() {
            return true;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        let full = path.to_string_lossy();
        self.matchers.iter().any(|m| m.matches(&name, &full))
    }
}
