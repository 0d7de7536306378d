use std::path::{Component, Path};

use crate::core::{normalize_refresh_id, MetaValue, Metadata};

pub const UNKNOWN: &str = "unknown";

/// 目录布局推导出的来源信息：
///
/// - `<root>/<host>/<app>/<file>.log`
/// - `<root>/<host>/<app>/<component>/<file>.log`
/// - `<root>/<host>/<app>/<component>/<refresh>/<step_name>.log`（编排器分步日志）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathLayout {
    pub host: String,
    pub application: String,
    pub component: Option<String>,
    pub metadata: Metadata,
}

impl PathLayout {
    pub fn derive(root: &Path, path: &Path) -> Self {
        let rel = path.strip_prefix(root).unwrap_or(path);
        let dirs: Vec<String> = rel
            .parent()
            .map(|p| {
                p.components()
                    .filter_map(|c| match c {
                        Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut layout = PathLayout {
            host: dirs.first().cloned().unwrap_or_else(|| UNKNOWN.to_string()),
            application: UNKNOWN.to_string(),
            component: None,
            metadata: Metadata::new(),
        };
        if dirs.len() >= 2 {
            layout.application = dirs[1].clone();
        }
        if dirs.len() >= 3 {
            layout.component = Some(dirs[2].clone());
        }
        if dirs.len() >= 4 {
            layout.metadata.insert(
                "refresh_id".into(),
                MetaValue::Text(normalize_refresh_id(&dirs[3])),
            );
            if let Some(stem) = rel.file_stem().map(|s| s.to_string_lossy().into_owned()) {
                if let Some(n) = step_number(&stem) {
                    layout.metadata.insert("step".into(), MetaValue::Number(n));
                }
                layout
                    .metadata
                    .insert("step_name".into(), MetaValue::Text(stem));
            }
        }
        layout
    }
}

/// `step3-upload_playlist` -> 3
fn step_number(step_name: &str) -> Option<i64> {
    let rest = step_name.strip_prefix("step")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}
