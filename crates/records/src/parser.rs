use std::path::Path;

use tracing::warn;
use tuna_core::models::{PerformanceRecord, Provenance};
use tuna_core::TunaResult;

/// 在第一个分隔符处切分，前半部分不能为空
fn split_once_nonempty(s: &str, separator: char) -> Option<(&str, &str)> {
    match s.split_once(separator) {
        Some((head, tail)) if !head.is_empty() => Some((head, tail)),
        _ => None,
    }
}

/// 解析单行 `key=value`
///
/// 空行返回 `None`；缺少 `=`、键为空或值为空的行记录警告后跳过。
pub fn parse_line(line: &str, provenance: &Provenance) -> Option<(String, String)> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.is_empty() {
        return None;
    }

    let Some((key, value)) = split_once_nonempty(line, '=') else {
        warn!("格式错误的记录，缺少键: {}", provenance);
        return None;
    };
    if value.is_empty() {
        warn!("键 {} 没有内容: {}", key, provenance);
        return None;
    }

    Some((key.to_string(), value.to_string()))
}

/// 把记录值切分为 `(id, measurement)` 子项，格式错误的子项记录警告后跳过
pub fn split_entries(value: &str, provenance: &Provenance) -> Vec<(String, String)> {
    value
        .split(';')
        .filter_map(|item| {
            let Some((id, measurement)) = split_once_nonempty(item, ':') else {
                warn!("格式错误的子项，缺少id: {}", provenance);
                return None;
            };
            if measurement.is_empty() {
                warn!("id {} 没有内容: {}", id, provenance);
                return None;
            }
            Some((id.to_string(), measurement.to_string()))
        })
        .collect()
}

/// 解析一个来源的全部内容，行号从1开始
pub fn parse_source(source: &str, content: &str) -> Vec<PerformanceRecord> {
    content
        .split('\n')
        .enumerate()
        .filter_map(|(index, line)| {
            let provenance = Provenance::new(source, index + 1);
            parse_line(line, &provenance)
                .map(|(key, value)| PerformanceRecord::new(key, value, provenance))
        })
        .collect()
}

/// 读取并解析记录文件，来源名为调用方给出的路径
pub async fn read_source(path: &Path) -> TunaResult<Vec<PerformanceRecord>> {
    let bytes = tokio::fs::read(path).await?;
    let content = String::from_utf8_lossy(&bytes);
    Ok(parse_source(&path.display().to_string(), &content))
}
