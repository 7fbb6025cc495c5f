use std::path::{Path, PathBuf};

use tracing::{info, warn};
use tuna_core::TunaResult;

use crate::decode::driver_command;
use crate::merger::{KeyConflict, MergeOutcome, Resolution};

/// 合并产物路径，未设置的产物不写出
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeArtifacts {
    pub output: Option<PathBuf>,
    pub conflicts: Option<PathBuf>,
    pub conflict_commands: Option<PathBuf>,
    pub commands: Option<PathBuf>,
}

impl MergeArtifacts {
    /// 设置主输出，未指定的冲突报告和冲突命令路径由它派生
    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        let output = output.into();
        let derive = |suffix: &str| {
            let mut path = output.clone().into_os_string();
            path.push(suffix);
            PathBuf::from(path)
        };
        self.conflicts.get_or_insert_with(|| derive(".conflicts"));
        self.conflict_commands
            .get_or_insert_with(|| derive(".options"));
        self.output = Some(output);
        self
    }
}

/// 合并统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub keys: usize,
    pub written: usize,
    pub trivial: usize,
    pub auto_resolved: usize,
    pub conflicts: usize,
}

impl MergeSummary {
    pub fn from_outcome(outcome: &MergeOutcome) -> Self {
        Self {
            keys: outcome.keys.len(),
            written: outcome.keys.iter().filter(|k| k.value.is_some()).count(),
            trivial: outcome.count(|r| matches!(r, Resolution::Trivial)),
            auto_resolved: outcome.count(|r| matches!(r, Resolution::Auto)),
            conflicts: outcome.count(|r| matches!(r, Resolution::Conflict(_))),
        }
    }
}

/// 复现命令，键无法解析时给出原因而不中断写出
fn command_or_reason(key: &str) -> String {
    driver_command(key).unwrap_or_else(|e| {
        warn!("无法还原键 {} 的驱动命令: {}", key, e);
        format!("# {e}")
    })
}

/// 主输出：每个键一行，按键排序
pub fn render_output(outcome: &MergeOutcome) -> String {
    outcome
        .keys
        .iter()
        .filter_map(|k| k.line())
        .map(|line| line + "\n")
        .collect()
}

/// 单个冲突在报告中的段落
pub fn render_conflict(conflict: &KeyConflict, command: &str) -> String {
    let mut block = format!(
        "Merge conflict at key {}\nDriver options to reproduce: {}\nMerged record: {}=",
        conflict.key, command, conflict.key
    );
    let merged = conflict
        .consistent
        .iter()
        .map(|(id, value)| format!("{id}:{value}"))
        .collect::<Vec<_>>()
        .join(";");
    block.push_str(&merged);
    block.push_str("\nConflicting items:\n");
    for (id, measurements) in &conflict.conflicting {
        for m in measurements {
            block.push_str(&format!("\t{}:{} from {}\n", id, m.value, m.provenance));
        }
    }
    block.push('\n');
    block
}

pub fn render_conflicts(outcome: &MergeOutcome) -> (String, String) {
    let mut report = String::new();
    let mut commands = String::new();
    for conflict in outcome.conflicts() {
        let command = command_or_reason(&conflict.key);
        report.push_str(&render_conflict(conflict, &command));
        commands.push_str(&command);
        commands.push('\n');
    }
    (report, commands)
}

/// 全部键的复现命令
pub fn render_commands(outcome: &MergeOutcome) -> String {
    outcome
        .keys
        .iter()
        .map(|k| command_or_reason(&k.key) + "\n")
        .collect()
}

async fn write_file(path: &Path, content: &str) -> TunaResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    info!("已写出 {}", path.display());
    Ok(())
}

impl MergeArtifacts {
    /// 写出全部产物，每次运行覆盖旧文件
    pub async fn write(&self, outcome: &MergeOutcome) -> TunaResult<MergeSummary> {
        if let Some(path) = &self.output {
            write_file(path, &render_output(outcome)).await?;
        }

        let (report, commands) = render_conflicts(outcome);
        if let Some(path) = &self.conflicts {
            write_file(path, &report).await?;
        }
        if let Some(path) = &self.conflict_commands {
            write_file(path, &commands).await?;
        }
        if let Some(path) = &self.commands {
            write_file(path, &render_commands(outcome)).await?;
        }

        Ok(MergeSummary::from_outcome(outcome))
    }
}
