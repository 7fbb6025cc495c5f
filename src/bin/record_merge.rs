use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tuna_core::config::LoggingConfig;
use tuna_core::init_logging;
use tuna_records::{read_source, MergeArtifacts, RecordMerger, ResolveMode};

/// 参数错误或输入输出失败
const EXIT_FAILURE: u8 = 2;
/// 存在未解决的冲突
const EXIT_CONFLICT: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "record-merge")]
#[command(version = "1.0.0")]
#[command(about = "合并各机器的性能记录文件")]
#[command(long_about = "合并各机器的性能记录文件，输出按键排序的合并结果，并报告无法自动判定的冲突")]
struct Args {
    /// 记录文件，每台机器一个
    #[arg(required = true)]
    sources: Vec<PathBuf>,

    /// 合并输出，冲突报告和冲突命令默认写在其旁边
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 冲突报告
    #[arg(short = 'p', long)]
    conflicts: Option<PathBuf>,

    /// 冲突键的复现命令
    #[arg(short = 'x', long)]
    conflict_commands: Option<PathBuf>,

    /// 所有键的复现命令
    #[arg(short, long)]
    commands: Option<PathBuf>,

    /// 冲突解决模式: off|auto (0|1)
    #[arg(short, long, default_value = "off")]
    resolve: ResolveMode,

    /// 日志级别
    #[arg(short, long, default_value = "info", value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: String,
}

impl Args {
    fn artifacts(&self) -> MergeArtifacts {
        let artifacts = MergeArtifacts {
            output: None,
            conflicts: self.conflicts.clone(),
            conflict_commands: self.conflict_commands.clone(),
            commands: self.commands.clone(),
        };
        match &self.output {
            Some(output) => artifacts.with_output(output),
            None => artifacts,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let logging = LoggingConfig {
        level: args.log_level.clone(),
        ..LoggingConfig::default()
    };
    if let Err(e) = init_logging(&logging) {
        eprintln!("初始化日志失败: {e:#}");
        return ExitCode::from(EXIT_FAILURE);
    }

    let mut merger = RecordMerger::new();
    for source in &args.sources {
        match read_source(source).await {
            Ok(records) => {
                info!("读取 {}: {} 条记录", source.display(), records.len());
                merger.add_all(&records);
            }
            Err(e) => {
                error!("无法读取 {}: {}", source.display(), e);
                return ExitCode::from(EXIT_FAILURE);
            }
        }
    }

    let outcome = merger.resolve(args.resolve);
    let artifacts = args.artifacts();
    if artifacts.output.is_none() {
        warn!("未指定输出文件，只生成报告");
    }

    let summary = match artifacts.write(&outcome).await {
        Ok(summary) => summary,
        Err(e) => {
            error!("写出合并结果失败: {}", e);
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    println!(
        "keys {} written {} trivial {} auto {} conflicts {} (mode {})",
        summary.keys,
        summary.written,
        summary.trivial,
        summary.auto_resolved,
        summary.conflicts,
        args.resolve
    );
    for path in [
        &artifacts.output,
        &artifacts.conflicts,
        &artifacts.conflict_commands,
        &artifacts.commands,
    ]
    .into_iter()
    .flatten()
    {
        println!("wrote {}", path.display());
    }

    if summary.conflicts > 0 {
        ExitCode::from(EXIT_CONFLICT)
    } else {
        ExitCode::SUCCESS
    }
}
