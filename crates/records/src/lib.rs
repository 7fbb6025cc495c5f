//! # 性能记录处理
//!
//! - `parser` - 解析各机器暂存的 `key=value` 记录文件
//! - `merger` - 多来源记录合并与冲突判定
//! - `decode` - 由记录键还原可复现的驱动命令
//! - `report` - 合并输出、冲突报告和命令文件
//! - `golden` - Golden版本生成

pub mod decode;
pub mod golden;
pub mod merger;
pub mod parser;
pub mod report;

pub use decode::{driver_command, driver_options};
pub use golden::{import_merged_file, GoldenRequest, GoldenVersioner};
pub use merger::{
    KeyConflict, Measurement, MergeEntry, MergeOutcome, RecordMerger, Resolution, ResolveMode,
    ResolvedKey,
};
pub use parser::{parse_line, parse_source, read_source, split_entries};
pub use report::{MergeArtifacts, MergeSummary};
