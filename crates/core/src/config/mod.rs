//! 配置管理
//!
//! 配置按 默认值 → TOML文件 → `TUNA_` 前缀环境变量 的顺序叠加，加载后整体校验。
//! 各组件在构造时接收自己的配置段，运行期间不读取环境变量。

pub mod models;

pub use models::*;
