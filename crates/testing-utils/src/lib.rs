//! # Tuna Testing Utils
//!
//! 工作区共享的测试工具：
//!
//! - **Mock Repositories**: 所有仓储接口的内存实现，状态转换语义与SQLite实现一致
//! - **Mock Backend**: 可编排结果的调优后端
//! - **Test Data Builders**: 带合理默认值的测试数据构造器
//!
//! ```toml
//! [dev-dependencies]
//! tuna-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod mocks;

pub use builders::*;
pub use mocks::*;
