//! 配置模型与加载
//!
//! 配置来源按优先级从低到高：各段的 `Default` 实现、TOML 配置文件、
//! `COURIER__SECTION__KEY` 形式的环境变量。

pub mod models;

pub use models::*;
