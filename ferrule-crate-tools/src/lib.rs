//! Ferrule 工具集
//!
//! 提供日志初始化与 TOML 配置加载等通用工具。

pub mod config;
pub mod init_log;
