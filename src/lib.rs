//! Tab Bridge - 浏览器自动化消息桥
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、任务调度（全局 / 按目标并发上限）
//! - **gateway**: 中继（WebSocket 服务器）、桥接客户端、执行端与编排端入口
//! - **observability**: 日志初始化

pub mod config;
pub mod core;
pub mod gateway;
pub mod observability;

pub use gateway::{BridgeClient, ExecutorEndpoint, OrchestratorEndpoint, RelayBroker};
