//! 桥接错误类型
//!
//! 传输错误（发送失败、连接断开）在 BridgeClient / RelayBroker 内部就地恢复（排队、重连、丢弃），
//! 只有请求级结果（成功、远端错误、超时、连接丢失）会穿过 `invoke()` 边界。

use thiserror::Error;

/// 客户端与中继可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// 请求在 timeout 内未收到响应
    #[error("timeout")]
    Timeout,

    /// 调用方主动断开，挂起请求全部被拒绝
    #[error("connection lost")]
    ConnectionLost,

    /// 远端执行失败，原样携带 response.error
    #[error("{0}")]
    Remote(String),

    #[error("not connected")]
    NotConnected,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("failed to bind: {0}")]
    Bind(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("call handler panicked")]
    HandlerPanicked,
}

impl BridgeError {
    /// 是否为本地超时（与远端错误仅靠消息内容区分时使用）
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout)
    }
}

/// 任务调度器的结算错误
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    /// 排队中（尚未准入）时调度器被清空
    #[error("cleared")]
    Cleared,

    /// operation 执行时 panic；槽位照常释放
    #[error("operation panicked")]
    Panicked,
}