//! 星型消息桥
//!
//! ## RelayBroker（中继）
//!
//! 唯一的 WebSocket 服务端。按 hello 中的角色登记连接：
//! - orchestrator 发出的 call 广播给所有 executor
//! - executor 发出的 response / error 转交给 orchestrator
//!
//! ## BridgeClient（端点）
//!
//! 两侧共用的客户端：自动重连、离线出站队列、按 id 关联请求与响应、请求超时。
//! executor 侧把入站 call 交给 CallHandler；ExecutorEndpoint 在其上接入 TaskScheduler 限流。

mod client;
mod endpoint;
mod hub;
mod message;
mod outbound;
mod pending;
mod transport;

pub use client::{BridgeClient, CallFuture, CallHandler, ClientConfig, ConnectionState};
pub use endpoint::{task_options, ExecutorEndpoint, OrchestratorEndpoint, ToolExecutor, ToolFuture, ToolRegistry};
pub use hub::{ConnectionId, ConnectionRegistry, RelayBroker, RelayConfig};
pub use message::{new_request_id, response_outcome, Envelope, HelloStatus, Role};
pub use outbound::OutboundQueue;
pub use pending::{PendingRequest, PendingRequestTable, RequestOutcome};
pub use transport::{Connector, FrameChannel, WsConnector};
