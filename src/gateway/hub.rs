//! RelayBroker（中继）
//!
//! 持有至多一个 orchestrator 连接与一组 executor 连接：
//! - orchestrator 发出的 call 广播给所有在线 executor
//! - executor 发回的 response / error 转发给当前 orchestrator
//!
//! 中继逐帧无状态转发，不解析 params / data，也不合成错误响应；请求失败由 orchestrator 自己的超时兜底。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::message::{Envelope, Role};
use crate::core::BridgeError;

/// 中继配置
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket 监听地址
    pub bind_addr: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
        }
    }
}

pub type ConnectionId = String;

/// 已登记的连接
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    orchestrator: Option<(ConnectionId, mpsc::UnboundedSender<String>)>,
    executors: HashMap<ConnectionId, mpsc::UnboundedSender<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按 hello 中的角色登记；新的 orchestrator 直接顶替旧的
    pub fn register(&mut self, id: &str, role: Role, tx: mpsc::UnboundedSender<String>) {
        match role {
            Role::Orchestrator => {
                if let Some((previous, _)) = &self.orchestrator {
                    if previous != id {
                        tracing::info!("Orchestrator {} superseded by {}", previous, id);
                    }
                }
                self.executors.remove(id);
                self.orchestrator = Some((id.to_string(), tx));
            }
            Role::Executor => {
                if self.is_orchestrator(id) {
                    self.orchestrator = None;
                }
                self.executors.insert(id.to_string(), tx);
            }
        }
    }

    pub fn role_of(&self, id: &str) -> Option<Role> {
        if self.is_orchestrator(id) {
            Some(Role::Orchestrator)
        } else if self.executors.contains_key(id) {
            Some(Role::Executor)
        } else {
            None
        }
    }

    fn is_orchestrator(&self, id: &str) -> bool {
        matches!(&self.orchestrator, Some((current, _)) if current == id)
    }

    /// 广播给所有在线 executor，返回投递数
    pub fn broadcast_to_executors(&self, frame: &str) -> usize {
        self.executors
            .values()
            .filter(|tx| !tx.is_closed())
            .filter(|tx| tx.send(frame.to_string()).is_ok())
            .count()
    }

    /// 转发给 orchestrator；不存在或已关闭返回 false
    pub fn send_to_orchestrator(&self, frame: &str) -> bool {
        match &self.orchestrator {
            Some((_, tx)) if !tx.is_closed() => tx.send(frame.to_string()).is_ok(),
            _ => false,
        }
    }

    /// 连接断开时移除；只有仍是当前 orchestrator 才清空该槽位
    pub fn remove(&mut self, id: &str) -> Option<Role> {
        if self.is_orchestrator(id) {
            self.orchestrator = None;
            return Some(Role::Orchestrator);
        }
        self.executors.remove(id).map(|_| Role::Executor)
    }

    pub fn executor_count(&self) -> usize {
        self.executors.len()
    }

    pub fn has_orchestrator(&self) -> bool {
        self.orchestrator.is_some()
    }

    pub fn clear(&mut self) {
        self.orchestrator = None;
        self.executors.clear();
    }
}

/// 中继服务器
pub struct RelayBroker {
    config: RelayConfig,
    registry: Arc<RwLock<ConnectionRegistry>>,
    shutdown: CancellationToken,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl RelayBroker {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: Arc::new(RwLock::new(ConnectionRegistry::new())),
            shutdown: CancellationToken::new(),
            local_addr: RwLock::new(None),
        }
    }

    /// 绑定并在后台运行 accept 循环，返回实际监听地址（端口可为 0）
    pub async fn start(&self) -> Result<SocketAddr, BridgeError> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| BridgeError::Bind(format!("invalid bind address {}: {}", self.config.bind_addr, e)))?;

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| BridgeError::Bind(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BridgeError::Bind(e.to_string()))?;
        *self.local_addr.write().await = Some(local_addr);

        tracing::info!("Relay listening on ws://{}", local_addr);

        let registry = Arc::clone(&self.registry);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let registry = Arc::clone(&registry);
                                let shutdown = shutdown.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, addr, registry, shutdown).await {
                                        tracing::error!("Connection error from {}: {}", addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                }
            }
            tracing::info!("Relay accept loop stopped");
        });

        Ok(local_addr)
    }

    /// 停止中继并断开所有连接
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.registry.write().await.clear();
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    pub async fn executor_count(&self) -> usize {
        self.registry.read().await.executor_count()
    }

    pub async fn has_orchestrator(&self) -> bool {
        self.registry.read().await.has_orchestrator()
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<RwLock<ConnectionRegistry>>,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let conn_id = format!("ws_{}_{}", addr, uuid::Uuid::new_v4());
    tracing::info!("New relay connection from {}", addr);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(msg)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = ws_rx.next() => match next {
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    tracing::warn!("WebSocket receive error: {}", e);
                    break;
                }
                None => break,
            },
        };

        match msg {
            WsMessage::Text(text) => {
                route_frame(&conn_id, &text, &tx, &registry).await;
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    let removed = registry.write().await.remove(&conn_id);
    tracing::info!(role = ?removed, "Relay connection closed: {}", addr);
    Ok(())
}

async fn route_frame(
    conn_id: &str,
    text: &str,
    tx: &mpsc::UnboundedSender<String>,
    registry: &RwLock<ConnectionRegistry>,
) {
    let envelope = match Envelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Discarding malformed frame from {}: {}", conn_id, e);
            return;
        }
    };

    if let Envelope::Hello { role, .. } = &envelope {
        match role {
            Some(role) => {
                registry.write().await.register(conn_id, *role, tx.clone());
                tracing::info!(role = %role, "Registered {}", conn_id);
                if let Ok(ack) = Envelope::hello_ack().to_json() {
                    let _ = tx.send(ack);
                }
            }
            None => tracing::debug!("Ignoring hello without role from {}", conn_id),
        }
        return;
    }

    let registry = registry.read().await;
    match (registry.role_of(conn_id), &envelope) {
        (None, _) => {
            tracing::debug!(kind = envelope.kind(), "Ignoring frame before hello from {}", conn_id);
        }
        (Some(Role::Orchestrator), Envelope::Call { id, tool, .. }) => {
            let delivered = registry.broadcast_to_executors(text);
            if delivered == 0 {
                tracing::warn!(id = %id, tool = %tool, "No executor available, dropping call");
            } else {
                tracing::debug!(id = %id, tool = %tool, delivered, "Forwarded call");
            }
        }
        (Some(Role::Executor), Envelope::Response { id, .. }) => {
            if !registry.send_to_orchestrator(text) {
                tracing::warn!(id = %id, "No orchestrator connected, dropping response");
            }
        }
        (Some(Role::Executor), Envelope::Error { .. }) => {
            if !registry.send_to_orchestrator(text) {
                tracing::warn!("No orchestrator connected, dropping error");
            }
        }
        (Some(role), _) => {
            tracing::debug!(role = %role, kind = envelope.kind(), "Ignoring unexpected frame from {}", conn_id);
        }
    }
}
