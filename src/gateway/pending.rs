//! 挂起请求表
//!
//! 以请求 ID 为键保存等待响应的 oneshot 发送端。每个条目只会被移除一次：
//! 匹配的 response、超时、clear() 三者谁先拿走条目谁生效，后到者查不到条目即无副作用。
//! 超时计时器随条目登记启动，调用方放弃等待时条目照样按期移除。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::core::BridgeError;

/// 请求结果
pub type RequestOutcome = Result<Value, BridgeError>;

/// 单个挂起请求
#[derive(Debug)]
pub struct PendingRequest {
    pub id: String,
    pub created_at: Instant,
    pub timeout: Duration,
    completer: oneshot::Sender<RequestOutcome>,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn settle(self, outcome: RequestOutcome) {
        // 接收端已被丢弃（调用方放弃等待）时忽略
        let _ = self.completer.send(outcome);
    }
}

type Entries = Arc<Mutex<HashMap<String, PendingRequest>>>;

/// 挂起请求表
#[derive(Debug, Default)]
pub struct PendingRequestTable {
    entries: Entries,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记请求并启动超时计时器，返回结果接收端；到期时以 Timeout 结算
    pub async fn register(&self, id: &str, timeout: Duration) -> oneshot::Receiver<RequestOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock().await;

        // 计时任务到期后要先拿到同一把锁，总能看到这里插入的条目
        let timer = tokio::spawn(expire(Arc::clone(&self.entries), id.to_string(), timeout));
        entries.insert(
            id.to_string(),
            PendingRequest {
                id: id.to_string(),
                created_at: Instant::now(),
                timeout,
                completer: tx,
                timer: Some(timer),
            },
        );
        rx
    }

    /// 按 ID 结算；返回 false 表示无此条目（重复或超时后到达）
    pub async fn resolve(&self, id: &str, outcome: RequestOutcome) -> bool {
        let request = self.entries.lock().await.remove(id);
        match request {
            Some(mut request) => {
                request.cancel_timer();
                tracing::debug!(
                    id = %id,
                    elapsed_ms = request.created_at.elapsed().as_millis() as u64,
                    "Pending request settled"
                );
                request.settle(outcome);
                true
            }
            None => false,
        }
    }

    /// 移除条目但不结算，接收端随之收到通道关闭
    pub async fn remove(&self, id: &str) -> Option<PendingRequest> {
        let mut request = self.entries.lock().await.remove(id)?;
        request.cancel_timer();
        Some(request)
    }

    /// 以同一错误拒绝所有挂起请求，返回数量
    pub async fn clear(&self, error: BridgeError) -> usize {
        let drained: Vec<PendingRequest> = self.entries.lock().await.drain().map(|(_, r)| r).collect();
        let count = drained.len();
        for mut request in drained {
            request.cancel_timer();
            request.settle(Err(error.clone()));
        }
        count
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

async fn expire(entries: Entries, id: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let expired = entries.lock().await.remove(&id);
    if let Some(request) = expired {
        tracing::warn!(id = %id, timeout_ms = timeout.as_millis() as u64, "Request timed out");
        request.settle(Err(BridgeError::Timeout));
    }
}
