//! BridgeClient：断线自动重连的 RPC 客户端（中继两端共用）
//!
//! - `connect()` 幂等；连上后先发 `hello{role}`，再按 FIFO 冲刷出站队列
//! - `send_message()` 尽力立即发送，失败则进出站队列（满时淘汰最旧）
//! - `send_request()` 登记挂起请求并发 call，按 ID 关联 response，超时返回 `timeout`
//! - `on_call()` 注册入站 call 的唯一处理器，结果包装为 response 回发
//! - `disconnect()` 停止重连、关闭连接、以 `connection lost` 拒绝所有挂起请求，出站队列保留
//!
//! 重连状态机：`Disconnected → Connecting → Connected`，非主动断开时进入 `Reconnecting`，
//! 按固定间隔重试，累计 `max_reconnect_attempts` 次失败后停止，直到再次显式调用 `connect()`。

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::message::{new_request_id, response_outcome, Envelope, Role};
use super::outbound::OutboundQueue;
use super::pending::PendingRequestTable;
use super::transport::{Connector, FrameChannel};
use crate::core::BridgeError;

/// 客户端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 重连间隔
    pub reconnect_interval: Duration,
    /// 最大连续重连次数
    pub max_reconnect_attempts: u32,
    /// 出站队列上限
    pub message_queue_limit: usize,
    /// 默认请求超时
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(3000),
            max_reconnect_attempts: 10,
            message_queue_limit: 100,
            request_timeout: Duration::from_millis(30_000),
        }
    }
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// 非主动断开后，重连定时器运行中
    Reconnecting,
}

pub type CallFuture = BoxFuture<'static, Result<Value, String>>;

/// 入站 call 处理器
///
/// `handle` 在读循环里同步调用，调用顺序即 call 到达顺序；返回的 future 在独立任务中等待结果。
pub trait CallHandler: Send + Sync {
    fn handle(&self, tool: String, params: Value) -> CallFuture;
}

struct Link {
    generation: u64,
    outgoing: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
struct ReconnectTimer {
    attempts: u32,
    active: bool,
    epoch: u64,
    task: Option<JoinHandle<()>>,
}

struct ClientInner {
    role: Role,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<ConnectionState>,
    link: Mutex<Option<Link>>,
    queue: Mutex<OutboundQueue>,
    pending: PendingRequestTable,
    handler: RwLock<Option<Arc<dyn CallHandler>>>,
    reconnect: Mutex<ReconnectTimer>,
    manual_close: AtomicBool,
    generation: AtomicU64,
}

/// 断线重连客户端，Clone 共享同一连接
#[derive(Clone)]
pub struct BridgeClient {
    inner: Arc<ClientInner>,
}

impl BridgeClient {
    pub fn new(role: Role, connector: Arc<dyn Connector>, config: ClientConfig) -> Self {
        let queue = OutboundQueue::new(config.message_queue_limit);
        Self {
            inner: Arc::new(ClientInner {
                role,
                config,
                connector,
                state: Mutex::new(ConnectionState::Disconnected),
                link: Mutex::new(None),
                queue: Mutex::new(queue),
                pending: PendingRequestTable::new(),
                handler: RwLock::new(None),
                reconnect: Mutex::new(ReconnectTimer::default()),
                manual_close: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// 建立连接；已连接或正在连接时直接返回
    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.inner.manual_close.store(false, Ordering::SeqCst);
        {
            let mut timer = self.inner.reconnect.lock().await;
            if !timer.active {
                timer.attempts = 0;
            }
        }
        self.inner.connect_once().await
    }

    /// 主动断开：停止重连、关闭连接、拒绝全部挂起请求（出站队列保留）
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.manual_close.store(true, Ordering::SeqCst);
        {
            let mut timer = inner.reconnect.lock().await;
            timer.active = false;
            timer.epoch += 1;
            if let Some(task) = timer.task.take() {
                task.abort();
            }
        }
        inner.link.lock().await.take();
        *inner.state.lock().await = ConnectionState::Disconnected;

        let rejected = inner.pending.clear(BridgeError::ConnectionLost).await;
        tracing::info!(role = %inner.role, rejected, "Bridge disconnected by caller");
    }

    /// 发送信封；未连接或发送失败时进入出站队列
    pub async fn send_message(&self, envelope: &Envelope) -> Result<(), BridgeError> {
        self.inner.send_message(envelope).await
    }

    /// 请求/响应 RPC；timeout 为 None 时使用配置的默认超时
    pub async fn send_request(
        &self,
        tool: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        let inner = &self.inner;
        let timeout = timeout.unwrap_or(inner.config.request_timeout);
        let id = new_request_id();
        let rx = inner.pending.register(&id, timeout).await;

        if inner.manual_close.load(Ordering::SeqCst) {
            inner.pending.remove(&id).await;
            return Err(BridgeError::ConnectionLost);
        }

        let envelope = Envelope::call(id.clone(), tool, params);
        if let Err(e) = inner.send_message(&envelope).await {
            inner.pending.remove(&id).await;
            return Err(e);
        }

        // 超时由挂起表的计时器结算，调用方中途放弃也不会遗留条目
        let outcome = rx.await.unwrap_or(Err(BridgeError::ConnectionLost));
        if matches!(outcome, Err(BridgeError::Timeout)) {
            tracing::debug!(id = %id, tool = %tool, "Request settled by timeout");
        }
        outcome
    }

    /// 注册入站 call 处理器（覆盖之前的）
    pub async fn on_call(&self, handler: Arc<dyn CallHandler>) {
        *self.inner.handler.write().await = Some(handler);
    }

    pub async fn clear_queue(&self) {
        self.inner.queue.lock().await.clear();
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.lock().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// 当前重连周期内已尝试次数
    pub async fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect.lock().await.attempts
    }

    pub async fn queued_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.pending.len().await
    }
}

impl ClientInner {
    /// 装箱返回：重连循环经由这里回到自身
    fn connect_once(self: &Arc<Self>) -> BoxFuture<'static, Result<(), BridgeError>> {
        let inner = Arc::clone(self);
        async move { inner.open_link().await }.boxed()
    }

    async fn open_link(self: &Arc<Self>) -> Result<(), BridgeError> {
        {
            let mut state = self.state.lock().await;
            if matches!(*state, ConnectionState::Connecting | ConnectionState::Connected) {
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        match self.connector.connect().await {
            Ok(channel) => {
                self.on_open(channel).await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(role = %self.role, "Bridge connect failed: {}", e);
                *self.state.lock().await = ConnectionState::Disconnected;
                if !self.manual_close.load(Ordering::SeqCst) {
                    self.schedule_reconnect().await;
                }
                Err(e)
            }
        }
    }

    async fn on_open(self: &Arc<Self>, channel: FrameChannel) {
        let FrameChannel { outgoing, mut incoming } = channel;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // 持有队列锁直到 hello 与积压消息发出，并发的 send_message 只能排在其后
        let mut queue = self.queue.lock().await;
        let mut link = self.link.lock().await;
        let current = link.insert(Link {
            generation,
            outgoing,
        });
        *self.state.lock().await = ConnectionState::Connected;
        {
            let mut timer = self.reconnect.lock().await;
            timer.attempts = 0;
            if timer.active {
                timer.active = false;
                timer.epoch += 1;
                timer.task.take();
            }
        }
        tracing::info!(role = %self.role, "Bridge connected");

        let send = |frame: String| current.outgoing.send(frame).map_err(|e| e.0);
        let hello_sent = match Envelope::hello(self.role).to_json() {
            Ok(frame) => send(frame).is_ok(),
            Err(_) => true,
        };
        if hello_sent {
            let flushed = flush_queue(&mut queue, send);
            if flushed > 0 {
                tracing::info!(flushed, remaining = queue.len(), "Flushed outbound queue");
            }
        }
        drop(link);
        drop(queue);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(text) = incoming.recv().await {
                inner.handle_frame(&text).await;
            }
            inner.on_close(generation).await;
        });
    }

    async fn on_close(self: &Arc<Self>, generation: u64) {
        {
            let mut link = self.link.lock().await;
            match link.as_ref() {
                Some(current) if current.generation == generation => {
                    link.take();
                }
                _ => return,
            }
        }
        *self.state.lock().await = ConnectionState::Disconnected;
        tracing::info!(role = %self.role, "Bridge connection closed");

        if !self.manual_close.load(Ordering::SeqCst) {
            self.schedule_reconnect().await;
        }
    }

    async fn schedule_reconnect(self: &Arc<Self>) {
        let mut timer = self.reconnect.lock().await;
        if self.config.max_reconnect_attempts == 0 || timer.attempts >= self.config.max_reconnect_attempts {
            return;
        }
        *self.state.lock().await = ConnectionState::Reconnecting;
        if timer.active {
            return;
        }
        timer.active = true;
        timer.epoch += 1;
        let epoch = timer.epoch;
        let inner = Arc::clone(self);
        timer.task = Some(tokio::spawn(async move {
            inner.run_reconnect_loop(epoch).await;
        }));
    }

    async fn run_reconnect_loop(self: Arc<Self>, epoch: u64) {
        let interval = self.config.reconnect_interval;
        let max = self.config.max_reconnect_attempts;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        loop {
            ticker.tick().await;

            let attempt = {
                let mut timer = self.reconnect.lock().await;
                if !timer.active || timer.epoch != epoch {
                    return;
                }
                timer.attempts += 1;
                timer.attempts
            };
            tracing::info!(role = %self.role, attempt, max, "Reconnecting to relay");

            if self.connect_once().await.is_ok() {
                return;
            }

            if attempt >= max {
                let mut timer = self.reconnect.lock().await;
                if timer.epoch == epoch {
                    timer.active = false;
                    timer.task = None;
                }
                drop(timer);
                *self.state.lock().await = ConnectionState::Disconnected;
                tracing::warn!(role = %self.role, attempts = attempt, "Giving up reconnecting to relay");
                return;
            }
        }
    }

    async fn send_message(&self, envelope: &Envelope) -> Result<(), BridgeError> {
        let frame = envelope.to_json().map_err(|e| {
            tracing::warn!("Dropping unserializable {} envelope: {}", envelope.kind(), e);
            e
        })?;

        let mut queue = self.queue.lock().await;
        let frame = if queue.is_empty() {
            match self.try_send(frame).await {
                Ok(()) => return Ok(()),
                Err(frame) => frame,
            }
        } else {
            frame
        };

        if let Some(evicted) = queue.push(frame) {
            tracing::warn!(
                limit = queue.limit(),
                evicted_len = evicted.len(),
                "Outbound queue full, dropped oldest message"
            );
        }
        tracing::debug!(queued = queue.len(), kind = envelope.kind(), "Message queued");
        Ok(())
    }

    async fn try_send(&self, frame: String) -> Result<(), String> {
        let link = self.link.lock().await;
        match link.as_ref() {
            Some(link) => link.outgoing.send(frame).map_err(|e| e.0),
            None => Err(frame),
        }
    }

    async fn handle_frame(self: &Arc<Self>, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Discarding malformed frame: {}", e);
                return;
            }
        };

        match envelope {
            Envelope::Hello { status, .. } => {
                tracing::debug!(role = %self.role, ?status, "Relay acknowledged hello");
            }
            Envelope::Call { id, tool, params } => {
                let handler = self.handler.read().await.clone();
                self.dispatch_call(handler, id, tool, params);
            }
            Envelope::Response { id, data, error } => {
                if !self.pending.resolve(&id, response_outcome(data, error)).await {
                    tracing::debug!(id = %id, "Discarding response for unknown request");
                }
            }
            Envelope::Error { id, error } => {
                let matched = match id.as_deref() {
                    Some(id) => self.pending.resolve(id, Err(BridgeError::Remote(error.clone()))).await,
                    None => false,
                };
                if !matched {
                    tracing::warn!(?id, "Relay reported error: {}", error);
                }
            }
        }
    }

    /// 同步交给处理器（保持到达顺序），只把等待结果与回发 response 放进独立任务
    fn dispatch_call(self: &Arc<Self>, handler: Option<Arc<dyn CallHandler>>, id: String, tool: String, params: Value) {
        let run: CallFuture = match handler {
            None => {
                tracing::warn!(tool = %tool, "No call handler registered");
                async { Err("no call handler registered".to_string()) }.boxed()
            }
            Some(handler) => {
                let name = tool.clone();
                match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(name, params))) {
                    Ok(run) => run,
                    Err(_) => {
                        tracing::error!(tool = %tool, "Call handler panicked");
                        async { Err(BridgeError::HandlerPanicked.to_string()) }.boxed()
                    }
                }
            }
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let response = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(data)) => Envelope::success(id, data),
                Ok(Err(message)) => Envelope::failure(id, message),
                Err(_) => {
                    tracing::error!(tool = %tool, "Call handler panicked");
                    Envelope::failure(id, BridgeError::HandlerPanicked.to_string())
                }
            };
            let _ = inner.send_message(&response).await;
        });
    }
}

/// 按 FIFO 发送积压消息，遇到失败即停止并把该条放回队首；返回发出条数
fn flush_queue<F>(queue: &mut OutboundQueue, mut send: F) -> usize
where
    F: FnMut(String) -> Result<(), String>,
{
    let mut flushed = 0usize;
    while let Some(frame) = queue.pop() {
        if let Err(frame) = send(frame) {
            queue.push_front(frame);
            break;
        }
        flushed += 1;
    }
    flushed
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct MockConnector {
        peers: mpsc::UnboundedSender<FrameChannel>,
        fail: AtomicBool,
        /// 连接立即被对端关闭，首帧就发送失败
        dead: AtomicBool,
        attempts: AtomicUsize,
    }

    impl MockConnector {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FrameChannel>) {
            let (peers, rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                peers,
                fail: AtomicBool::new(false),
                dead: AtomicBool::new(false),
                attempts: AtomicUsize::new(0),
            });
            (connector, rx)
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self) -> Result<FrameChannel, BridgeError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(BridgeError::Connect("connection refused".to_string()));
            }
            let (client, peer) = FrameChannel::pair();
            if self.dead.load(Ordering::SeqCst) {
                drop(peer);
            } else {
                let _ = self.peers.send(peer);
            }
            Ok(client)
        }
    }

    struct EchoHandler;

    impl CallHandler for EchoHandler {
        fn handle(&self, tool: String, params: Value) -> CallFuture {
            if tool == "panic_now" {
                panic!("handler blew up before returning");
            }
            async move {
                match tool.as_str() {
                    "echo" => Ok(params),
                    "fail" => Err("element not found".to_string()),
                    "panic" => panic!("handler blew up"),
                    _ => Err(format!("Unknown tool: {}", tool)),
                }
            }
            .boxed()
        }
    }

    /// 按调用顺序记录 n，并立即应答
    struct RecordingHandler {
        seen: Arc<parking_lot::Mutex<Vec<i64>>>,
    }

    impl CallHandler for RecordingHandler {
        fn handle(&self, _tool: String, params: Value) -> CallFuture {
            self.seen.lock().push(params["n"].as_i64().unwrap_or(-1));
            async move { Ok(params) }.boxed()
        }
    }

    fn client_with(connector: Arc<MockConnector>, config: ClientConfig) -> BridgeClient {
        BridgeClient::new(Role::Orchestrator, connector, config)
    }

    async fn recv(peer: &mut FrameChannel) -> Envelope {
        let text = peer.incoming.recv().await.expect("peer channel closed");
        Envelope::from_json(&text).expect("valid envelope")
    }

    async fn wait_queued(client: &BridgeClient, n: usize) {
        while client.queued_len().await < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_queued_request_resolves_after_connect() {
        let (connector, mut peers) = MockConnector::new();
        let client = client_with(connector, ClientConfig::default());

        let caller = client.clone();
        let request = tokio::spawn(async move {
            caller
                .send_request("navigate", json!({"url": "https://x"}), Some(Duration::from_millis(1000)))
                .await
        });
        wait_queued(&client, 1).await;

        client.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        assert_eq!(recv(&mut peer).await, Envelope::hello(Role::Orchestrator));
        let id = match recv(&mut peer).await {
            Envelope::Call { id, tool, params } => {
                assert_eq!(tool, "navigate");
                assert_eq!(params, json!({"url": "https://x"}));
                id
            }
            other => panic!("unexpected envelope: {:?}", other),
        };

        let reply = Envelope::success(id, json!({"navigated": true})).to_json().unwrap();
        peer.outgoing.send(reply).unwrap();

        assert_eq!(request.await.unwrap(), Ok(json!({"navigated": true})));
        assert_eq!(client.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response_is_discarded() {
        let (connector, mut peers) = MockConnector::new();
        let client = client_with(connector, ClientConfig::default());
        client.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let _hello = recv(&mut peer).await;

        let result = client
            .send_request("wait", json!({}), Some(Duration::from_millis(50)))
            .await;
        assert_eq!(result, Err(BridgeError::Timeout));
        assert!(result.unwrap_err().is_timeout());

        let id = match recv(&mut peer).await {
            Envelope::Call { id, .. } => id,
            other => panic!("unexpected envelope: {:?}", other),
        };
        peer.outgoing.send(Envelope::success(id, json!(1)).to_json().unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(client.pending_len().await, 0);
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_correlate_by_id() {
        let (connector, mut peers) = MockConnector::new();
        let client = client_with(connector, ClientConfig::default());
        client.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let _hello = recv(&mut peer).await;

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.send_request("echo", json!({"n": 1}), None).await })
        };
        let id1 = match recv(&mut peer).await {
            Envelope::Call { id, .. } => id,
            other => panic!("unexpected envelope: {:?}", other),
        };
        let second = {
            let client = client.clone();
            tokio::spawn(async move { client.send_request("echo", json!({"n": 2}), None).await })
        };
        let id2 = match recv(&mut peer).await {
            Envelope::Call { id, .. } => id,
            other => panic!("unexpected envelope: {:?}", other),
        };

        peer.outgoing.send(Envelope::failure(id2, "stale element").to_json().unwrap()).unwrap();
        peer.outgoing.send(Envelope::success(id1, json!("one")).to_json().unwrap()).unwrap();

        assert_eq!(first.await.unwrap(), Ok(json!("one")));
        assert_eq!(
            second.await.unwrap(),
            Err(BridgeError::Remote("stale element".to_string()))
        );
    }

    #[tokio::test]
    async fn test_queue_limit_drops_oldest_and_flushes_in_order() {
        let (connector, mut peers) = MockConnector::new();
        let config = ClientConfig {
            message_queue_limit: 2,
            ..ClientConfig::default()
        };
        let client = client_with(connector, config);

        for name in ["A", "B", "C"] {
            client.send_message(&Envelope::call(name, name, json!({}))).await.unwrap();
        }
        assert_eq!(client.queued_len().await, 2);

        client.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(recv(&mut peer).await, Envelope::hello(Role::Orchestrator));
        assert_eq!(recv(&mut peer).await.id(), Some("B"));
        assert_eq!(recv(&mut peer).await.id(), Some("C"));
        assert_eq!(client.queued_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_stops_after_max_attempts() {
        let (connector, _peers) = MockConnector::new();
        connector.fail.store(true, Ordering::SeqCst);
        let config = ClientConfig {
            reconnect_interval: Duration::from_millis(100),
            max_reconnect_attempts: 3,
            ..ClientConfig::default()
        };
        let client = client_with(Arc::clone(&connector), config);

        assert!(client.connect().await.is_err());
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(client.reconnect_attempts().await, 3);
        assert_eq!(client.state().await, ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);

        connector.fail.store(false, Ordering::SeqCst);
        client.connect().await.unwrap();
        assert_eq!(client.reconnect_attempts().await, 0);
        assert!(client.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_reconnects_and_resends_hello() {
        let (connector, mut peers) = MockConnector::new();
        let config = ClientConfig {
            reconnect_interval: Duration::from_millis(100),
            ..ClientConfig::default()
        };
        let client = BridgeClient::new(Role::Executor, connector, config);
        client.connect().await.unwrap();

        let peer = peers.recv().await.unwrap();
        drop(peer);

        let mut second = peers.recv().await.unwrap();
        assert_eq!(recv(&mut second).await, Envelope::hello(Role::Executor));
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_disconnect_rejects_pending_and_keeps_queue() {
        let (connector, _peers) = MockConnector::new();
        let client = client_with(connector, ClientConfig::default());

        let caller = client.clone();
        let request = tokio::spawn(async move { caller.send_request("click", json!({}), None).await });
        wait_queued(&client, 1).await;

        client.disconnect().await;
        assert_eq!(request.await.unwrap(), Err(BridgeError::ConnectionLost));
        assert_eq!(client.queued_len().await, 1);

        let after = client.send_request("click", json!({}), None).await;
        assert_eq!(after, Err(BridgeError::ConnectionLost));
        assert_eq!(client.queued_len().await, 1);
    }

    #[tokio::test]
    async fn test_inbound_calls_produce_responses() {
        let (connector, mut peers) = MockConnector::new();
        let client = BridgeClient::new(Role::Executor, connector, ClientConfig::default());
        client.on_call(Arc::new(EchoHandler)).await;
        client.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let _hello = recv(&mut peer).await;

        peer.outgoing.send("{not json".to_string()).unwrap();
        peer.outgoing.send(Envelope::call("1", "echo", json!({"v": 1})).to_json().unwrap()).unwrap();
        assert_eq!(recv(&mut peer).await, Envelope::success("1", json!({"v": 1})));

        peer.outgoing.send(Envelope::call("2", "fail", json!({})).to_json().unwrap()).unwrap();
        assert_eq!(recv(&mut peer).await, Envelope::failure("2", "element not found"));

        peer.outgoing.send(Envelope::call("3", "panic", json!({})).to_json().unwrap()).unwrap();
        assert_eq!(recv(&mut peer).await, Envelope::failure("3", "call handler panicked"));

        peer.outgoing.send(Envelope::call("4", "panic_now", json!({})).to_json().unwrap()).unwrap();
        assert_eq!(recv(&mut peer).await, Envelope::failure("4", "call handler panicked"));

        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_call_without_handler_answers_error() {
        let (connector, mut peers) = MockConnector::new();
        let client = BridgeClient::new(Role::Executor, connector, ClientConfig::default());
        client.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let _hello = recv(&mut peer).await;

        peer.outgoing.send(Envelope::call("1", "echo", json!({})).to_json().unwrap()).unwrap();
        assert_eq!(recv(&mut peer).await, Envelope::failure("1", "no call handler registered"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_inbound_calls_reach_handler_in_arrival_order() {
        let (connector, mut peers) = MockConnector::new();
        let client = BridgeClient::new(Role::Executor, connector, ClientConfig::default());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        client
            .on_call(Arc::new(RecordingHandler {
                seen: Arc::clone(&seen),
            }))
            .await;
        client.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let _hello = recv(&mut peer).await;

        for n in 0..60 {
            let call = Envelope::call(n.to_string(), "record", json!({"n": n}));
            peer.outgoing.send(call.to_json().unwrap()).unwrap();
        }
        for _ in 0..60 {
            let _response = recv(&mut peer).await;
        }

        assert_eq!(*seen.lock(), (0..60).collect::<Vec<i64>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_leaves_no_pending_entry() {
        let (connector, mut peers) = MockConnector::new();
        let client = client_with(connector, ClientConfig::default());
        client.connect().await.unwrap();
        let _peer = peers.recv().await.unwrap();

        for _ in 0..5 {
            let outer = tokio::time::timeout(
                Duration::from_millis(10),
                client.send_request("wait", json!({}), Some(Duration::from_millis(50))),
            )
            .await;
            assert!(outer.is_err());
        }
        assert_eq!(client.pending_len().await, 5);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_error_envelope_rejects_matching_request() {
        let (connector, mut peers) = MockConnector::new();
        let client = client_with(connector, ClientConfig::default());
        client.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        let _hello = recv(&mut peer).await;

        let request = {
            let client = client.clone();
            tokio::spawn(async move { client.send_request("click", json!({}), None).await })
        };
        let id = match recv(&mut peer).await {
            Envelope::Call { id, .. } => id,
            other => panic!("unexpected envelope: {:?}", other),
        };

        let unrelated = Envelope::Error {
            id: Some("other".to_string()),
            error: "tab closed".to_string(),
        };
        peer.outgoing.send(unrelated.to_json().unwrap()).unwrap();
        let matching = Envelope::Error {
            id: Some(id),
            error: "tab closed".to_string(),
        };
        peer.outgoing.send(matching.to_json().unwrap()).unwrap();

        assert_eq!(
            request.await.unwrap(),
            Err(BridgeError::Remote("tab closed".to_string()))
        );
        assert_eq!(client.pending_len().await, 0);
        assert!(client.is_connected().await);
    }

    #[test]
    fn test_flush_stops_at_failed_send_and_requeues_it_first() {
        let mut queue = OutboundQueue::new(10);
        for frame in ["A", "B", "C", "D"] {
            queue.push(frame.to_string());
        }

        let mut sent = Vec::new();
        let flushed = flush_queue(&mut queue, |frame| {
            if frame == "C" {
                return Err(frame);
            }
            sent.push(frame);
            Ok(())
        });

        assert_eq!(flushed, 2);
        assert_eq!(sent, vec!["A".to_string(), "B".to_string()]);
        let left: Vec<&String> = queue.iter().collect();
        assert_eq!(left, vec!["C", "D"]);
    }

    #[tokio::test]
    async fn test_failed_hello_leaves_queue_untouched() {
        let (connector, _peers) = MockConnector::new();
        connector.dead.store(true, Ordering::SeqCst);
        let client = client_with(Arc::clone(&connector), ClientConfig::default());

        for name in ["A", "B"] {
            client.send_message(&Envelope::call(name, name, json!({}))).await.unwrap();
        }
        client.connect().await.unwrap();

        assert_eq!(client.queued_len().await, 2);
        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_active_reconnect_timer() {
        let (connector, _peers) = MockConnector::new();
        connector.fail.store(true, Ordering::SeqCst);
        let config = ClientConfig {
            reconnect_interval: Duration::from_millis(100),
            max_reconnect_attempts: 10,
            ..ClientConfig::default()
        };
        let client = client_with(Arc::clone(&connector), config);

        assert!(client.connect().await.is_err());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(client.state().await, ConnectionState::Reconnecting);
        let before = connector.attempts.load(Ordering::SeqCst);
        assert!(before >= 2);

        client.disconnect().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(connector.attempts.load(Ordering::SeqCst), before);
        assert_eq!(client.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hello_precedes_concurrent_sends() {
        let (connector, mut peers) = MockConnector::new();
        let client = client_with(connector, ClientConfig::default());

        let sender = {
            let client = client.clone();
            tokio::spawn(async move {
                for n in 0..200 {
                    let call = Envelope::call(n.to_string(), "noop", json!({}));
                    client.send_message(&call).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        client.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        assert_eq!(recv(&mut peer).await, Envelope::hello(Role::Orchestrator));
        sender.await.unwrap();
    }
}