//! 对外入口：执行端注册工具处理器，编排端发起调用
//!
//! 应用其余部分只需要两个入口：`ExecutorEndpoint::register_call_handler(name, fn)` 与
//! `OrchestratorEndpoint::invoke(tool, params, timeout)`。执行端的每个入站 call 都经过
//! TaskScheduler 限流，target_key 取自 `params.tabId`，优先级取自 `params.priority`。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;

use super::client::{BridgeClient, CallFuture, CallHandler};
use super::message::Role;
use super::transport::WsConnector;
use crate::config::AppConfig;
use crate::core::{BridgeError, TaskOptions, TaskScheduler};

pub type ToolFuture = CallFuture;
type ToolFn = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

/// 宿主提供的 executeTool(name, params)
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute_tool(&self, name: &str, params: Value) -> Result<Value, String>;
}

/// 工具注册表：按名称存储处理函数
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolFn>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: ToolFn = Arc::new(move |params| handler(params).boxed());
        self.tools.insert(name.into(), handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    fn prepare(&self, name: &str, params: Value) -> Option<ToolFuture> {
        self.tools.get(name).map(|handler| handler(params))
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute_tool(&self, name: &str, params: Value) -> Result<Value, String> {
        match self.prepare(name, params) {
            Some(run) => run.await,
            None => Err(BridgeError::UnknownTool(name.to_string()).to_string()),
        }
    }
}

/// 从 params 提取调度选项：tabId（字符串或整数）与 priority（整数）
pub fn task_options(params: &Value) -> TaskOptions {
    let target_key = match params.get("tabId") {
        Some(Value::String(tab)) => Some(tab.clone()),
        Some(Value::Number(tab)) => Some(tab.to_string()),
        _ => None,
    };
    let priority = params
        .get("priority")
        .and_then(Value::as_i64)
        .map(|p| p.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
        .unwrap_or(0);
    TaskOptions {
        target_key,
        priority,
    }
}

struct ScheduledCallHandler {
    scheduler: TaskScheduler,
    registry: Arc<RwLock<ToolRegistry>>,
    fallback: Arc<RwLock<Option<Arc<dyn ToolExecutor>>>>,
}

impl CallHandler for ScheduledCallHandler {
    /// 同步入队：schedule() 在返回前就已登记任务，入站顺序即调度器的提交顺序
    fn handle(&self, tool: String, params: Value) -> CallFuture {
        let options = task_options(&params);

        let prepared = self.registry.read().prepare(&tool, params.clone());
        let run: ToolFuture = match prepared {
            Some(run) => run,
            None => match self.fallback.read().clone() {
                Some(executor) => {
                    let name = tool.clone();
                    async move { executor.execute_tool(&name, params).await }.boxed()
                }
                None => {
                    let message = BridgeError::UnknownTool(tool).to_string();
                    return async move { Err(message) }.boxed();
                }
            },
        };

        tracing::debug!(tool = %tool, target = ?options.target_key, priority = options.priority, "Scheduling call");
        let outcome = self.scheduler.schedule(options, move || run);
        async move {
            match outcome.await {
                Ok(result) => result,
                Err(e) => Err(e.to_string()),
            }
        }
        .boxed()
    }
}

/// 执行端（浏览器侧）
pub struct ExecutorEndpoint {
    client: BridgeClient,
    scheduler: TaskScheduler,
    registry: Arc<RwLock<ToolRegistry>>,
    fallback: Arc<RwLock<Option<Arc<dyn ToolExecutor>>>>,
}

impl ExecutorEndpoint {
    /// 以给定客户端与调度器创建，并接管客户端的入站 call
    pub async fn new(client: BridgeClient, scheduler: TaskScheduler) -> Self {
        let registry = Arc::new(RwLock::new(ToolRegistry::new()));
        let fallback = Arc::new(RwLock::new(None));
        client
            .on_call(Arc::new(ScheduledCallHandler {
                scheduler: scheduler.clone(),
                registry: Arc::clone(&registry),
                fallback: Arc::clone(&fallback),
            }))
            .await;
        Self {
            client,
            scheduler,
            registry,
            fallback,
        }
    }

    /// 按配置连接中继（WebSocket）
    pub async fn from_config(config: &AppConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.relay_url()));
        let client = BridgeClient::new(Role::Executor, connector, config.client.to_client_config());
        let scheduler = TaskScheduler::new(config.scheduler.to_scheduler_config());
        Self::new(client, scheduler).await
    }

    /// 注册具名工具处理器
    pub fn register_call_handler<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.registry.write().register(name, handler);
    }

    /// 安装宿主的 executeTool；具名处理器优先
    pub fn set_tool_executor(&self, executor: Arc<dyn ToolExecutor>) {
        *self.fallback.write() = Some(executor);
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.read().tool_names()
    }

    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.client.connect().await
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    pub fn client(&self) -> &BridgeClient {
        &self.client
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }
}

/// 编排端（自动化调用方）
#[derive(Clone)]
pub struct OrchestratorEndpoint {
    client: BridgeClient,
}

impl OrchestratorEndpoint {
    pub fn new(client: BridgeClient) -> Self {
        Self { client }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.relay_url()));
        Self::new(BridgeClient::new(
            Role::Orchestrator,
            connector,
            config.client.to_client_config(),
        ))
    }

    /// 发起调用；timeout 为 None 时使用默认请求超时
    pub async fn invoke(&self, tool: &str, params: Value, timeout: Option<Duration>) -> Result<Value, BridgeError> {
        self.client.send_request(tool, params, timeout).await
    }

    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.client.connect().await
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    pub fn client(&self) -> &BridgeClient {
        &self.client
    }
}
