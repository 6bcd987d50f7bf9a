//! 中继消息协议定义
//!
//! 唯一的线上类型 Envelope：按 `kind` 打标签的 JSON 文本帧，每种 kind 只携带该 kind 合法的字段。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::BridgeError;

/// 连接角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// 发起调用、等待响应（中继上同一时刻只有一个）
    Orchestrator,
    /// 接收调用、产生响应（可有多个）
    Executor,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Orchestrator => write!(f, "orchestrator"),
            Role::Executor => write!(f, "executor"),
        }
    }
}

/// hello 握手确认状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HelloStatus {
    Connected,
}

/// 消息信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Envelope {
    /// 握手：客户端带 role，中继回 status
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<HelloStatus>,
    },

    /// 工具调用
    Call {
        id: String,
        tool: String,
        #[serde(default = "empty_params")]
        params: Value,
    },

    /// 调用结果；error 存在时以 error 为准
    Response {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// 协议级错误通知
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        error: String,
    },
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

impl Envelope {
    pub fn hello(role: Role) -> Self {
        Envelope::Hello {
            role: Some(role),
            status: None,
        }
    }

    pub fn hello_ack() -> Self {
        Envelope::Hello {
            role: None,
            status: Some(HelloStatus::Connected),
        }
    }

    pub fn call(id: impl Into<String>, tool: impl Into<String>, params: Value) -> Self {
        Envelope::Call {
            id: id.into(),
            tool: tool.into(),
            params,
        }
    }

    pub fn success(id: impl Into<String>, data: Value) -> Self {
        Envelope::Response {
            id: id.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Envelope::Response {
            id: id.into(),
            data: None,
            error: Some(error.into()),
        }
    }

    /// 信封 kind 名（日志用）
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Hello { .. } => "hello",
            Envelope::Call { .. } => "call",
            Envelope::Response { .. } => "response",
            Envelope::Error { .. } => "error",
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Envelope::Hello { .. } => None,
            Envelope::Call { id, .. } | Envelope::Response { id, .. } => Some(id),
            Envelope::Error { id, .. } => id.as_deref(),
        }
    }

    pub fn to_json(&self) -> Result<String, BridgeError> {
        serde_json::to_string(self).map_err(|e| BridgeError::Serialize(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// 把 response 的 data / error 折叠为结果：error 优先，data 缺失视为 null
pub fn response_outcome(data: Option<Value>, error: Option<String>) -> Result<Value, BridgeError> {
    match error {
        Some(message) => Err(BridgeError::Remote(message)),
        None => Ok(data.unwrap_or(Value::Null)),
    }
}

/// 生成请求 ID：毫秒时间戳 + 随机后缀
pub fn new_request_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", millis, &suffix[..8])
}
