//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BRIDGE__*` 覆盖（双下划线表示嵌套，如 `BRIDGE__RELAY__PORT=9000`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{AdmissionPolicy, SchedulerConfig};
use crate::gateway::{ClientConfig, RelayConfig};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
}

impl AppConfig {
    /// 客户端连接的中继地址
    pub fn relay_url(&self) -> String {
        format!("ws://{}:{}", self.relay.host, self.relay.port)
    }
}

/// [relay] 段：中继监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl RelaySection {
    pub fn to_relay_config(&self) -> RelayConfig {
        RelayConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
        }
    }
}

/// [client] 段：重连、出站队列与请求超时（毫秒）
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_message_queue_limit")]
    pub message_queue_limit: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_reconnect_interval_ms() -> u64 {
    3000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_message_queue_limit() -> usize {
    100
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            message_queue_limit: default_message_queue_limit(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ClientSection {
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            message_queue_limit: self.message_queue_limit,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

/// [scheduler] 段：并发上限与准入策略（head_of_line / scan）
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_max_global")]
    pub max_global: usize,
    #[serde(default = "default_max_per_target")]
    pub max_per_target: usize,
    #[serde(default)]
    pub admission: AdmissionPolicy,
}

fn default_max_global() -> usize {
    3
}

fn default_max_per_target() -> usize {
    1
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_global: default_max_global(),
            max_per_target: default_max_per_target(),
            admission: AdmissionPolicy::default(),
        }
    }
}

impl SchedulerSection {
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_global: self.max_global.max(1),
            max_per_target: self.max_per_target.max(1),
            admission: self.admission,
        }
    }
}

/// 加载桥接配置
///
/// 依次叠加：工作目录下第一个存在的 config/default.toml（或 ../config/default.toml、default.toml），
/// 调用方给出的配置文件（不存在则跳过），以及 `BRIDGE__RELAY__PORT` 这类环境变量。
/// 任何一层缺失的键都回落到各段的 serde 默认值。
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BRIDGE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 按默认搜索路径重读配置；已建立的客户端与调度器不受影响，调用方自行决定是否重建
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
