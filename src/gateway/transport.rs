//! 传输层：能收发文本帧的全双工通道
//!
//! BridgeClient 只依赖 Connector trait；默认实现 WsConnector 基于 tokio-tungstenite，
//! 与 Hub 一样拆分读写两半，写半由独立任务从 mpsc 通道取帧发送。

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::core::BridgeError;

/// 一条已建立的连接：outgoing 发帧，incoming 收帧；incoming 结束即连接关闭
pub struct FrameChannel {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

impl FrameChannel {
    /// 内存通道对，返回 (客户端侧, 对端侧)
    pub fn pair() -> (FrameChannel, FrameChannel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            FrameChannel {
                outgoing: a_tx,
                incoming: b_rx,
            },
            FrameChannel {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

/// 建立连接的能力（每次调用产生一条新连接）
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<FrameChannel, BridgeError>;
}

/// WebSocket 连接器
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<FrameChannel, BridgeError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_tx.send(WsMessage::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("WebSocket receive error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(FrameChannel {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}