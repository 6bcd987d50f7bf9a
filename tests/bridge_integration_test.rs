//! 中继 + 客户端集成测试（真实回环 WebSocket）

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tab_bridge::core::{BridgeError, SchedulerConfig, TaskScheduler};
    use tab_bridge::gateway::{
        BridgeClient, ClientConfig, ConnectionState, ExecutorEndpoint, OrchestratorEndpoint,
        RelayBroker, RelayConfig, Role, WsConnector,
    };

    fn client_config() -> ClientConfig {
        ClientConfig {
            reconnect_interval: Duration::from_millis(100),
            max_reconnect_attempts: 3,
            message_queue_limit: 100,
            request_timeout: Duration::from_secs(5),
        }
    }

    async fn start_relay() -> (RelayBroker, String) {
        let broker = RelayBroker::new(RelayConfig {
            bind_addr: "127.0.0.1:0".to_string(),
        });
        let addr = broker.start().await.unwrap();
        (broker, format!("ws://{}", addr))
    }

    async fn executor(url: &str, scheduler: SchedulerConfig) -> ExecutorEndpoint {
        let client = BridgeClient::new(Role::Executor, Arc::new(WsConnector::new(url)), client_config());
        ExecutorEndpoint::new(client, TaskScheduler::new(scheduler)).await
    }

    fn orchestrator(url: &str) -> OrchestratorEndpoint {
        OrchestratorEndpoint::new(BridgeClient::new(
            Role::Orchestrator,
            Arc::new(WsConnector::new(url)),
            client_config(),
        ))
    }

    async fn wait_for_executors(broker: &RelayBroker, count: usize) {
        for _ in 0..100 {
            if broker.executor_count().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("relay never registered {} executors", count);
    }

    #[tokio::test]
    async fn test_invoke_round_trip_through_relay() {
        let (broker, url) = start_relay().await;

        let exec = executor(&url, SchedulerConfig::default()).await;
        exec.register_call_handler("getTitle", |params: Value| async move {
            Ok(json!({"title": format!("tab {}", params["tabId"])}))
        });
        exec.connect().await.unwrap();
        wait_for_executors(&broker, 1).await;

        let orch = orchestrator(&url);
        orch.connect().await.unwrap();

        let data = orch.invoke("getTitle", json!({"tabId": 7}), None).await.unwrap();
        assert_eq!(data, json!({"title": "tab 7"}));

        let err = orch.invoke("missing", json!({}), None).await.unwrap_err();
        assert_eq!(err, BridgeError::Remote("Unknown tool: missing".to_string()));

        orch.disconnect().await;
        exec.disconnect().await;
        broker.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_first_response_wins() {
        let (broker, url) = start_relay().await;

        let first = executor(&url, SchedulerConfig::default()).await;
        let second = executor(&url, SchedulerConfig::default()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        for (exec, name) in [(&first, "first"), (&second, "second")] {
            let calls = Arc::clone(&calls);
            exec.register_call_handler("whoami", move |_params: Value| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(name))
                }
            });
            exec.connect().await.unwrap();
        }
        wait_for_executors(&broker, 2).await;

        let orch = orchestrator(&url);
        orch.connect().await.unwrap();

        let data = orch.invoke("whoami", json!({}), None).await.unwrap();
        assert!(data == json!("first") || data == json!("second"));

        // 两个执行端都收到了广播；迟到的第二个响应被丢弃
        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orch.client().pending_len().await, 0);

        let again = orch.invoke("whoami", json!({}), None).await.unwrap();
        assert!(again.is_string());

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_call_without_executor_times_out() {
        let (broker, url) = start_relay().await;

        let orch = orchestrator(&url);
        orch.connect().await.unwrap();

        let err = orch
            .invoke("click", json!({"selector": "#go"}), Some(Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(orch.client().pending_len().await, 0);

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_calls_on_same_tab_are_serialized() {
        let (broker, url) = start_relay().await;

        let exec = executor(
            &url,
            SchedulerConfig {
                max_global: 3,
                max_per_target: 1,
                ..Default::default()
            },
        )
        .await;
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            exec.register_call_handler("navigate", move |params: Value| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(params["url"].clone())
                }
            });
        }
        exec.connect().await.unwrap();
        wait_for_executors(&broker, 1).await;

        let orch = orchestrator(&url);
        orch.connect().await.unwrap();

        let (a, b, c) = tokio::join!(
            orch.invoke("navigate", json!({"tabId": 1, "url": "a"}), None),
            orch.invoke("navigate", json!({"tabId": 1, "url": "b"}), None),
            orch.invoke("navigate", json!({"tabId": 1, "url": "c"}), None),
        );
        assert_eq!(a.unwrap(), json!("a"));
        assert_eq!(b.unwrap(), json!("b"));
        assert_eq!(c.unwrap(), json!("c"));
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        // 槽位在结果送出之后才释放
        for _ in 0..100 {
            if exec.scheduler().running() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(exec.scheduler().running(), 0);

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_client_reconnects_after_relay_stop() {
        let (broker, url) = start_relay().await;

        let orch = orchestrator(&url);
        orch.connect().await.unwrap();
        assert!(orch.client().is_connected().await);

        broker.stop().await;

        let mut state = orch.client().state().await;
        for _ in 0..100 {
            state = orch.client().state().await;
            if state != ConnectionState::Connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_ne!(state, ConnectionState::Connected);

        // 中继不再接受连接：请求进入出站队列并在超时后失败
        let err = orch
            .invoke("click", json!({}), Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Timeout);
        assert!(orch.client().queued_len().await >= 1);

        orch.disconnect().await;
        assert_eq!(orch.client().state().await, ConnectionState::Disconnected);
    }
}
