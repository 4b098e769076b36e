//! HTTP 接口集成测试：直接驱动 Router，不监听端口

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use axum::Router;
    use foreman::config::AppConfig;
    use foreman::core::{build_engine, Session, Trigger};
    use foreman::events::{EventHub, EventKind, StreamEvent};
    use foreman::llm::MockLlmClient;
    use foreman::memory::HistoryStore;
    use foreman::scheduler::Scheduler;
    use foreman::server::{router, StreamBudget};
    use serde_json::{json, Value};
    use tokio::sync::Notify;
    use tower::ServiceExt;

    const BUDGET: StreamBudget = StreamBudget {
        first_event: Duration::from_secs(5),
        terminal: Duration::from_secs(10),
    };

    async fn setup(mock: MockLlmClient, budget: StreamBudget) -> (Arc<Session>, Router) {
        let config = AppConfig::default();
        let hub = EventHub::new(512, 64);
        let scheduler = Arc::new(Scheduler::in_memory(Arc::clone(&hub)));
        let engine = build_engine(&config, Arc::new(mock), &scheduler).await;
        let session = Session::new(config, HistoryStore::in_memory(), hub, scheduler, engine);
        let app = router(Arc::clone(&session), budget);
        (session, app)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, String) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn ndjson(body: &str) -> Vec<Value> {
        body.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_health_and_cors() {
        let (_session, app) = setup(MockLlmClient::new(), BUDGET).await;
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let preflight = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/chat/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(preflight.status(), StatusCode::NO_CONTENT);
        assert_eq!(preflight.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let (_, body) = call(&app, Method::GET, "/api/health", None).await;
        let health: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["busy"], false);
    }

    #[tokio::test]
    async fn test_chat_stream_emits_ordered_ndjson() {
        let (_session, app) = setup(MockLlmClient::new().reply("pong"), BUDGET).await;
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/chat/stream",
            Some(json!({ "message": "ping", "message_id": "m1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let lines = ndjson(&body);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "chunk");
        assert_eq!(lines[0]["content"], "pong");
        assert_eq!(lines[0]["seq"], 0);
        assert_eq!(lines[1]["type"], "done");
        assert_eq!(lines[1]["record_index"], 0);
        assert_eq!(lines[1]["response"], "pong");
        assert_eq!(lines[1]["seq"], 1);
        assert!(lines.iter().all(|l| l["message_id"] == "m1"));

        let (_, history) = call(&app, Method::GET, "/api/history", None).await;
        let history: Value = serde_json::from_str(&history).unwrap();
        assert_eq!(history[0]["record_index"], 0);
        assert_eq!(history[0]["messages"][0]["role"], "user");
        assert_eq!(history[0]["messages"][0]["content"], "ping");
        assert_eq!(history[0]["messages"][1]["content"], "pong");
    }

    #[tokio::test]
    async fn test_blocking_chat_returns_final_response() {
        let (_session, app) = setup(MockLlmClient::new().reply("all done"), BUDGET).await;
        let (status, body) = call(&app, Method::POST, "/api/chat", Some(json!({ "text": "status?" }))).await;
        assert_eq!(status, StatusCode::OK);
        let reply: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(reply["response"], "all done");
        assert_eq!(reply["record_index"], 0);
        assert_eq!(reply["replaced"], false);
    }

    #[tokio::test]
    async fn test_retry_conflicts_while_busy_and_404_for_missing_record() {
        let gate = Arc::new(Notify::new());
        let (session, app) = setup(MockLlmClient::new().with_gate(Arc::clone(&gate)), BUDGET).await;

        let (status, _) = call(&app, Method::POST, "/api/retry", Some(json!({ "record_index": 7 }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let handle = session
            .start_turn(Trigger::Send { text: "long task".into() }, Some("m2".into()), false)
            .await
            .unwrap();
        let (status, body) = call(&app, Method::POST, "/api/retry", Some(json!({ "record_index": 0 }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let err: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(err["error"], "busy");
        assert_eq!(err["holder"], "m2");

        let (status, _) = call(&app, Method::POST, "/api/chat/stream", Some(json!({ "message": "hi" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        gate.notify_one();
        handle.finished().await;
        assert_eq!(session.history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reserved_message_id_is_a_bad_request() {
        let (session, app) = setup(MockLlmClient::new(), BUDGET).await;
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/chat/stream",
            Some(json!({ "message": "hi", "message_id": "scheduler" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(err["error"], "bad_request");
        assert!(!session.lock().is_busy());
    }

    #[tokio::test]
    async fn test_first_event_budget_detaches_to_catchup() {
        let gate = Arc::new(Notify::new());
        let budget = StreamBudget {
            first_event: Duration::from_millis(50),
            terminal: Duration::from_secs(10),
        };
        let (_session, app) = setup(MockLlmClient::new().reply("late").with_gate(Arc::clone(&gate)), budget).await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/chat/stream",
            Some(json!({ "message": "slow", "message_id": "m1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let lines = ndjson(&body);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["type"], "detached");
        assert_eq!(lines[0]["kind"], "timeout");
        assert_eq!(lines[0]["message_id"], "m1");
        assert!(lines[0].get("seq").is_none());
        // 不是回合事件：按 StreamEvent 解析会失败，客户端据 type 区分
        assert!(serde_json::from_value::<StreamEvent>(lines[0].clone()).is_err());

        gate.notify_one();
        let mut events: Vec<StreamEvent> = Vec::new();
        for _ in 0..200 {
            let (_, body) = call(&app, Method::GET, "/api/events", None).await;
            let polled: Value = serde_json::from_str(&body).unwrap();
            events.extend(serde_json::from_value::<Vec<StreamEvent>>(polled["events"].clone()).unwrap());
            if events.iter().any(|e| e.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let done = events.iter().find(|e| e.is_terminal()).expect("turn completes in the background");
        assert_eq!(done.message_id, "m1");
        assert_eq!(
            done.kind,
            EventKind::Done {
                record_index: 0,
                response: Some("late".into()),
                replaced: false,
            }
        );
    }

    #[tokio::test]
    async fn test_edit_and_clear() {
        let (session, app) = setup(MockLlmClient::new().reply("pong"), BUDGET).await;
        call(&app, Method::POST, "/api/chat", Some(json!({ "message": "ping" }))).await;

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/history/edit",
            Some(json!({ "record_index": 0, "message_index": 1, "content": "pong, edited" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let history = session.history().await;
        assert_eq!(history[0].messages[0].content, "ping");
        assert_eq!(history[0].messages[1].content, "pong, edited");

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/history/edit",
            Some(json!({ "record_index": 4, "message_index": 0, "content": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let err: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(err["error"], "coordinates");

        let (status, _) = call(&app, Method::POST, "/api/history/clear", None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, Method::GET, "/api/history", None).await;
        assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!([]));
    }

    #[tokio::test]
    async fn test_scheduler_endpoints() {
        let (_session, app) = setup(MockLlmClient::new(), BUDGET).await;

        let (_, body) = call(&app, Method::GET, "/api/scheduler", None).await;
        let state: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(state["active"], false);

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/scheduler",
            Some(json!({ "interval_minutes": 30, "delay_minutes": 5 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let state: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(state["active"], true);
        assert_eq!(state["interval_minutes"], 30.0);
        let remaining = state["remaining_seconds"].as_f64().unwrap();
        assert!(remaining > 290.0 && remaining <= 300.0);

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/scheduler",
            Some(json!({ "interval_minutes": -1 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&app, Method::GET, "/api/events", None).await;
        let polled: Value = serde_json::from_str(&body).unwrap();
        assert!(polled["events"]
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e["type"] == "scheduler_update" && e["scheduler"]["active"] == true));

        let (_, body) = call(&app, Method::POST, "/api/scheduler/clear", None).await;
        let state: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(state["active"], false);
    }
}
