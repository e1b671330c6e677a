//! End-to-end flows through the manager and the HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tempfile::TempDir;
use tower::util::ServiceExt;

use crucible_host::config::HostConfig;
use crucible_host::http::{router, with_deadline, AppState};
use crucible_host::manager::ScriptManager;
use crucible_host::metrics::Metrics;
use crucible_host::wire::{host_to_any, AnyValue};
use crucible_lang::{HostValue, PoolConfig, TypeRegistry, VmPool};
use crucible_store::KvStore;

fn manager_in(dir: &TempDir, pool_limit: usize) -> Arc<ScriptManager> {
    let store = KvStore::open(dir.path()).unwrap();
    let pool = VmPool::new(
        PoolConfig { limit: pool_limit },
        TypeRegistry::with_defaults(),
    );
    Arc::new(ScriptManager::new(store, pool, Arc::new(Metrics::default())))
}

fn test_state(manager: Arc<ScriptManager>) -> AppState {
    AppState::new(manager, &HostConfig::default())
}

async fn call(
    state: AppState,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let app = router(state);
    let request = match body {
        Some(json) => Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&json).unwrap()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn add_and_execute_sums_arguments() {
    // S1: store the adder, call it with [2, 3], expect [int 5].
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir, 4);
    let state = test_state(manager);

    let (status, body) = call(
        state.clone(),
        "POST",
        "/v1/scripts",
        Some(serde_json::json!({
            "script": "this.returns(this.argv(1) + this.argv(2))"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = body["id"].as_str().unwrap().to_string();
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

    let (status, body) = call(
        state,
        "POST",
        &format!("/v1/scripts/{id}/execute"),
        Some(serde_json::json!({
            "args": [
                {"type": "int32", "value": 2},
                {"type": "int32", "value": 3}
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["args"],
        serde_json::json!([{"type": "int32", "value": 5}])
    );
}

#[tokio::test]
async fn find_and_prefix_disambiguation() {
    // S2: find by prefix; a second script sharing the prefix makes execution
    // by that prefix ambiguous.
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir, 4);

    let id = manager.new_key();
    manager.set(&id, "this.returns(1)").unwrap();
    let prefix = &id[..2];

    let found = manager.ids_by_prefix(prefix, 5);
    assert!(found.contains(&id));

    let out = manager.execute(prefix, vec![]).await.unwrap();
    assert_eq!(out, vec![HostValue::Int(1)]);

    // Craft a sibling key under the same two-character prefix.
    let mut sibling = id.clone();
    let bump = |c: char| if c == 'f' { '0' } else { char::from_digit(c.to_digit(16).unwrap() + 1, 16).unwrap() };
    let tail_char = sibling.pop().unwrap();
    sibling.push(bump(tail_char));
    manager.set(&sibling, "this.returns(2)").unwrap();

    let err = manager.execute(prefix, vec![]).await.unwrap_err();
    assert_eq!(err.code(), "multiple_matches");
}

#[tokio::test]
async fn decimal_sum_is_exact_over_the_wire() {
    // S3: no binary-float rounding.
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir, 4);
    let out = manager
        .run_once(
            r#"
            local a = decimal.new("1.1")
            local b = decimal.new("2.2")
            this.returns((a + b):string())
            "#,
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(out, vec![HostValue::Str("3.3".into())]);
    assert_eq!(
        host_to_any(&out[0]),
        AnyValue::String("3.3".into())
    );
}

#[tokio::test]
async fn timestamp_formatting() {
    // S4.
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir, 4);
    let out = manager
        .run_once(
            r#"
            local t = time.new("2024-01-02T03:04:05Z")
            this.returns(t:format("2006-01-02"))
            "#,
            vec![],
        )
        .await
        .unwrap();
    assert_eq!(out, vec![HostValue::Str("2024-01-02".into())]);
}

#[tokio::test]
async fn delete_then_execute_is_not_found() {
    // S5.
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir, 4);
    let state = test_state(manager.clone());

    let id = manager.new_key();
    manager.set(&id, "this.returns(1)").unwrap();

    let (status, _) = call(state.clone(), "DELETE", &format!("/v1/scripts/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(
        state,
        "POST",
        &format!("/v1/scripts/{id}/execute"),
        Some(serde_json::json!({"args": []})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "script_not_found");
}

#[tokio::test]
async fn scripts_survive_restart() {
    // S6: re-open the same data directory and execute by the same id.
    let dir = TempDir::new().unwrap();
    let id;
    {
        let manager = manager_in(&dir, 2);
        id = manager.new_key();
        manager
            .set(&id, "this.returns(this.argv(1) * 10)")
            .unwrap();
    }
    let manager = manager_in(&dir, 2);
    let out = manager.execute(&id, vec![HostValue::Int(7)]).await.unwrap();
    assert_eq!(out, vec![HostValue::Int(70)]);
    // The prefix index was rebuilt too.
    let out = manager.execute(&id[..8], vec![HostValue::Int(7)]).await.unwrap();
    assert_eq!(out, vec![HostValue::Int(70)]);
}

#[tokio::test]
async fn update_changes_behaviour_in_place() {
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir, 4);
    let state = test_state(manager.clone());

    let id = manager.new_key();
    manager.set(&id, "this.returns(1)").unwrap();

    let (status, _) = call(
        state.clone(),
        "PUT",
        &format!("/v1/scripts/{}", &id[..10]),
        Some(serde_json::json!({"script": "this.returns(2)"})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let out = manager.execute(&id, vec![]).await.unwrap();
    assert_eq!(out, vec![HostValue::Int(2)]);
    assert_eq!(manager.script_count(), 1);
}

#[tokio::test]
async fn update_of_missing_script_is_not_found() {
    let dir = TempDir::new().unwrap();
    let state = test_state(manager_in(&dir, 2));
    let (status, body) = call(
        state,
        "PUT",
        "/v1/scripts/00000000000000000000000000000000",
        Some(serde_json::json!({"script": "this.returns(1)"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "script_not_found");
}

#[tokio::test]
async fn run_once_round_trips_wire_values() {
    let dir = TempDir::new().unwrap();
    let state = test_state(manager_in(&dir, 2));
    let (status, body) = call(
        state,
        "POST",
        "/v1/run",
        Some(serde_json::json!({
            "script": "this.returns(this.argv(1), {tag = \"x\"}, nil)",
            "args": [{"type": "string", "value": "echo"}]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["args"],
        serde_json::json!([
            {"type": "string", "value": "echo"},
            {"type": "struct", "value": {"tag": {"type": "string", "value": "x"}}},
            {"type": "null"}
        ])
    );
}

#[tokio::test]
async fn compile_errors_are_client_errors() {
    let dir = TempDir::new().unwrap();
    let state = test_state(manager_in(&dir, 2));
    let (status, body) = call(
        state,
        "POST",
        "/v1/scripts",
        Some(serde_json::json!({"script": "local = nope"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "compile_error");
}

#[tokio::test]
async fn empty_script_is_invalid_param() {
    let dir = TempDir::new().unwrap();
    let state = test_state(manager_in(&dir, 2));
    let (status, body) = call(
        state,
        "POST",
        "/v1/scripts",
        Some(serde_json::json!({"script": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_param");
}

#[tokio::test]
async fn slow_scripts_hit_the_deadline_and_later_calls_succeed() {
    // Testable property 6: a deadline produces context_timeout and does not
    // wedge the service.
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir, 2);

    let slow = manager.clone();
    let err = with_deadline(Duration::from_millis(100), "slow script", async move {
        slow.run_once(
            "local i = 0\nwhile i < 100000000 do i = i + 1 end\nthis.returns(i)",
            vec![],
        )
        .await
    })
    .await
    .unwrap_err();
    assert_eq!(err.code(), "context_timeout");

    let out = manager.run_once("this.returns(1)", vec![]).await.unwrap();
    assert_eq!(out, vec![HostValue::Int(1)]);
}

#[tokio::test]
async fn pool_cap_suspends_excess_executions() {
    // Testable property 5 at the manager level with limit 2.
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir, 2);
    let mut handles = Vec::new();
    for i in 0..6i64 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .run_once(
                    "local n = 0\nfor i = 1, 200000 do n = n + 1 end\nthis.returns(this.argv(1))",
                    vec![HostValue::Int(i)],
                )
                .await
                .unwrap()
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), vec![HostValue::Int(i as i64)]);
    }
}

#[tokio::test]
async fn find_uses_default_limit() {
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir, 2);
    for _ in 0..15 {
        let id = manager.new_key();
        manager.set(&id, "this.returns(1)").unwrap();
    }
    let state = test_state(manager);
    let (status, body) = call(state, "GET", "/v1/scripts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"].as_array().unwrap().len(), 10);
}
