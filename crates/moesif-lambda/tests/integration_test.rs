// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::{Matcher, Mock, Server, ServerGuard};
use moesif_lambda::event::BLOCKED_BY_HEADER;
use moesif_lambda::http::APPLICATION_ID_HEADER;
use moesif_lambda::{
    BatchBuffer, CompanyProfile, Handler, HandlerError, Hooks, LambdaContext, MiddlewareConfig,
    TelemetryError, TelemetryMiddleware, UserProfile,
};
use serde_json::{json, Value};
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn mock_remote_config(server: &mut ServerGuard, rules: Value) -> (Mock, Mock) {
    let config = server
        .mock("GET", "/v1/config")
        .match_header(APPLICATION_ID_HEADER, "mock-app-id")
        .with_status(200)
        .with_body(r#"{"sample_rate": 100}"#)
        .create_async()
        .await;
    let rules = server
        .mock("GET", "/v1/rules")
        .with_status(200)
        .with_body(rules.to_string())
        .create_async()
        .await;
    (config, rules)
}

fn config(server: &ServerGuard, disable_batching: bool) -> MiddlewareConfig {
    MiddlewareConfig {
        base_uri: server.url(),
        disable_batching,
        governance_wait_for_rules: Some(Duration::from_secs(2)),
        ..MiddlewareConfig::new("mock-app-id")
    }
}

fn posts_event() -> Value {
    json!({
        "httpMethod": "GET",
        "path": "/posts/1",
        "headers": {},
        "requestContext": {"identity": {"sourceIp": "10.0.0.1"}}
    })
}

fn hello_handler(calls: Arc<AtomicUsize>) -> Handler {
    Handler::deferred(move |_event, _context| {
        calls.fetch_add(1, Ordering::SeqCst);
        async {
            Ok::<Value, HandlerError>(json!({
                "statusCode": 200,
                "body": "{\"key\":\"hello\"}",
                "headers": {"Content-Type": "application/json"}
            }))
        }
    })
}

#[tokio::test]
#[serial]
async fn submits_proxy_response_record() {
    let mut server = Server::new_async().await;
    let _remote = mock_remote_config(&mut server, json!([])).await;
    let events = server
        .mock("POST", "/v1/events")
        .match_header(APPLICATION_ID_HEADER, "mock-app-id")
        .match_body(Matcher::PartialJson(json!({
            "request": {"verb": "GET", "uri": "/posts/1", "ipAddress": "10.0.0.1"},
            "response": {
                "status": 200,
                "transferEncoding": "json",
                "body": {"key": "hello"}
            },
            "direction": "Incoming",
            "weight": 1
        })))
        .with_status(201)
        .create_async()
        .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let middleware = TelemetryMiddleware::new(
        config(&server, true),
        Hooks::default(),
        hello_handler(Arc::clone(&calls)),
    )
    .expect("failed to create middleware");

    let result = middleware
        .handle(posts_event(), LambdaContext::default())
        .await
        .expect("handler failed");

    assert_eq!(result["statusCode"], 200);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    events.assert_async().await;
}

#[tokio::test]
#[serial]
async fn handler_error_is_submitted_with_indeterminate_status() {
    let mut server = Server::new_async().await;
    let _remote = mock_remote_config(&mut server, json!([])).await;
    let events = server
        .mock("POST", "/v1/events")
        .match_body(Matcher::PartialJson(json!({"response": {"status": 599}})))
        .with_status(201)
        .create_async()
        .await;

    let middleware = TelemetryMiddleware::new(
        config(&server, true),
        Hooks::default(),
        Handler::deferred(|_, _| async {
            Err::<Value, HandlerError>("database unavailable".into())
        }),
    )
    .expect("failed to create middleware");

    let error = middleware
        .handle(posts_event(), LambdaContext::default())
        .await
        .expect_err("handler error must reach the caller");

    assert_eq!(error.to_string(), "database unavailable");
    events.assert_async().await;
}

#[tokio::test]
#[serial]
async fn blocking_rule_short_circuits_handler() {
    let mut server = Server::new_async().await;
    let rules = json!([{
        "_id": "block-posts",
        "type": "regex",
        "block": true,
        "regex_config": [{"conditions": [{"path": "request.route", "value": "^/posts/"}]}],
        "response": {"headers": {"X-Reason": "quota"}, "body": {"error": "quota exceeded"}}
    }]);
    let _remote = mock_remote_config(&mut server, rules).await;
    let events = server
        .mock("POST", "/v1/events")
        .match_body(Matcher::PartialJson(json!({
            "response": {"status": 403, "blockedBy": "block-posts"}
        })))
        .with_status(201)
        .create_async()
        .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let middleware = TelemetryMiddleware::new(
        config(&server, true),
        Hooks::default(),
        hello_handler(Arc::clone(&calls)),
    )
    .expect("failed to create middleware");

    let result = middleware
        .handle(posts_event(), LambdaContext::default())
        .await
        .expect("blocked requests still succeed");

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result["statusCode"], 403);
    assert_eq!(result["headers"][BLOCKED_BY_HEADER], "block-posts");
    assert_eq!(result["headers"]["X-Reason"], "quota");
    events.assert_async().await;
}

#[tokio::test]
#[serial]
async fn rewrapped_handlers_share_the_process_buffer() {
    let mut server = Server::new_async().await;
    let _remote = mock_remote_config(&mut server, json!([])).await;
    let batch = server
        .mock("POST", "/v1/events/batch")
        .match_body(Matcher::Regex(
            r#"^\[\{.*"uri":"/posts/1".*\},\{.*"uri":"/posts/1".*\}\]$"#.into(),
        ))
        .with_status(201)
        .expect(1)
        .create_async()
        .await;

    BatchBuffer::global().flush();
    let calls = Arc::new(AtomicUsize::new(0));
    let first = TelemetryMiddleware::new(
        config(&server, false),
        Hooks::default(),
        hello_handler(Arc::clone(&calls)),
    )
    .expect("failed to create middleware");
    first
        .handle(posts_event(), LambdaContext::default())
        .await
        .expect("handler failed");

    let second = TelemetryMiddleware::new(
        config(&server, false),
        Hooks::default(),
        hello_handler(Arc::clone(&calls)),
    )
    .expect("failed to create middleware");
    second
        .handle(posts_event(), LambdaContext::default())
        .await
        .expect("handler failed");

    assert_eq!(BatchBuffer::global().len(), 2);
    second.flush().await;

    assert!(BatchBuffer::global().is_empty());
    batch.assert_async().await;
}

#[tokio::test]
#[serial]
async fn ingestion_failure_does_not_change_the_response() {
    let mut server = Server::new_async().await;
    let _remote = mock_remote_config(&mut server, json!([])).await;
    let _events = server
        .mock("POST", "/v1/events")
        .with_status(500)
        .with_body("internal error")
        .create_async()
        .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let middleware = TelemetryMiddleware::new(
        config(&server, true),
        Hooks::default(),
        hello_handler(calls),
    )
    .expect("failed to create middleware");

    let result = middleware
        .handle(posts_event(), LambdaContext::default())
        .await
        .expect("handler failed");
    assert_eq!(result["statusCode"], 200);
    assert_eq!(result["body"], "{\"key\":\"hello\"}");
}

#[tokio::test]
#[serial]
async fn user_and_company_updates_reach_ingestion() {
    let mut server = Server::new_async().await;
    let users = server
        .mock("POST", "/v1/users/batch")
        .match_header(APPLICATION_ID_HEADER, "mock-app-id")
        .match_body(Matcher::PartialJson(json!([{"userId": "user-1"}])))
        .with_status(201)
        .create_async()
        .await;
    let company = server
        .mock("POST", "/v1/companies")
        .match_body(Matcher::PartialJson(json!({
            "companyId": "acme",
            "metadata": {"plan": "enterprise"}
        })))
        .with_status(201)
        .create_async()
        .await;

    let middleware = TelemetryMiddleware::new(
        config(&server, true),
        Hooks::default(),
        hello_handler(Arc::new(AtomicUsize::new(0))),
    )
    .expect("failed to create middleware");

    middleware
        .update_users_batch(&[UserProfile::new("user-1")])
        .await
        .expect("user update failed");
    let acme = CompanyProfile {
        metadata: Some(json!({"plan": "enterprise"})),
        ..CompanyProfile::new("acme")
    };
    middleware
        .update_company(&acme)
        .await
        .expect("company update failed");

    let missing = middleware.update_user(&UserProfile::default()).await;
    assert!(matches!(missing, Err(TelemetryError::Validation(_))));

    users.assert_async().await;
    company.assert_async().await;
}
