// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Runs one API Gateway event through an instrumented handler.
//!
//! The event is read from stdin (a sample GET is used when stdin is empty). The handler
//! fetches `UPSTREAM_URL` through the capture layer, so both the inbound invocation and
//! the outbound call are reported.

use bytes::Bytes;
use serde_json::{json, Value};
use std::env;
use std::io::Read;
use tower::{Layer, ServiceExt};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use moesif_lambda::outgoing::{CaptureLayer, ReqwestTransport};
use moesif_lambda::{
    Handler, HandlerError, Hooks, LambdaContext, MiddlewareConfig, TelemetryMiddleware,
};

const DEFAULT_UPSTREAM_URL: &str = "https://jsonplaceholder.typicode.com/posts/1";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("MOESIF_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match MiddlewareConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return;
        }
    };

    let upstream_url = env::var("UPSTREAM_URL").unwrap_or(DEFAULT_UPSTREAM_URL.to_string());
    let upstream = CaptureLayer::new().layer(ReqwestTransport::default());
    let handler = Handler::deferred(move |_event, _context| {
        let upstream = upstream.clone();
        let upstream_url = upstream_url.clone();
        async move {
            let request = http::Request::builder()
                .uri(upstream_url)
                .header("accept", "application/json")
                .body(Bytes::new())?;
            let response = upstream.oneshot(request).await?;
            Ok::<Value, HandlerError>(json!({
                "statusCode": response.status().as_u16(),
                "headers": {"Content-Type": "application/json"},
                "body": String::from_utf8_lossy(response.body()),
            }))
        }
    });

    let middleware = match TelemetryMiddleware::new(config, Hooks::default(), handler) {
        Ok(middleware) => middleware,
        Err(e) => {
            error!("Failed to create middleware: {e}");
            return;
        }
    };
    middleware.start_capture_outgoing();

    let context = LambdaContext {
        aws_request_id: "local-invocation".to_string(),
        function_name: "moesif-lambda-example".to_string(),
        function_version: "$LATEST".to_string(),
        identity: None,
    };
    match middleware.handle(read_event(), context).await {
        Ok(result) => info!("handler returned {result}"),
        Err(e) => error!("handler failed: {e}"),
    }

    middleware.flush().await;
}

fn read_event() -> Value {
    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        debug!("could not read event from stdin: {e}");
    }
    if input.trim().is_empty() {
        return sample_event();
    }
    serde_json::from_str(&input).unwrap_or_else(|e| {
        error!("stdin is not a JSON event ({e}), using the sample event");
        sample_event()
    })
}

fn sample_event() -> Value {
    json!({
        "version": "2.0",
        "rawPath": "/posts/1",
        "rawQueryString": "",
        "headers": {"accept": "application/json", "user-agent": "curl/8.4.0"},
        "requestContext": {
            "http": {"method": "GET", "path": "/posts/1", "sourceIp": "127.0.0.1"},
            "timeEpoch": 1700000000000_i64
        }
    })
}
