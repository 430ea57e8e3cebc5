// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Invocation shapes understood by the middleware.
//!
//! API Gateway and load balancer proxy integrations deliver the HTTP request as a JSON event.
//! Two layouts exist: the legacy proxy payload (format 1.0) with explicit `httpMethod`/`path`
//! fields, and the routed payload (format 2.0) with a nested `requestContext.http` block plus
//! `rawPath`/`rawQueryString`. Each layout is read through [`InvocationAdapter`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

mod http_v2;
mod proxy_v1;

pub use http_v2::HttpApiEvent;
pub use proxy_v1::ProxyEvent;

/// Runtime context delivered alongside each invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LambdaContext {
    pub aws_request_id: String,
    pub function_name: String,
    pub function_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<CognitoIdentity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CognitoIdentity {
    pub cognito_identity_id: Option<String>,
    pub cognito_identity_pool_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFormat {
    /// Payload format 1.0: REST APIs and load balancers.
    ProxyV1,
    /// Payload format 2.0: HTTP APIs and function URLs.
    HttpV2,
}

/// Read-only view over one raw invocation event.
pub trait InvocationAdapter {
    fn verb(&self) -> Option<String>;
    fn uri(&self) -> Option<String>;
    fn ip_address(&self) -> Option<String>;
    fn headers(&self) -> HashMap<String, String>;
    /// Raw body and whether the platform marked it as base64 encoded.
    fn body(&self) -> Option<(String, bool)>;
    fn time(&self) -> Option<DateTime<Utc>>;
}

/// Picks the payload format of an event.
///
/// An explicit `version` tag wins. Without it, a top-level `httpMethod` implies the legacy
/// layout and anything else is read as the routed layout.
pub fn detect_format(event: &Value) -> EventFormat {
    match event.get("version").and_then(Value::as_str) {
        Some("1.0") => return EventFormat::ProxyV1,
        Some("2.0") => return EventFormat::HttpV2,
        _ => {}
    }
    if event.get("httpMethod").is_some_and(|m| !m.is_null()) {
        EventFormat::ProxyV1
    } else {
        EventFormat::HttpV2
    }
}

/// Returns true when the event is an HTTP trigger this crate can normalize: it needs either
/// a legacy verb field or a request context, and a header map.
pub fn is_supported(event: &Value) -> bool {
    let has_verb = event.get("httpMethod").is_some_and(|m| !m.is_null());
    let has_context = event.get("requestContext").is_some_and(Value::is_object);
    let has_headers = event.get("headers").is_some_and(Value::is_object);
    (has_verb || has_context) && has_headers
}

/// Builds the adapter matching the detected format.
pub fn adapter_for(event: &Value) -> Box<dyn InvocationAdapter + '_> {
    match detect_format(event) {
        EventFormat::ProxyV1 => Box::new(ProxyEvent::new(event)),
        EventFormat::HttpV2 => Box::new(HttpApiEvent::new(event)),
    }
}

/// Copies a JSON object of scalar values into an owned header map. Non-string values are
/// stringified, nulls are dropped.
pub(crate) fn string_map(value: Option<&Value>) -> HashMap<String, String> {
    let Some(Value::Object(map)) = value else {
        return HashMap::new();
    };
    map.iter()
        .filter_map(|(k, v)| match v {
            Value::Null => None,
            Value::String(s) => Some((k.clone(), s.clone())),
            other => Some((k.clone(), other.to_string())),
        })
        .collect()
}

pub(crate) fn epoch_millis(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let millis = value?.as_i64()?;
    Utc.timestamp_millis_opt(millis).single()
}

pub(crate) fn raw_body(event: &Value) -> Option<(String, bool)> {
    let body = match event.get("body")? {
        Value::Null => return None,
        Value::String(s) if s.is_empty() => return None,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let is_base64 = event
        .get("isBase64Encoded")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Some((body, is_base64))
}

/// Looks up a dotted path such as `requestContext.identity.sourceIp` and returns it as a
/// string when present.
pub(crate) fn str_at(value: &Value, path: &str) -> Option<String> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    match current {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
