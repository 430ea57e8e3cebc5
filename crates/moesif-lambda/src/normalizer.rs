// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns a raw invocation event and the handler's outcome into a [`LogRecord`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::TelemetryError;
use crate::event::{
    Direction, LogRecord, RequestRecord, ResponseRecord, TransferEncoding, BLOCKED_BY_HEADER,
    INDETERMINATE_STATUS,
};
use crate::governance::GovernanceRequest;
use crate::invocation::{self, string_map};

const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Response produced by a handler that set its status explicitly.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HandlerResponse {
    pub status: Option<u16>,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub is_base64_encoded: bool,
}

/// What the wrapped handler ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The handler returned a proxy response object carrying `statusCode`.
    Explicit(HandlerResponse),
    /// The handler returned any other value; the platform answers on its behalf.
    Implicit(Value),
    /// The handler failed before producing a response.
    Failed,
}

impl Outcome {
    pub fn from_value(value: &Value) -> Outcome {
        let Some(object) = value.as_object() else {
            return Outcome::Implicit(value.clone());
        };
        let Some(status) = object.get("statusCode").filter(|s| !s.is_null()) else {
            return Outcome::Implicit(value.clone());
        };

        let mut headers = string_map(object.get("headers"));
        if let Some(Value::Object(multi)) = object.get("multiValueHeaders") {
            for (name, values) in multi {
                if headers.contains_key(name) {
                    continue;
                }
                if let Value::Array(values) = values {
                    let joined = values
                        .iter()
                        .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
                        .collect::<Vec<_>>()
                        .join(", ");
                    headers.insert(name.clone(), joined);
                }
            }
        }

        Outcome::Explicit(HandlerResponse {
            status: parse_status(status),
            headers,
            body: object.get("body").filter(|b| !b.is_null()).cloned(),
            is_base64_encoded: object
                .get("isBase64Encoded")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    /// Resolves implicit outcomes into the response the platform would send.
    ///
    /// `null`, strings and objects become a 200 with a JSON content type and the value
    /// serialized as the body. Anything else is passed through with no known status.
    pub fn translate(self) -> HandlerResponse {
        match self {
            Outcome::Explicit(response) => response,
            Outcome::Implicit(value) => match value {
                Value::Null | Value::String(_) | Value::Object(_) => HandlerResponse {
                    status: Some(200),
                    headers: HashMap::from([(
                        "content-type".to_string(),
                        DEFAULT_CONTENT_TYPE.to_string(),
                    )]),
                    body: (!value.is_null()).then(|| Value::String(value.to_string())),
                    is_base64_encoded: false,
                },
                other => HandlerResponse {
                    status: None,
                    body: Some(other),
                    ..Default::default()
                },
            },
            Outcome::Failed => HandlerResponse::default(),
        }
    }
}

fn parse_status(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Per-record inputs computed by collaborator hooks before normalization.
#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    pub log_body: bool,
    pub api_version: Option<String>,
    pub metadata: Option<Value>,
}

/// Stores a text payload: JSON stays structured, anything else is base64 encoded. Payloads
/// the platform already marked as base64 are passed through untouched.
pub fn encode_body(raw: &str, pre_encoded: bool) -> (Value, TransferEncoding) {
    if pre_encoded {
        return (Value::String(raw.to_string()), TransferEncoding::Base64);
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(parsed) => (parsed, TransferEncoding::None),
        Err(_) => (
            Value::String(STANDARD.encode(raw.as_bytes())),
            TransferEncoding::Base64,
        ),
    }
}

/// Same as [`encode_body`] for payloads that may not be valid UTF-8.
pub fn encode_bytes(raw: &[u8]) -> (Value, TransferEncoding) {
    match std::str::from_utf8(raw) {
        Ok(text) => encode_body(text, false),
        Err(_) => (Value::String(STANDARD.encode(raw)), TransferEncoding::Base64),
    }
}

fn encode_response_body(response: &HandlerResponse) -> Option<(Value, TransferEncoding)> {
    match response.body.as_ref()? {
        Value::String(raw) if raw.is_empty() => None,
        Value::String(raw) => Some(encode_body(raw, response.is_base64_encoded)),
        structured => Some((structured.clone(), TransferEncoding::None)),
    }
}

/// Builds the canonical record for one invocation.
///
/// Returns [`TelemetryError::UnsupportedInvocationShape`] when the event is not an HTTP
/// trigger; callers skip telemetry for it.
pub fn normalize(
    event: &Value,
    outcome: Outcome,
    options: &NormalizeOptions,
) -> Result<LogRecord, TelemetryError> {
    if !invocation::is_supported(event) {
        return Err(TelemetryError::UnsupportedInvocationShape);
    }
    let adapter = invocation::adapter_for(event);
    let verb = adapter
        .verb()
        .ok_or(TelemetryError::UnsupportedInvocationShape)?;
    let uri = adapter
        .uri()
        .ok_or(TelemetryError::UnsupportedInvocationShape)?;

    let request_time = adapter.time().unwrap_or_else(Utc::now);
    let (request_body, request_encoding) = match adapter.body() {
        Some((raw, pre_encoded)) if options.log_body => {
            let (body, encoding) = encode_body(&raw, pre_encoded);
            (Some(body), Some(encoding))
        }
        _ => (None, None),
    };

    let request = RequestRecord {
        time: request_time,
        verb,
        uri,
        ip_address: adapter.ip_address(),
        headers: adapter.headers(),
        body: request_body,
        transfer_encoding: request_encoding,
        api_version: options.api_version.clone(),
    };

    let response = outcome.translate();
    let (response_body, response_encoding) = match encode_response_body(&response) {
        Some((body, encoding)) if options.log_body => (Some(body), Some(encoding)),
        _ => (None, None),
    };
    let blocked_by = response.headers.get(BLOCKED_BY_HEADER).cloned();

    let response = ResponseRecord {
        time: Utc::now().max(request_time),
        status: response.status.unwrap_or(INDETERMINATE_STATUS),
        headers: response.headers,
        body: response_body,
        transfer_encoding: response_encoding,
        blocked_by,
    };

    let mut record = LogRecord::new(request, response, Direction::Incoming);
    record.metadata = options.metadata.clone();
    Ok(record)
}

/// Extracts the request attributes governance rules are matched against.
pub fn governance_request(event: &Value) -> Option<GovernanceRequest> {
    if !invocation::is_supported(event) {
        return None;
    }
    let adapter = invocation::adapter_for(event);
    let body = adapter
        .body()
        .filter(|(_, pre_encoded)| !pre_encoded)
        .and_then(|(raw, _)| serde_json::from_str::<Value>(&raw).ok());

    let mut fields = HashMap::new();
    let mut put = |key: &str, value: Option<String>| {
        if let Some(value) = value {
            fields.insert(key.to_string(), value);
        }
    };
    put("request.verb", adapter.verb());
    put("request.ip", adapter.ip_address());
    put("request.route", adapter.uri());
    put(
        "request.body.operationName",
        body.as_ref()
            .and_then(|b| b.get("operationName"))
            .and_then(Value::as_str)
            .map(str::to_string),
    );

    Some(GovernanceRequest {
        fields,
        headers: adapter.headers(),
        body,
    })
}
