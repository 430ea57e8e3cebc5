// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

use super::{epoch_millis, raw_body, str_at, string_map, InvocationAdapter};

/// Routed payload (format 2.0), sent by HTTP APIs and function URLs.
pub struct HttpApiEvent<'a> {
    event: &'a Value,
}

impl<'a> HttpApiEvent<'a> {
    pub fn new(event: &'a Value) -> Self {
        HttpApiEvent { event }
    }
}

impl InvocationAdapter for HttpApiEvent<'_> {
    fn verb(&self) -> Option<String> {
        str_at(self.event, "requestContext.http.method")
    }

    fn uri(&self) -> Option<String> {
        let path = str_at(self.event, "rawPath")
            .or_else(|| str_at(self.event, "requestContext.http.path"))?;
        match str_at(self.event, "rawQueryString") {
            Some(query) => Some(format!("{path}?{query}")),
            None => Some(path),
        }
    }

    fn ip_address(&self) -> Option<String> {
        str_at(self.event, "requestContext.http.sourceIp")
    }

    fn headers(&self) -> HashMap<String, String> {
        string_map(self.event.get("headers"))
    }

    fn body(&self) -> Option<(String, bool)> {
        raw_body(self.event)
    }

    fn time(&self) -> Option<DateTime<Utc>> {
        epoch_millis(
            self.event
                .get("requestContext")
                .and_then(|ctx| ctx.get("timeEpoch")),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> Value {
        json!({
            "version": "2.0",
            "routeKey": "$default",
            "rawPath": "/my/path",
            "rawQueryString": "parameter1=value1&parameter2=value2",
            "headers": {"content-type": "application/json"},
            "requestContext": {
                "http": {
                    "method": "POST",
                    "path": "/my/path",
                    "sourceIp": "192.0.2.1"
                },
                "timeEpoch": 1_583_348_638_390_i64
            },
            "body": "{\"operationName\":\"GetPost\"}",
            "isBase64Encoded": false
        })
    }

    #[test]
    fn test_reads_routed_fields() {
        let event = event();
        let adapter = HttpApiEvent::new(&event);
        assert_eq!(adapter.verb().as_deref(), Some("POST"));
        assert_eq!(
            adapter.uri().as_deref(),
            Some("/my/path?parameter1=value1&parameter2=value2")
        );
        assert_eq!(adapter.ip_address().as_deref(), Some("192.0.2.1"));
        assert_eq!(adapter.time().unwrap().timestamp_millis(), 1_583_348_638_390);
        assert_eq!(
            adapter.body(),
            Some(("{\"operationName\":\"GetPost\"}".to_string(), false))
        );
    }

    #[test]
    fn test_empty_query_string_is_omitted() {
        let mut event = event();
        event["rawQueryString"] = json!("");
        assert_eq!(HttpApiEvent::new(&event).uri().as_deref(), Some("/my/path"));
    }

    #[test]
    fn test_missing_method_yields_none() {
        let event = json!({"requestContext": {}, "headers": {}});
        let adapter = HttpApiEvent::new(&event);
        assert!(adapter.verb().is_none());
        assert!(adapter.uri().is_none());
        assert!(adapter.time().is_none());
    }
}
