// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

use super::{epoch_millis, raw_body, str_at, string_map, InvocationAdapter};

/// Legacy proxy payload (format 1.0), sent by REST APIs and application load balancers.
pub struct ProxyEvent<'a> {
    event: &'a Value,
}

impl<'a> ProxyEvent<'a> {
    pub fn new(event: &'a Value) -> Self {
        ProxyEvent { event }
    }

    fn query_string(&self) -> Option<String> {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        let mut appended = false;

        if let Some(Value::Object(params)) = self.event.get("multiValueQueryStringParameters") {
            for (key, values) in params {
                if let Value::Array(values) = values {
                    for value in values.iter().filter_map(Value::as_str) {
                        serializer.append_pair(key, value);
                        appended = true;
                    }
                }
            }
        } else if let Some(Value::Object(params)) = self.event.get("queryStringParameters") {
            for (key, value) in params {
                if let Some(value) = value.as_str() {
                    serializer.append_pair(key, value);
                    appended = true;
                }
            }
        }

        appended.then(|| serializer.finish())
    }
}

impl InvocationAdapter for ProxyEvent<'_> {
    fn verb(&self) -> Option<String> {
        str_at(self.event, "httpMethod")
    }

    fn uri(&self) -> Option<String> {
        let path = str_at(self.event, "path").unwrap_or_else(|| "/".to_string());
        match self.query_string() {
            Some(query) => Some(format!("{path}?{query}")),
            None => Some(path),
        }
    }

    fn ip_address(&self) -> Option<String> {
        let forwarded = self
            .headers()
            .into_iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("x-forwarded-for"))
            .and_then(|(_, value)| {
                value
                    .split(',')
                    .map(str::trim)
                    .find(|ip| !ip.is_empty())
                    .map(str::to_string)
            });
        forwarded.or_else(|| str_at(self.event, "requestContext.identity.sourceIp"))
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
                .and_then(|ctx| ctx.get("requestTimeEpoch")),
        )
    }
}
