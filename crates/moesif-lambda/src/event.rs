// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Canonical log record shared by inbound invocations and captured outbound calls.
//!
//! Field names follow the ingestion API's JSON event model (camelCase), so a record can be
//! serialized as-is into a submission payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::TelemetryError;

/// Response header naming the governance rule that blocked a request.
pub const BLOCKED_BY_HEADER: &str = "X-Moesif-Blocked-By";
/// Response header carrying the correlation id of the delivered record.
pub const TRANSACTION_ID_HEADER: &str = "X-Moesif-Transaction-Id";
/// Status recorded when the handler failed before producing a response.
pub const INDETERMINATE_STATUS: u16 = 599;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferEncoding {
    /// Body is stored as structured JSON.
    #[default]
    #[serde(rename = "json")]
    None,
    Base64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub time: DateTime<Utc>,
    pub verb: String,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_encoding: Option<TransferEncoding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub time: DateTime<Utc>,
    pub status: u16,
    pub headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_encoding: Option<TransferEncoding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub request: RequestRecord,
    pub response: ResponseRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub direction: Direction,
    pub weight: u32,
}

impl LogRecord {
    pub fn new(request: RequestRecord, response: ResponseRecord, direction: Direction) -> Self {
        LogRecord {
            request,
            response,
            user_id: None,
            company_id: None,
            session_token: None,
            metadata: None,
            direction,
            weight: 1,
        }
    }

    /// Checks the fields the ingestion API requires. A masking hook is free to rewrite the
    /// record, so this runs after masking and before the record leaves the process.
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.request.verb.trim().is_empty() {
            return Err(TelemetryError::Validation(
                "request verb is required, check that mask_content does not remove it".into(),
            ));
        }
        if self.request.uri.trim().is_empty() {
            return Err(TelemetryError::Validation(
                "request uri is required, check that mask_content does not remove it".into(),
            ));
        }
        if self.response.time < self.request.time {
            return Err(TelemetryError::Validation(
                "response time must not precede request time".into(),
            ));
        }
        if self.weight == 0 {
            return Err(TelemetryError::Validation("weight must be at least 1".into()));
        }
        Ok(())
    }
}
