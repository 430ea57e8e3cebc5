// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! User and company profiles pushed to the ingestion API outside of any invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TelemetryError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        UserProfile {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.user_id.trim().is_empty() {
            return Err(TelemetryError::Validation(
                "a user id is required to update a user".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyProfile {
    pub company_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl CompanyProfile {
    pub fn new(company_id: impl Into<String>) -> Self {
        CompanyProfile {
            company_id: company_id.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.company_id.trim().is_empty() {
            return Err(TelemetryError::Validation(
                "a company id is required to update a company".into(),
            ));
        }
        Ok(())
    }
}
