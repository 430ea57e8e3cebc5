// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, error};

use crate::entity::{CompanyProfile, UserProfile};
use crate::error::DeliveryError;
use crate::event::LogRecord;
use crate::http::APPLICATION_ID_HEADER;
use crate::remote_config::CONFIG_ETAG_HEADER;

const EVENT_PATH: &str = "/v1/events";
const BATCH_PATH: &str = "/v1/events/batch";
const USER_PATH: &str = "/v1/users";
const USER_BATCH_PATH: &str = "/v1/users/batch";
const COMPANY_PATH: &str = "/v1/companies";
const COMPANY_BATCH_PATH: &str = "/v1/companies/batch";

/// What the ingestion API echoed back for an accepted submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitResponse {
    pub config_etag: Option<String>,
}

/// Event Submission Service: ships finished records to the ingestion API.
#[async_trait]
pub trait EventSubmitter {
    async fn submit(&self, record: &LogRecord) -> Result<SubmitResponse, DeliveryError>;
    async fn submit_batch(&self, records: &[LogRecord]) -> Result<SubmitResponse, DeliveryError>;

    async fn update_user(&self, user: &UserProfile) -> Result<SubmitResponse, DeliveryError>;
    async fn update_users_batch(
        &self,
        users: &[UserProfile],
    ) -> Result<SubmitResponse, DeliveryError>;
    async fn update_company(
        &self,
        company: &CompanyProfile,
    ) -> Result<SubmitResponse, DeliveryError>;
    async fn update_companies_batch(
        &self,
        companies: &[CompanyProfile],
    ) -> Result<SubmitResponse, DeliveryError>;
}

fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, DeliveryError> {
    serde_json::to_vec(payload).map_err(|e| DeliveryError::Payload(e.to_string()))
}

#[derive(Debug, Clone)]
pub struct HttpEventSubmitter {
    client: reqwest::Client,
    base_uri: String,
    application_id: String,
}

impl HttpEventSubmitter {
    pub fn new(client: reqwest::Client, base_uri: &str, application_id: &str) -> Self {
        HttpEventSubmitter {
            client,
            base_uri: base_uri.trim_end_matches('/').to_string(),
            application_id: application_id.to_string(),
        }
    }

    async fn post(&self, path: &str, body: Vec<u8>) -> Result<SubmitResponse, DeliveryError> {
        let url = format!("{}{path}", self.base_uri);
        let time = Instant::now();
        let response = self
            .client
            .post(&url)
            .header(APPLICATION_ID_HEADER, &self.application_id)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!("Submission | network error posting to {url}: {e:?}");
                DeliveryError::Transport(e.to_string())
            })?;

        let status = response.status();
        let config_etag = response
            .headers()
            .get(CONFIG_ETAG_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if status.is_success() {
            debug!(
                "Submission | accepted by {url} in {} ms",
                time.elapsed().as_millis()
            );
            Ok(SubmitResponse { config_etag })
        } else {
            let body = response.text().await.unwrap_or_default();
            error!("Submission | request failed with status {status}: {body:?}");
            Err(DeliveryError::Destination {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl EventSubmitter for HttpEventSubmitter {
    async fn submit(&self, record: &LogRecord) -> Result<SubmitResponse, DeliveryError> {
        self.post(EVENT_PATH, encode(record)?).await
    }

    async fn submit_batch(&self, records: &[LogRecord]) -> Result<SubmitResponse, DeliveryError> {
        self.post(BATCH_PATH, encode(records)?).await
    }

    async fn update_user(&self, user: &UserProfile) -> Result<SubmitResponse, DeliveryError> {
        self.post(USER_PATH, encode(user)?).await
    }

    async fn update_users_batch(
        &self,
        users: &[UserProfile],
    ) -> Result<SubmitResponse, DeliveryError> {
        self.post(USER_BATCH_PATH, encode(users)?).await
    }

    async fn update_company(
        &self,
        company: &CompanyProfile,
    ) -> Result<SubmitResponse, DeliveryError> {
        self.post(COMPANY_PATH, encode(company)?).await
    }

    async fn update_companies_batch(
        &self,
        companies: &[CompanyProfile],
    ) -> Result<SubmitResponse, DeliveryError> {
        self.post(COMPANY_BATCH_PATH, encode(companies)?).await
    }
}
