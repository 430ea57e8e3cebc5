// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Error raised by the wrapped handler. It is recorded as telemetry and handed back to the
/// caller untouched.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced while turning an invocation into a deliverable record.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invocation is not an API Gateway or load balancer proxy event")]
    UnsupportedInvocationShape,

    #[error("invalid log record: {0}")]
    Validation(String),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Errors returned by the Event Submission Service client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to serialize events: {0}")]
    Payload(String),

    #[error("failed to reach ingestion endpoint: {0}")]
    Transport(String),

    #[error("ingestion endpoint responded with status {status}: {body}")]
    Destination { status: u16, body: String },
}

/// Errors returned by the Remote Configuration Service client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("failed to reach configuration endpoint: {0}")]
    Transport(String),

    #[error("configuration endpoint responded with status {0}")]
    Status(u16),

    #[error("failed to decode configuration payload: {0}")]
    Decode(String),
}

/// Errors from the reqwest-backed outbound transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("outbound request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid outbound response: {0}")]
    Response(#[from] http::Error),
}

/// Errors that can occur while building the middleware configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("an application id is required, set MOESIF_APPLICATION_ID")]
    MissingApplicationId,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to build http client: {0}")]
    HttpClient(String),
}
