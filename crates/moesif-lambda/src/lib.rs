// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! API telemetry for AWS Lambda handlers.
//!
//! [`TelemetryMiddleware`] wraps an API Gateway or load balancer handler. Before the
//! handler runs it evaluates governance rules and may block the request; afterwards it
//! normalizes the invocation into a [`LogRecord`], samples it and hands it to a
//! process-wide [`BatchBuffer`] (or submits it directly). Outbound calls made through
//! [`outgoing::CaptureLayer`] join the same pipeline once
//! [`TelemetryMiddleware::start_capture_outgoing`] was called.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batcher;
pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod governance;
pub mod hooks;
pub mod http;
pub mod invocation;
pub mod middleware;
pub mod normalizer;
pub mod outgoing;
pub mod remote_config;
pub mod sampling;
pub mod submission;

pub use batcher::BatchBuffer;
pub use config::MiddlewareConfig;
pub use entity::{CompanyProfile, UserProfile};
pub use error::{ConfigError, DeliveryError, HandlerError, TelemetryError};
pub use event::{Direction, LogRecord, TransferEncoding};
pub use hooks::{Hooks, Identifier};
pub use invocation::LambdaContext;
pub use middleware::{Completion, Handler, TelemetryMiddleware};
pub use normalizer::{normalize, NormalizeOptions, Outcome};
