// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Functions supplied by the embedding application to enrich or filter records.
//!
//! Every hook is a pure function of the invocation. Identification may run twice per
//! invocation (once for governance, once for the final record) unless the caller memoizes
//! it, which the middleware does.

use serde_json::{json, Value};
use std::fmt::Debug;
use std::sync::Arc;
use std::{future::Future, pin::Pin};

use crate::error::DeliveryError;
use crate::event::LogRecord;
use crate::invocation::{str_at, LambdaContext};

pub type IdentifyFn = Arc<dyn Fn(&Value, &LambdaContext) -> Option<String> + Send + Sync>;
pub type DeferredIdentifyFn = Arc<
    dyn Fn(Value, LambdaContext) -> Pin<Box<dyn Future<Output = Option<String>> + Send>>
        + Send
        + Sync,
>;
pub type SessionTokenFn = Arc<dyn Fn(&Value, &LambdaContext) -> Option<String> + Send + Sync>;
pub type MetadataFn = Arc<dyn Fn(&Value, &LambdaContext) -> Option<Value> + Send + Sync>;
pub type ApiVersionFn = Arc<dyn Fn(&Value, &LambdaContext) -> Option<String> + Send + Sync>;
pub type MaskFn = Arc<dyn Fn(LogRecord) -> LogRecord + Send + Sync>;
pub type SkipFn = Arc<dyn Fn(&Value, &LambdaContext) -> bool + Send + Sync>;
pub type CompletionFn = Arc<dyn Fn(&Result<(), DeliveryError>, &[LogRecord]) + Send + Sync>;

const USER_ID_PATHS: [&str; 3] = [
    "requestContext.authorizer.principalId",
    "principalId",
    "requestContext.identity.cognitoIdentityId",
];
const USER_FALLBACK_PATHS: [&str; 2] = ["requestContext.identity.user", "user"];

/// Resolves a user or company id, either right away or through a future.
#[derive(Clone)]
pub enum Identifier {
    Sync(IdentifyFn),
    Deferred(DeferredIdentifyFn),
}

impl Identifier {
    pub fn new_sync<F>(f: F) -> Self
    where
        F: Fn(&Value, &LambdaContext) -> Option<String> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn new_deferred(resolver_fn: DeferredIdentifyFn) -> Self {
        Self::Deferred(resolver_fn)
    }

    pub async fn identify(&self, event: &Value, context: &LambdaContext) -> Option<String> {
        match self {
            Self::Sync(f) => f(event, context),
            Self::Deferred(resolver_fn) => (resolver_fn)(event.clone(), context.clone()).await,
        }
    }
}

impl Debug for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(_) => write!(f, "Identifier::Sync"),
            Self::Deferred(_) => write!(f, "Identifier::Deferred"),
        }
    }
}

/// User and company resolved for one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Identity {
    pub user_id: Option<String>,
    pub company_id: Option<String>,
}

#[derive(Clone)]
pub struct Hooks {
    pub identify_user: Identifier,
    pub identify_company: Option<Identifier>,
    pub get_session_token: SessionTokenFn,
    pub get_metadata: MetadataFn,
    pub get_api_version: ApiVersionFn,
    pub mask_content: MaskFn,
    pub skip: SkipFn,
    /// Told about every delivery attempt, success or failure.
    pub callback: Option<CompletionFn>,
}

impl Hooks {
    pub async fn identify(&self, event: &Value, context: &LambdaContext) -> Identity {
        let user_id = self.identify_user.identify(event, context).await;
        let company_id = match &self.identify_company {
            Some(identifier) => identifier.identify(event, context).await,
            None => None,
        };
        Identity {
            user_id,
            company_id,
        }
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Hooks {
            identify_user: Identifier::new_sync(default_user_id),
            identify_company: None,
            get_session_token: Arc::new(|event, _| {
                str_at(event, "requestContext.identity.apiKey")
            }),
            get_metadata: Arc::new(default_metadata),
            get_api_version: Arc::new(|_, context| {
                Some(context.function_version.clone()).filter(|v| !v.is_empty())
            }),
            mask_content: Arc::new(|record| record),
            skip: Arc::new(|_, _| false),
            callback: None,
        }
    }
}

impl Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("identify_user", &self.identify_user)
            .field("identify_company", &self.identify_company)
            .field("callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}

/// First of the authorizer principal, the Cognito identity or the IAM user.
pub fn default_user_id(event: &Value, context: &LambdaContext) -> Option<String> {
    USER_ID_PATHS
        .iter()
        .find_map(|path| str_at(event, path))
        .or_else(|| {
            context
                .identity
                .as_ref()
                .and_then(|identity| identity.cognito_identity_id.clone())
        })
        .or_else(|| USER_FALLBACK_PATHS.iter().find_map(|path| str_at(event, path)))
}

pub fn default_metadata(event: &Value, context: &LambdaContext) -> Option<Value> {
    Some(json!({
        "trace_id": context.aws_request_id,
        "function_name": context.function_name,
        "request_context": event.get("requestContext").cloned().unwrap_or(Value::Null),
    }))
}
