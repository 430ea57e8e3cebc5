// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wraps a Lambda handler with governance, telemetry capture and delivery.
//!
//! One invocation goes through: snapshot refresh, optional cold-start wait for rules,
//! governance check, handler (skipped when blocked), header decoration, normalization,
//! masking, identification, validation, sampling and finally the batch buffer or a direct
//! submission. Nothing in the telemetry path can change what the caller gets back, except
//! a deliberate block.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batcher::BatchBuffer;
use crate::config::MiddlewareConfig;
use crate::entity::{CompanyProfile, UserProfile};
use crate::error::{ConfigError, DeliveryError, HandlerError, TelemetryError};
use crate::event::{LogRecord, BLOCKED_BY_HEADER, TRANSACTION_ID_HEADER};
use crate::governance::{self, Decision};
use crate::hooks::{Hooks, Identity};
use crate::http::build_client;
use crate::invocation::{self, LambdaContext};
use crate::normalizer::{self, NormalizeOptions, Outcome};
use crate::outgoing::{Interceptor, Recorder};
use crate::remote_config::{ConfigManager, HttpRemoteConfig, RemoteConfigService, RulesManager};
use crate::sampling::SamplingGate;
use crate::submission::{EventSubmitter, HttpEventSubmitter, SubmitResponse};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;
pub type DeferredHandlerFn = Arc<dyn Fn(Value, LambdaContext) -> HandlerFuture + Send + Sync>;
pub type CallbackHandlerFn = Arc<dyn Fn(Value, LambdaContext, Completion) + Send + Sync>;

/// Completion signal handed to callback-style handlers.
pub struct Completion {
    tx: oneshot::Sender<Result<Value, HandlerError>>,
}

impl Completion {
    pub fn complete(self, result: Result<Value, HandlerError>) {
        // the receiver only goes away when the invocation future was dropped
        let _ = self.tx.send(result);
    }

    pub fn succeed(self, value: Value) {
        self.complete(Ok(value));
    }

    pub fn fail(self, error: HandlerError) {
        self.complete(Err(error));
    }
}

/// The wrapped business handler, in either completion style.
#[derive(Clone)]
pub enum Handler {
    /// Returns a future resolving to the response.
    Deferred(DeferredHandlerFn),
    /// Reports its response through a [`Completion`].
    Callback(CallbackHandlerFn),
}

impl Handler {
    pub fn deferred<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, LambdaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        Self::Deferred(Arc::new(move |event, context| Box::pin(f(event, context))))
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(Value, LambdaContext, Completion) + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(f))
    }

    /// Both styles resolve into one future.
    fn invoke(&self, event: Value, context: LambdaContext) -> HandlerFuture {
        match self {
            Self::Deferred(f) => f(event, context),
            Self::Callback(f) => {
                let (tx, rx) = oneshot::channel();
                f(event, context, Completion { tx });
                Box::pin(async move {
                    rx.await.unwrap_or_else(|_| {
                        Err("handler dropped its completion without responding".into())
                    })
                })
            }
        }
    }
}

/// Everything after normalization, shared with the outgoing recorder and the batch buffer.
struct Pipeline {
    hooks: Hooks,
    log_body: bool,
    batching: bool,
    sampling: SamplingGate,
    config: Arc<ConfigManager>,
    submitter: Arc<dyn EventSubmitter + Send + Sync>,
    buffer: Arc<BatchBuffer>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Applies sampling and sets the weight. `None` when the record is not sent.
    fn sample(&self, mut record: LogRecord) -> Option<LogRecord> {
        match self
            .sampling
            .decide(record.user_id.as_deref(), record.company_id.as_deref())
        {
            Some(weight) => {
                record.weight = weight;
                Some(record)
            }
            None => {
                debug!("record for {} skipped by sampling", record.request.uri);
                None
            }
        }
    }

    async fn deliver(&self, record: LogRecord) {
        let Some(record) = self.sample(record) else {
            return;
        };
        if self.batching {
            self.buffer.add(record);
        } else {
            let result = self.submitter.submit(&record).await;
            self.complete(result, std::slice::from_ref(&record));
        }
    }

    fn complete(&self, result: Result<SubmitResponse, DeliveryError>, records: &[LogRecord]) {
        let result = match result {
            Ok(response) => {
                debug!("delivered {} records", records.len());
                self.config
                    .try_update_hash(response.config_etag.as_deref());
                Ok(())
            }
            Err(e) => {
                error!("Failed to deliver {} records: {e}", records.len());
                Err(e)
            }
        };
        if let Some(callback) = &self.hooks.callback {
            callback(&result, records);
        }
    }

    /// Runs `task` in the background and keeps its handle so `drain` can wait for it.
    #[allow(clippy::expect_used)]
    fn spawn_tracked<F>(&self, label: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, dropping {label}");
            return;
        };
        let handle = runtime.spawn(task);
        let mut in_flight = self.in_flight.lock().expect("lock poisoned");
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
    }

    fn send_batch(self: &Arc<Self>, records: Vec<LogRecord>) {
        let pipeline = Arc::clone(self);
        self.spawn_tracked("batch", async move {
            let result = pipeline.submitter.submit_batch(&records).await;
            pipeline.complete(result, &records);
        });
    }

    fn record_outgoing(self: &Arc<Self>, mut record: LogRecord) {
        if !self.log_body {
            strip_bodies(&mut record);
        }
        let record = (self.hooks.mask_content)(record);
        if let Err(e) = record.validate() {
            warn!("dropping outgoing record: {e}");
            return;
        }
        if self.batching {
            if let Some(record) = self.sample(record) {
                self.buffer.add(record);
            }
        } else {
            let pipeline = Arc::clone(self);
            self.spawn_tracked("outgoing record", async move {
                pipeline.deliver(record).await;
            });
        }
    }

    #[allow(clippy::expect_used)]
    async fn drain(&self) {
        let handles = std::mem::take(&mut *self.in_flight.lock().expect("lock poisoned"));
        for handle in handles {
            if let Err(e) = handle.await {
                error!("delivery task failed: {e}");
            }
        }
    }
}

fn strip_bodies(record: &mut LogRecord) {
    record.request.body = None;
    record.request.transfer_encoding = None;
    record.response.body = None;
    record.response.transfer_encoding = None;
}

/// A handler wrapped with telemetry.
pub struct TelemetryMiddleware {
    handler: Handler,
    pipeline: Arc<Pipeline>,
    rules: Arc<RulesManager>,
    governance_wait: Option<Duration>,
    interceptor: Arc<Interceptor>,
    ingestion_host: Option<String>,
}

impl TelemetryMiddleware {
    /// Wraps `handler` with HTTP collaborators built from `config`. The process-wide batch
    /// buffer is reconfigured, not replaced, so wrapping again keeps pending records.
    pub fn new(
        config: MiddlewareConfig,
        hooks: Hooks,
        handler: Handler,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = build_client(config.https_proxy.as_deref(), config.request_timeout)
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        let submitter = Arc::new(HttpEventSubmitter::new(
            client.clone(),
            &config.base_uri,
            &config.application_id,
        ));
        let remote_config = Arc::new(HttpRemoteConfig::new(
            client,
            &config.base_uri,
            &config.application_id,
        ));
        Ok(Self::with_services(
            &config,
            hooks,
            handler,
            submitter,
            remote_config,
            BatchBuffer::global(),
        ))
    }

    /// Wraps `handler` with the given collaborators.
    pub fn with_services(
        config: &MiddlewareConfig,
        hooks: Hooks,
        handler: Handler,
        submitter: Arc<dyn EventSubmitter + Send + Sync>,
        remote_config: Arc<dyn RemoteConfigService + Send + Sync>,
        buffer: Arc<BatchBuffer>,
    ) -> Self {
        let config_manager = Arc::new(ConfigManager::new(Arc::clone(&remote_config)));
        let rules = Arc::new(RulesManager::new(remote_config));
        let pipeline = Arc::new(Pipeline {
            hooks,
            log_body: config.log_body,
            batching: !config.disable_batching,
            sampling: SamplingGate::new(Arc::clone(&config_manager)),
            config: config_manager,
            submitter,
            buffer,
            in_flight: Mutex::new(Vec::new()),
        });

        if pipeline.batching {
            let flush_target = Arc::clone(&pipeline);
            pipeline.buffer.configure(
                Arc::new(move |records| flush_target.send_batch(records)),
                config.batch_size,
                config.batch_max_time,
            );
        }

        TelemetryMiddleware {
            handler,
            pipeline,
            rules,
            governance_wait: config.governance_wait_for_rules,
            interceptor: Interceptor::global(),
            ingestion_host: url::Url::parse(&config.base_uri)
                .ok()
                .and_then(|url| url.host_str().map(str::to_string)),
        }
    }

    /// Routes outgoing capture through `interceptor` instead of the process-wide one.
    pub fn with_interceptor(mut self, interceptor: Arc<Interceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    /// Runs one invocation. The handler's own error is returned unchanged.
    pub async fn handle(
        &self,
        event: Value,
        context: LambdaContext,
    ) -> Result<Value, HandlerError> {
        let transaction_id = Uuid::new_v4().to_string();
        self.pipeline.config.try_refresh();
        self.rules.try_refresh();

        if let Some(wait) = self.governance_wait {
            if !self.rules.wait_until_loaded(wait).await {
                debug!("governance rules not loaded after {} ms", wait.as_millis());
            }
        }

        let identity = OnceCell::new();
        let decision = self.govern(&event, &context, &identity).await;

        let mut result = match &decision {
            Some(Decision::Block {
                status,
                headers,
                body,
                rule_id,
            }) => {
                info!("request blocked by governance rule {rule_id}");
                Ok(blocked_response(*status, headers, body.as_ref(), rule_id))
            }
            _ => self.handler.invoke(event.clone(), context.clone()).await,
        };

        let overrides = decision.as_ref().map(Decision::headers);
        if let Ok(value) = result.as_mut() {
            decorate_response(value, overrides, &transaction_id);
        }

        let outcome = match &result {
            Ok(value) => Outcome::from_value(value),
            Err(e) => {
                debug!("handler failed: {e}");
                Outcome::Failed
            }
        };
        self.log_event(&event, &context, outcome, overrides, &identity)
            .await;
        result
    }

    async fn identify<'a>(
        &self,
        event: &Value,
        context: &LambdaContext,
        identity: &'a OnceCell<Identity>,
    ) -> &'a Identity {
        identity
            .get_or_init(|| self.pipeline.hooks.identify(event, context))
            .await
    }

    async fn govern(
        &self,
        event: &Value,
        context: &LambdaContext,
        identity: &OnceCell<Identity>,
    ) -> Option<Decision> {
        if !self.rules.has_rules() {
            return None;
        }
        let request = normalizer::governance_request(event)?;
        let identity = self.identify(event, context, identity).await;
        Some(governance::evaluate(
            &request,
            identity.user_id.as_deref(),
            identity.company_id.as_deref(),
            &self.rules.snapshot(),
        ))
    }

    async fn log_event(
        &self,
        event: &Value,
        context: &LambdaContext,
        outcome: Outcome,
        overrides: Option<&HashMap<String, String>>,
        identity: &OnceCell<Identity>,
    ) {
        let hooks = &self.pipeline.hooks;
        if !invocation::is_supported(event) {
            debug!("not an API Gateway or load balancer event, skipping telemetry");
            return;
        }
        if (hooks.skip)(event, context) {
            debug!("skip hook matched, no telemetry for this invocation");
            return;
        }

        let options = NormalizeOptions {
            log_body: self.pipeline.log_body,
            api_version: (hooks.get_api_version)(event, context),
            metadata: (hooks.get_metadata)(event, context),
        };
        let mut record = match normalizer::normalize(event, outcome, &options) {
            Ok(record) => record,
            Err(e) => {
                debug!("skipping telemetry: {e}");
                return;
            }
        };
        // implicit results never carry the overrides, the record still reports them
        for (name, value) in overrides.into_iter().flatten() {
            record.response.headers.insert(name.clone(), value.clone());
        }

        let mut record = (hooks.mask_content)(record);
        let identity = self.identify(event, context, identity).await;
        record.user_id.clone_from(&identity.user_id);
        record.company_id.clone_from(&identity.company_id);
        record.session_token = (hooks.get_session_token)(event, context);

        if let Err(e) = record.validate() {
            warn!("dropping record: {e}");
            return;
        }
        self.pipeline.deliver(record).await;
    }

    /// Starts recording calls made through [`crate::outgoing::CaptureLayer`]. Calling it
    /// again only points the recorder at this middleware. Returns whether this call
    /// installed the interceptor.
    pub fn start_capture_outgoing(&self) -> bool {
        if let Some(host) = &self.ingestion_host {
            self.interceptor.exclude_host(host);
        }
        let pipeline = Arc::clone(&self.pipeline);
        let recorder: Recorder = Arc::new(move |record| pipeline.record_outgoing(record));
        self.interceptor.install(recorder)
    }

    /// Hands pending records to the submitter and waits for in-flight deliveries.
    pub async fn flush(&self) {
        self.pipeline.buffer.flush();
        self.pipeline.drain().await;
    }

    pub async fn update_user(&self, user: &UserProfile) -> Result<(), TelemetryError> {
        user.validate()?;
        self.pipeline.submitter.update_user(user).await?;
        debug!("updated user {}", user.user_id);
        Ok(())
    }

    /// Every profile is validated before anything is sent.
    pub async fn update_users_batch(&self, users: &[UserProfile]) -> Result<(), TelemetryError> {
        for user in users {
            user.validate()?;
        }
        if users.is_empty() {
            return Ok(());
        }
        self.pipeline.submitter.update_users_batch(users).await?;
        debug!("updated {} users", users.len());
        Ok(())
    }

    pub async fn update_company(&self, company: &CompanyProfile) -> Result<(), TelemetryError> {
        company.validate()?;
        self.pipeline.submitter.update_company(company).await?;
        debug!("updated company {}", company.company_id);
        Ok(())
    }

    pub async fn update_companies_batch(
        &self,
        companies: &[CompanyProfile],
    ) -> Result<(), TelemetryError> {
        for company in companies {
            company.validate()?;
        }
        if companies.is_empty() {
            return Ok(());
        }
        self.pipeline
            .submitter
            .update_companies_batch(companies)
            .await?;
        debug!("updated {} companies", companies.len());
        Ok(())
    }
}

fn blocked_response(
    status: u16,
    headers: &HashMap<String, String>,
    body: Option<&Value>,
    rule_id: &str,
) -> Value {
    let mut response_headers: Map<String, Value> = headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    response_headers.insert(BLOCKED_BY_HEADER.to_string(), Value::String(rule_id.into()));
    json!({
        "isBase64Encoded": false,
        "statusCode": status,
        "headers": response_headers,
        "body": body.map(Value::to_string),
    })
}

/// Adds governance headers and the transaction id to an explicit proxy response. Implicit
/// results are left alone since the platform builds their response.
fn decorate_response(
    value: &mut Value,
    overrides: Option<&HashMap<String, String>>,
    transaction_id: &str,
) {
    let Some(object) = value.as_object_mut() else {
        return;
    };
    if object.get("statusCode").map_or(true, Value::is_null) {
        return;
    }
    let headers = object
        .entry("headers")
        .or_insert_with(|| Value::Object(Map::new()));
    if !headers.is_object() {
        *headers = Value::Object(Map::new());
    }
    if let Value::Object(headers) = headers {
        for (name, value) in overrides.into_iter().flatten() {
            headers.insert(name.clone(), Value::String(value.clone()));
        }
        headers.insert(
            TRANSACTION_ID_HEADER.to_string(),
            Value::String(transaction_id.to_string()),
        );
    }
}
