// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capture of outbound HTTP calls.
//!
//! Outbound traffic is recorded by routing it through [`CaptureLayer`], a tower layer that
//! wraps any `http::Request<Bytes>` service. [`ReqwestTransport`] adapts a `reqwest::Client`
//! into such a service. Nothing is recorded until [`Interceptor::install`] has been called;
//! installing again only swaps the recorder, so a re-initialized middleware never counts a
//! call twice.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use http::HeaderMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::debug;

use crate::error::TransportError;
use crate::event::{
    Direction, LogRecord, RequestRecord, ResponseRecord, TransferEncoding, INDETERMINATE_STATUS,
};
use crate::normalizer::encode_bytes;

pub type Recorder = Arc<dyn Fn(LogRecord) + Send + Sync>;

static GLOBAL_INTERCEPTOR: OnceLock<Arc<Interceptor>> = OnceLock::new();

/// Request extension that keeps a call out of telemetry.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipCapture;

#[derive(Default)]
pub struct Interceptor {
    installed: AtomicBool,
    recorder: RwLock<Option<Recorder>>,
    excluded_hosts: RwLock<Vec<String>>,
}

impl Interceptor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_INTERCEPTOR.get_or_init(Interceptor::new))
    }

    /// Starts recording. Returns false when already installed, in which case only the
    /// recorder is replaced.
    #[allow(clippy::expect_used)]
    pub fn install(&self, recorder: Recorder) -> bool {
        *self.recorder.write().expect("lock poisoned") = Some(recorder);
        let first = !self.installed.swap(true, Ordering::AcqRel);
        if first {
            debug!("outgoing capture installed");
        } else {
            debug!("outgoing capture already installed, recorder updated");
        }
        first
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Calls to `host` are never recorded. Used for the ingestion endpoint.
    #[allow(clippy::expect_used)]
    pub fn exclude_host(&self, host: &str) {
        let mut hosts = self.excluded_hosts.write().expect("lock poisoned");
        if !hosts.iter().any(|h| h.eq_ignore_ascii_case(host)) {
            hosts.push(host.to_string());
        }
    }

    #[allow(clippy::expect_used)]
    fn should_capture<B>(&self, request: &http::Request<B>) -> bool {
        if !self.is_installed() || request.extensions().get::<SkipCapture>().is_some() {
            return false;
        }
        match request.uri().host() {
            Some(host) => !self
                .excluded_hosts
                .read()
                .expect("lock poisoned")
                .iter()
                .any(|h| h.eq_ignore_ascii_case(host)),
            None => true,
        }
    }

    #[allow(clippy::expect_used)]
    fn record(&self, record: LogRecord) {
        let recorder = self.recorder.read().expect("lock poisoned").clone();
        if let Some(recorder) = recorder {
            recorder(record);
        }
    }
}

#[derive(Clone)]
pub struct CaptureLayer {
    interceptor: Arc<Interceptor>,
}

impl CaptureLayer {
    /// Layer bound to the process-wide interceptor.
    pub fn new() -> Self {
        Self::with_interceptor(Interceptor::global())
    }

    pub fn with_interceptor(interceptor: Arc<Interceptor>) -> Self {
        CaptureLayer { interceptor }
    }
}

impl Default for CaptureLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for CaptureLayer {
    type Service = CaptureService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CaptureService {
            inner,
            interceptor: Arc::clone(&self.interceptor),
        }
    }
}

#[derive(Clone)]
pub struct CaptureService<S> {
    inner: S,
    interceptor: Arc<Interceptor>,
}

impl<S> Service<http::Request<Bytes>> for CaptureService<S>
where
    S: Service<http::Request<Bytes>, Response = http::Response<Bytes>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = http::Response<Bytes>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<Bytes>) -> Self::Future {
        let inner = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, inner);

        if !self.interceptor.should_capture(&req) {
            return Box::pin(async move { inner.call(req).await });
        }

        let interceptor = Arc::clone(&self.interceptor);
        let request = OutgoingRequest::from_request(&req);
        Box::pin(async move {
            let result = inner.call(req).await;
            interceptor.record(request.into_record(result.as_ref().ok(), Utc::now()));
            result
        })
    }
}

/// What is kept of an outbound request while the call is in flight.
struct OutgoingRequest {
    time: DateTime<Utc>,
    verb: String,
    uri: String,
    headers: HashMap<String, String>,
    body: Bytes,
}

impl OutgoingRequest {
    fn from_request(req: &http::Request<Bytes>) -> Self {
        OutgoingRequest {
            time: Utc::now(),
            verb: req.method().to_string(),
            uri: req.uri().to_string(),
            headers: header_map(req.headers()),
            body: req.body().clone(),
        }
    }

    fn into_record(
        self,
        response: Option<&http::Response<Bytes>>,
        end: DateTime<Utc>,
    ) -> LogRecord {
        let (body, transfer_encoding) = split_body(&self.body);
        let request = RequestRecord {
            time: self.time,
            verb: self.verb,
            uri: self.uri,
            ip_address: None,
            headers: self.headers,
            body,
            transfer_encoding,
            api_version: None,
        };

        let (status, headers, (body, transfer_encoding)) = match response {
            Some(response) => (
                response.status().as_u16(),
                header_map(response.headers()),
                split_body(response.body()),
            ),
            None => (INDETERMINATE_STATUS, HashMap::new(), (None, None)),
        };
        let response = ResponseRecord {
            time: end.max(request.time),
            status,
            headers,
            body,
            transfer_encoding,
            blocked_by: None,
        };
        LogRecord::new(request, response, Direction::Outgoing)
    }
}

fn split_body(raw: &Bytes) -> (Option<Value>, Option<TransferEncoding>) {
    if raw.is_empty() {
        return (None, None);
    }
    let (body, encoding) = encode_bytes(raw);
    (Some(body), Some(encoding))
}

/// Owned copy of a header map; repeated headers are joined with ", ".
fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}

/// `reqwest::Client` as a tower service over `http` types, so it can sit under
/// [`CaptureLayer`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        ReqwestTransport { client }
    }
}

impl Service<http::Request<Bytes>> for ReqwestTransport {
    type Response = http::Response<Bytes>;
    type Error = TransportError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Bytes>) -> Self::Future {
        let client = self.client.clone();
        Box::pin(async move {
            let request = reqwest::Request::try_from(req)?;
            let response = client.execute(request).await?;

            let mut builder = http::Response::builder()
                .status(response.status())
                .version(response.version());
            if let Some(headers) = builder.headers_mut() {
                *headers = response.headers().clone();
            }
            let body = response.bytes().await?;
            Ok(builder.body(body)?)
        })
    }
}
