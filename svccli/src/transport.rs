//! Sending a built request to the service and translating failures.
//!
//! [`Transport`] is the seam between the engine and the wire. The engine
//! only ever sees JSON responses or a [`ServiceError`]; [`HttpTransport`]
//! speaks the two protocols service models can declare.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::{Map, Value};

use crate::builder::RequestEnvelope;
use crate::cancel::StopSignal;
use crate::error::{Error, ServiceError};
use crate::model::{Location, OperationDescriptor, Protocol, ServiceModel, URI_LABEL_RE};

/// One call: which service, which operation, what payload.
#[derive(Debug, Clone, Copy)]
pub struct ServiceCall<'a> {
    pub service: &'a ServiceModel,
    pub operation: &'a OperationDescriptor,
    pub envelope: &'a RequestEnvelope,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, call: &ServiceCall<'_>) -> Result<Value, ServiceError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, call: &ServiceCall<'_>) -> Result<Value, ServiceError> {
        (**self).send(call).await
    }
}

/// Connection settings shared by every call made through one client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub region: String,
    /// Replaces the model's endpoint template when set.
    pub endpoint_url: Option<String>,
    /// Extra `Key: Value` headers, e.g. for a signing proxy.
    pub headers: Vec<String>,
    pub conn_timeout_secs: Option<f64>,
    pub request_timeout_secs: Option<f64>,
    pub user_agent: String,
}

impl ClientConfig {
    #[must_use]
    pub fn new(region: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            endpoint_url: None,
            headers: Vec::new(),
            conn_timeout_secs: None,
            request_timeout_secs: None,
            user_agent: user_agent.into(),
        }
    }

    #[must_use]
    pub fn endpoint_for(&self, service: &ServiceModel) -> String {
        self.endpoint_url
            .clone()
            .unwrap_or_else(|| service.endpoint_for(&self.region))
    }
}

/// A request ready to hand to `reqwest`.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Value>,
}

/// JSON-over-HTTP transport. The underlying client (and its connection
/// pool) is shared by all calls.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    config: ClientConfig,
    extra_headers: HeaderMap,
}

impl HttpTransport {
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let mut builder = Client::builder().user_agent(config.user_agent.clone());
        if let Some(secs) = config.conn_timeout_secs {
            builder = builder.connect_timeout(timeout_duration("connection", secs)?);
        }
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(timeout_duration("request", secs)?);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        let extra_headers = parse_headers(&config.headers)?;
        Ok(Self {
            client,
            config,
            extra_headers,
        })
    }

    /// Work out method, URL, headers and body for `call` without sending it.
    pub fn prepare(&self, call: &ServiceCall<'_>) -> Result<PreparedRequest, ServiceError> {
        let endpoint = self.config.endpoint_for(call.service);
        let op = call.operation;
        let request_err = |reason: String| ServiceError::Request {
            operation: op.name.clone(),
            reason,
        };
        let mut url = Url::parse(&endpoint)
            .map_err(|e| request_err(format!("invalid endpoint '{endpoint}': {e}")))?;
        let mut headers = self.extra_headers.clone();

        let prepared = match call.service.protocol {
            Protocol::Json => {
                let prefix = call
                    .service
                    .target_prefix
                    .as_deref()
                    .unwrap_or(&call.service.id);
                let target = HeaderValue::from_str(&format!("{prefix}.{}", op.name))
                    .map_err(|e| request_err(e.to_string()))?;
                headers.insert(HeaderName::from_static("x-amz-target"), target);
                headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/x-amz-json-1.0"),
                );
                let method = op
                    .http
                    .as_ref()
                    .and_then(|h| Method::from_bytes(h.method.to_ascii_uppercase().as_bytes()).ok())
                    .unwrap_or(Method::POST);
                if let Some(http) = &op.http {
                    append_path(&mut url, &http.uri, &Map::new()).map_err(request_err)?;
                }
                PreparedRequest {
                    method,
                    url,
                    headers,
                    body: Some(Value::Object(call.envelope.payload.clone())),
                }
            }
            Protocol::RestJson => {
                let http = op
                    .http
                    .as_ref()
                    .ok_or_else(|| request_err("operation has no http binding".to_string()))?;
                let method = Method::from_bytes(http.method.to_ascii_uppercase().as_bytes())
                    .map_err(|e| request_err(e.to_string()))?;
                let mut body = call.envelope.payload.clone();
                let mut labels = Map::new();
                let mut query: Vec<(String, String)> = Vec::new();

                let input = op.input.as_deref().unwrap_or_default();
                for member in call.service.members(input) {
                    if member.location == Location::Body {
                        continue;
                    }
                    let Some(value) = body.remove(&member.name) else {
                        continue;
                    };
                    let key = member.wire_location_name().to_string();
                    match member.location {
                        Location::Uri => {
                            labels.insert(member.name.clone(), value);
                        }
                        Location::Query => match value {
                            Value::Array(items) => {
                                query.extend(items.iter().map(|v| (key.clone(), scalar_text(v))));
                            }
                            other => query.push((key, scalar_text(&other))),
                        },
                        Location::Header => {
                            let name = HeaderName::from_bytes(key.as_bytes())
                                .map_err(|e| request_err(e.to_string()))?;
                            let value = HeaderValue::from_str(&scalar_text(&value))
                                .map_err(|e| request_err(e.to_string()))?;
                            headers.insert(name, value);
                        }
                        Location::Body => {}
                    }
                }

                append_path(&mut url, &http.uri, &labels).map_err(request_err)?;
                if !query.is_empty() {
                    url.query_pairs_mut().extend_pairs(query);
                }
                let sends_body = !body.is_empty()
                    || matches!(method, Method::POST | Method::PUT | Method::PATCH);
                if sends_body {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                PreparedRequest {
                    method,
                    url,
                    headers,
                    body: sends_body.then(|| Value::Object(body)),
                }
            }
        };
        Ok(prepared)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, call: &ServiceCall<'_>) -> Result<Value, ServiceError> {
        let prepared = self.prepare(call)?;
        let endpoint = prepared.url.to_string();
        tracing::debug!(
            operation = %call.operation.name,
            method = %prepared.method,
            url = %endpoint,
            "sending request"
        );

        let mut req = self
            .client
            .request(prepared.method, prepared.url)
            .headers(prepared.headers);
        if let Some(body) = &prepared.body {
            req = req.body(body.to_string());
        }

        let started = Instant::now();
        let resp = req
            .send()
            .await
            .map_err(|e| translate_send_error(&endpoint, e))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let text = resp.text().await.map_err(|e| ServiceError::Transport {
            endpoint: endpoint.clone(),
            source: Box::new(e),
        })?;
        tracing::debug!(
            operation = %call.operation.name,
            status = status.as_u16(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "received response"
        );

        if !status.is_success() {
            return Err(api_error(status, &headers, &text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_json::from_str(&text).map_err(|e| ServiceError::MalformedResponse {
            operation: call.operation.name.clone(),
            reason: e.to_string(),
        })
    }
}

/// Send `call`, giving up as soon as `stop` fires.
///
/// The transport future is dropped on cancellation, which aborts the
/// in-flight request; no response is produced.
pub async fn invoke<T: Transport + ?Sized>(
    transport: &T,
    call: &ServiceCall<'_>,
    stop: &mut StopSignal,
) -> Result<Value, Error> {
    if stop.is_stopped() {
        return Err(Error::Cancelled);
    }
    tokio::select! {
        biased;
        () = stop.stopped() => {
            tracing::info!(operation = %call.operation.name, "request cancelled");
            Err(Error::Cancelled)
        }
        res = transport.send(call) => res.map_err(Error::from),
    }
}

/// Append the uri template's path segments to `url`, substituting labels.
/// Each segment is percent-encoded.
fn append_path(url: &mut Url, template: &str, labels: &Map<String, Value>) -> Result<(), String> {
    let (path_part, query_part) = template.split_once('?').unwrap_or((template, ""));
    let mut segments = Vec::new();
    for seg in path_part.split('/').filter(|s| !s.is_empty()) {
        let mut missing = None;
        let resolved = URI_LABEL_RE.replace_all(seg, |caps: &regex::Captures| {
            let label = &caps[1];
            match labels.get(label) {
                Some(v) => scalar_text(v),
                None => {
                    missing = Some(label.to_string());
                    String::new()
                }
            }
        });
        if let Some(label) = missing {
            return Err(format!("no value for uri label '{label}'"));
        }
        segments.push(resolved.into_owned());
    }
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|()| "endpoint cannot carry a path".to_string())?;
        path.pop_if_empty();
        path.extend(segments.iter().map(String::as_str));
    }
    if !query_part.is_empty() {
        let pairs: Vec<(String, String)> = query_part
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| {
                let (k, v) = p.split_once('=').unwrap_or((p, ""));
                (k.to_string(), v.to_string())
            })
            .collect();
        url.query_pairs_mut().extend_pairs(pairs);
    }
    Ok(())
}

fn timeout_duration(what: &str, secs: f64) -> Result<Duration, Error> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::Config(format!("invalid {what} timeout {secs}: {e}")))
}

fn scalar_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_headers(raw_headers: &[String]) -> Result<HeaderMap, Error> {
    let mut map = HeaderMap::new();
    for h in raw_headers {
        let (name, value) = h
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("invalid header format, expected 'Key: Value', got: {h}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| Error::Config(format!("invalid header name: {}", name.trim())))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| Error::Config(format!("invalid header value for {name}")))?;
        map.append(name, value);
    }
    Ok(map)
}

fn translate_send_error(endpoint: &str, err: reqwest::Error) -> ServiceError {
    if err.is_connect() && is_name_resolution(&err) {
        tracing::debug!(endpoint = %endpoint, error = %err, "name resolution failed");
        ServiceError::NameResolution {
            endpoint: endpoint.to_string(),
            source: Box::new(err),
        }
    } else {
        ServiceError::Transport {
            endpoint: endpoint.to_string(),
            source: Box::new(err),
        }
    }
}

/// Walk the source chain looking for a resolver failure.
fn is_name_resolution(err: &(dyn std::error::Error + 'static)) -> bool {
    const MARKERS: [&str; 5] = [
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "no such host",
        "nodename nor servname",
    ];
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        let text = e.to_string().to_ascii_lowercase();
        if MARKERS.iter().any(|m| text.contains(m)) {
            return true;
        }
        current = e.source();
    }
    false
}

fn api_error(status: StatusCode, headers: &HeaderMap, text: &str) -> ServiceError {
    let body: Value = serde_json::from_str(text).unwrap_or(Value::Null);
    let header_code = headers
        .get("x-amzn-errortype")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(':').next().unwrap_or(s).to_string());
    let body_code = ["__type", "code", "Code"]
        .iter()
        .find_map(|k| body.get(*k).and_then(Value::as_str))
        .map(|s| s.rsplit('#').next().unwrap_or(s).to_string());
    let code = header_code
        .or(body_code)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("HttpError").replace(' ', ""));
    let message = ["message", "Message"]
        .iter()
        .find_map(|k| body.get(*k).and_then(Value::as_str))
        .map_or_else(|| text.trim().to_string(), str::to_string);
    let request_id = headers
        .get("x-amzn-requestid")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ServiceError::Api {
        status: status.as_u16(),
        code,
        message,
        request_id,
    }
}
