//! Request/Response Translator
//!
//! HTTP request → invocation event and context; handler result → HTTP response.
//! The event mirrors the cloud proxy-integration shape closely enough that
//! handlers written against it run unchanged.

use std::collections::BTreeMap;
use std::io::Read;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use serde::Serialize;
use serde_json::{json, Map, Value};
use smallvec::SmallVec;

use crate::errors::{json_kind, TranslationError};
use crate::overrides::{FunctionSettings, TIMEOUT_SECONDS};
use crate::runtime::InvocationPayload;

/// Shorter payloads cannot be compressed data.
pub const MIN_COMPRESSED_LEN: usize = 8;

pub const STAGE: &str = "dev";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestContext {
    request_id: String,
    stage: &'static str,
    http_method: String,
    path: String,
    resource_path: String,
    request_time_epoch: u64,
}

/// Eagerly serialized part of the event. Headers and query parameters travel
/// separately as raw pairs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct EventFields {
    resource: String,
    path: String,
    http_method: String,
    path_parameters: Option<BTreeMap<String, String>>,
    stage_variables: Option<Map<String, Value>>,
    request_context: RequestContext,
    body: Option<String>,
    is_base64_encoded: bool,
}

#[derive(Debug, Clone)]
pub struct InvocationEvent {
    fields: EventFields,
    headers: SmallVec<[(String, String); 8]>,
    query: SmallVec<[(String, String); 4]>,
}

impl InvocationEvent {
    /// `resource` is the matched endpoint in platform form (`/users/{id}`).
    pub fn from_request(
        parts: &Parts,
        body: &[u8],
        resource: &str,
        path_parameters: BTreeMap<String, String>,
        request_id: &str,
    ) -> Self {
        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let query = parts
            .uri
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        let path = parts.uri.path().to_string();
        let method = parts.method.as_str().to_string();
        Self {
            fields: EventFields {
                resource: resource.to_string(),
                path: path.clone(),
                http_method: method.clone(),
                path_parameters: (!path_parameters.is_empty()).then_some(path_parameters),
                stage_variables: None,
                request_context: RequestContext {
                    request_id: request_id.to_string(),
                    stage: STAGE,
                    http_method: method,
                    path,
                    resource_path: resource.to_string(),
                    request_time_epoch: epoch_millis(SystemTime::now()),
                },
                body: (!body.is_empty()).then(|| String::from_utf8_lossy(body).into_owned()),
                is_base64_encoded: false,
            },
            headers,
            query,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.fields.request_context.request_id
    }

    /// Serializes the event and context for the isolate.
    pub fn payload(&self, context: &InvocationContext) -> Result<InvocationPayload, serde_json::Error> {
        let deferred = json!({
            "headers": pairs(&self.headers, false, false),
            "multiValueHeaders": pairs(&self.headers, true, false),
            "queryStringParameters": pairs(&self.query, false, true),
            "multiValueQueryStringParameters": pairs(&self.query, true, true),
        });
        Ok(InvocationPayload {
            event: serde_json::to_string(&self.fields)?,
            deferred: deferred.to_string(),
            context: serde_json::to_string(context)?,
        })
    }
}

fn pairs(pairs: &[(String, String)], multi: bool, null_if_empty: bool) -> Value {
    json!({ "pairs": pairs, "multi": multi, "nullIfEmpty": null_if_empty })
}

/// Identity and runtime metadata. Inert in development apart from the deadline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    pub function_name: String,
    pub function_version: &'static str,
    pub invoked_function_arn: String,
    #[serde(rename = "memoryLimitInMB")]
    pub memory_limit_in_mb: String,
    pub aws_request_id: String,
    pub log_group_name: String,
    pub log_stream_name: String,
    pub callback_waits_for_empty_event_loop: bool,
    /// Consumed by `getRemainingTimeInMillis()` inside the isolate.
    pub deadline_ms: u64,
}

impl InvocationContext {
    pub fn new(endpoint: &str, function: &FunctionSettings, request_id: &str) -> Self {
        let name = function_name(endpoint);
        let now = SystemTime::now();
        let deadline = now
            .checked_add(Duration::from_secs(function.timeout_seconds))
            .unwrap_or(now + Duration::from_secs(*TIMEOUT_SECONDS.end()));
        Self {
            invoked_function_arn: format!("arn:aws:lambda:local:000000000000:function:{name}"),
            log_group_name: format!("/aws/lambda/{name}"),
            log_stream_name: format!("{STAGE}/[$LATEST]local"),
            function_name: name,
            function_version: "$LATEST",
            memory_limit_in_mb: function.memory_size.to_string(),
            aws_request_id: request_id.to_string(),
            callback_waits_for_empty_event_loop: true,
            deadline_ms: epoch_millis(deadline),
        }
    }
}

/// `/users/{id}` → `users-id`, `/` → `root`.
pub fn function_name(endpoint: &str) -> String {
    let name: Vec<String> = endpoint
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                .collect::<String>()
        })
        .filter(|s| !s.is_empty())
        .collect();
    if name.is_empty() { "root".to_string() } else { name.join("-") }
}

fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub multi_value_headers: Vec<(String, Vec<String>)>,
    pub cookies: Vec<String>,
    pub body: String,
    pub is_base64_encoded: bool,
}

impl InvocationResult {
    pub fn from_value(value: Value) -> Result<Self, TranslationError> {
        let Value::Object(mut map) = value else {
            return Err(TranslationError::NotAnObject(json_kind(&value)));
        };

        let status = match map.remove("statusCode") {
            None | Some(Value::Null) => StatusCode::OK,
            Some(v) => parse_status(&v)?,
        };

        let headers = match map.remove("headers") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(h)) => h
                .into_iter()
                .map(|(k, v)| scalar(&v).map(|v| (k.clone(), v)).ok_or_else(|| header_error(&k, &v)))
                .collect::<Result<_, _>>()?,
            Some(other) => return Err(shape("headers", &other)),
        };

        let multi_value_headers = match map.remove("multiValueHeaders") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(h)) => h
                .into_iter()
                .map(|(k, v)| match &v {
                    Value::Array(items) => items
                        .iter()
                        .map(|item| scalar(item).ok_or_else(|| header_error(&k, item)))
                        .collect::<Result<Vec<_>, _>>()
                        .map(|values| (k.clone(), values)),
                    _ => scalar(&v).map(|s| (k.clone(), vec![s])).ok_or_else(|| header_error(&k, &v)),
                })
                .collect::<Result<_, _>>()?,
            Some(other) => return Err(shape("multiValueHeaders", &other)),
        };

        let cookies = match map.remove("cookies") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|c| scalar(c).ok_or_else(|| shape("cookies", c)))
                .collect::<Result<_, _>>()?,
            Some(other) => return Err(shape("cookies", &other)),
        };

        let body = match map.remove("body") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
        };

        let is_base64_encoded = match map.remove("isBase64Encoded") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => b,
            Some(other) => return Err(shape("isBase64Encoded", &other)),
        };

        Ok(Self {
            status,
            headers,
            multi_value_headers,
            cookies,
            body,
            is_base64_encoded,
        })
    }

    /// Builds the HTTP response. `head` keeps status and headers but drops the body.
    pub fn into_response(self, head: bool) -> Result<Response, TranslationError> {
        let (body, decompressed) = if self.is_base64_encoded {
            let raw = BASE64
                .decode(self.body.trim())
                .map_err(|e| TranslationError::Base64(e.to_string()))?;
            decode_body(raw)
        } else {
            (self.body.into_bytes(), false)
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            headers.insert(header_name(name)?, header_value(name, value)?);
        }
        for (name, values) in &self.multi_value_headers {
            let key = header_name(name)?;
            headers.remove(&key);
            for value in values {
                headers.append(key.clone(), header_value(name, value)?);
            }
        }
        for cookie in &self.cookies {
            headers.append(SET_COOKIE, header_value("set-cookie", cookie)?);
        }

        if decompressed {
            headers.remove(CONTENT_ENCODING);
        }
        headers.remove(CONTENT_LENGTH);
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(infer_content_type(&body)));
        }

        let body = if head {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            Body::empty()
        } else {
            Body::from(Bytes::from(body))
        };

        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Base64-decoded body → bytes to send, and whether they were decompressed.
/// A failed decompression sends the decoded bytes unchanged.
pub fn decode_body(raw: Vec<u8>) -> (Vec<u8>, bool) {
    if raw.len() < MIN_COMPRESSED_LEN {
        return (raw, false);
    }
    let mut out = Vec::new();
    let inflated = if raw.starts_with(&[0x1f, 0x8b]) {
        GzDecoder::new(raw.as_slice()).read_to_end(&mut out)
    } else if raw[0] == 0x78 {
        ZlibDecoder::new(raw.as_slice()).read_to_end(&mut out)
    } else {
        return (raw, false);
    };
    match inflated {
        Ok(_) => (out, true),
        Err(_) => (raw, false),
    }
}

/// JSON when the body parses as JSON, then text when it is UTF-8.
pub fn infer_content_type(body: &[u8]) -> &'static str {
    if !body.is_empty() && serde_json::from_slice::<serde::de::IgnoredAny>(body).is_ok() {
        "application/json"
    } else if std::str::from_utf8(body).is_ok() {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}

fn parse_status(value: &Value) -> Result<StatusCode, TranslationError> {
    let code = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    code.and_then(|c| u16::try_from(c).ok())
        .filter(|c| (100..=599).contains(c))
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| TranslationError::StatusCode(value.to_string()))
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn header_name(name: &str) -> Result<HeaderName, TranslationError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|e| TranslationError::Header {
        name: name.to_string(),
        message: e.to_string(),
    })
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, TranslationError> {
    HeaderValue::from_str(value).map_err(|e| TranslationError::Header {
        name: name.to_string(),
        message: e.to_string(),
    })
}

fn header_error(name: &str, value: &Value) -> TranslationError {
    TranslationError::Header {
        name: name.to_string(),
        message: format!("value must be a string, number or boolean, got {}", json_kind(value)),
    }
}

fn shape(field: &str, value: &Value) -> TranslationError {
    TranslationError::Shape(format!("`{field}` has unexpected type {}", json_kind(value)))
}
