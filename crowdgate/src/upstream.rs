//! Upstream API abstraction: wire payloads, response parsing, and the
//! `UpstreamClient` trait with production and mock implementations.
//!
//! The vision API takes a JSON body with text + inline base64 image parts and
//! answers with candidate text; the maps API is a GET with query parameters.
//! Both are opaque remote calls that can succeed, fail, or rate-limit.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};

use crate::error::{MitigationError, Result};
use crate::types::ServiceKind;

/// A request bound for one upstream service.
///
/// For the vision service `body` is the JSON POST payload; for the maps
/// service it is a flat object of query parameters.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub service: ServiceKind,
    pub body: Value,
}

/// Response from an upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as a string
    pub body: String,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }
}

/// Trait for executing upstream requests.
///
/// This abstraction allows for different implementations (production vs.
/// testing) and makes the dispatch logic testable without real HTTP calls.
#[async_trait]
pub trait UpstreamClient: Send + Sync + Clone {
    /// Execute one upstream request with the given credential.
    ///
    /// # Errors
    /// Returns an error if the request fails at the transport level (network
    /// issues, timeout, invalid URL). Non-2xx statuses are returned as a
    /// normal `UpstreamResponse` for the caller to classify.
    async fn execute(
        &self,
        request: &UpstreamRequest,
        credential: &str,
        timeout: Duration,
    ) -> Result<UpstreamResponse>;
}

// ============================================================================
// Wire payloads
// ============================================================================

/// Marker prefix used to label each fragment of a multi-part prompt.
const REQUEST_MARKER: &str = "REQUEST_";

/// Marker suffix the upstream is instructed to echo before each answer.
const RESPONSE_MARKER_SUFFIX: &str = "_RESPONSE:";

/// Output token budget granted per fragment in a combined call.
const OUTPUT_TOKENS_PER_FRAGMENT: u64 = 4096;

/// Build the single-request vision payload: prompt text plus the inline
/// base64-encoded frame.
pub fn vision_payload(image: &[u8], prompt: &str) -> Value {
    json!({
        "contents": [{
            "parts": [
                { "text": prompt },
                {
                    "inline_data": {
                        "mime_type": "image/jpeg",
                        "data": BASE64_STANDARD.encode(image),
                    }
                }
            ]
        }]
    })
}

/// Build a combined multi-part vision payload from several prompt fragments.
///
/// Each fragment is labelled `REQUEST_{n}` (1-based, admission order) and the
/// upstream is instructed to echo `REQUEST_{n}_RESPONSE:` before each answer
/// so the combined response can be split back into per-request segments.
pub fn multipart_payload(fragments: &[String]) -> Value {
    let parts: Vec<Value> = fragments
        .iter()
        .enumerate()
        .map(|(i, fragment)| {
            let n = i + 1;
            json!({
                "text": format!(
                    "{REQUEST_MARKER}{n}: {fragment}\n\nPlease respond with: {REQUEST_MARKER}{n}{RESPONSE_MARKER_SUFFIX} [your response]"
                )
            })
        })
        .collect();

    json!({
        "contents": [{ "parts": parts }],
        "generationConfig": {
            "maxOutputTokens": OUTPUT_TOKENS_PER_FRAGMENT * fragments.len() as u64,
            "temperature": 0.7,
        }
    })
}

/// Build the maps query parameters for an area-activity lookup.
pub fn maps_payload(lat: f64, lng: f64, query: &str) -> Value {
    json!({
        "location": format!("{lat},{lng}"),
        "radius": "500",
        "type": query,
    })
}

// ============================================================================
// Response parsing
// ============================================================================

/// Pull the answer text out of a vision response body.
pub fn extract_response_text(body: &str) -> Result<String> {
    let value: Value = serde_json::from_str(body)?;
    value
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            MitigationError::MalformedResponse("missing candidates[0].content.parts[0].text".into())
        })
}

/// Parse a single-request vision response into a people count.
pub fn parse_people_count(body: &str) -> Result<u32> {
    let text = extract_response_text(body)?;
    first_number(&text).ok_or_else(|| {
        MitigationError::MalformedResponse(format!("no count in response text: {:.60}", text))
    })
}

/// Split a combined response back into `n` per-request segments.
///
/// Segments are located by the `REQUEST_{n}_RESPONSE:` markers in admission
/// order. When a marker is missing the text is split into `n` even chunks
/// instead, so every member still receives a segment (degraded but answered).
pub fn split_multipart(full_text: &str, n: usize) -> Vec<String> {
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![strip_marker(full_text, 1)];
    }

    let markers_present = (1..=n).all(|i| full_text.contains(&response_marker(i)));
    if markers_present {
        (1..=n)
            .map(|i| {
                let marker = response_marker(i);
                let start = full_text.find(&marker).map(|p| p + marker.len()).unwrap_or(0);
                let end = full_text[start..]
                    .find(&response_marker(i + 1))
                    .map(|p| start + p)
                    .unwrap_or(full_text.len());
                full_text[start..end].trim().to_string()
            })
            .collect()
    } else {
        even_chunks(full_text, n)
    }
}

/// Parse a combined batch response into one people count per fragment.
///
/// A count must be extractable for every segment; anything less is a
/// full-window parse failure resolved via fallback for all members.
pub fn parse_batch_counts(body: &str, n: usize) -> Result<Vec<u32>> {
    let text = extract_response_text(body)?;
    let segments = split_multipart(&text, n);
    segments
        .iter()
        .enumerate()
        .map(|(i, segment)| {
            first_number(segment).ok_or_else(|| {
                MitigationError::BatchParse(format!("no count in segment {}", i + 1))
            })
        })
        .collect()
}

/// Parse a maps response into an area activity factor, 0-100.
///
/// The factor scales with the number of active places reported near the
/// location; it feeds the density score rather than a literal people count.
pub fn parse_maps_activity(body: &str) -> Result<u32> {
    let value: Value = serde_json::from_str(body)?;
    let results = value
        .pointer("/results")
        .and_then(Value::as_array)
        .ok_or_else(|| MitigationError::MalformedResponse("missing results array".into()))?;
    Ok(((results.len() as u32) * 8).min(100))
}

fn response_marker(n: usize) -> String {
    format!("{REQUEST_MARKER}{n}{RESPONSE_MARKER_SUFFIX}")
}

fn strip_marker(text: &str, n: usize) -> String {
    let marker = response_marker(n);
    match text.find(&marker) {
        Some(pos) => text[pos + marker.len()..].trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// Split text into `n` chunks of roughly equal character count.
fn even_chunks(text: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let chunk_size = (chars.len() / n).max(1);
    (0..n)
        .map(|i| {
            let start = (i * chunk_size).min(chars.len());
            let end = if i == n - 1 {
                chars.len()
            } else {
                ((i + 1) * chunk_size).min(chars.len())
            };
            chars[start..end].iter().collect::<String>().trim().to_string()
        })
        .collect()
}

/// First run of ASCII digits in the text, parsed as a count.
fn first_number(text: &str) -> Option<u32> {
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else if !digits.is_empty() {
            break;
        }
    }
    digits.parse().ok()
}

// ============================================================================
// Production implementation using reqwest
// ============================================================================

/// Production upstream client using reqwest.
#[derive(Clone)]
pub struct ReqwestUpstreamClient {
    client: reqwest::Client,
    vision_endpoint: String,
    maps_endpoint: String,
}

impl ReqwestUpstreamClient {
    pub fn new(vision_endpoint: impl Into<String>, maps_endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            vision_endpoint: vision_endpoint.into(),
            maps_endpoint: maps_endpoint.into(),
        }
    }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
    #[tracing::instrument(skip(self, request, credential), fields(service = %request.service))]
    async fn execute(
        &self,
        request: &UpstreamRequest,
        credential: &str,
        timeout: Duration,
    ) -> Result<UpstreamResponse> {
        let response = match request.service {
            ServiceKind::Vision => {
                let url = format!("{}?key={}", self.vision_endpoint, credential);
                self.client
                    .post(&url)
                    .timeout(timeout)
                    .header("Content-Type", "application/json")
                    .json(&request.body)
                    .send()
                    .await?
            }
            ServiceKind::Maps => {
                let mut params: Vec<(String, String)> = request
                    .body
                    .as_object()
                    .map(|obj| {
                        obj.iter()
                            .map(|(k, v)| {
                                let value = match v {
                                    Value::String(s) => s.clone(),
                                    other => other.to_string(),
                                };
                                (k.clone(), value)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                params.push(("key".to_string(), credential.to_string()));
                self.client
                    .get(&self.maps_endpoint)
                    .timeout(timeout)
                    .query(&params)
                    .send()
                    .await?
            }
        };

        let status = response.status().as_u16();
        let body = response.text().await?;

        tracing::debug!(
            service = %request.service,
            status = status,
            response_len = body.len(),
            "upstream request completed"
        );

        Ok(UpstreamResponse { status, body })
    }
}

// ============================================================================
// Test/mock implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Mock upstream client for testing.
///
/// Allows configuring predetermined responses per service without making
/// actual HTTP calls. Every call is recorded for assertions.
#[derive(Clone, Default)]
pub struct MockUpstreamClient {
    responses: Arc<Mutex<HashMap<ServiceKind, Vec<Result<UpstreamResponse>>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

/// Record of a call made to the mock upstream client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub service: ServiceKind,
    pub body: Value,
    pub credential: String,
    pub timeout: Duration,
}

impl MockUpstreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for a service. Multiple responses are returned in
    /// FIFO order.
    pub fn add_response(&self, service: ServiceKind, response: Result<UpstreamResponse>) {
        self.responses
            .lock()
            .entry(service)
            .or_default()
            .push(response);
    }

    /// Queue a 200 vision response whose answer text is the given count.
    pub fn add_vision_count(&self, count: u32) {
        self.add_response(
            ServiceKind::Vision,
            Ok(UpstreamResponse {
                status: 200,
                body: vision_body_with_text(&count.to_string()),
            }),
        );
    }

    /// Queue a bare-status response (429, 500, ...) for a service.
    pub fn add_status(&self, service: ServiceKind, status: u16) {
        self.add_response(
            service,
            Ok(UpstreamResponse {
                status,
                body: format!(r#"{{"error":{{"code":{status}}}}}"#),
            }),
        );
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, service: ServiceKind) -> usize {
        self.calls.lock().iter().filter(|c| c.service == service).count()
    }
}

/// Build a vision response body whose answer text is `text`.
pub fn vision_body_with_text(text: &str) -> String {
    json!({
        "candidates": [{
            "content": { "parts": [{ "text": text }] }
        }]
    })
    .to_string()
}

#[async_trait]
impl UpstreamClient for MockUpstreamClient {
    async fn execute(
        &self,
        request: &UpstreamRequest,
        credential: &str,
        timeout: Duration,
    ) -> Result<UpstreamResponse> {
        self.calls.lock().push(MockCall {
            service: request.service,
            body: request.body.clone(),
            credential: credential.to_string(),
            timeout,
        });

        let mut responses = self.responses.lock();
        if let Some(queue) = responses.get_mut(&request.service) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }

        Err(MitigationError::Internal(anyhow::anyhow!(
            "no mock response configured for {}",
            request.service
        )))
    }
}
