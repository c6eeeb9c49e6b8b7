//! Thin HTTP client for the Moonraker API consumed by the dryer controllers.
//!
//! Four primitives, no more: query objects, run a gcode script, and a
//! convenience wrapper for reading a heater's configured max temperature.
//! Built on `hyper`/`hyper-util` directly (matching the rest of this
//! crate's HTTP-client style) rather than a higher-level client crate -
//! at ~1 Hz per dryer, a pooled `hyper_util::client::legacy::Client` shared
//! across calls is all the connection reuse we need.

use crate::error::{DryerError, Result};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::Value;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type RequestBody = http_body_util::combinators::BoxBody<Bytes, std::convert::Infallible>;

pub struct MoonrakerClient {
    base_url: String,
    api_key: Option<String>,
    client: Client<hyper_util::client::legacy::connect::HttpConnector, RequestBody>,
}

impl MoonrakerClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            base_url,
            api_key,
            client,
        }
    }

    /// GET `{base}/printer/objects/query?name1&name2&...` and return the
    /// `result.status` subtree.
    pub async fn query(&self, object_names: &[&str]) -> Result<Value> {
        let query = object_names.join("&");
        let uri = format!("{}/printer/objects/query?{}", self.base_url, query);
        let body = self.get(&uri).await?;
        body.get("result")
            .and_then(|r| r.get("status"))
            .cloned()
            .ok_or_else(|| DryerError::ConfigMissing("result.status missing from moonraker response".into()))
    }

    /// POST `{base}/printer/gcode/script` with `{"script": script}`.
    pub async fn gcode(&self, script: &str) -> Result<Value> {
        let uri = format!("{}/printer/gcode/script", self.base_url);
        let payload = serde_json::json!({ "script": script });
        self.post(&uri, payload).await
    }

    /// Reads `configfile.settings.<heater>.max_temp`.
    pub async fn max_temp(&self, heater_name: &str) -> Result<f64> {
        let status = self.query(&["configfile"]).await?;
        status
            .get("configfile")
            .and_then(|c| c.get("settings"))
            .and_then(|s| s.get(heater_name))
            .and_then(|h| h.get("max_temp"))
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                DryerError::ConfigMissing(format!("configfile.settings.{heater_name}.max_temp missing"))
            })
    }

    async fn get(&self, uri: &str) -> Result<Value> {
        let uri: Uri = uri.parse().map_err(|e| DryerError::InvalidState(format!("bad uri: {e}")))?;
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if let Some(key) = &self.api_key {
            builder = builder.header("X-Api-Key", HeaderValue::from_str(key).unwrap_or(HeaderValue::from_static("")));
        }
        let req = builder
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .map_err(|e| DryerError::InvalidState(e.to_string()))?;
        self.send(req).await
    }

    async fn post(&self, uri: &str, payload: Value) -> Result<Value> {
        let uri: Uri = uri.parse().map_err(|e| DryerError::InvalidState(format!("bad uri: {e}")))?;
        let bytes = Bytes::from(serde_json::to_vec(&payload)?);
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("X-Api-Key", HeaderValue::from_str(key).unwrap_or(HeaderValue::from_static("")));
        }
        let req = builder
            .body(Full::new(bytes).map_err(|never| match never {}).boxed())
            .map_err(|e| DryerError::InvalidState(e.to_string()))?;
        self.send(req).await
    }

    async fn send(&self, req: Request<RequestBody>) -> Result<Value> {
        let call = self.client.request(req);
        let response = tokio::time::timeout(REQUEST_TIMEOUT, call)
            .await
            .map_err(|_| DryerError::Timeout(REQUEST_TIMEOUT))?
            .map_err(|e| DryerError::Unreachable(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| DryerError::Unreachable(e.to_string()))?
            .to_bytes();

        if status != StatusCode::OK {
            return Err(DryerError::Upstream(format!(
                "status={status} body={}",
                String::from_utf8_lossy(&body)
            )));
        }
        serde_json::from_slice(&body).map_err(DryerError::from)
    }
}

/// Drops everything before and including the first whitespace-delimited
/// token of a Moonraker device name, e.g. `"heater_bed chamber"` ->
/// `"chamber"`. Moonraker config sections are named `<type> <name>`; the
/// gcode commands and LED/servo macros want just `<name>`.
pub fn strip_scope_prefix(device_name: &str) -> String {
    device_name
        .split(' ')
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_scope_token() {
        assert_eq!(strip_scope_prefix("heater_generic chamber"), "chamber");
        assert_eq!(strip_scope_prefix("servo vent_servo"), "vent_servo");
        assert_eq!(strip_scope_prefix("no_space"), "");
    }
}
