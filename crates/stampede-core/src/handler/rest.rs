//! REST protocol handler over the shared reqwest connection pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use serde_json::Value;

use crate::error::StampedeError;
use crate::handler::StepOutcome;
use crate::model::{BasicAuth, GlobalConfig, HttpMethod, StepAction};

pub struct RestHandler {
    client: Arc<reqwest::Client>,
}

impl RestHandler {
    pub fn new(client: Arc<reqwest::Client>) -> Self {
        Self { client }
    }

    /// Execute a `rest` step. The step has already been templated; this
    /// resolves the URL against `global.base_url`, merges global headers,
    /// loads `json_file` and applies `overrides`, sends, and measures.
    ///
    /// Network failures surface through the outcome's `error` field —
    /// handlers never panic a VU.
    pub async fn execute(&self, action: &StepAction, global: &GlobalConfig) -> StepOutcome {
        let StepAction::Rest {
            method,
            url,
            headers,
            json,
            json_file,
            overrides,
            body,
            form,
            auth,
            timeout,
        } = action
        else {
            return StepOutcome::failed("rest handler received a non-rest step", "dispatch");
        };

        let url = resolve_url(url, global.base_url.as_deref());

        // Synthesise the JSON payload from the inline value and/or file,
        // then lay the dot-path overrides on top.
        let json_payload = match build_json_payload(json.as_ref(), json_file.as_deref(), overrides)
            .await
        {
            Ok(payload) => payload,
            Err(e) => return StepOutcome::failed(e.to_string(), "json_file"),
        };

        let mut request_headers: HashMap<String, String> = global.headers.clone();
        request_headers.extend(headers.clone());
        if let Some(BasicAuth { username, password }) = auth {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}"));
            request_headers.insert("Authorization".to_string(), format!("Basic {encoded}"));
        }

        let mut builder = self.client.request(to_reqwest_method(method), &url);
        for (key, value) in &request_headers {
            builder = builder.header(key, value);
        }
        if let Some(t) = timeout {
            match t.to_duration() {
                Ok(d) => builder = builder.timeout(d),
                Err(e) => return StepOutcome::failed(e.to_string(), "config"),
            }
        }

        let mut request_body_text = None;
        if let Some(payload) = &json_payload {
            request_body_text = Some(payload.to_string());
            builder = builder.json(payload);
        } else if !form.is_empty() {
            let pairs: Vec<(&str, &str)> =
                form.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            request_body_text = Some(
                pairs
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("&"),
            );
            builder = builder.form(&pairs);
        } else if let Some(raw) = body {
            request_body_text = Some(raw.clone());
            builder = builder.body(raw.clone());
        }

        let body_size_sent = request_body_text.as_ref().map(|b| b.len() as u64).unwrap_or(0);
        let headers_size_sent = estimate_header_size(&request_headers)
            + method.to_string().len() as u64
            + url.len() as u64
            + 12; // request line framing

        let mut outcome = StepOutcome {
            request_url: url.clone(),
            request_method: method.to_string(),
            request_headers,
            request_body: request_body_text,
            sent_bytes: headers_size_sent + body_size_sent,
            headers_size_sent,
            body_size_sent,
            ..StepOutcome::default()
        };

        let start = Instant::now();
        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                outcome.response_time_ms = start.elapsed().as_millis() as u64;
                outcome.success = false;
                outcome.error_code = Some(classify_reqwest_error(&e).to_string());
                outcome.error = Some(format!("Network error: {e}"));
                return outcome;
            }
        };

        // Headers are in; everything from here to body completion is
        // download time.
        outcome.latency_ms = start.elapsed().as_millis() as u64;
        outcome.status = response.status().as_u16();
        outcome.status_text = response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string();
        outcome.response_headers = collect_headers(response.headers());
        outcome.data_type = outcome
            .response_headers
            .get("content-type")
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_string());

        let body_bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                outcome.response_time_ms = start.elapsed().as_millis() as u64;
                outcome.success = false;
                outcome.error_code = Some("body".to_string());
                outcome.error = Some(format!("Error reading response body: {e}"));
                return outcome;
            }
        };
        outcome.response_time_ms = start.elapsed().as_millis() as u64;

        outcome.body_size_received = body_bytes.len() as u64;
        outcome.headers_size_received = estimate_header_size(&outcome.response_headers);
        outcome.response_size = outcome.headers_size_received + outcome.body_size_received;
        outcome.response_body = if body_bytes.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&body_bytes).into_owned())
        };

        if !(200..400).contains(&outcome.status) {
            outcome.success = false;
            outcome.error_code = Some("status".to_string());
            outcome.error = Some(format!(
                "HTTP {} {}",
                outcome.status, outcome.status_text
            ));
        }

        outcome
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn to_reqwest_method(method: &HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}

/// Join a possibly relative URL onto the global base URL.
fn resolve_url(url: &str, base_url: Option<&str>) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    match base_url {
        Some(base) => format!(
            "{}/{}",
            base.trim_end_matches('/'),
            url.trim_start_matches('/')
        ),
        None => url.to_string(),
    }
}

/// Merge inline JSON, a JSON file, and dot-path overrides into one payload.
async fn build_json_payload(
    inline: Option<&Value>,
    json_file: Option<&str>,
    overrides: &HashMap<String, Value>,
) -> Result<Option<Value>, StampedeError> {
    let mut payload = match (inline, json_file) {
        (Some(value), _) => Some(value.clone()),
        (None, Some(path)) => {
            let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                StampedeError::Data(format!("failed to read json_file \"{path}\": {e}"))
            })?;
            Some(serde_json::from_str(&content).map_err(|e| {
                StampedeError::Data(format!("json_file \"{path}\" is not valid JSON: {e}"))
            })?)
        }
        (None, None) => None,
    };

    if !overrides.is_empty() {
        let target = payload.get_or_insert_with(|| Value::Object(Default::default()));
        for (path, value) in overrides {
            set_json_path(target, path, value.clone());
        }
    }

    Ok(payload)
}

/// Set a dot-path (`a.b[0].c`) inside a JSON value, creating intermediate
/// objects as needed. Array segments index into existing arrays only.
fn set_json_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let segments: Vec<&str> = path.split('.').collect();

    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;

        let (key, index) = match segment.find('[') {
            Some(pos) => {
                let idx = segment[pos + 1..]
                    .trim_end_matches(']')
                    .parse::<usize>()
                    .ok();
                (&segment[..pos], idx)
            }
            None => (*segment, None),
        };

        if !key.is_empty() {
            if !current.is_object() {
                *current = Value::Object(Default::default());
            }
            let map = current.as_object_mut().expect("object ensured above");
            if last && index.is_none() {
                map.insert(key.to_string(), value);
                return;
            }
            current = map
                .entry(key.to_string())
                .or_insert(Value::Object(Default::default()));
        }

        if let Some(idx) = index {
            let Some(slot) = current.get_mut(idx) else {
                return; // out-of-range index: override is dropped
            };
            if last {
                *slot = value;
                return;
            }
            current = slot;
        }
    }
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}

fn estimate_header_size(headers: &HashMap<String, String>) -> u64 {
    headers
        .iter()
        .map(|(k, v)| k.len() as u64 + v.len() as u64 + 4)
        .sum()
}

fn classify_reqwest_error(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection"
    } else {
        "network"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn handler() -> RestHandler {
        RestHandler::new(Arc::new(reqwest::Client::new()))
    }

    fn rest_action(json_str: &str) -> StepAction {
        let step: crate::model::Step = serde_json::from_str(json_str).unwrap();
        step.action
    }

    // -----------------------------------------------------------------------
    // URL resolution & payload synthesis (no network)
    // -----------------------------------------------------------------------

    #[test]
    fn resolve_url_joins_base() {
        assert_eq!(
            resolve_url("/api/users", Some("http://example.com/")),
            "http://example.com/api/users"
        );
        assert_eq!(
            resolve_url("http://other.com/x", Some("http://example.com")),
            "http://other.com/x"
        );
        assert_eq!(resolve_url("/x", None), "/x");
    }

    #[test]
    fn set_json_path_creates_nested_objects() {
        let mut v = json!({});
        set_json_path(&mut v, "user.profile.name", json!("ada"));
        assert_eq!(v, json!({"user": {"profile": {"name": "ada"}}}));
    }

    #[test]
    fn set_json_path_overwrites_existing() {
        let mut v = json!({"a": 1});
        set_json_path(&mut v, "a", json!(2));
        assert_eq!(v, json!({"a": 2}));
    }

    #[test]
    fn set_json_path_indexes_into_arrays() {
        let mut v = json!({"items": [{"id": 1}, {"id": 2}]});
        set_json_path(&mut v, "items[1].id", json!(99));
        assert_eq!(v["items"][1]["id"], json!(99));
        // Out-of-range index is dropped silently.
        set_json_path(&mut v, "items[9].id", json!(0));
        assert_eq!(v["items"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn build_json_payload_from_file_with_overrides() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"user": {"name": "template"}, "active": false}"#)
            .unwrap();

        let mut overrides = HashMap::new();
        overrides.insert("user.name".to_string(), json!("alice"));
        overrides.insert("active".to_string(), json!(true));

        let payload = build_json_payload(None, Some(file.path().to_str().unwrap()), &overrides)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload["user"]["name"], json!("alice"));
        assert_eq!(payload["active"], json!(true));
    }

    #[tokio::test]
    async fn build_json_payload_missing_file_is_error() {
        let overrides = HashMap::new();
        let result = build_json_payload(None, Some("/no/such/file.json"), &overrides).await;
        assert!(result.is_err());
    }

    // -----------------------------------------------------------------------
    // Wire tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn get_populates_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .mount(&server)
            .await;

        let action = rest_action(&format!(
            r#"{{"name": "ping", "type": "rest", "url": "{}/ping"}}"#,
            server.uri()
        ));
        let outcome = handler().execute(&action, &GlobalConfig::default()).await;
        assert!(outcome.success);
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.response_body.as_deref(), Some("pong"));
        assert_eq!(outcome.request_method, "GET");
        assert!(outcome.body_size_received >= 4);
    }

    #[tokio::test]
    async fn non_2xx_is_a_failure_with_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let action = rest_action(&format!(
            r#"{{"name": "x", "type": "rest", "url": "{}/missing"}}"#,
            server.uri()
        ));
        let outcome = handler().execute(&action, &GlobalConfig::default()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.status, 404);
        assert_eq!(outcome.error_code.as_deref(), Some("status"));
    }

    #[tokio::test]
    async fn json_body_and_header_merge() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .and(header("x-tenant", "acme"))
            .and(body_json(json!({"user": "alice"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "T-42"})))
            .mount(&server)
            .await;

        let action = rest_action(&format!(
            r#"{{"name": "login", "type": "rest", "method": "POST",
                 "url": "{}/login", "json": {{"user": "alice"}}}}"#,
            server.uri()
        ));
        let mut global = GlobalConfig::default();
        global
            .headers
            .insert("x-tenant".to_string(), "acme".to_string());

        let outcome = handler().execute(&action, &global).await;
        assert!(outcome.success, "error: {:?}", outcome.error);
        assert_eq!(outcome.data_type.as_deref(), Some("application/json"));
        assert!(outcome.response_body.unwrap().contains("T-42"));
    }

    #[tokio::test]
    async fn basic_auth_header_is_attached() {
        let server = MockServer::start().await;
        // "user:pass" base64-encoded.
        Mock::given(method("GET"))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let action = rest_action(&format!(
            r#"{{"name": "auth", "type": "rest", "url": "{}/",
                 "auth": {{"username": "user", "password": "pass"}}}}"#,
            server.uri()
        ));
        let outcome = handler().execute(&action, &GlobalConfig::default()).await;
        assert!(outcome.success, "error: {:?}", outcome.error);
    }

    #[tokio::test]
    async fn connection_failure_is_classified() {
        // Nothing listens on this port.
        let action = rest_action(
            r#"{"name": "down", "type": "rest", "url": "http://127.0.0.1:9", "timeout": "500ms"}"#,
        );
        let outcome = handler().execute(&action, &GlobalConfig::default()).await;
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
        assert!(outcome.status == 0);
    }

    #[tokio::test]
    async fn relative_url_uses_global_base() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ping"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let action =
            rest_action(r#"{"name": "ping", "type": "rest", "url": "/api/ping"}"#);
        let global = GlobalConfig {
            base_url: Some(server.uri()),
            ..GlobalConfig::default()
        };
        let outcome = handler().execute(&action, &global).await;
        assert!(outcome.success);
    }
}
