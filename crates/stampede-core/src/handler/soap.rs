//! SOAP protocol handler — wraps the configured XML in a SOAP 1.1
//! envelope, posts it, and detects faults in the response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::handler::StepOutcome;
use crate::model::{GlobalConfig, StepAction};

pub struct SoapHandler {
    client: Arc<reqwest::Client>,
}

impl SoapHandler {
    pub fn new(client: Arc<reqwest::Client>) -> Self {
        Self { client }
    }

    pub async fn execute(&self, action: &StepAction, global: &GlobalConfig) -> StepOutcome {
        let StepAction::Soap {
            url,
            action: soap_action,
            envelope,
            headers,
            timeout,
        } = action
        else {
            return StepOutcome::failed("soap handler received a non-soap step", "dispatch");
        };

        let body = wrap_envelope(envelope);

        let mut request_headers: HashMap<String, String> = global.headers.clone();
        request_headers.extend(headers.clone());
        request_headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| "text/xml; charset=utf-8".to_string());
        request_headers.insert("SOAPAction".to_string(), format!("\"{soap_action}\""));

        let mut builder = self.client.post(url).body(body.clone());
        for (key, value) in &request_headers {
            builder = builder.header(key, value);
        }
        if let Some(t) = timeout {
            match t.to_duration() {
                Ok(d) => builder = builder.timeout(d),
                Err(e) => return StepOutcome::failed(e.to_string(), "config"),
            }
        }

        let mut outcome = StepOutcome {
            request_url: url.clone(),
            request_method: "POST".to_string(),
            body_size_sent: body.len() as u64,
            sent_bytes: body.len() as u64,
            request_body: Some(body),
            request_headers,
            data_type: Some("xml".to_string()),
            ..StepOutcome::default()
        };

        let start = Instant::now();
        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                outcome.response_time_ms = start.elapsed().as_millis() as u64;
                outcome.success = false;
                outcome.error_code = Some(if e.is_timeout() { "timeout" } else { "network" }.to_string());
                outcome.error = Some(format!("Network error: {e}"));
                return outcome;
            }
        };

        outcome.latency_ms = start.elapsed().as_millis() as u64;
        outcome.status = response.status().as_u16();
        outcome.status_text = response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string();

        let body_text = match response.text().await {
            Ok(t) => t,
            Err(e) => {
                outcome.response_time_ms = start.elapsed().as_millis() as u64;
                outcome.success = false;
                outcome.error_code = Some("body".to_string());
                outcome.error = Some(format!("Error reading response body: {e}"));
                return outcome;
            }
        };
        outcome.response_time_ms = start.elapsed().as_millis() as u64;
        outcome.body_size_received = body_text.len() as u64;
        outcome.response_size = body_text.len() as u64;

        // A 500 with a Fault element is the SOAP error convention; surface
        // the faultstring as the step error either way.
        if let Some(fault) = find_fault(&body_text) {
            outcome.success = false;
            outcome.error_code = Some("soap_fault".to_string());
            outcome.error = Some(format!("SOAP fault: {fault}"));
        } else if !(200..400).contains(&outcome.status) {
            outcome.success = false;
            outcome.error_code = Some("status".to_string());
            outcome.error = Some(format!("HTTP {} {}", outcome.status, outcome.status_text));
        }

        outcome.response_body = if body_text.is_empty() {
            None
        } else {
            Some(body_text)
        };
        outcome
    }
}

/// Wrap inner XML in a SOAP 1.1 envelope unless it already is one.
fn wrap_envelope(inner: &str) -> String {
    if inner.contains("Envelope") {
        return inner.to_string();
    }
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>",
            "<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\">",
            "<soap:Body>{}</soap:Body>",
            "</soap:Envelope>"
        ),
        inner
    )
}

/// Scan a response for a `Fault` element and return its `faultstring`.
fn find_fault(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut in_fault = false;
    let mut in_faultstring = false;
    let mut fault_found = false;
    let mut fault_message = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                let name = String::from_utf8_lossy(name.as_ref()).to_string();
                if name == "Fault" {
                    in_fault = true;
                    fault_found = true;
                } else if in_fault && name == "faultstring" {
                    in_faultstring = true;
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                let name = String::from_utf8_lossy(name.as_ref()).to_string();
                if name == "Fault" {
                    in_fault = false;
                } else if name == "faultstring" {
                    in_faultstring = false;
                }
            }
            Ok(Event::Text(t)) if in_faultstring => {
                if let Ok(text) = t.unescape() {
                    fault_message.push_str(&text);
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break, // malformed XML is not a fault
            _ => {}
        }
    }

    if fault_found {
        Some(if fault_message.is_empty() {
            "unspecified fault".to_string()
        } else {
            fault_message
        })
    } else {
        None
    }
}
