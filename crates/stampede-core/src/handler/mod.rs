//! Protocol handlers — the uniform `execute(step, vu) → outcome` seam.
//!
//! REST and SOAP ship in-crate; browser (`web`) and `custom` steps go to
//! opaque handlers registered on the per-test registry, so the engine never
//! depends on a concrete browser or vendor client.

pub mod rest;
pub mod soap;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::context::VuContext;
use crate::model::Step;

pub use rest::RestHandler;
pub use soap::SoapHandler;

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// What a handler observed while executing one step, before checks and
/// extracts run. Handlers fill every field they can measure.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub success: bool,
    pub status: u16,
    pub status_text: String,
    pub error: Option<String>,
    pub error_code: Option<String>,
    /// Protocol-level response time in milliseconds.
    pub response_time_ms: u64,
    pub connect_time_ms: u64,
    /// Time to first byte in milliseconds.
    pub latency_ms: u64,
    pub request_url: String,
    pub request_method: String,
    pub request_headers: HashMap<String, String>,
    pub request_body: Option<String>,
    /// Response headers with lowercased names.
    pub response_headers: HashMap<String, String>,
    /// Full response body; truncation happens when the result is built.
    pub response_body: Option<String>,
    pub response_size: u64,
    pub sent_bytes: u64,
    pub headers_size_sent: u64,
    pub body_size_sent: u64,
    pub headers_size_received: u64,
    pub body_size_received: u64,
    pub data_type: Option<String>,
    pub custom_metrics: HashMap<String, Value>,
    /// Browser handlers set this to false for commands that are neither
    /// verifications nor waits; failures force it back to true.
    pub should_record: bool,
}

impl Default for StepOutcome {
    fn default() -> Self {
        Self {
            success: true,
            status: 0,
            status_text: String::new(),
            error: None,
            error_code: None,
            response_time_ms: 0,
            connect_time_ms: 0,
            latency_ms: 0,
            request_url: String::new(),
            request_method: String::new(),
            request_headers: HashMap::new(),
            request_body: None,
            response_headers: HashMap::new(),
            response_body: None,
            response_size: 0,
            sent_bytes: 0,
            headers_size_sent: 0,
            body_size_sent: 0,
            headers_size_received: 0,
            body_size_received: 0,
            data_type: None,
            custom_metrics: HashMap::new(),
            should_record: true,
        }
    }
}

impl StepOutcome {
    /// An outcome for a failure that happened before any protocol work.
    pub fn failed(error: impl Into<String>, code: &str) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            error_code: Some(code.to_string()),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// ProtocolHandler — the opaque-handler contract
// ---------------------------------------------------------------------------

/// Contract for externally registered handlers (`web`, `custom` steps).
/// One method, chosen by the step's variant tag — no base class.
pub trait ProtocolHandler: Send + Sync {
    fn execute<'a>(&'a self, step: &'a Step, vu: &'a VuContext) -> BoxFuture<'a, StepOutcome>;
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Per-test handler registry. REST and SOAP are always present; `web` and
/// named custom handlers are injected by the embedding application.
pub struct HandlerRegistry {
    pub rest: RestHandler,
    pub soap: SoapHandler,
    web: RwLock<Option<Arc<dyn ProtocolHandler>>>,
    custom: RwLock<HashMap<String, Arc<dyn ProtocolHandler>>>,
}

impl HandlerRegistry {
    pub fn new(client: Arc<reqwest::Client>) -> Self {
        Self {
            rest: RestHandler::new(Arc::clone(&client)),
            soap: SoapHandler::new(client),
            web: RwLock::new(None),
            custom: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_web(&self, handler: Arc<dyn ProtocolHandler>) {
        *self.web.write().expect("handler registry poisoned") = Some(handler);
    }

    pub fn register_custom(&self, name: &str, handler: Arc<dyn ProtocolHandler>) {
        self.custom
            .write()
            .expect("handler registry poisoned")
            .insert(name.to_string(), handler);
    }

    pub fn web(&self) -> Option<Arc<dyn ProtocolHandler>> {
        self.web.read().expect("handler registry poisoned").clone()
    }

    pub fn custom(&self, name: &str) -> Option<Arc<dyn ProtocolHandler>> {
        self.custom
            .read()
            .expect("handler registry poisoned")
            .get(name)
            .cloned()
    }
}
