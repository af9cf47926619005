//! # Channel Envelope
//!
//! The JSON message exchanged over channel bindings. A call carries the
//! caller's span headers, the method, its arguments and the back-route to
//! answer on. A response echoes the call's headers and correlation id and adds
//! `response`, either `{"ok": value}` or `{"error": message}`.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::CallArgs;
use crate::span::SpanContext;
use crate::transport::Error;
use crate::transport::Result;

/// Span headers as they travel inside an envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireContext {
    pub span_id: String,
    pub trace_id: String,
    #[serde(default = "default_sampled")]
    pub sampled: bool,
    #[serde(default)]
    pub baggage: BTreeMap<String, String>,
}

fn default_sampled() -> bool {
    true
}

impl WireContext {
    pub fn from_span(context: &SpanContext) -> Self {
        Self {
            span_id: context.span_id_hex(),
            trace_id: context.trace_id_hex(),
            sampled: context.sampled,
            baggage: context.baggage.clone(),
        }
    }

    pub fn to_span_context(&self) -> Result<SpanContext> {
        let parse = |field: &str, raw: &str| {
            u64::from_str_radix(raw, 16).map_err(|_| Error::Decode(format!("bad {} {:?}", field, raw)))
        };
        Ok(SpanContext {
            trace_id: parse("trace_id", &self.trace_id)?,
            span_id: parse("span_id", &self.span_id)?,
            parent_span_id: None,
            sampled: self.sampled,
            baggage: self.baggage.clone(),
        })
    }
}

/// Outcome of a remote call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    Ok(Value),
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub context_headers: WireContext,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back_route: Option<String>,
    /// Overrides the span id as correlation key when the span id collided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
}

impl Envelope {
    pub fn call(
        context: &SpanContext,
        method: &str,
        args: CallArgs,
        back_route: Option<String>,
        correlation_id: &str,
    ) -> Self {
        let context_headers = WireContext::from_span(context);
        let correlation_id = (correlation_id != context_headers.span_id).then(|| correlation_id.to_string());
        Self {
            context_headers,
            method: method.to_string(),
            args: args.args,
            kwargs: args.kwargs,
            back_route,
            correlation_id,
            response: None,
        }
    }

    /// The response to this call.
    pub fn reply(&self, response: Response) -> Self {
        Self {
            context_headers: self.context_headers.clone(),
            method: self.method.clone(),
            args: Vec::new(),
            kwargs: Map::new(),
            back_route: None,
            correlation_id: self.correlation_id.clone(),
            response: Some(response),
        }
    }

    /// The key a response is matched to its call by.
    pub fn correlation_key(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or(&self.context_headers.span_id)
    }

    pub fn call_args(&self) -> CallArgs {
        CallArgs {
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
    }
}
