//! # Header Propagation
//!
//! Maps a `SpanContext` to and from a flat header map so a trace survives a
//! wire hop. Ids travel as lowercase hex; baggage and the sampling flag travel
//! as JSON.
//!
//! Extraction never fails: missing or garbled headers yield `None`, and the
//! receiving side starts a new trace.

use std::collections::BTreeMap;

use crate::SpanContext;

pub type Headers = BTreeMap<String, String>;

/// Injects and extracts span contexts in one header dialect.
pub trait HeaderMapper: Send + Sync + 'static {
    fn inject(&self, context: &SpanContext, headers: &mut Headers);
    fn extract(&self, headers: &Headers) -> Option<SpanContext>;
}

struct Keys {
    span_id: &'static str,
    trace_id: &'static str,
    baggage: &'static str,
    sampled: &'static str,
}

const OT_KEYS: Keys = Keys {
    span_id: "ot-span-id",
    trace_id: "ot-trace-id",
    baggage: "ot-baggage",
    sampled: "ot-sampled",
};

const PREFIXED_KEYS: Keys = Keys {
    span_id: "HTTP_OT_SPAN_ID",
    trace_id: "HTTP_OT_TRACE_ID",
    baggage: "HTTP_OT_BAGGAGE",
    sampled: "HTTP_OT_SAMPLED",
};

/// The `ot-*` header dialect used between services.
#[derive(Debug, Default, Clone, Copy)]
pub struct OtHeaders;

impl HeaderMapper for OtHeaders {
    fn inject(&self, context: &SpanContext, headers: &mut Headers) {
        inject(&OT_KEYS, context, headers);
    }

    fn extract(&self, headers: &Headers) -> Option<SpanContext> {
        extract(&OT_KEYS, |key| headers.get(key).map(String::as_str))
    }
}

/// The `HTTP_OT_*` dialect that web frameworks expose request headers under.
///
/// Extraction also accepts the key without the `HTTP_` prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrefixedOtHeaders;

impl HeaderMapper for PrefixedOtHeaders {
    fn inject(&self, context: &SpanContext, headers: &mut Headers) {
        inject(&PREFIXED_KEYS, context, headers);
    }

    fn extract(&self, headers: &Headers) -> Option<SpanContext> {
        extract(&PREFIXED_KEYS, |key| {
            headers
                .get(key)
                .or_else(|| key.strip_prefix("HTTP_").and_then(|bare| headers.get(bare)))
                .map(String::as_str)
        })
    }
}

fn inject(keys: &Keys, context: &SpanContext, headers: &mut Headers) {
    headers.insert(keys.span_id.to_string(), context.span_id_hex());
    headers.insert(keys.trace_id.to_string(), context.trace_id_hex());
    // A string map always serializes.
    let baggage = serde_json::to_string(&context.baggage).unwrap_or_else(|_| "{}".to_string());
    headers.insert(keys.baggage.to_string(), baggage);
    headers.insert(keys.sampled.to_string(), context.sampled.to_string());
}

fn extract<'a>(keys: &Keys, get: impl Fn(&str) -> Option<&'a str>) -> Option<SpanContext> {
    let span_id = u64::from_str_radix(get(keys.span_id)?, 16).ok()?;
    let trace_id = u64::from_str_radix(get(keys.trace_id)?, 16).ok()?;
    let baggage = match get(keys.baggage) {
        Some(raw) => serde_json::from_str(raw).ok()?,
        None => BTreeMap::new(),
    };
    let sampled = match get(keys.sampled) {
        Some(raw) => serde_json::from_str(raw).ok()?,
        None => true,
    };
    Some(SpanContext {
        trace_id,
        span_id,
        parent_span_id: None,
        sampled,
        baggage,
    })
}
