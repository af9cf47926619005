//! Unit tests for names, versions, propagation, envelopes, correlation and
//! the in-memory store.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use crate::CallArgs;
use crate::Error;
use crate::Runtime;
use crate::RuntimeConfig;
use crate::ServiceBuilder;
use crate::ServiceName;
use crate::SpanContext;
use crate::VersionFilter;
use crate::VersionOrder;
use crate::discovery;
use crate::discovery::CoordinationStore;
use crate::discovery::CreateMode;
use crate::discovery::MemoryStore;
use crate::discovery::RemoteDiscovery;
use crate::discovery::StaticDiscovery;
use crate::discovery::is_valid_version;
use crate::propagation::HeaderMapper;
use crate::propagation::Headers;
use crate::propagation::OtHeaders;
use crate::propagation::PrefixedOtHeaders;
use crate::span::InMemoryRecorder;
use crate::transport;
use crate::transport::envelope::Envelope;
use crate::transport::envelope::Response;
use crate::transport::http::HttpResponse;
use crate::transport::http::decode_response;
use crate::transport::pending::PendingCalls;

fn sample_context() -> SpanContext {
    let mut baggage = BTreeMap::new();
    baggage.insert("user".to_string(), "alice".to_string());
    SpanContext {
        trace_id: 0xdead_beef,
        span_id: 0x1234_abcd,
        parent_span_id: None,
        sampled: false,
        baggage,
    }
}

// ============================================================================
// Names and versions
// ============================================================================

#[test]
fn test_service_names_parse_and_render() {
    let name = ServiceName::parse("billing.invoices").unwrap();
    assert_eq!(name.segments(), ["billing", "invoices"]);
    assert_eq!(name.as_path(), "billing/invoices");
    assert_eq!(name.to_string(), "billing.invoices");
    assert_eq!("billing.invoices".parse::<ServiceName>().unwrap(), name);
}

#[test]
fn test_empty_names_and_segments_are_rejected() {
    assert!(matches!(ServiceName::parse(""), Err(Error::InvalidName(_))));
    assert!(matches!(ServiceName::parse("a..b"), Err(Error::InvalidName(_))));
    assert!(matches!(ServiceName::parse("a/b"), Err(Error::InvalidName(_))));
    assert!(ServiceName::from_segments(Vec::<String>::new()).is_err());
}

#[test]
fn test_split_method_takes_the_last_segment() {
    let (service, method) = ServiceName::split_method("a.b.create").unwrap();
    assert_eq!(service.to_string(), "a.b");
    assert_eq!(method, "create");

    assert!(ServiceName::split_method("nomethod").is_err());
    assert!(ServiceName::split_method("svc.").is_err());
}

#[test]
fn test_version_syntax() {
    assert!(is_valid_version("1"));
    assert!(is_valid_version("1.4.2"));
    assert!(!is_valid_version(""));
    assert!(!is_valid_version("1."));
    assert!(!is_valid_version("1.x"));
    assert!(!is_valid_version("latest"));
}

#[test]
fn test_version_filters_match_segment_wise() {
    assert!(VersionFilter::Any.matches("3.1"));
    assert!(VersionFilter::Exact("1.0.0".into()).matches("1.0.0"));
    assert!(!VersionFilter::Exact("1.0.0".into()).matches("1.0.1"));
    assert!(VersionFilter::Prefix("1".into()).matches("1.4.2"));
    assert!(VersionFilter::Prefix("1.4".into()).matches("1.4.2"));
    assert!(!VersionFilter::Prefix("1".into()).matches("10.0"));
    assert!(!VersionFilter::Prefix("1.4.2.0".into()).matches("1.4.2"));
}

#[test]
fn test_latest_version_ignores_non_versions() {
    let versions = ["1.0.0", "1.2.0", "barrier", "2.0.0", "latest"];
    let latest = VersionOrder::Semantic.latest(versions, &VersionFilter::Any);
    assert_eq!(latest, Some("2.0.0"));

    let latest = VersionOrder::Semantic.latest(versions, &VersionFilter::Prefix("1".into()));
    assert_eq!(latest, Some("1.2.0"));

    assert_eq!(VersionOrder::Semantic.latest(["barrier"], &VersionFilter::Any), None);
}

#[test]
fn test_semantic_and_lexicographic_orders_disagree_on_wide_numbers() {
    let versions = ["2.0.0", "10.0.0"];
    assert_eq!(VersionOrder::Semantic.latest(versions, &VersionFilter::Any), Some("10.0.0"));
    assert_eq!(VersionOrder::Lexicographic.latest(versions, &VersionFilter::Any), Some("2.0.0"));
    assert_eq!(VersionOrder::default(), VersionOrder::Lexicographic);
}

#[test]
fn test_semantic_order_handles_segments_wider_than_u64() {
    let huge = "1.99999999999999999999999";
    let small = "1.18446744073709551615";
    assert_eq!(VersionOrder::Semantic.compare(huge, small), std::cmp::Ordering::Greater);
    assert_eq!(VersionOrder::Semantic.compare("1.010", "1.9"), std::cmp::Ordering::Greater);
    assert_eq!(VersionOrder::Semantic.compare("1.0", "1.0.0"), std::cmp::Ordering::Less);
    assert_eq!(VersionOrder::Semantic.latest([huge, small, "0.1"], &VersionFilter::Any), Some(huge));
}

#[test]
fn test_version_order_parses_case_insensitively() {
    assert_eq!("Semantic".parse::<VersionOrder>().unwrap(), VersionOrder::Semantic);
    assert_eq!("lexicographic".parse::<VersionOrder>().unwrap(), VersionOrder::Lexicographic);
    assert!("alphabetic".parse::<VersionOrder>().is_err());
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_config_defaults() {
    let config = RuntimeConfig::default();
    assert_eq!(config.registry.root, "/endpoints");
    assert!(config.registry.use_barrier);
    assert_eq!(config.registry.version_order, VersionOrder::Lexicographic);
    assert_eq!(config.publish_min_subscribers, 1);
}

#[test]
fn test_config_overlays_lookup_values() {
    let vars: BTreeMap<&str, &str> = [
        ("FAN_SERVICE_NAME", "billing"),
        ("FAN_REGISTRY_ROOT", "/services"),
        ("FAN_PUBLISH_MIN_SUBSCRIBERS", "0"),
        ("FAN_VERSION_ORDER", "semantic"),
        ("FAN_REGISTRY_BARRIER", "off"),
    ]
    .into_iter()
    .collect();
    let config = RuntimeConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

    assert_eq!(config.service_name, "billing");
    assert_eq!(config.registry.root, "/services");
    assert_eq!(config.publish_min_subscribers, 0);
    assert_eq!(config.registry.version_order, VersionOrder::Semantic);
    assert!(!config.registry.use_barrier);
}

#[test]
fn test_config_rejects_malformed_values() {
    let bad_number = RuntimeConfig::from_lookup(|key| {
        (key == "FAN_PUBLISH_MIN_SUBSCRIBERS").then(|| "many".to_string())
    });
    assert!(matches!(bad_number, Err(Error::Config(_))));

    let relative_root = RuntimeConfig::from_lookup(|key| (key == "FAN_REGISTRY_ROOT").then(|| "endpoints".to_string()));
    assert!(matches!(relative_root, Err(Error::Config(_))));
}

#[test]
fn test_config_deserializes_with_defaults() {
    let config: RuntimeConfig = serde_json::from_value(json!({
        "service_name": "gateway",
        "registry": {"version_order": "semantic"}
    }))
    .unwrap();
    assert_eq!(config.service_name, "gateway");
    assert_eq!(config.registry.root, "/endpoints");
    assert_eq!(config.registry.version_order, VersionOrder::Semantic);
    assert_eq!(config.publish_min_subscribers, 1);
}

#[test]
fn test_logging_installs_once() {
    crate::telemetry::init_logging_with("warn");
    assert!(!crate::telemetry::init_logging());
}

// ============================================================================
// Header propagation
// ============================================================================

#[test]
fn test_ot_headers_round_trip() {
    let context = sample_context();
    let mut headers = Headers::new();
    OtHeaders.inject(&context, &mut headers);

    assert_eq!(headers["ot-span-id"], "1234abcd");
    assert_eq!(headers["ot-trace-id"], "deadbeef");
    assert_eq!(headers["ot-sampled"], "false");
    assert_eq!(OtHeaders.extract(&headers), Some(context));
}

#[test]
fn test_prefixed_headers_accept_bare_keys() {
    let context = sample_context();
    let mut headers = Headers::new();
    PrefixedOtHeaders.inject(&context, &mut headers);
    assert!(headers.contains_key("HTTP_OT_SPAN_ID"));
    assert_eq!(PrefixedOtHeaders.extract(&headers), Some(context.clone()));

    let bare: Headers = headers
        .into_iter()
        .map(|(k, v)| (k.trim_start_matches("HTTP_").to_string(), v))
        .collect();
    assert_eq!(PrefixedOtHeaders.extract(&bare), Some(context));
}

#[test]
fn test_missing_optional_headers_take_defaults() {
    let mut headers = Headers::new();
    headers.insert("ot-span-id".into(), "a".into());
    headers.insert("ot-trace-id".into(), "b".into());

    let context = OtHeaders.extract(&headers).unwrap();
    assert_eq!(context.span_id, 0xa);
    assert_eq!(context.trace_id, 0xb);
    assert!(context.sampled);
    assert!(context.baggage.is_empty());
}

#[test]
fn test_garbled_headers_start_a_new_trace() {
    let mut headers = Headers::new();
    assert_eq!(OtHeaders.extract(&headers), None);

    headers.insert("ot-span-id".into(), "not-hex".into());
    headers.insert("ot-trace-id".into(), "b".into());
    assert_eq!(OtHeaders.extract(&headers), None);

    headers.insert("ot-span-id".into(), "a".into());
    headers.insert("ot-baggage".into(), "{broken".into());
    assert_eq!(OtHeaders.extract(&headers), None);
}

// ============================================================================
// Envelope
// ============================================================================

#[test]
fn test_envelope_uses_span_id_as_correlation_key() {
    let context = sample_context();
    let args = CallArgs::new().arg(1).kwarg("amount", 10);
    let call = Envelope::call(&context, "charge", args, Some("back".into()), "1234abcd");

    assert_eq!(call.correlation_id, None);
    assert_eq!(call.correlation_key(), "1234abcd");

    let wire: serde_json::Value = serde_json::from_slice(&call.encode().unwrap()).unwrap();
    assert_eq!(wire["context_headers"]["span_id"], "1234abcd");
    assert_eq!(wire["context_headers"]["baggage"]["user"], "alice");
    assert_eq!(wire["method"], "charge");
    assert_eq!(wire["args"], json!([1]));
    assert_eq!(wire["kwargs"], json!({"amount": 10}));
    assert_eq!(wire["back_route"], "back");
    assert!(wire.get("response").is_none());
    assert!(wire.get("correlation_id").is_none());
}

#[test]
fn test_envelope_carries_a_suffixed_key_after_collision() {
    let context = sample_context();
    let call = Envelope::call(&context, "charge", CallArgs::new(), None, "1234abcd-ff");
    assert_eq!(call.correlation_key(), "1234abcd-ff");

    let reply = call.reply(Response::Ok(json!(5)));
    assert_eq!(reply.correlation_key(), "1234abcd-ff");
    assert_eq!(reply.back_route, None);

    let decoded = Envelope::decode(&reply.encode().unwrap()).unwrap();
    assert_eq!(decoded.response, Some(Response::Ok(json!(5))));
}

#[test]
fn test_envelope_response_shapes() {
    let ok = serde_json::to_value(Response::Ok(json!({"id": 1}))).unwrap();
    assert_eq!(ok, json!({"ok": {"id": 1}}));
    let err = serde_json::to_value(Response::Error("boom".into())).unwrap();
    assert_eq!(err, json!({"error": "boom"}));
}

#[test]
fn test_envelope_rejects_garbage() {
    assert!(matches!(Envelope::decode(b"not json"), Err(transport::Error::Decode(_))));

    let bad_ids = json!({
        "context_headers": {"span_id": "zz", "trace_id": "1"},
        "method": "m"
    });
    let envelope = Envelope::decode(bad_ids.to_string().as_bytes()).unwrap();
    assert!(envelope.context_headers.to_span_context().is_err());
}

// ============================================================================
// Pending calls
// ============================================================================

#[tokio::test]
async fn test_pending_slot_resolves_once() {
    let pending = PendingCalls::new();
    let slot = pending.register("abc").unwrap();
    assert_eq!(slot.key(), "abc");

    assert!(pending.resolve("abc", Ok(json!("pong"))));
    assert!(!pending.resolve("abc", Ok(json!("again"))));
    assert_eq!(slot.wait().await.unwrap(), json!("pong"));
    assert!(pending.is_empty());
}

#[tokio::test]
async fn test_colliding_keys_get_a_suffix() {
    let pending = PendingCalls::new();
    let first = pending.register("abc").unwrap();
    let second = pending.register("abc").unwrap();

    assert_eq!(first.key(), "abc");
    assert_ne!(second.key(), "abc");
    assert!(second.key().starts_with("abc-"));
    assert_eq!(pending.len(), 2);

    assert!(pending.resolve(second.key(), Ok(json!(2))));
    assert_eq!(second.wait().await.unwrap(), json!(2));
    drop(first);
}

#[tokio::test]
async fn test_fail_all_reaches_every_waiter_and_blocks_new_calls() {
    let pending = PendingCalls::new();
    let a = pending.register("a").unwrap();
    let b = pending.register("b").unwrap();

    let cause = transport::Error::Disconnected("gone".into());
    assert_eq!(pending.fail_all(cause.clone()), 2);

    assert_eq!(a.wait().await.unwrap_err(), cause);
    assert_eq!(b.wait().await.unwrap_err(), cause);
    assert_eq!(pending.register("c").err(), Some(cause));
}

#[test]
fn test_dropped_slot_removes_itself() {
    let pending = PendingCalls::new();
    let slot = pending.register("abc").unwrap();
    assert_eq!(pending.len(), 1);
    drop(slot);
    assert!(pending.is_empty());
    assert!(!pending.resolve("abc", Ok(json!(null))));
}

// ============================================================================
// HTTP responses
// ============================================================================

#[test]
fn test_http_statuses_map_to_results() {
    let ok = decode_response(HttpResponse {
        status: 200,
        body: br#"{"id": 7}"#.to_vec(),
    });
    assert_eq!(ok.unwrap(), json!({"id": 7}));

    let created = decode_response(HttpResponse {
        status: 201,
        body: b"[1,2]".to_vec(),
    });
    assert_eq!(created.unwrap(), json!([1, 2]));

    let empty = decode_response(HttpResponse {
        status: 204,
        body: Vec::new(),
    });
    assert_eq!(empty.unwrap(), json!(true));

    let missing = decode_response(HttpResponse {
        status: 404,
        body: b"no such user".to_vec(),
    });
    assert_eq!(
        missing.unwrap_err(),
        transport::Error::Status {
            status: 404,
            body: "no such user".into()
        }
    );
}

#[test]
fn test_http_200_with_invalid_json_is_a_decode_error() {
    let result = decode_response(HttpResponse {
        status: 200,
        body: b"<html>".to_vec(),
    });
    assert!(matches!(result, Err(transport::Error::Decode(_))));
}

// ============================================================================
// In-memory broker
// ============================================================================

#[tokio::test]
async fn test_dropping_the_last_subscription_removes_the_channel() {
    use crate::transport::Broker;
    use crate::transport::MemoryBroker;
    use crate::transport::Publisher;

    let broker = MemoryBroker::new();
    let first = broker.subscribe("svc.back.01").await.unwrap();
    let second = broker.subscribe("svc.back.01").await.unwrap();
    let publisher = broker.publisher().await.unwrap();
    assert_eq!(publisher.publish("svc.back.01", b"hi".to_vec()).await.unwrap(), 2);

    drop(first);
    assert_eq!(broker.channels(), vec!["svc.back.01".to_string()]);
    assert_eq!(broker.subscriber_count("svc.back.01"), 1);

    drop(second);
    assert!(broker.channels().is_empty());
    assert_eq!(publisher.publish("svc.back.01", b"hi".to_vec()).await.unwrap(), 0);
}

// ============================================================================
// In-memory coordination store
// ============================================================================

#[tokio::test]
async fn test_store_requires_a_connection() {
    let store = MemoryStore::new();
    let result = store.create("/a", Vec::new(), CreateMode::Persistent).await;
    assert_eq!(result, Err(discovery::Error::NotConnected));
}

#[tokio::test]
async fn test_sequential_nodes_are_numbered_per_parent() {
    let store = MemoryStore::new();
    store.connect().await.unwrap();
    store.ensure_path("/endpoints/a/1.0.0").await.unwrap();
    store.ensure_path("/endpoints/b/1.0.0").await.unwrap();

    let first = store
        .create("/endpoints/a/1.0.0/config_", b"1".to_vec(), CreateMode::EphemeralSequential)
        .await
        .unwrap();
    let second = store
        .create("/endpoints/a/1.0.0/config_", b"2".to_vec(), CreateMode::EphemeralSequential)
        .await
        .unwrap();
    let other = store
        .create("/endpoints/b/1.0.0/config_", Vec::new(), CreateMode::EphemeralSequential)
        .await
        .unwrap();

    assert_eq!(first, "/endpoints/a/1.0.0/config_0000000000");
    assert_eq!(second, "/endpoints/a/1.0.0/config_0000000001");
    assert_eq!(other, "/endpoints/b/1.0.0/config_0000000000");
    assert_eq!(store.get(&second).await.unwrap(), Some(b"2".to_vec()));

    let mut children = store.children("/endpoints/a/1.0.0").await.unwrap().unwrap();
    children.sort();
    assert_eq!(children, ["config_0000000000", "config_0000000001"]);
    assert_eq!(store.children("/endpoints/missing").await.unwrap(), None);
}

#[tokio::test]
async fn test_closing_a_session_removes_only_its_ephemeral_nodes() {
    let store = MemoryStore::new();
    let other = store.session();
    store.connect().await.unwrap();
    other.connect().await.unwrap();

    store.ensure_path("/svc").await.unwrap();
    store.create("/svc/mine", Vec::new(), CreateMode::Ephemeral).await.unwrap();
    other.create("/svc/theirs", Vec::new(), CreateMode::Ephemeral).await.unwrap();

    let mut events = other.events();
    store.close().await.unwrap();

    assert!(!store.exists("/svc/mine"));
    assert!(store.exists("/svc/theirs"));
    assert!(store.exists("/svc"));
    assert_eq!(events.recv().await.unwrap(), discovery::NodeEvent::Deleted("/svc/mine".into()));
}

#[tokio::test]
async fn test_ensure_path_is_idempotent_and_delete_refuses_parents() {
    let store = MemoryStore::new();
    store.connect().await.unwrap();
    store.ensure_path("/a/b/c").await.unwrap();
    store.ensure_path("/a/b/c").await.unwrap();

    assert!(matches!(store.delete("/a/b").await, Err(discovery::Error::Store(_))));
    store.delete("/a/b/c").await.unwrap();
    store.delete("/a/b").await.unwrap();
    assert_eq!(store.delete("/a/b").await, Err(discovery::Error::NoNode("/a/b".into())));
}

#[tokio::test]
async fn test_lagging_watcher_fires_every_watch() {
    use std::sync::Mutex;

    use dashmap::DashMap;
    use tokio::sync::broadcast;

    use crate::discovery::NodeEvent;
    use crate::discovery::WatchId;
    use crate::discovery::store::Watch;
    use crate::discovery::store::dispatch_events;

    let (tx, rx) = broadcast::channel(2);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let watches = Arc::new(DashMap::new());
    let sink = seen.clone();
    watches.insert(
        WatchId(1),
        Watch {
            path: "/endpoints/billing".to_string(),
            callback: Arc::new(move |event: &NodeEvent| sink.lock().unwrap().push(event.clone())),
        },
    );

    for i in 0..5 {
        tx.send(NodeEvent::Created(format!("/endpoints/other/{}", i))).unwrap();
    }
    drop(tx);
    dispatch_events(rx, watches).await;

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, vec![NodeEvent::DataChanged("/endpoints/billing".to_string())]);
}

// ============================================================================
// Static registry
// ============================================================================

#[tokio::test]
async fn test_static_registry_resolves_configured_endpoints() {
    let config = json!({"proxy_endpoints": [
        {"endpoint": "billing", "transport": "http", "params": {"host": "billing", "port": 80}},
        {"endpoint": "billing", "transport": "http", "params": {"host": "billing-v2", "port": 80}, "version": "2.0.0"}
    ]});
    let registry = StaticDiscovery::from_json(&config, VersionOrder::Semantic).unwrap();
    let name = ServiceName::parse("billing").unwrap();

    let latest = registry.find_remote_endpoint(&name, &VersionFilter::Any).await.unwrap().unwrap();
    assert_eq!(latest.version, "2.0.0");
    assert_eq!(latest.params.get_str("host").unwrap(), "billing-v2");
    assert_eq!(latest.params.binding().unwrap(), "http");

    let pinned = registry
        .find_remote_endpoint(&name, &VersionFilter::Exact("1.0.0".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pinned.params.get_str("host").unwrap(), "billing");

    let unknown = ServiceName::parse("shipping").unwrap();
    assert!(registry.find_remote_endpoint(&unknown, &VersionFilter::Any).await.unwrap().is_none());
}

#[test]
fn test_static_registry_rejects_bad_records() {
    let bad_version = json!({"proxy_endpoints": [{"endpoint": "a", "transport": "http", "version": "v1"}]});
    assert!(StaticDiscovery::from_json(&bad_version, VersionOrder::Semantic).is_err());

    let bad_name = json!({"proxy_endpoints": [{"endpoint": "", "transport": "http"}]});
    assert!(StaticDiscovery::from_json(&bad_name, VersionOrder::Semantic).is_err());
}

// ============================================================================
// Services and contexts
// ============================================================================

fn runtime_with(recorder: Arc<InMemoryRecorder>) -> Runtime {
    Runtime::builder().recorder(recorder).build()
}

#[test]
fn test_services_reject_invalid_versions() {
    let result = ServiceBuilder::new("svc").version("beta").build();
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_unknown_methods_are_reported() {
    let runtime = Runtime::builder().build();
    let service = ServiceBuilder::new("svc")
        .method("ping", |_ctx, _args| async { anyhow::Ok(json!("pong")) })
        .build()
        .unwrap();
    assert!(service.has_method("ping"));

    let ctx = runtime.root_context("test");
    let err = service.dispatch(ctx, "missing", CallArgs::new()).await.unwrap_err();
    assert!(matches!(err, Error::MethodNotFound { ref method, .. } if method == "missing"));
}

#[test]
fn test_finishing_a_context_twice_exports_once() {
    let recorder = InMemoryRecorder::new();
    let runtime = runtime_with(recorder.clone());

    let ctx = runtime.root_context("request");
    ctx.enter();
    assert!(ctx.exit());
    assert!(!ctx.exit());
    assert!(!ctx.exit_with_error(&"late failure"));
    drop(ctx);

    let spans = recorder.spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].operation, "request");
    assert!(!spans[0].tags.contains_key("error"));
}

#[test]
fn test_failed_scope_tags_the_span() {
    let recorder = InMemoryRecorder::new();
    let runtime = runtime_with(recorder.clone());

    let ctx = runtime.root_context("request");
    ctx.enter();
    ctx.exit_with_error(&"boom");

    let span = &recorder.spans()[0];
    assert_eq!(span.tags["error"], json!(true));
    assert_eq!(span.tags["error.message"], json!("boom"));
}

#[test]
fn test_unentered_contexts_are_not_exported_on_drop() {
    let recorder = InMemoryRecorder::new();
    let runtime = runtime_with(recorder.clone());

    drop(runtime.root_context("never-entered"));
    assert!(recorder.spans().is_empty());

    let ctx = runtime.root_context("entered");
    ctx.enter();
    drop(ctx);
    assert_eq!(recorder.by_operation("entered").len(), 1);
}

#[test]
fn test_child_contexts_inherit_trace_and_baggage() {
    let runtime = runtime_with(InMemoryRecorder::new());
    let root = runtime.root_context("request");
    root.set_baggage("tenant", "acme");

    let child = root.create_child_context("step");
    let parent = root.span_context();
    let span = child.span_context();
    assert_eq!(span.trace_id, parent.trace_id);
    assert_eq!(span.parent_span_id, Some(parent.span_id));
    assert_ne!(span.span_id, parent.span_id);
    assert_eq!(child.baggage("tenant").as_deref(), Some("acme"));
}

#[test]
fn test_inbound_headers_continue_the_callers_trace() {
    let runtime = runtime_with(InMemoryRecorder::new());
    let caller = sample_context();
    let mut headers = Headers::new();
    OtHeaders.inject(&caller, &mut headers);

    let ctx = runtime.context_from_headers("inbound", &headers, &OtHeaders);
    let span = ctx.span_context();
    assert_eq!(span.trace_id, caller.trace_id);
    assert_eq!(span.parent_span_id, Some(caller.span_id));
    assert_eq!(span.baggage, caller.baggage);

    let fresh = runtime.context_from_headers("inbound", &Headers::new(), &OtHeaders);
    assert_eq!(fresh.span_context().parent_span_id, None);
}

#[tokio::test]
async fn test_calls_require_an_entered_context() {
    let runtime = Runtime::builder().build();
    let ctx = runtime.root_context("request");
    let err = ctx.call("svc.ping", CallArgs::new()).await.unwrap_err();
    assert!(matches!(err, Error::ContextNotEntered));
}

#[tokio::test]
async fn test_unknown_services_are_not_found() {
    let runtime = Runtime::builder().build();
    let err = runtime.call("nobody.ping", CallArgs::new()).await.unwrap_err();
    assert!(matches!(err, Error::NoSuchEndpoint(ref name) if name == "nobody"));
}

#[tokio::test]
async fn test_missing_bindings_are_reported() {
    let runtime = Runtime::builder().build();
    let name = ServiceName::parse("svc").unwrap();
    let params = crate::ConnectionParams::new("carrier-pigeon");
    let err = runtime.proxy_endpoint(&name, "1.0.0", &params).unwrap_err();
    assert!(matches!(err, Error::UnknownBinding(ref binding) if binding == "carrier-pigeon"));
}
