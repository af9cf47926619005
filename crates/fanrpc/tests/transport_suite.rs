//! Integration tests for calls over the channel and HTTP bindings, trace
//! propagation, supervised listeners and the blocking facade.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use fanrpc::CallArgs;
use fanrpc::ConnectionParams;
use fanrpc::Error;
use fanrpc::Runtime;
use fanrpc::RuntimeConfig;
use fanrpc::Service;
use fanrpc::ServiceBuilder;
use fanrpc::ServiceName;
use fanrpc::VersionFilter;
use fanrpc::VersionOrder;
use fanrpc::blocking::BlockingRuntime;
use fanrpc::discovery::MemoryStore;
use fanrpc::discovery::StaticDiscovery;
use fanrpc::discovery::StoreDiscovery;
use fanrpc::span::InMemoryRecorder;
use fanrpc::transport;
use fanrpc::transport::ChannelBinding;
use fanrpc::transport::HttpBinding;
use fanrpc::transport::HttpClient;
use fanrpc::transport::MemoryBroker;
use fanrpc::transport::Transport;
use fanrpc::transport::http::Body;
use fanrpc::transport::http::HttpRequest;
use fanrpc::transport::http::HttpResponse;
use fanrpc::transport::http::Verb;
use fanvisor::Managed;
use fanvisor::ManagedExt;
use fanvisor::State;
use fanvisor::Supervisor;
use serde_json::json;

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not reached in time");
}

fn queue(name: &str) -> ConnectionParams {
    ConnectionParams::new(ChannelBinding::NAME).with("queue", name)
}

/// A calculator whose `hang` method never returns.
fn calc_service(hung: Arc<AtomicUsize>) -> Arc<Service> {
    ServiceBuilder::new("calc")
        .method("add", |_ctx, args: CallArgs| async move {
            let a: i64 = args.parse("a")?;
            let b: i64 = args.parse("b")?;
            anyhow::Ok(json!(a + b))
        })
        .method("echo_args", |_ctx, args: CallArgs| async move {
            anyhow::Ok(json!({"args": args.args, "kwargs": args.kwargs}))
        })
        .method("fail", |_ctx, _args| async move {
            Err::<fanrpc::Value, _>(anyhow::anyhow!("insufficient funds"))
        })
        .method("trace", |ctx: fanrpc::Context, _args| async move {
            let span = ctx.span_context();
            anyhow::Ok(json!({
                "trace": span.trace_id,
                "parent": span.parent_span_id,
                "tenant": ctx.baggage("tenant"),
            }))
        })
        .method("hang", move |_ctx, _args| {
            let hung = hung.clone();
            async move {
                hung.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
                anyhow::Ok(json!(null))
            }
        })
        .build()
        .unwrap()
}

/// Runtimes sharing one coordination store and one broker.
struct Cluster {
    store: MemoryStore,
    broker: MemoryBroker,
}

impl Cluster {
    fn new() -> Self {
        fanrpc::telemetry::init_logging_with("warn");
        Self {
            store: MemoryStore::new(),
            broker: MemoryBroker::new(),
        }
    }

    async fn runtime(&self, service_name: &str, recorder: Arc<InMemoryRecorder>) -> Runtime {
        let config = RuntimeConfig {
            service_name: service_name.to_string(),
            ..RuntimeConfig::default()
        };
        let remote = StoreDiscovery::new(Arc::new(self.store.session()), config.registry.clone());
        let runtime = Runtime::builder()
            .config(config)
            .remote_discovery(Arc::new(remote))
            .recorder(recorder)
            .binding(ChannelBinding::NAME, ChannelBinding::new(Arc::new(self.broker.clone())))
            .build();
        runtime.start().await.unwrap();
        runtime
    }
}

// ============================================================================
// Channel binding
// ============================================================================

#[tokio::test]
async fn test_proxy_calls_reach_the_remote_handler() {
    let cluster = Cluster::new();
    let server = cluster.runtime("server", InMemoryRecorder::new()).await;
    server.serve(calc_service(Default::default()), queue("calc")).await.unwrap();
    let client = cluster.runtime("client", InMemoryRecorder::new()).await;

    let args = CallArgs::new().arg(1).arg("two").kwarg("flag", true);
    let reply = client.call("calc.echo_args", args).await.unwrap();
    assert_eq!(reply, json!({"args": [1, "two"], "kwargs": {"flag": true}}));

    let sum = client.call("calc.add", CallArgs::new().kwarg("a", 2).kwarg("b", 40)).await.unwrap();
    assert_eq!(sum, json!(42));

    let proxy = client.discovery().local().find_endpoint(&ServiceName::parse("calc").unwrap()).unwrap();
    assert_eq!(proxy.kind_name(), "proxy");
}

#[tokio::test]
async fn test_concurrent_calls_are_correlated() {
    let cluster = Cluster::new();
    let server = cluster.runtime("server", InMemoryRecorder::new()).await;
    server.serve(calc_service(Default::default()), queue("calc")).await.unwrap();
    let client = cluster.runtime("client", InMemoryRecorder::new()).await;
    client.call("calc.add", CallArgs::new().kwarg("a", 0).kwarg("b", 0)).await.unwrap();

    let calls = (0..16).map(|i| {
        let client = client.clone();
        tokio::spawn(async move { client.call("calc.add", CallArgs::new().kwarg("a", i).kwarg("b", 1000)).await })
    });
    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().unwrap(), json!(i as i64 + 1000));
    }
}

#[tokio::test]
async fn test_handler_failures_come_back_as_remote_errors() {
    let cluster = Cluster::new();
    let server = cluster.runtime("server", InMemoryRecorder::new()).await;
    server.serve(calc_service(Default::default()), queue("calc")).await.unwrap();
    let recorder = InMemoryRecorder::new();
    let client = cluster.runtime("client", recorder.clone()).await;

    let err = client.call("calc.fail", CallArgs::new()).await.unwrap_err();
    match err {
        Error::Transport(transport::Error::Remote(message)) => assert!(message.contains("insufficient funds")),
        other => panic!("unexpected error: {}", other),
    }

    let missing = client.call("calc.nope", CallArgs::new()).await.unwrap_err();
    match missing {
        Error::Transport(transport::Error::Remote(message)) => assert!(message.contains("nope")),
        other => panic!("unexpected error: {}", other),
    }

    let span = &recorder.by_operation("calc.fail")[0];
    assert_eq!(span.tags["error"], json!(true));
}

#[tokio::test]
async fn test_closing_the_back_route_fails_every_outstanding_call() {
    let cluster = Cluster::new();
    let hung = Arc::new(AtomicUsize::new(0));
    let server = cluster.runtime("server", InMemoryRecorder::new()).await;
    server.serve(calc_service(hung.clone()), queue("calc")).await.unwrap();
    let client = cluster.runtime("client", InMemoryRecorder::new()).await;

    // Materialize the proxy before the calls race for it.
    client.call("calc.add", CallArgs::new().kwarg("a", 1).kwarg("b", 1)).await.unwrap();
    let proxy = client.discovery().local().find_endpoint(&ServiceName::parse("calc").unwrap()).unwrap();

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.call("calc.hang", CallArgs::new()).await })
        })
        .collect();
    eventually(|| hung.load(Ordering::SeqCst) == 3).await;

    let routes: Vec<String> = cluster
        .broker
        .channels()
        .into_iter()
        .filter(|c| c.starts_with("calc.back."))
        .collect();
    assert_eq!(routes.len(), 1);
    cluster.broker.close_channel(&routes[0]);

    let mut causes = Vec::new();
    for call in calls {
        match call.await.unwrap() {
            Err(Error::Transport(cause)) => causes.push(cause),
            other => panic!("unexpected outcome: {:?}", other.map_err(|e| e.to_string())),
        }
    }
    let expected = transport::Error::Disconnected(format!("channel '{}' closed", routes[0]));
    assert!(causes.iter().all(|c| *c == expected));

    eventually(|| proxy.state() == State::Terminated).await;
    assert!(proxy.transport().unwrap().termination().is_terminated());
}

#[tokio::test]
async fn test_publishing_to_nobody_is_unacknowledged() {
    let broker = MemoryBroker::new();
    let registry = StaticDiscovery::from_json(
        &json!({"proxy_endpoints": [{"endpoint": "ghost", "transport": "channel", "params": {"queue": "ghost"}}]}),
        VersionOrder::Semantic,
    )
    .unwrap();
    let runtime = Runtime::builder()
        .remote_discovery(Arc::new(registry))
        .binding(ChannelBinding::NAME, ChannelBinding::new(Arc::new(broker)))
        .build();

    let err = runtime.call("ghost.ping", CallArgs::new()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Transport(transport::Error::Unacknowledged {
            delivered: 0,
            required: 1
        })
    ));
}

// ============================================================================
// Tracing
// ============================================================================

#[tokio::test]
async fn test_sequential_calls_share_the_request_trace() {
    let recorder = InMemoryRecorder::new();
    let runtime = Runtime::builder().recorder(recorder.clone()).build();
    runtime.register_local(calc_service(Default::default())).await.unwrap();

    let request = runtime.root_context("request");
    let root = request.span_context();
    request
        .scope(|ctx| async move {
            ctx.call("calc.add", CallArgs::new().kwarg("a", 1).kwarg("b", 2)).await?;
            ctx.rpc().at("calc").call("add", CallArgs::new().kwarg("a", 3).kwarg("b", 4)).await
        })
        .await
        .unwrap();

    let children = recorder.by_operation("calc.add");
    assert_eq!(children.len(), 2);
    for child in &children {
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id, Some(root.span_id));
        assert_eq!(child.service, RuntimeConfig::default().service_name);
    }
    assert_ne!(children[0].span_id, children[1].span_id);
    assert_eq!(recorder.by_operation("request").len(), 1);
}

#[tokio::test]
async fn test_trace_and_baggage_cross_the_wire() {
    let cluster = Cluster::new();
    let server_spans = InMemoryRecorder::new();
    let client_spans = InMemoryRecorder::new();
    let server = cluster.runtime("server", server_spans.clone()).await;
    server.serve(calc_service(Default::default()), queue("calc")).await.unwrap();
    let client = cluster.runtime("client", client_spans.clone()).await;

    let request = client.root_context("request");
    request.set_baggage("tenant", "acme");
    let root = request.span_context();
    let reply = request
        .scope(|ctx| async move { ctx.call("calc.trace", CallArgs::new()).await })
        .await
        .unwrap();

    let outbound = &client_spans.by_operation("calc.trace")[0];
    assert_eq!(outbound.parent_span_id, Some(root.span_id));
    assert_eq!(reply["trace"], json!(root.trace_id));
    assert_eq!(reply["parent"], json!(outbound.span_id));
    assert_eq!(reply["tenant"], json!("acme"));

    let inbound = &server_spans.by_operation("calc.trace")[0];
    assert_eq!(inbound.trace_id, root.trace_id);
    assert_eq!(inbound.parent_span_id, Some(outbound.span_id));
    assert_eq!(inbound.service, "server");
}

// ============================================================================
// HTTP binding
// ============================================================================

/// Records requests and answers with canned responses, 500 once they run out.
#[derive(Default)]
struct CannedClient {
    requests: Mutex<Vec<HttpRequest>>,
    responses: Mutex<VecDeque<HttpResponse>>,
}

impl CannedClient {
    fn respond(&self, status: u16, body: &str) {
        self.responses.lock().unwrap().push_back(HttpResponse {
            status,
            body: body.as_bytes().to_vec(),
        });
    }

    fn last_request(&self) -> HttpRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl HttpClient for CannedClient {
    async fn send(&self, request: HttpRequest) -> transport::Result<HttpResponse> {
        self.requests.lock().unwrap().push(request);
        Ok(self.responses.lock().unwrap().pop_front().unwrap_or(HttpResponse {
            status: 500,
            body: b"no canned response".to_vec(),
        }))
    }
}

fn http_runtime(client: Arc<CannedClient>, recorder: Arc<InMemoryRecorder>) -> Runtime {
    let registry = StaticDiscovery::from_json(
        &json!({"proxy_endpoints": [{
            "endpoint": "users",
            "transport": "http",
            "params": {
                "host": "users.internal",
                "port": 8080,
                "methods": [
                    {"name": "get", "url": "/users/{id}", "verb": "GET"},
                    {"name": "create", "url": "/users", "verb": "POST"},
                    {"name": "upload", "url": "/users/{id}/avatar", "method": "post", "content_type": "multipart/form-data"},
                    {"name": "remove", "url": "/users/{id}", "verb": "DELETE"}
                ]
            }
        }]}),
        VersionOrder::Semantic,
    )
    .unwrap();
    Runtime::builder()
        .remote_discovery(Arc::new(registry))
        .recorder(recorder)
        .binding(HttpBinding::NAME, HttpBinding::new(client))
        .build()
}

#[tokio::test]
async fn test_http_get_fills_the_url_and_sends_a_query() {
    let client = Arc::new(CannedClient::default());
    let recorder = InMemoryRecorder::new();
    let runtime = http_runtime(client.clone(), recorder.clone());
    client.respond(200, r#"{"id": 7, "name": "ada"}"#);

    let args = CallArgs::new().kwarg("id", 7).kwarg("fields", json!(["name", "email"]));
    let user = runtime.call("users.get", args).await.unwrap();
    assert_eq!(user, json!({"id": 7, "name": "ada"}));

    let request = client.last_request();
    assert_eq!(request.verb, Verb::Get);
    assert_eq!(request.url, "http://users.internal:8080/users/7");
    assert!(request.query.contains(&("fields".to_string(), "name,email".to_string())));
    assert!(request.query.contains(&("id".to_string(), "7".to_string())));
    assert_eq!(request.body, Body::Empty);

    let span = &recorder.by_operation("users.get")[0];
    assert_eq!(request.headers["ot-span-id"], format!("{:x}", span.span_id));
    assert_eq!(request.headers["ot-trace-id"], format!("{:x}", span.trace_id));
}

#[tokio::test]
async fn test_http_bodies_follow_the_route() {
    let client = Arc::new(CannedClient::default());
    let runtime = http_runtime(client.clone(), InMemoryRecorder::new());

    client.respond(201, r#"{"id": 8}"#);
    let created = runtime.call("users.create", CallArgs::new().kwarg("name", "bob")).await.unwrap();
    assert_eq!(created, json!({"id": 8}));
    let request = client.last_request();
    assert_eq!(request.verb, Verb::Post);
    assert_eq!(request.url, "http://users.internal:8080/users");
    assert_eq!(request.body, Body::Json(json!({"name": "bob"})));

    client.respond(200, "true");
    let args = CallArgs::new().kwarg("id", 8).kwarg("file", "avatar.png");
    runtime.call("users.upload", args).await.unwrap();
    let request = client.last_request();
    assert_eq!(request.verb, Verb::Post);
    assert_eq!(request.url, "http://users.internal:8080/users/8/avatar");
    assert_eq!(
        request.body,
        Body::Form(vec![
            ("file".to_string(), "avatar.png".to_string()),
            ("id".to_string(), "8".to_string())
        ])
    );

    client.respond(204, "");
    let removed = runtime.call("users.remove", CallArgs::new().kwarg("id", 8)).await.unwrap();
    assert_eq!(removed, json!(true));
    assert_eq!(client.last_request().verb, Verb::Delete);
}

#[tokio::test]
async fn test_http_failures_are_structured() {
    let client = Arc::new(CannedClient::default());
    let recorder = InMemoryRecorder::new();
    let runtime = http_runtime(client.clone(), recorder.clone());

    client.respond(404, "no such user");
    let err = runtime.call("users.get", CallArgs::new().kwarg("id", 1)).await.unwrap_err();
    match err {
        Error::Transport(transport::Error::Status { status, body }) => {
            assert_eq!(status, 404);
            assert_eq!(body, "no such user");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(recorder.by_operation("users.get")[0].tags["error"], json!(true));

    let sent = client.request_count();
    let err = runtime.call("users.get", CallArgs::new().arg(1)).await.unwrap_err();
    assert!(matches!(err, Error::Transport(transport::Error::Encode(_))));

    let err = runtime.call("users.get", CallArgs::new()).await.unwrap_err();
    assert!(matches!(err, Error::Transport(transport::Error::Encode(_))));

    let err = runtime.call("users.ping", CallArgs::new()).await.unwrap_err();
    assert!(matches!(err, Error::Transport(transport::Error::UnknownMethod(ref m)) if m == "ping"));
    assert_eq!(client.request_count(), sent);
}

#[tokio::test]
async fn test_version_filters_reach_the_registry() {
    let client = Arc::new(CannedClient::default());
    let runtime = http_runtime(client.clone(), InMemoryRecorder::new());
    let ctx = runtime.root_context("request");
    ctx.enter();

    let err = ctx
        .rpc()
        .at("users")
        .version(VersionFilter::Exact("2.0.0".into()))
        .call("get", CallArgs::new().kwarg("id", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoSuchEndpoint(ref name) if name == "users"));
    assert_eq!(client.request_count(), 0);
}

// ============================================================================
// Supervised listeners
// ============================================================================

#[tokio::test]
async fn test_a_dead_listener_is_restarted_by_its_supervisor() {
    let cluster = Cluster::new();
    let server = cluster.runtime("server", InMemoryRecorder::new()).await;
    let spec = server.serve_spec(calc_service(Default::default()), queue("calc"));
    let supervisor = Supervisor::new("listeners", vec![spec]);
    supervisor.start().await.unwrap();
    assert_eq!(supervisor.len(), 1);
    let first = supervisor.children()[0].lifecycle().id();

    let client = cluster.runtime("client", InMemoryRecorder::new()).await;
    let sum = client.call("calc.add", CallArgs::new().kwarg("a", 1).kwarg("b", 2)).await.unwrap();
    assert_eq!(sum, json!(3));

    // Killing the listener's queue kills its transport, then the endpoint.
    cluster.broker.close_channel("calc");
    eventually(|| {
        supervisor.children().first().is_some_and(|child| {
            child.lifecycle().id() != first && child.lifecycle().state() == State::Running
        })
    })
    .await;
    assert_eq!(cluster.broker.subscriber_count("calc"), 1);

    let sum = client.call("calc.add", CallArgs::new().kwarg("a", 5).kwarg("b", 5)).await.unwrap();
    assert_eq!(sum, json!(10));

    supervisor.terminate(fanvisor::Reason::Shutdown).await;
    assert_eq!(supervisor.state(), State::Terminated);
    eventually(|| cluster.broker.subscriber_count("calc") == 0).await;
}

#[tokio::test]
async fn test_shutdown_stops_supervised_listeners_for_good() {
    let cluster = Cluster::new();
    let server = cluster.runtime("server", InMemoryRecorder::new()).await;
    let spec = server.serve_spec(calc_service(Default::default()), queue("calc"));
    let supervisor = Supervisor::new("listeners", vec![spec]);
    supervisor.start().await.unwrap();
    assert_eq!(cluster.broker.subscriber_count("calc"), 1);
    assert!(cluster.store.exists("/endpoints/calc/1.0.0/config_0000000000"));

    server.shutdown().await.unwrap();

    eventually(|| cluster.broker.subscriber_count("calc") == 0).await;
    assert_eq!(supervisor.len(), 0);
    assert_eq!(supervisor.state(), State::Running);
    assert!(server.discovery().local().is_empty());
    assert!(!cluster.store.exists("/endpoints/calc/1.0.0/config_0000000000"));
}

#[tokio::test]
async fn test_shutdown_releases_back_routes() {
    let cluster = Cluster::new();
    let server = cluster.runtime("server", InMemoryRecorder::new()).await;
    server.serve(calc_service(Default::default()), queue("calc")).await.unwrap();
    let client = cluster.runtime("client", InMemoryRecorder::new()).await;
    client.call("calc.add", CallArgs::new().kwarg("a", 1).kwarg("b", 1)).await.unwrap();
    let back_routes = || cluster.broker.channels().into_iter().filter(|c| c.starts_with("calc.back.")).count();
    assert_eq!(back_routes(), 1);

    client.shutdown().await.unwrap();
    eventually(|| back_routes() == 0).await;
    assert_eq!(cluster.broker.channels(), vec!["calc".to_string()]);
}

// ============================================================================
// Blocking facade
// ============================================================================

#[test]
fn test_blocking_runtime_performs_a_call() {
    let recorder = InMemoryRecorder::new();
    let blocking = BlockingRuntime::new(Runtime::builder().recorder(recorder.clone())).unwrap();
    blocking.start().unwrap();
    blocking.register_local(calc_service(Default::default())).unwrap();

    let sum = blocking.call("calc.add", CallArgs::new().kwarg("a", 20).kwarg("b", 22)).unwrap();
    assert_eq!(sum, json!(42));
    assert_eq!(recorder.by_operation("calc.add").len(), 1);

    let err = blocking.call("calc.add", CallArgs::new().kwarg("a", "x")).unwrap_err();
    assert!(matches!(err, Error::Handler(_)));

    blocking.shutdown().unwrap();
}
