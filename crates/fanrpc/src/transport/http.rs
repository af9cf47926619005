//! # HTTP Transport
//!
//! One round trip per call through an `HttpClient`. Each method name maps to a
//! route in the connection parameters:
//!
//! ```json
//! {"transport": "http", "host": "users", "port": 8080,
//!  "methods": [{"name": "get", "url": "/users/{id}", "verb": "GET"}]}
//! ```
//!
//! `{key}` placeholders are filled from keyword arguments. GET and DELETE send
//! the keyword arguments as query parameters; other verbs send them as a JSON
//! body, or as a form when the route's content type is multipart.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::CallArgs;
use crate::Context;
use crate::RuntimeConfig;
use crate::propagation::HeaderMapper;
use crate::propagation::Headers;
use crate::propagation::OtHeaders;
use crate::span::SpanContext;
use crate::transport::Binding;
use crate::transport::Error;
use crate::transport::Result;
use crate::transport::Transport;
use crate::transport::TransportCore;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Verb {
    pub fn parse(verb: &str) -> Result<Self> {
        match verb.to_ascii_lowercase().as_str() {
            "get" => Ok(Self::Get),
            "post" => Ok(Self::Post),
            "put" => Ok(Self::Put),
            "patch" => Ok(Self::Patch),
            "delete" => Ok(Self::Delete),
            other => Err(Error::Params(format!("unsupported verb '{}'", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    fn sends_query(&self) -> bool {
        matches!(self, Self::Get | Self::Delete)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpRequest {
    pub verb: Verb,
    pub url: String,
    pub headers: Headers,
    pub query: Vec<(String, String)>,
    pub body: Body,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// The wire client behind `HttpTransport`.
#[async_trait::async_trait]
pub trait HttpClient: Send + Sync + 'static {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

#[derive(Clone, Debug, Deserialize)]
pub struct MethodRoute {
    pub name: String,
    pub url: String,
    #[serde(default = "default_verb", alias = "method")]
    pub verb: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

fn default_verb() -> String {
    "get".to_string()
}

#[derive(Deserialize)]
struct HttpParams {
    host: String,
    port: u16,
    #[serde(default)]
    scheme: Option<String>,
    #[serde(default)]
    methods: Vec<MethodRoute>,
}

pub struct HttpTransport {
    core: TransportCore,
    client: Arc<dyn HttpClient>,
    base_url: String,
    routes: HashMap<String, MethodRoute>,
}

impl HttpTransport {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Builds the request for `method` without sending it.
    pub fn prepare(&self, method: &str, span: &SpanContext, args: CallArgs) -> Result<HttpRequest> {
        if !args.args.is_empty() {
            return Err(Error::Encode("positional arguments cannot be sent over http".into()));
        }
        let route = self
            .routes
            .get(method)
            .ok_or_else(|| Error::UnknownMethod(method.to_string()))?;
        let verb = Verb::parse(&route.verb)?;
        let url = format!("{}{}", self.base_url, fill_template(&route.url, &args.kwargs)?);

        let mut headers = Headers::new();
        OtHeaders.inject(span, &mut headers);

        let (query, body) = if verb.sends_query() {
            (query_params(&args.kwargs), Body::Empty)
        } else if route.content_type.as_deref().is_some_and(|ct| ct.contains("multipart")) {
            (Vec::new(), Body::Form(form_fields(&args.kwargs)))
        } else {
            (Vec::new(), Body::Json(Value::Object(args.kwargs)))
        };

        Ok(HttpRequest { verb, url, headers, query, body })
    }
}

/// Maps a response to a call result: 200/201 decode the body, 204 is `true`.
pub fn decode_response(response: HttpResponse) -> Result<Value> {
    match response.status {
        200 | 201 => serde_json::from_slice(&response.body).map_err(|e| Error::Decode(e.to_string())),
        204 => Ok(Value::Bool(true)),
        status => Err(Error::Status {
            status,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        }),
    }
}

fn fill_template(template: &str, kwargs: &Map<String, Value>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            return Err(Error::Params(format!("unterminated placeholder in '{}'", template)));
        };
        let key = &rest[open + 1..open + close];
        let value = kwargs
            .get(key)
            .ok_or_else(|| Error::Encode(format!("missing url argument '{}'", key)))?;
        out.push_str(&rest[..open]);
        out.push_str(&plain(value));
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn query_params(kwargs: &Map<String, Value>) -> Vec<(String, String)> {
    kwargs
        .iter()
        .map(|(k, v)| {
            let value = match v {
                Value::Array(items) => items.iter().map(plain).collect::<Vec<_>>().join(","),
                other => plain(other),
            };
            (k.clone(), value)
        })
        .collect()
}

fn form_fields(kwargs: &Map<String, Value>) -> Vec<(String, String)> {
    kwargs.iter().map(|(k, v)| (k.clone(), plain(v))).collect()
}

/// Strings unquoted, everything else as JSON text.
fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    async fn rpc_call(&self, method: &str, ctx: &Context, args: CallArgs) -> Result<Value> {
        let request = self.prepare(method, &ctx.span_context(), args)?;
        debug!(owner = %self.core.owner(), verb = request.verb.as_str(), url = %request.url, "http call");
        let response = self.client.send(request).await?;
        let result = decode_response(response);
        if let Err(Error::Status { status, body }) = &result {
            warn!(owner = %self.core.owner(), method, status, body = %body, "http call failed");
        }
        result
    }

    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds HTTP transports over one client. Binding name: `http`.
pub struct HttpBinding {
    client: Arc<dyn HttpClient>,
}

impl HttpBinding {
    pub const NAME: &'static str = "http";

    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }
}

impl Binding for HttpBinding {
    fn build(&self, core: TransportCore, _config: &RuntimeConfig) -> Result<Arc<dyn Transport>> {
        let params: HttpParams = core.params().parse()?;
        let scheme = params.scheme.as_deref().unwrap_or("http");
        let base_url = format!("{}://{}:{}", scheme, params.host, params.port);
        let routes = params.methods.into_iter().map(|r| (r.name.clone(), r)).collect();
        let transport: Arc<HttpTransport> = Arc::new(HttpTransport {
            core,
            client: self.client.clone(),
            base_url,
            routes,
        });
        Ok(transport)
    }
}
