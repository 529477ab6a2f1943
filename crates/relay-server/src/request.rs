//! Owned view of an inbound HTTP request.
//!
//! Handler hooks run long after axum has handed the request over, so the
//! stream layer extracts everything up front into a [`StreamRequest`]:
//! method, URI, headers, the transport peer address, the raw body, and a
//! unified parameter map layered as query string, then JSON or form body.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, FromRequest, Query, Request};
use axum::http::{HeaderMap, Method, Uri, header};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::StreamError;

/// Header carrying the caller's client id on callback requests.
pub const CLIENT_ID_HEADER: &str = "x-client-id";
/// Media type of the stream response.
pub const EVENT_STREAM: &str = "text/event-stream";

/// Request state retained for the lifetime of a stream or callback.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    peer: Option<SocketAddr>,
    body: Bytes,
    params: Map<String, Value>,
}

impl StreamRequest {
    /// Build from already-extracted parts.
    ///
    /// Query parameters are parsed here; body parameters are parsed only
    /// for JSON objects. Form bodies need the async extractor path.
    pub fn from_parts(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        peer: Option<SocketAddr>,
        body: Bytes,
    ) -> Self {
        let mut params = query_params(&uri);
        if is_json(&headers) {
            merge_json_body(&mut params, &body);
        }
        Self {
            method,
            uri,
            headers,
            peer,
            body,
            params,
        }
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Raw request body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Decode the raw body as JSON.
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// All parameters: query string overlaid by JSON or form body fields.
    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Typed parameter lookup.
    ///
    /// String values that fail to deserialize directly are retried as JSON
    /// text, so `?count=3` yields `Some(3u32)`.
    pub fn param<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let value = self.params.get(name)?;
        if let Ok(typed) = serde_json::from_value(value.clone()) {
            return Some(typed);
        }
        value.as_str().and_then(|s| serde_json::from_str(s).ok())
    }

    /// Parameter as text: strings verbatim, numbers and booleans formatted.
    pub fn param_text(&self, name: &str) -> Option<String> {
        match self.params.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Transport peer address, when the server was started with connect info.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Best-effort client address: `X-Real-IP`, then the first
    /// `X-Forwarded-For` hop, then the transport peer.
    pub fn remote_addr(&self) -> String {
        if let Some(real_ip) = self.header("x-real-ip").map(str::trim).filter(|v| !v.is_empty()) {
            return real_ip.to_owned();
        }
        if let Some(first_hop) = self
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return first_hop.to_owned();
        }
        self.peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
    }
}

/// Whether an `Accept` header lists `text/event-stream`, ignoring media
/// type parameters and case.
pub fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|media| media.split(';').next().unwrap_or_default().trim())
        .any(|media| media.eq_ignore_ascii_case(EVENT_STREAM))
}

fn media_type(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let media = value.split(';').next()?.trim().to_ascii_lowercase();
    Some(media)
}

fn is_json(headers: &HeaderMap) -> bool {
    media_type(headers).is_some_and(|m| m == "application/json" || m.ends_with("+json"))
}

fn is_form(headers: &HeaderMap) -> bool {
    media_type(headers).is_some_and(|m| m == "application/x-www-form-urlencoded")
}

fn query_params(uri: &Uri) -> Map<String, Value> {
    match Query::<HashMap<String, String>>::try_from_uri(uri) {
        Ok(Query(pairs)) => pairs.into_iter().map(|(k, v)| (k, Value::String(v))).collect(),
        Err(error) => {
            debug!(%error, "ignoring malformed query string");
            Map::new()
        }
    }
}

fn merge_json_body(params: &mut Map<String, Value>, body: &Bytes) {
    if body.is_empty() {
        return;
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(fields)) => params.extend(fields),
        Ok(_) => debug!("JSON body is not an object, no body parameters"),
        Err(error) => debug!(%error, "JSON body did not parse, no body parameters"),
    }
}

async fn form_params(headers: &HeaderMap, body: Bytes) -> Map<String, Value> {
    let mut builder = Request::builder().method(Method::POST);
    if let Some(content_type) = headers.get(header::CONTENT_TYPE) {
        builder = builder.header(header::CONTENT_TYPE, content_type.clone());
    }
    let Ok(request) = builder.body(Body::from(body)) else {
        return Map::new();
    };
    match axum::Form::<HashMap<String, String>>::from_request(request, &()).await {
        Ok(axum::Form(pairs)) => pairs.into_iter().map(|(k, v)| (k, Value::String(v))).collect(),
        Err(rejection) => {
            debug!(error = %rejection, "form body did not parse, no body parameters");
            Map::new()
        }
    }
}

impl<S> FromRequest<S> for StreamRequest
where
    S: Send + Sync,
{
    type Rejection = StreamError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let method = req.method().clone();
        let uri = req.uri().clone();
        let headers = req.headers().clone();
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|rejection| StreamError::InvalidRequest(rejection.body_text()))?;

        let mut request = Self::from_parts(method, uri, headers, peer, body);
        if is_form(&request.headers) && !request.body.is_empty() {
            let fields = form_params(&request.headers, request.body.clone()).await;
            request.params.extend(fields);
        }
        Ok(request)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            let _ = map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn get(uri: &str, hdrs: HeaderMap) -> StreamRequest {
        StreamRequest::from_parts(Method::GET, uri.parse().unwrap(), hdrs, None, Bytes::new())
    }

    async fn extract(request: Request) -> StreamRequest {
        StreamRequest::from_request(request, &()).await.unwrap()
    }

    #[test]
    fn query_params_are_strings() {
        let req = get("/events?client_id=abc&count=3", HeaderMap::new());
        assert_eq!(req.param_text("client_id").as_deref(), Some("abc"));
        assert_eq!(req.param::<u32>("count"), Some(3));
        assert_eq!(req.param::<String>("count").as_deref(), Some("3"));
        assert!(req.param::<u32>("missing").is_none());
    }

    #[test]
    fn json_body_overrides_query() {
        let req = StreamRequest::from_parts(
            Method::POST,
            "/events/callback?client_id=from-query&keep=1".parse().unwrap(),
            headers(&[("content-type", "application/json; charset=utf-8")]),
            None,
            Bytes::from_static(br#"{"client_id":"from-body","n":7}"#),
        );
        assert_eq!(req.param_text("client_id").as_deref(), Some("from-body"));
        assert_eq!(req.param_text("keep").as_deref(), Some("1"));
        assert_eq!(req.param::<i64>("n"), Some(7));
        assert_eq!(req.param_text("n").as_deref(), Some("7"));
    }

    #[test]
    fn json_body_ignored_without_content_type() {
        let req = StreamRequest::from_parts(
            Method::POST,
            "/cb".parse().unwrap(),
            HeaderMap::new(),
            None,
            Bytes::from_static(br#"{"client_id":"x"}"#),
        );
        assert!(req.params().is_empty());
        let raw: Value = req.json_body().unwrap();
        assert_eq!(raw["client_id"], "x");
    }

    #[test]
    fn non_object_json_body_adds_nothing() {
        let req = StreamRequest::from_parts(
            Method::POST,
            "/cb?a=1".parse().unwrap(),
            headers(&[("content-type", "application/json")]),
            None,
            Bytes::from_static(b"[1,2,3]"),
        );
        assert_eq!(req.params().len(), 1);
    }

    #[test]
    fn accept_matching_ignores_parameters_and_case() {
        assert!(accepts_event_stream(&headers(&[("accept", "text/event-stream")])));
        assert!(accepts_event_stream(&headers(&[(
            "accept",
            "application/json, Text/Event-Stream;q=0.9"
        )])));
        assert!(!accepts_event_stream(&headers(&[("accept", "application/json")])));
        assert!(!accepts_event_stream(&HeaderMap::new()));
    }

    #[test]
    fn remote_addr_precedence() {
        let peer: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        let with = |hdrs| {
            StreamRequest::from_parts(Method::GET, "/".parse().unwrap(), hdrs, Some(peer), Bytes::new())
        };

        let req = with(headers(&[("x-real-ip", "1.1.1.1"), ("x-forwarded-for", "2.2.2.2")]));
        assert_eq!(req.remote_addr(), "1.1.1.1");

        let req = with(headers(&[("x-forwarded-for", "2.2.2.2, 3.3.3.3")]));
        assert_eq!(req.remote_addr(), "2.2.2.2");

        let req = with(HeaderMap::new());
        assert_eq!(req.remote_addr(), "10.1.2.3");
        assert_eq!(req.peer_addr(), Some(peer));

        assert_eq!(get("/", HeaderMap::new()).remote_addr(), "");
    }

    #[tokio::test]
    async fn extractor_reads_form_body() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/events/callback?observer_id=q")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("client_id=form-id&message=hi+there"))
            .unwrap();
        let req = extract(request).await;
        assert_eq!(req.param_text("client_id").as_deref(), Some("form-id"));
        assert_eq!(req.param_text("message").as_deref(), Some("hi there"));
        assert_eq!(req.param_text("observer_id").as_deref(), Some("q"));
        assert_eq!(*req.method(), Method::POST);
    }

    #[tokio::test]
    async fn extractor_picks_up_connect_info() {
        let peer: SocketAddr = "192.168.0.9:1234".parse().unwrap();
        let mut request = Request::builder().uri("/events").body(Body::empty()).unwrap();
        let _ = request.extensions_mut().insert(ConnectInfo(peer));
        let req = extract(request).await;
        assert_eq!(req.peer_addr(), Some(peer));
        assert_eq!(req.uri().path(), "/events");
        assert!(req.body().is_empty());
    }
}
