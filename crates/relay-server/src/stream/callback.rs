//! Callback routing from clients back to their session's handler.
//!
//! A callback names its target connection by client id, taken from the first
//! non-empty of:
//!
//! 1. the `X-Client-ID` header
//! 2. the `client_id` parameter (query, JSON body, or form body)
//! 3. the `observer_id` parameter

use axum::http::HeaderMap;
use axum::response::Response;
use metrics::counter;
use relay_core::ClientId;
use tracing::debug;

use super::hub::StreamHub;
use crate::errors::StreamError;
use crate::metrics::CALLBACKS_TOTAL;
use crate::request::{CLIENT_ID_HEADER, StreamRequest, accepts_event_stream};

/// Resolve the client id a callback request is addressed to.
pub fn resolve_client_id(request: &StreamRequest) -> Option<String> {
    let from_header = request
        .header(CLIENT_ID_HEADER)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_owned);

    from_header.or_else(|| {
        ["client_id", "observer_id"]
            .into_iter()
            .filter_map(|name| request.param_text(name))
            .map(|id| id.trim().to_owned())
            .find(|id| !id.is_empty())
    })
}

/// Whether a request on the stream path should be treated as a callback.
///
/// True when the caller does not accept `text/event-stream` and names a
/// client in a non-blank `X-Client-ID`. A callback sent with an event-stream `Accept`
/// header opens a new stream instead; use the dedicated callback route for
/// those clients.
pub fn is_callback_request(headers: &HeaderMap) -> bool {
    let names_client = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|id| !id.trim().is_empty());
    names_client && !accepts_event_stream(headers)
}

/// Hand `request` to the `on_callback` hook of the session it names.
pub(crate) async fn dispatch(hub: &StreamHub, request: &StreamRequest) -> Result<Response, StreamError> {
    let client_id = resolve_client_id(request).ok_or(StreamError::MissingClientId)?;
    let session = hub
        .find(&client_id)
        .ok_or_else(|| StreamError::ClientNotFound(ClientId::from(client_id)))?;

    debug!(endpoint = %hub.path(), client_id = %session.client_id(), "dispatching callback");
    counter!(CALLBACKS_TOTAL, "endpoint" => hub.path().to_owned()).increment(1);
    Ok(session.handler().on_callback(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use axum::body::Bytes;
    use axum::http::{HeaderValue, Method, StatusCode};
    use axum::response::IntoResponse;

    use crate::config::StreamSettings;
    use crate::shutdown::ShutdownCoordinator;
    use crate::stream::handler::{EventHandler, handler_factory};

    fn request(uri: &str, headers: &[(&'static str, &'static str)], json: Option<&'static str>) -> StreamRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let _ = map.insert(*name, HeaderValue::from_static(value));
        }
        let body = match json {
            Some(body) => {
                let _ = map.insert("content-type", HeaderValue::from_static("application/json"));
                Bytes::from_static(body.as_bytes())
            }
            None => Bytes::new(),
        };
        StreamRequest::from_parts(Method::POST, uri.parse().unwrap(), map, None, body)
    }

    struct Echo;

    #[async_trait]
    impl EventHandler for Echo {
        async fn on_callback(&self, request: &StreamRequest) -> Response {
            let said = request.param_text("say").unwrap_or_default();
            (StatusCode::ACCEPTED, said).into_response()
        }
    }

    fn hub() -> StreamHub {
        StreamHub::new(
            "/events",
            StreamSettings::default(),
            Some(handler_factory(|| Echo)),
            Arc::new(ShutdownCoordinator::new()),
        )
    }

    #[test]
    fn header_wins_over_parameters() {
        let req = request(
            "/cb?client_id=query-id",
            &[("x-client-id", "header-id")],
            Some(r#"{"client_id":"body-id"}"#),
        );
        assert_eq!(resolve_client_id(&req).as_deref(), Some("header-id"));
    }

    #[test]
    fn client_id_param_wins_over_observer_id() {
        let req = request("/cb?observer_id=obs&client_id=cid", &[], None);
        assert_eq!(resolve_client_id(&req).as_deref(), Some("cid"));
    }

    #[test]
    fn observer_id_is_last_resort() {
        let req = request("/cb", &[], Some(r#"{"observer_id":"obs"}"#));
        assert_eq!(resolve_client_id(&req).as_deref(), Some("obs"));
    }

    #[test]
    fn empty_values_fall_through() {
        let req = request("/cb?client_id=&observer_id=obs", &[("x-client-id", " ")], None);
        assert_eq!(resolve_client_id(&req).as_deref(), Some("obs"));
        assert!(resolve_client_id(&request("/cb?client_id=", &[], None)).is_none());
    }

    #[test]
    fn callback_heuristic() {
        let mut headers = HeaderMap::new();
        assert!(!is_callback_request(&headers));
        let _ = headers.insert("x-client-id", HeaderValue::from_static(""));
        assert!(!is_callback_request(&headers));
        let _ = headers.insert("x-client-id", HeaderValue::from_static("  "));
        assert!(!is_callback_request(&headers));
        let _ = headers.insert("x-client-id", HeaderValue::from_static("abc"));
        assert!(is_callback_request(&headers));
        let _ = headers.insert("accept", HeaderValue::from_static("text/event-stream"));
        assert!(!is_callback_request(&headers));
    }

    #[tokio::test]
    async fn missing_id_is_rejected() {
        let err = hub().handle_callback(request("/cb", &[], None)).await.unwrap_err();
        assert_matches!(err, StreamError::MissingClientId);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let err = hub()
            .handle_callback(request("/cb", &[("x-client-id", "ghost")], None))
            .await
            .unwrap_err();
        assert_matches!(err, StreamError::ClientNotFound(id) if id.as_str() == "ghost");
    }

    #[tokio::test]
    async fn dispatches_to_named_session() {
        let hub = hub();
        let conn = hub.accept(request("/events", &[], None)).await.unwrap();
        let id = conn.client_id().to_string();

        let body = format!(r#"{{"client_id":"{id}","say":"hello"}}"#);
        let req = StreamRequest::from_parts(
            Method::POST,
            "/events/callback".parse().unwrap(),
            {
                let mut h = HeaderMap::new();
                let _ = h.insert("content-type", HeaderValue::from_static("application/json"));
                h
            },
            None,
            Bytes::from(body),
        );
        let resp = hub.handle_callback(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&bytes[..], b"hello");

        conn.disconnect().await;
    }
}
