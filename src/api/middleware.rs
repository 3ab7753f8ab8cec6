//! HTTP middleware: request correlation and cross-origin policy.
//!
//! Every request runs inside a `request` span carrying its id, so anything the
//! handlers or the room manager log while serving it can be traced back.

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::Instrument;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied request id that is echoed back
const MAX_REQUEST_ID_LEN: usize = 64;

/// Correlation id of the request being served
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Accept a caller's id only if it is short printable ASCII
fn client_request_id(value: &HeaderValue) -> Option<String> {
    let id = value.to_str().ok()?;
    let acceptable = !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id.bytes().all(|b| b.is_ascii_graphic());
    acceptable.then(|| id.to_string())
}

/// Tag the request with an id, serve it inside a span, echo the id back
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(client_request_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let started = Instant::now();
    let mut response = next.run(request).instrument(span.clone()).await;
    span.in_scope(|| {
        tracing::debug!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request served"
        );
    });

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Origins a browser may read responses from. `*` or an empty list opens it up.
fn allowed_origin(origins: &[String]) -> AllowOrigin {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return AllowOrigin::any();
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring malformed CORS origin");
                None
            }
        })
        .collect();
    AllowOrigin::list(parsed)
}

/// The HTTP surface is read-only; game traffic goes over the WebSocket
pub fn create_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(allowed_origin(allowed_origins))
        .allow_methods([Method::GET])
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_request_id_is_sanitized() {
        let ok = HeaderValue::from_static("match-42.retry-1");
        assert_eq!(client_request_id(&ok).as_deref(), Some("match-42.retry-1"));

        let spaced = HeaderValue::from_static("two words");
        assert!(client_request_id(&spaced).is_none());

        let long = HeaderValue::from_str(&"x".repeat(MAX_REQUEST_ID_LEN + 1)).unwrap();
        assert!(client_request_id(&long).is_none());

        let empty = HeaderValue::from_static("");
        assert!(client_request_id(&empty).is_none());
    }

    #[test]
    fn test_cors_layer_accepts_wildcard_and_lists() {
        let _open = create_cors_layer(&["*".to_string()]);
        let _none = create_cors_layer(&[]);
        let _listed = create_cors_layer(&["https://play.example".to_string(), "bad\norigin".to_string()]);
    }
}
