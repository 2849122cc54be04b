//! axum adapter: request guard middleware and admin endpoints
//!
//! ```ignore
//! let state = GuardState::new(monitor, &config.general);
//! let app = Router::new()
//!     .route("/api/items", get(list_items))
//!     .layer(middleware::from_fn_with_state(state.clone(), guard))
//!     .nest("/admin", admin_router(state));
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::GeneralConfig;
use crate::error::Rejection;
use crate::models::RequestView;
use crate::monitor::SecurityMonitor;

/// Identifier the guard resolved for the request, available to handlers
/// as a request extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId(pub String);

/// Shared state for [`guard`] and the admin routes
#[derive(Clone)]
pub struct GuardState {
    monitor: Arc<SecurityMonitor>,
    max_body_bytes: usize,
    trust_forwarded_for: bool,
    trusted_proxies: Arc<[IpAddr]>,
    admin_token: Option<Arc<str>>,
}

impl std::fmt::Debug for GuardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardState")
            .field("max_body_bytes", &self.max_body_bytes)
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .field("trusted_proxies", &self.trusted_proxies)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<set>"))
            .finish()
    }
}

impl GuardState {
    /// Admin token is read from the environment variable named in `general`
    pub fn new(monitor: Arc<SecurityMonitor>, general: &GeneralConfig) -> Self {
        let admin_token = std::env::var(&general.admin_token_env)
            .ok()
            .filter(|t| !t.is_empty())
            .map(Arc::from);
        if admin_token.is_none() {
            debug!(var = %general.admin_token_env, "No admin token configured, admin routes disabled");
        }

        Self {
            monitor,
            max_body_bytes: general.max_body_bytes,
            trust_forwarded_for: general.trust_forwarded_for,
            trusted_proxies: general.trusted_proxies.clone().into(),
            admin_token,
        }
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.admin_token = (!token.is_empty()).then(|| Arc::from(token));
        self
    }

    pub fn monitor(&self) -> &Arc<SecurityMonitor> {
        &self.monitor
    }

    /// Whether forwarding headers from this peer name the real client
    fn honours_forwarding(&self, peer: Option<SocketAddr>) -> bool {
        self.trust_forwarded_for
            || peer.is_some_and(|addr| self.trusted_proxies.contains(&addr.ip()))
    }

    /// Forwarding headers first (from trusted peers only), then the socket peer
    pub fn resolve_client_id(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
        let forwarded = self
            .honours_forwarding(peer)
            .then(|| {
                header_str(headers, "x-forwarded-for")
                    .and_then(|v| v.split(',').next())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .or_else(|| header_str(headers, "x-real-ip").map(str::trim))
                    .map(str::to_string)
            })
            .flatten();

        forwarded
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Constant-time bearer token check; nothing passes without a configured token
    pub fn is_admin(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.admin_token.as_deref() else {
            return false;
        };
        let Some(presented) = header_str(headers, header::AUTHORIZATION.as_str())
            .and_then(|v| v.strip_prefix("Bearer "))
        else {
            return false;
        };
        presented.as_bytes().ct_eq(expected.as_bytes()).into()
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status()).unwrap_or(StatusCode::FORBIDDEN);
        let retry_after = self.retry_after;

        let mut response = (status, Json(self)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Middleware for `axum::middleware::from_fn_with_state`.
///
/// Buffers the body (up to the configured limit) so detectors can see it,
/// then hands an identical request to `next` when the monitor allows it.
pub async fn guard(State(state): State<GuardState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_id = state.resolve_client_id(request.headers(), peer);

    let (mut parts, body) = request.into_parts();
    let bytes = match to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(client = %client_id, path = %parts.uri.path(), "Request body rejected: {}", e);
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({"success": false, "message": "Request body too large"})),
            )
                .into_response();
        }
    };

    let view = build_view(&client_id, &parts, &bytes);
    let decision = state.monitor.check(&view);

    if let Some(rejection) = decision.into_rejection() {
        debug!(
            client = %client_id,
            method = %view.method,
            path = %view.path,
            code = %rejection.code,
            "Request rejected"
        );
        return rejection.into_response();
    }

    parts.extensions.insert(ClientId(client_id));
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

fn build_view(client_id: &str, parts: &axum::http::request::Parts, bytes: &Bytes) -> RequestView {
    let mut view = RequestView::new(client_id, parts.method.as_str(), parts.uri.path())
        .with_query(parts.uri.query().unwrap_or_default());

    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            view.headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    view.content_length = header_str(&parts.headers, header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.parse().ok())
        .or(Some(bytes.len() as u64).filter(|len| *len > 0));
    view.body = decode_body(&parts.headers, bytes);
    view
}

/// JSON when the content type says so and it parses, text otherwise
fn decode_body(headers: &HeaderMap, bytes: &Bytes) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    let is_json = header_str(headers, header::CONTENT_TYPE.as_str())
        .map(|ct| ct.to_ascii_lowercase().contains("json"))
        .unwrap_or(false);

    if is_json {
        if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            return Some(value);
        }
    }
    Some(Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"success": false, "message": "Unauthorized"})),
    )
        .into_response()
}

/// `GET` handler returning [`crate::models::SecurityStats`]
pub async fn stats_handler(State(state): State<GuardState>, headers: HeaderMap) -> Response {
    if !state.is_admin(&headers) {
        return unauthorized();
    }
    Json(state.monitor.get_stats()).into_response()
}

pub async fn blocks_handler(State(state): State<GuardState>, headers: HeaderMap) -> Response {
    if !state.is_admin(&headers) {
        return unauthorized();
    }
    Json(json!({ "blocked": state.monitor.blocked_ids() })).into_response()
}

pub async fn unblock_handler(
    State(state): State<GuardState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !state.is_admin(&headers) {
        return unauthorized();
    }
    if state.monitor.unblock(&id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// `/stats`, `/blocks` and `/blocks/:id`, all behind the admin token
pub fn admin_router(state: GuardState) -> Router {
    Router::new()
        .route("/stats", get(stats_handler))
        .route("/blocks", get(blocks_handler))
        .route("/blocks/:id", delete(unblock_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn state() -> GuardState {
        let monitor = Arc::new(SecurityMonitor::new(&Config::default()));
        GuardState::new(monitor, &GeneralConfig::default())
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_client_id_resolution_order() {
        let mut state = state();
        state.trust_forwarded_for = true;
        let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();

        let h = headers(&[("x-forwarded-for", "203.0.113.5, 10.0.0.1"), ("x-real-ip", "198.51.100.2")]);
        assert_eq!(state.resolve_client_id(&h, Some(peer)), "203.0.113.5");

        let h = headers(&[("x-real-ip", "198.51.100.2")]);
        assert_eq!(state.resolve_client_id(&h, Some(peer)), "198.51.100.2");

        assert_eq!(state.resolve_client_id(&HeaderMap::new(), Some(peer)), "192.0.2.1");
        assert_eq!(state.resolve_client_id(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn test_spoofed_forwarding_headers_ignored_by_default() {
        let state = state();
        let peer: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        for spoofed in ["203.0.113.5", "203.0.113.6", "10.0.0.1, 203.0.113.7"] {
            let h = headers(&[("x-forwarded-for", spoofed), ("x-real-ip", "198.51.100.2")]);
            assert_eq!(state.resolve_client_id(&h, Some(peer)), "192.0.2.1");
        }
        let h = headers(&[("x-forwarded-for", "203.0.113.5")]);
        assert_eq!(state.resolve_client_id(&h, None), "unknown");
    }

    #[test]
    fn test_forwarding_headers_honoured_from_trusted_proxy_only() {
        let general = GeneralConfig {
            trusted_proxies: vec!["10.0.0.2".parse().unwrap()],
            ..GeneralConfig::default()
        };
        let state = GuardState::new(Arc::new(SecurityMonitor::new(&Config::default())), &general);
        let h = headers(&[("x-forwarded-for", "203.0.113.5")]);

        let proxy: SocketAddr = "10.0.0.2:443".parse().unwrap();
        assert_eq!(state.resolve_client_id(&h, Some(proxy)), "203.0.113.5");

        let direct: SocketAddr = "10.0.0.3:443".parse().unwrap();
        assert_eq!(state.resolve_client_id(&h, Some(direct)), "10.0.0.3");
    }

    #[test]
    fn test_admin_token_check() {
        let state = state().with_admin_token("s3cret");
        assert!(state.is_admin(&headers(&[("authorization", "Bearer s3cret")])));
        assert!(!state.is_admin(&headers(&[("authorization", "Bearer s3cre")])));
        assert!(!state.is_admin(&headers(&[("authorization", "s3cret")])));
        assert!(!state.is_admin(&HeaderMap::new()));

        let closed = state.with_admin_token("");
        assert!(!closed.is_admin(&headers(&[("authorization", "Bearer ")])));
    }

    #[test]
    fn test_decode_body() {
        let json_ct = headers(&[("content-type", "application/json; charset=utf-8")]);
        assert_eq!(
            decode_body(&json_ct, &Bytes::from_static(br#"{"a":1}"#)),
            Some(json!({"a": 1}))
        );
        assert_eq!(
            decode_body(&json_ct, &Bytes::from_static(b"not json")),
            Some(json!("not json"))
        );
        assert_eq!(decode_body(&HeaderMap::new(), &Bytes::new()), None);
    }

    #[test]
    fn test_rejection_response() {
        let response = Rejection::rate_limited(59_001).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");

        let response = Rejection::blocked().into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }
}
