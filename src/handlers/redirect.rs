use crate::{
    guards::{RequestContext, Verdict},
    resolver::Resolution,
    AppState,
};
use askama::Template;
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
};
use std::{net::SocketAddr, sync::Arc};

#[derive(Template)]
#[template(path = "invalid_link.html")]
struct InvalidLinkTemplate<'a> {
    code: &'a str,
}

/// GET /:code
///
/// 1. Run the defense chain; a deny answers 403/429 with a generic message.
/// 2. Resolve the code through the cache, falling back to the database.
/// 3. Answer 302 to the destination, or 410 with the static invalid-link
///    page.
pub async fn redirect(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    // ── 1. Defense chain ───────────────────────────────────────────────────
    let ctx = RequestContext {
        ip: client_ip(&headers, addr, state.config.trust_proxy),
        short_code: code.clone(),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
    };

    if let Verdict::Deny { status, reason } = state.guards.check(&ctx).await {
        return (status, reason).into_response();
    }

    // ── 2. Resolve ─────────────────────────────────────────────────────────
    let original_url = match state.resolver.resolve(&code).await {
        Resolution::Redirect(url) => url,
        Resolution::Invalid => return invalid_link(&code),
    };

    // ── 3. Redirect ────────────────────────────────────────────────────────
    match HeaderValue::from_str(&original_url) {
        Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
        Err(_) => {
            tracing::warn!("'{}' points at a URL that is not a valid Location header", code);
            invalid_link(&code)
        }
    }
}

fn invalid_link(code: &str) -> Response {
    match (InvalidLinkTemplate { code }).render() {
        Ok(page) => (StatusCode::GONE, Html(page)).into_response(),
        Err(e) => {
            tracing::error!("Failed to render invalid-link page: {}", e);
            (StatusCode::GONE, "This link is no longer available").into_response()
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// The address the guards key on.
///
/// Without a trusted proxy the peer address is the only thing a client
/// cannot forge. Behind one, the proxy appends the peer it saw to
/// `X-Forwarded-For`, so the last entry is used; entries before it came
/// from the client.
fn client_ip(headers: &HeaderMap, addr: SocketAddr, trust_proxy: bool) -> String {
    if !trust_proxy {
        return addr.ip().to_string();
    }

    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = xff.rsplit(',').next().map(str::trim) {
            if !ip.is_empty() {
                return ip.to_owned();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_owned();
        }
    }

    addr.ip().to_string()
}
