//! UI session token middleware.
//!
//! Every browser gets an opaque `oc_ui_session` cookie. Handlers read the
//! token from request extensions to group push subscriptions and
//! visibility reports per browser.

use axum::{
    body::Body,
    http::{header, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use openchamber_protocol::new_id;

pub const COOKIE_NAME: &str = "oc_ui_session";
const COOKIE_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 365;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiSessionToken(pub String);

impl UiSessionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Token from a `Cookie` header, if present and non-empty.
pub fn token_from_cookies(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == COOKIE_NAME && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// Attach the caller's token, issuing a fresh one when the cookie is absent.
pub async fn ui_session_middleware(mut req: Request<Body>, next: Next) -> Response {
    let (token, issued) = match token_from_cookies(req.headers()) {
        Some(token) => (token, false),
        None => (new_id(), true),
    };
    req.extensions_mut().insert(UiSessionToken(token.clone()));

    let mut response = next.run(req).await;
    if issued {
        let cookie = format!(
            "{COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={COOKIE_MAX_AGE_SECS}"
        );
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    #[test]
    fn finds_token_among_other_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; oc_ui_session=abc123; other=1"),
        );
        assert_eq!(token_from_cookies(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn empty_cookie_value_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("oc_ui_session="));
        assert_eq!(token_from_cookies(&headers), None);
    }
}
