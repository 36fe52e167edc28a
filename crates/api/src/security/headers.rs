//! Security response headers

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};

/// Headers set on every response, overwriting handler values
const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("X-Frame-Options", "DENY"),
    ("X-Content-Type-Options", "nosniff"),
    ("Referrer-Policy", "no-referrer"),
    (
        "Strict-Transport-Security",
        "max-age=63072000; includeSubDomains",
    ),
    (
        "Content-Security-Policy",
        "default-src 'none'; frame-ancestors 'none'",
    ),
];

/// Tokens travel in response bodies, so nothing may be cached unless the
/// handler opted in.
const DEFAULT_CACHE_CONTROL: &str = "no-store";

pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    for &(name, value) in SECURITY_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }

    if !headers.contains_key("Cache-Control") {
        headers.insert("Cache-Control", HeaderValue::from_static(DEFAULT_CACHE_CONTROL));
        headers.insert("Pragma", HeaderValue::from_static("no-cache"));
    }

    response
}
