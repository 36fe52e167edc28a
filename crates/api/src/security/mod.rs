//! HTTP hardening shared by all routes

mod headers;

pub use headers::security_headers_middleware;
