//! Authentication and token lifecycle service for the BMS platform.
//!
//! The `auth` module holds the core (token codec, password hashing, refresh
//! token store, user directory and session service); `routes` exposes it
//! over HTTP.

pub mod audit_constants;
pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod security;
pub mod state;
pub mod telemetry;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
