//! BMS Shared Types and Utilities
//!
//! Domain types and database helpers shared by the auth service binaries.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
