//! Shared library for the ASUBT request handlers.
//!
//! This crate provides the configuration, connection source, gateway envelope,
//! validation and credential helpers used by every handler binary.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod validation;

pub use auth::{generate_token, hash_password, verify_password, Verification};
pub use config::{Config, ConnectionMode, PasswordScheme};
pub use db::{Database, DbConnection, Session};
pub use error::{Error, Result};
pub use http::{Cors, GatewayEvent, GatewayResponse};
pub use validation::Patch;
