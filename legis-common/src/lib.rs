//! # legis-common
//!
//! Shared code for the legislative data pipeline:
//! - Common error and result types
//! - TOML configuration model and root folder resolution
//! - Relational target schema initialization
//! - Pipeline progress events

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
