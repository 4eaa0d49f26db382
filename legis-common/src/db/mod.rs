//! Relational target database
//!
//! The target schema is fixed: source-of-record tables (`congress_*`,
//! `lobbying_*`), computed views (`analytics_*`) and operational metadata
//! (`ops_*`). SQLite has no schemas, so namespaces are table-name prefixes.

pub mod init;

pub use init::{init_database, init_schema};
