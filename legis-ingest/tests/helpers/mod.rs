//! Shared helpers for legis-ingest integration tests

#![allow(dead_code)]

pub mod fixtures;
pub mod mock_source;

pub use fixtures::{bill_payload, member_payload, seed_records, vote_payload, TestRoot};
pub use mock_source::{source_orchestrator, fast_fetch_config, mock_congress_config};
