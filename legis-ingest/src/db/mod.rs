//! Database access for the migration tier

pub mod checkpoints;
pub mod rows;
pub mod runs;
