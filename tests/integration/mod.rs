//! Integration tests for Parley.

pub mod common;
pub mod executor_test;
pub mod persistence_test;
pub mod pipeline_test;
pub mod query_test;
