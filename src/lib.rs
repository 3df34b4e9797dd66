//! Parley - ask questions of a transactional database in plain language.
//!
//! Questions are turned into candidate SQL by a language model, filtered to
//! read-only statements, run under a deadline and a row cap, and recorded as
//! messages in branchable conversations.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod logging;
pub mod persistence;
pub mod query;
pub mod safety;
