//! Question answering for Parley.
//!
//! Separates bounded statement execution from the pipeline that turns a
//! question into a stored message.

pub mod executor;
pub mod pipeline;

pub use executor::{deadline_after, ExecutionOutcome, QueryExecutor, QueryLimits};
pub use pipeline::{PipelineState, QueryPipeline, StageFailure};
