//! clip-pipeline - Stage coordination for contradiction-clipper
//!
//! This crate runs each pipeline stage over the work the store reports as
//! pending, with a bounded worker pool, per-unit timeouts and per-unit
//! failure isolation, and assembles the final montage and summary.

mod coordinator;
mod handlers;
mod montage;
mod pipeline;

#[cfg(test)]
mod tests;

pub use coordinator::Coordinator;
pub use handlers::{
    DetectHandler, EmbedHandler, FetchHandler, StageHandler, Staged, StagingDir, TranscribeHandler,
};
pub use montage::{format_summary_line, plan_montage};
pub use pipeline::{Collaborators, Pipeline};
