//! The ExamPaper graph (§4.6): segments a submission into question regions,
//! grades each region in parallel, aggregates scores, optionally gates on
//! human review, then persists and notifies.

pub mod graph;
pub mod nodes;
pub mod state;

pub use graph::build;
pub use state::{ExamPaperPartial, ExamPaperState, GradingResult, QuestionRegion, ReviewOutcome};
