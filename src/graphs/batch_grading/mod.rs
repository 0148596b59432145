//! The BatchGrading graph (§4.7): partitions a multi-student submission
//! stream into boundaries, gates on low-confidence detections, then grades
//! each student as a nested ExamPaper run.

pub mod graph;
pub mod nodes;
pub mod state;

pub use graph::build;
pub use state::{BatchGradingPartial, BatchGradingState, StudentBoundary, StudentRunSummary};
