//! State and domain types for the BatchGrading graph (§4.7): partitions a
//! multi-student page stream into per-student slices, each graded by a
//! nested ExamPaper run.

use serde::{Deserialize, Serialize};

use crate::channels::{Versioned, reduce_last_write, reduce_list_append, reduce_or};
use crate::graph_state::{CoreChannels, CorePartial, GraphState, GraphStateError};

/// One detected student slice of the page stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentBoundary {
    pub student_id: String,
    pub file_refs: Vec<String>,
    pub confidence: f64,
}

/// The nested ExamPaper run's outcome, folded back into the parent batch's
/// `student_runs` channel — a summary rather than the raw `GradingResult`
/// list, since a batch run's unit of aggregation is the student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentRunSummary {
    pub student_id: String,
    pub submission_id: String,
    pub total_score: f64,
    pub max_total_score: f64,
    pub needs_review: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchGradingState {
    pub core: CoreChannels,
    pub file_refs: Versioned<Vec<String>>,
    pub rubric: Versioned<String>,
    pub boundaries: Versioned<Vec<StudentBoundary>>,
    pub boundary_review: Versioned<bool>,
    pub student_runs: Versioned<Vec<StudentRunSummary>>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchGradingPartial {
    pub core: CorePartial,
    pub file_refs: Option<Vec<String>>,
    pub rubric: Option<String>,
    pub boundaries: Option<Vec<StudentBoundary>>,
    pub boundary_review: Option<bool>,
    pub student_runs: Vec<StudentRunSummary>,
}

impl BatchGradingPartial {
    #[must_use]
    pub fn with_progress(mut self, stage: impl Into<String>, fraction: f32) -> Self {
        self.core = self.core.with_progress(stage, fraction);
        self
    }
}

impl GraphState for BatchGradingState {
    type Partial = BatchGradingPartial;

    fn initial(input: serde_json::Value) -> Result<Self, GraphStateError> {
        #[derive(Deserialize)]
        struct Input {
            #[serde(default)]
            file_refs: Vec<String>,
            rubric: String,
        }
        let parsed: Input = serde_json::from_value(input)
            .map_err(|e| GraphStateError::InvalidInput(e.to_string()))?;
        if parsed.file_refs.is_empty() {
            return Err(GraphStateError::InvalidInput("file_refs must not be empty".into()));
        }
        Ok(Self {
            core: CoreChannels::default(),
            file_refs: Versioned::new(parsed.file_refs),
            rubric: Versioned::new(parsed.rubric),
            boundaries: Versioned::default(),
            boundary_review: Versioned::default(),
            student_runs: Versioned::default(),
        })
    }

    fn merge(&mut self, partial: Self::Partial) {
        self.core.merge_partial(partial.core);
        if let Some(v) = partial.file_refs {
            reduce_last_write(&mut self.file_refs, v);
        }
        if let Some(v) = partial.rubric {
            reduce_last_write(&mut self.rubric, v);
        }
        if let Some(v) = partial.boundaries {
            reduce_last_write(&mut self.boundaries, v);
        }
        if let Some(v) = partial.boundary_review {
            reduce_or(&mut self.boundary_review, v);
        }
        reduce_list_append(&mut self.student_runs, partial.student_runs);
    }

    fn core(&self) -> &CoreChannels {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CoreChannels {
        &mut self.core
    }

    fn output_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "student_runs": self.student_runs.get(),
            "boundaries": self.boundaries.get(),
        })
    }

    fn channel_versions(&self) -> Vec<(&'static str, u32)> {
        vec![
            ("progress", self.core.progress.version()),
            ("errors", self.core.errors.version()),
            ("attempts", self.core.attempts.version()),
            ("cancel_requested", self.core.cancel_requested.version()),
            ("file_refs", self.file_refs.version()),
            ("rubric", self.rubric.version()),
            ("boundaries", self.boundaries.version()),
            ("boundary_review", self.boundary_review.version()),
            ("student_runs", self.student_runs.version()),
        ]
    }
}
