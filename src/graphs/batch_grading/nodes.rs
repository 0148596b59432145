//! Node bodies for the BatchGrading graph (§4.7): `detect_student_boundaries`,
//! `boundary_review`, `grade_student` (fan-out, each child drives a nested
//! ExamPaper run to completion), and `finalize`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::collaborators::{BoundaryDetector, CollaboratorError};
use crate::control::{Command, SendTarget};
use crate::engine::{Engine, EngineStatus, GraphDef};
use crate::graph_state::GraphState as _;
use crate::graphs::exam_paper::state::ExamPaperState;
use crate::node::{Node, NodeContext, NodeError};
use crate::retry::{RetryOutcome, RetryPolicy, retry};
use crate::types::NodeKind;

use super::state::{BatchGradingPartial, BatchGradingState, StudentBoundary, StudentRunSummary};

fn classify_collaborator_error(err: &CollaboratorError) -> bool {
    matches!(err, CollaboratorError::Transient { .. })
}

/// `detect_student_boundaries`: partitions the page stream via
/// `BoundaryDetector`, flagging `boundary_review` when any detected
/// boundary's confidence falls below threshold.
pub struct DetectBoundariesNode {
    pub detector: Arc<dyn BoundaryDetector>,
    pub retry_policy: RetryPolicy,
    pub confidence_review_threshold: f64,
}

#[async_trait]
impl Node<BatchGradingState> for DetectBoundariesNode {
    async fn run(
        &self,
        snapshot: BatchGradingState,
        ctx: NodeContext,
    ) -> Result<Command<BatchGradingPartial>, NodeError> {
        let file_refs = snapshot.file_refs.get().clone();
        let outcome = retry(self.retry_policy, classify_collaborator_error, |_attempt| {
            let detector = self.detector.clone();
            let file_refs = file_refs.clone();
            async move { detector.detect(&file_refs).await }
        })
        .await;

        let boundaries = match outcome {
            RetryOutcome::Succeeded { value, .. } => value,
            RetryOutcome::Exhausted { last_error, attempts } => {
                ctx.emit_diagnostic(
                    "detect_student_boundaries",
                    format!("boundary detection failed after {attempts} attempts"),
                )?;
                return Err(match last_error {
                    CollaboratorError::Transient { message, .. } => {
                        NodeError::Transient { provider: "boundary_detector", message }
                    }
                    CollaboratorError::SchemaViolation { message, .. } => {
                        NodeError::SchemaViolation { provider: "boundary_detector", message }
                    }
                });
            }
        };

        let needs_review = boundaries.iter().any(|b| b.confidence < self.confidence_review_threshold);

        Ok(Command::Update(BatchGradingPartial {
            boundaries: Some(boundaries),
            boundary_review: Some(needs_review),
            ..BatchGradingPartial::default().with_progress("boundaries_detected", 0.2)
        }))
    }
}

/// Builds the `grade_student` fan-out targets from post-merge state: one
/// child per detected boundary, carrying that student's slice plus the
/// batch's shared rubric.
pub fn student_fanout_targets(state: &BatchGradingState) -> Vec<SendTarget> {
    let rubric = state.rubric.get().clone();
    state
        .boundaries
        .get()
        .iter()
        .map(|boundary| {
            SendTarget::new(
                NodeKind::Custom("grade_student".to_string()),
                serde_json::json!({
                    "student_id": boundary.student_id,
                    "submission_id": format!("{}-batch", boundary.student_id),
                    "file_refs": boundary.file_refs,
                    "rubric": rubric,
                }),
            )
        })
        .collect()
}

/// `boundary_review`: interrupts when a low-confidence boundary was
/// detected, mirroring ExamPaper's `wait_for_review` shape. On resume, a
/// teacher's `action: "approve"` clears the flag and lets fan-out proceed
/// with the boundaries as detected; there is no override shape here since
/// re-drawing a boundary is out of scope (§9).
pub struct BoundaryReviewNode;

#[async_trait]
impl Node<BatchGradingState> for BoundaryReviewNode {
    async fn run(
        &self,
        snapshot: BatchGradingState,
        ctx: NodeContext,
    ) -> Result<Command<BatchGradingPartial>, NodeError> {
        if ctx.resume_payload.is_some() {
            return Ok(Command::Update(BatchGradingPartial {
                boundary_review: Some(false),
                ..Default::default()
            }));
        }
        if !*snapshot.boundary_review.get() {
            return Ok(Command::Update(BatchGradingPartial::default()));
        }
        Ok(Command::Interrupt(serde_json::json!({
            "reason": "low_confidence_boundary",
            "boundaries": snapshot.boundaries.get(),
        })))
    }
}

/// `grade_student`: one fan-out child per detected boundary, each driving a
/// complete nested ExamPaper run to completion (or to its own interrupt) and
/// folding a [`StudentRunSummary`] back into `student_runs`.
pub struct GradeStudentNode {
    pub exam_paper_graph: Arc<GraphDef<ExamPaperState>>,
    pub fanout_concurrency_cap: usize,
    pub node_timeout: Duration,
}

#[derive(serde::Deserialize)]
struct StudentInput {
    student_id: String,
    submission_id: String,
    file_refs: Vec<String>,
    rubric: String,
}

#[async_trait]
impl Node<BatchGradingState> for GradeStudentNode {
    async fn run(
        &self,
        _snapshot: BatchGradingState,
        ctx: NodeContext,
    ) -> Result<Command<BatchGradingPartial>, NodeError> {
        let input: StudentInput = match ctx.send_input {
            Some(value) => serde_json::from_value(value)?,
            None => return Err(NodeError::MissingInput { what: "student boundary" }),
        };

        let nested_state = ExamPaperState::initial(serde_json::json!({
            "submission_id": input.submission_id,
            "file_refs": input.file_refs,
            "rubric": input.rubric,
        }))
        .map_err(|e| NodeError::ValidationFailed(e.to_string()))?;

        let engine = Engine::new(self.exam_paper_graph.clone(), self.fanout_concurrency_cap, self.node_timeout);
        let outcome = engine
            .run(nested_state, self.exam_paper_graph.entry.clone(), None, ctx.step, ctx.event_emitter.clone())
            .await
            .map_err(|e| NodeError::Transient { provider: "nested_exam_paper_run", message: e.to_string() })?;

        let summary = match outcome.status {
            EngineStatus::Completed => StudentRunSummary {
                student_id: input.student_id,
                submission_id: input.submission_id,
                total_score: *outcome.state.total_score.get(),
                max_total_score: *outcome.state.max_total_score.get(),
                needs_review: *outcome.state.needs_review.get(),
            },
            // A nested run that pauses for its own question-level review is
            // recorded as needing review at the batch level too; resolving
            // a nested interrupt through the batch's own SendEvent surface
            // is out of scope (§9) — the student's slice simply needs a
            // second pass.
            EngineStatus::Interrupted { .. } => StudentRunSummary {
                student_id: input.student_id,
                submission_id: input.submission_id,
                total_score: 0.0,
                max_total_score: *outcome.state.max_total_score.get(),
                needs_review: true,
            },
            // A nested run only observes cancellation if the child state
            // itself carries `cancel_requested` (it doesn't today — the
            // parent's flag isn't threaded into `nested_state`); keep this
            // arm so a future change that does thread it stays well-defined
            // instead of silently dropping the slice from `student_runs`.
            EngineStatus::Cancelled => StudentRunSummary {
                student_id: input.student_id,
                submission_id: input.submission_id,
                total_score: 0.0,
                max_total_score: *outcome.state.max_total_score.get(),
                needs_review: true,
            },
        };

        Ok(Command::Update(BatchGradingPartial {
            student_runs: vec![summary],
            ..Default::default()
        }))
    }
}

/// `finalize`: terminal bookkeeping node; the batch's student summaries are
/// already in state by the time the fan-out join reaches here.
pub struct FinalizeNode;

#[async_trait]
impl Node<BatchGradingState> for FinalizeNode {
    async fn run(
        &self,
        _snapshot: BatchGradingState,
        _ctx: NodeContext,
    ) -> Result<Command<BatchGradingPartial>, NodeError> {
        Ok(Command::Update(BatchGradingPartial::default().with_progress("finalized", 1.0)))
    }
}
