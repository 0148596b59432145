//! Node bodies for the ExamPaper graph (§4.7 / §4.1-§4.3): `segment`,
//! `grade_question`, `aggregate`, `wait_for_review`, `persist`, `notify`.
//!
//! Every node is a thin adapter between the [`Node`] trait and a
//! collaborator call, wrapped in the shared [`crate::retry`] policy where
//! the specification calls for retry-then-degrade (§4.2). Nodes never
//! return `Err` for a per-branch grading failure — only `segment`'s
//! failure, which has no degraded fallback, propagates fatally.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::{CacheKey, SemanticCache, rubric_hash};
use crate::channels::errors::{ErrorEvent, LadderError};
use crate::collaborators::{CollaboratorError, Grader, LayoutAnalysis, Notifier, Persistence};
use crate::config::ExamflowConfig;
use crate::control::{Command, SendTarget};
use crate::imaging::ImageHasher;
use crate::node::{Node, NodeContext, NodeError};
use crate::retry::{RetryOutcome, RetryPolicy, retry};
use crate::types::{NodeKind, QuestionType, ReviewAction};

use super::state::{ExamPaperPartial, ExamPaperState, GradingResult, QuestionRegion, ReviewOutcome};

fn classify_collaborator_error(err: &CollaboratorError) -> bool {
    matches!(err, CollaboratorError::Transient { .. })
}

/// `segment`: calls `LayoutAnalysis.Segment`, then either fans out one
/// `grade_question` invocation per region or, if the submission has no
/// gradeable regions, routes straight past grading.
pub struct SegmentNode {
    pub layout: Arc<dyn LayoutAnalysis>,
    pub retry_policy: RetryPolicy,
}

#[async_trait]
impl Node<ExamPaperState> for SegmentNode {
    async fn run(
        &self,
        snapshot: ExamPaperState,
        ctx: NodeContext,
    ) -> Result<Command<ExamPaperPartial>, NodeError> {
        let file_refs = snapshot.file_refs.get().clone();
        let rubric = snapshot.rubric.get().clone();

        let outcome = retry(
            self.retry_policy,
            classify_collaborator_error,
            |_attempt| {
                let layout = self.layout.clone();
                let file_refs = file_refs.clone();
                let rubric = rubric.clone();
                async move { layout.segment(&file_refs, &rubric).await }
            },
        )
        .await;

        let regions = match outcome {
            RetryOutcome::Succeeded { value, .. } => value,
            RetryOutcome::Exhausted { last_error, attempts } => {
                ctx.emit_diagnostic("segment", format!("segmentation failed after {attempts} attempts"))?;
                return Err(match last_error {
                    CollaboratorError::Transient { message, .. } => NodeError::Transient {
                        provider: "layout_analysis",
                        message,
                    },
                    CollaboratorError::SchemaViolation { message, .. } => NodeError::SchemaViolation {
                        provider: "layout_analysis",
                        message,
                    },
                });
            }
        };

        // Returned as a plain `Update`, not `Command::Send`: the outgoing
        // edge for this node is `Edge::FanOut`, which builds the dispatch
        // list from `state.regions` *after* this partial has been merged,
        // so segment's own bookkeeping (regions/max_total_score/progress)
        // is never discarded in favor of the fan-out.
        Ok(Command::Update(ExamPaperPartial {
            regions: Some(regions.clone()),
            max_total_score: Some(regions.iter().map(|r| r.max_score).sum()),
            needs_review: Some(regions.is_empty()),
            ..ExamPaperPartial::default().with_progress("segmented", 0.2)
        }))
    }
}

/// Builds the `grade_question` fan-out targets for the `segment` edge from
/// post-merge state: one child per region, or none if the submission had no
/// gradeable regions (the engine routes straight to the join in that case).
pub fn segment_fanout_targets(state: &ExamPaperState) -> Vec<SendTarget> {
    state
        .regions
        .get()
        .iter()
        .map(|region| {
            SendTarget::new(
                NodeKind::Custom("grade_question".to_string()),
                serde_json::json!(region),
            )
        })
        .collect()
}

/// `grade_question`: one fan-out child per `QuestionRegion`. Looks up the
/// semantic cache first (§4.3); on a miss, dispatches to the collaborator
/// resolved by [`QuestionType::resolved_agent`], retries per §4.2, and
/// falls back to [`GradingResult::degraded`] on exhaustion rather than
/// failing the run.
pub struct GradeQuestionNode {
    pub graders: GraderTable,
    pub cache: SemanticCache<GradingResult>,
    pub image_hasher: Arc<dyn ImageHasher>,
    pub retry_policy: RetryPolicy,
    pub cache_confidence_threshold: f64,
    pub cache_ttl: std::time::Duration,
}

/// One `Grader` per resolved agent type, per §4.7's "dispatch by resolved
/// question type" routing.
pub struct GraderTable {
    pub objective: Arc<dyn Grader>,
    pub stepwise: Arc<dyn Grader>,
    pub essay: Arc<dyn Grader>,
    pub lab_design: Arc<dyn Grader>,
}

impl GraderTable {
    fn resolve(&self, question_type: QuestionType) -> Arc<dyn Grader> {
        match question_type {
            QuestionType::Objective => self.objective.clone(),
            QuestionType::Stepwise => self.stepwise.clone(),
            QuestionType::Essay | QuestionType::Unknown => self.essay.clone(),
            QuestionType::LabDesign => self.lab_design.clone(),
        }
    }
}

#[async_trait]
impl Node<ExamPaperState> for GradeQuestionNode {
    async fn run(
        &self,
        snapshot: ExamPaperState,
        ctx: NodeContext,
    ) -> Result<Command<ExamPaperPartial>, NodeError> {
        let region: QuestionRegion = match ctx.send_input {
            Some(value) => serde_json::from_value(value)?,
            None => return Err(NodeError::MissingInput { what: "region" }),
        };
        let rubric = snapshot.rubric.get().clone();
        let rubric_hash_value = *snapshot.rubric_hash.get();

        // §4.3: a backend failure degrades to a cache miss, not a node
        // failure; the image hash itself is allowed to fail the same way
        // (a hash error just means this question is never cached).
        let image_hash = self
            .image_hasher
            .hash(region.image_ref.as_bytes())
            .map(|h| h)
            .unwrap_or_else(|_| rubric_hash(&region.image_ref));
        let key = CacheKey::new(rubric_hash_value, image_hash);

        if let Some(cached) = self.cache.lookup(key).await {
            ctx.emit("grade_question", format!("cache hit for {}", region.question_id))?;
            return Ok(Command::Update(ExamPaperPartial {
                grading_results: vec![cached.clone()],
                min_confidence: Some(cached.confidence),
                ..Default::default()
            }));
        }

        let grader = self.graders.resolve(region.question_type.resolved_agent());
        let outcome = retry(self.retry_policy, classify_collaborator_error, |_attempt| {
            let grader = grader.clone();
            let region = region.clone();
            let rubric = rubric.clone();
            async move { grader.grade(&region, &rubric).await }
        })
        .await;

        let result = match outcome {
            RetryOutcome::Succeeded { value, .. } => value,
            RetryOutcome::Exhausted { last_error, attempts } => {
                let error = ErrorEvent::grading(
                    region.question_id.clone(),
                    ctx.step,
                    LadderError::msg(format!("grading failed after {attempts} attempts: {last_error}")),
                );
                ctx.emit_diagnostic(
                    "grade_question",
                    format!("{} degraded after {attempts} attempts", region.question_id),
                )?;
                let degraded = GradingResult::degraded(
                    region.question_id.clone(),
                    region.max_score,
                    region.question_type.resolved_agent(),
                );
                return Ok(Command::Update(ExamPaperPartial {
                    grading_results: vec![degraded.clone()],
                    needs_review: Some(true),
                    min_confidence: Some(degraded.confidence),
                    ..ExamPaperPartial::default().with_error(error)
                }));
            }
        };

        if result.confidence >= self.cache_confidence_threshold {
            self.cache.store(key, result.clone(), self.cache_ttl).await;
        }

        Ok(Command::Update(ExamPaperPartial {
            grading_results: vec![result.clone()],
            min_confidence: Some(result.confidence),
            ..Default::default()
        }))
    }
}

/// `aggregate`: sums scores, takes the minimum confidence across every
/// graded region, and decides whether the run gates to human review
/// (§4.1: `needs_review = min_confidence < CONFIDENCE_REVIEW_THRESHOLD`).
pub struct AggregateNode {
    pub confidence_review_threshold: f64,
}

#[async_trait]
impl Node<ExamPaperState> for AggregateNode {
    async fn run(
        &self,
        snapshot: ExamPaperState,
        _ctx: NodeContext,
    ) -> Result<Command<ExamPaperPartial>, NodeError> {
        let results = snapshot.grading_results.get();
        let total_score: f64 = results.iter().map(|r| r.score).sum();
        let min_confidence = results
            .iter()
            .map(|r| r.confidence)
            .fold(1.0_f64, f64::min);
        let needs_review = min_confidence < self.confidence_review_threshold || *snapshot.needs_review.get();

        Ok(Command::Update(ExamPaperPartial {
            total_score: Some(total_score),
            min_confidence: Some(min_confidence),
            needs_review: Some(needs_review),
            ..ExamPaperPartial::default().with_progress("aggregated", 0.7)
        }))
    }
}

/// `wait_for_review`: interrupts when the run is gated; on resume,
/// interprets the `SendEvent` payload's `action` (§4.4/§6) and applies an
/// `OVERRIDE`'s score corrections directly onto `grading_results`.
pub struct WaitForReviewNode;

#[async_trait]
impl Node<ExamPaperState> for WaitForReviewNode {
    async fn run(
        &self,
        snapshot: ExamPaperState,
        ctx: NodeContext,
    ) -> Result<Command<ExamPaperPartial>, NodeError> {
        let Some(payload) = ctx.resume_payload else {
            if !*snapshot.needs_review.get() {
                return Ok(Command::Update(ExamPaperPartial::default()));
            }
            return Ok(Command::Interrupt(serde_json::json!({
                "reason": "low_confidence",
                "min_confidence": snapshot.min_confidence.get(),
            })));
        };

        #[derive(serde::Deserialize)]
        struct ResumePayload {
            action: ReviewAction,
            #[serde(default)]
            overrides: Vec<ScoreOverride>,
        }
        #[derive(serde::Deserialize)]
        struct ScoreOverride {
            question_id: String,
            score: f64,
        }

        let parsed: ResumePayload = serde_json::from_value(payload)?;
        match parsed.action {
            ReviewAction::Approve => Ok(Command::Update(ExamPaperPartial {
                review_outcome: Some(ReviewOutcome::Approved),
                ..Default::default()
            })),
            ReviewAction::Reject => Ok(Command::Update(ExamPaperPartial {
                review_outcome: Some(ReviewOutcome::Rejected),
                rejected: Some(true),
                ..Default::default()
            })),
            ReviewAction::Override => {
                let mut results = snapshot.grading_results.get().clone();
                let mut overridden_questions = Vec::new();
                for over in parsed.overrides {
                    if let Some(r) = results.iter_mut().find(|r| r.question_id == over.question_id) {
                        r.score = over.score;
                        r.confidence = 1.0;
                        overridden_questions.push(over.question_id);
                    }
                }
                let total_score: f64 = results.iter().map(|r| r.score).sum();
                ctx.emit("wait_for_review", format!("{} question(s) overridden", overridden_questions.len()))?;
                Ok(Command::Update(ExamPaperPartial {
                    grading_results: results,
                    total_score: Some(total_score),
                    needs_review: Some(false),
                    review_outcome: Some(ReviewOutcome::Overridden { overridden_questions }),
                    ..Default::default()
                }))
            }
        }
    }
}

/// `persist`: writes the final grading results via the `Persistence`
/// collaborator. Skipped entirely (a no-op Update) when the review
/// decision was `REJECT` — the conditional edge after `wait_for_review`
/// is what actually routes around this node; this guard is a second,
/// cheap line of defense against persisting rejected runs.
pub struct PersistNode {
    pub persistence: Arc<dyn Persistence>,
}

#[async_trait]
impl Node<ExamPaperState> for PersistNode {
    async fn run(
        &self,
        snapshot: ExamPaperState,
        _ctx: NodeContext,
    ) -> Result<Command<ExamPaperPartial>, NodeError> {
        if *snapshot.rejected.get() {
            return Ok(Command::Update(ExamPaperPartial::default()));
        }
        self.persistence
            .save_results(snapshot.submission_id.get(), snapshot.grading_results.get())
            .await
            .map_err(|e| match e {
                CollaboratorError::Transient { provider, message } => NodeError::Transient { provider, message },
                CollaboratorError::SchemaViolation { provider, message } => {
                    NodeError::SchemaViolation { provider, message }
                }
            })?;
        Ok(Command::Update(ExamPaperPartial::default().with_progress("persisted", 0.9)))
    }
}

/// `notify`: best-effort completion notification. A notifier failure is
/// logged, never fatal — the run has already persisted its results.
pub struct NotifyNode {
    pub notifier: Arc<dyn Notifier>,
}

#[async_trait]
impl Node<ExamPaperState> for NotifyNode {
    async fn run(
        &self,
        snapshot: ExamPaperState,
        ctx: NodeContext,
    ) -> Result<Command<ExamPaperPartial>, NodeError> {
        let event = if *snapshot.rejected.get() { "rejected" } else { "graded" };
        if let Err(e) = self.notifier.notify(snapshot.submission_id.get(), event).await {
            ctx.emit_diagnostic("notify", format!("notification failed: {e}"))?;
        }
        Ok(Command::Update(ExamPaperPartial::default().with_progress("notified", 1.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeGrader, FakeLayoutAnalysis, FakeNotifier, FakePersistence};
    use crate::graphs::exam_paper::state::BoundingBox;
    use crate::imaging::AverageHasher;

    fn region(id: &str, question_type: QuestionType) -> QuestionRegion {
        QuestionRegion {
            question_id: id.to_string(),
            page_index: 0,
            bounding_box: BoundingBox { x: 0, y: 0, width: 4, height: 4 },
            image_ref: format!("obj://{id}"),
            question_type,
            max_score: 10.0,
            rubric_ref: "r1".to_string(),
        }
    }

    fn ctx() -> NodeContext {
        NodeContext {
            node_id: "test".to_string(),
            step: 0,
            event_emitter: crate::event_bus::EventBus::default().get_emitter(),
            resume_payload: None,
            send_input: None,
        }
    }

    fn state() -> ExamPaperState {
        ExamPaperState::initial(serde_json::json!({
            "submission_id": "sub-1",
            "file_refs": ["obj://page1"],
            "rubric": "award full credit for correct final answer",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn segment_update_carries_regions_for_the_fanout_edge_to_dispatch() {
        let regions = vec![region("q1", QuestionType::Objective), region("q2", QuestionType::Stepwise)];
        let node = SegmentNode {
            layout: Arc::new(FakeLayoutAnalysis::new(regions.clone())),
            retry_policy: RetryPolicy::default(),
        };
        let cmd = node.run(state(), ctx()).await.unwrap();
        match cmd {
            Command::Update(partial) => {
                assert_eq!(partial.regions.as_ref().unwrap().len(), 2);
                assert_eq!(partial.needs_review, Some(false));
                let mut s = state();
                s.merge(partial);
                assert_eq!(segment_fanout_targets(&s).len(), 2);
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn segment_with_no_regions_flags_needs_review() {
        let node = SegmentNode {
            layout: Arc::new(FakeLayoutAnalysis::new(vec![])),
            retry_policy: RetryPolicy::default(),
        };
        let cmd = node.run(state(), ctx()).await.unwrap();
        match cmd {
            Command::Update(partial) => assert_eq!(partial.needs_review, Some(true)),
            other => panic!("expected Update, got {other:?}"),
        }
    }

    fn grade_node(grader: Arc<FakeGrader>) -> GradeQuestionNode {
        GradeQuestionNode {
            graders: GraderTable {
                objective: grader.clone(),
                stepwise: grader.clone(),
                essay: grader.clone(),
                lab_design: grader,
            },
            cache: SemanticCache::new(Arc::new(crate::cache::MokaBackend::default())),
            image_hasher: Arc::new(AverageHasher),
            retry_policy: RetryPolicy {
                max_attempts: 2,
                initial_delay: std::time::Duration::from_millis(1),
                multiplier: 1.0,
                cap: std::time::Duration::from_millis(5),
            },
            cache_confidence_threshold: 0.9,
            cache_ttl: std::time::Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn grade_question_degrades_after_exhaustion_instead_of_failing() {
        let grader = Arc::new(FakeGrader::new());
        grader.fail_question("q1");
        let node = grade_node(grader);
        let mut context = ctx();
        context.send_input = Some(serde_json::to_value(region("q1", QuestionType::Objective)).unwrap());
        let cmd = node.run(state(), context).await.unwrap();
        match cmd {
            Command::Update(partial) => {
                assert_eq!(partial.grading_results.len(), 1);
                assert_eq!(partial.grading_results[0].score, 0.0);
                assert_eq!(partial.needs_review, Some(true));
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn grade_question_missing_send_input_is_missing_input_error() {
        let node = grade_node(Arc::new(FakeGrader::new()));
        let err = node.run(state(), ctx()).await.unwrap_err();
        assert!(matches!(err, NodeError::MissingInput { .. }));
    }

    #[tokio::test]
    async fn aggregate_flags_review_below_threshold() {
        let node = AggregateNode { confidence_review_threshold: 0.75 };
        let mut s = state();
        s.merge(ExamPaperPartial {
            grading_results: vec![
                GradingResult {
                    question_id: "q1".into(),
                    score: 10.0,
                    max_score: 10.0,
                    confidence: 0.95,
                    agent_type: QuestionType::Objective,
                    evidence_chain: vec![],
                    visual_annotations: vec![],
                    feedback_text: String::new(),
                },
                GradingResult {
                    question_id: "q2".into(),
                    score: 3.0,
                    max_score: 10.0,
                    confidence: 0.5,
                    agent_type: QuestionType::Essay,
                    evidence_chain: vec![],
                    visual_annotations: vec![],
                    feedback_text: String::new(),
                },
            ],
            ..Default::default()
        });
        let cmd = node.run(s, ctx()).await.unwrap();
        match cmd {
            Command::Update(partial) => {
                assert_eq!(partial.total_score, Some(13.0));
                assert_eq!(partial.needs_review, Some(true));
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_review_interrupts_when_needed_and_resumes_on_approve() {
        let node = WaitForReviewNode;
        let mut s = state();
        s.merge(ExamPaperPartial { needs_review: Some(true), ..Default::default() });
        let cmd = node.run(s.clone(), ctx()).await.unwrap();
        assert!(cmd.is_interrupt());

        let mut resumed_ctx = ctx();
        resumed_ctx.resume_payload = Some(serde_json::json!({"action": "approve"}));
        let cmd = node.run(s, resumed_ctx).await.unwrap();
        match cmd {
            Command::Update(partial) => assert_eq!(partial.review_outcome, Some(ReviewOutcome::Approved)),
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_review_override_rewrites_score() {
        let node = WaitForReviewNode;
        let mut s = state();
        s.merge(ExamPaperPartial {
            needs_review: Some(true),
            grading_results: vec![GradingResult::degraded("q1", 10.0, QuestionType::Essay)],
            ..Default::default()
        });
        let mut resumed_ctx = ctx();
        resumed_ctx.resume_payload = Some(serde_json::json!({
            "action": "override",
            "overrides": [{"question_id": "q1", "score": 8.0}],
        }));
        let cmd = node.run(s, resumed_ctx).await.unwrap();
        match cmd {
            Command::Update(partial) => {
                assert_eq!(partial.total_score, Some(8.0));
                assert_eq!(partial.grading_results[0].score, 8.0);
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn persist_skips_rejected_runs() {
        let persistence = Arc::new(FakePersistence::new());
        let node = PersistNode { persistence: persistence.clone() };
        let mut s = state();
        s.merge(ExamPaperPartial { rejected: Some(true), ..Default::default() });
        node.run(s, ctx()).await.unwrap();
        assert!(persistence.saved().is_empty());
    }

    #[tokio::test]
    async fn notify_swallows_collaborator_failure() {
        struct FailingNotifier;
        #[async_trait]
        impl Notifier for FailingNotifier {
            async fn notify(&self, _submission_id: &str, _event: &str) -> Result<(), CollaboratorError> {
                Err(CollaboratorError::Transient { provider: "notifier", message: "down".into() })
            }
        }
        let node = NotifyNode { notifier: Arc::new(FailingNotifier) };
        let result = node.run(state(), ctx()).await;
        assert!(result.is_ok());
        let _ = FakeNotifier::new();
    }
}
