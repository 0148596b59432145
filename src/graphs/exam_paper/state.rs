//! State and domain types for the ExamPaper graph (§4.6).
//!
//! `ExamPaperState` is the concrete [`GraphState`] for the illustrative
//! graph: it embeds [`CoreChannels`] (every graph's `progress`/`errors`/
//! `attempts`/`cancel_requested`) plus the channels §4.6 names —
//! `regions`, `grading_results` (list-append reducer), `needs_review`,
//! `total_score`, `max_total_score`, `min_confidence` — as named, typed,
//! versioned struct fields rather than a runtime channel-name map (see the
//! redesign note in the design notes).

use serde::{Deserialize, Serialize};

use crate::channels::{Versioned, reduce_last_write, reduce_list_append, reduce_min, reduce_or};
use crate::graph_state::{CoreChannels, CorePartial, GraphState, GraphStateError};
use crate::types::QuestionType;

/// A cropped question region located by `segment`, inside state until
/// `grade_question` consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRegion {
    pub question_id: String,
    pub page_index: u32,
    pub bounding_box: BoundingBox,
    /// Opaque handle to the cropped image in object storage; the core
    /// never interprets this beyond passing it to collaborators.
    pub image_ref: String,
    pub question_type: QuestionType,
    pub max_score: f64,
    pub rubric_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One scored point backing a `STEPWISE` (or any) grading result. Invariant
/// P5: for `STEPWISE` results, `points_awarded` sums to `score`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub scoring_point: String,
    pub image_region: Option<BoundingBox>,
    pub reasoning: String,
    pub rubric_reference: String,
    pub points_awarded: f64,
}

/// The outcome of grading a single question, whether produced by a
/// collaborator call, a cache hit, or the retry wrapper's degraded result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingResult {
    pub question_id: String,
    pub score: f64,
    pub max_score: f64,
    pub confidence: f64,
    pub agent_type: QuestionType,
    pub evidence_chain: Vec<EvidenceItem>,
    pub visual_annotations: Vec<BoundingBox>,
    pub feedback_text: String,
}

impl GradingResult {
    /// The §4.2 degraded result: attempts exhausted, other branches
    /// unaffected.
    #[must_use]
    pub fn degraded(question_id: impl Into<String>, max_score: f64, agent_type: QuestionType) -> Self {
        Self {
            question_id: question_id.into(),
            score: 0.0,
            max_score,
            confidence: 0.0,
            agent_type,
            evidence_chain: Vec::new(),
            visual_annotations: Vec::new(),
            feedback_text: "needs human review".to_string(),
        }
    }

    /// P5: stepwise results must have their evidence chain sum to `score`.
    #[must_use]
    pub fn stepwise_consistent(&self) -> bool {
        if self.agent_type != QuestionType::Stepwise {
            return true;
        }
        let summed: f64 = self.evidence_chain.iter().map(|e| e.points_awarded).sum();
        (summed - self.score).abs() <= 1e-6
    }

    /// P4: bounded scores.
    #[must_use]
    pub fn is_bounded(&self) -> bool {
        self.score >= 0.0
            && self.score <= self.max_score + 1e-9
            && (0.0..=1.0).contains(&self.confidence)
    }
}

/// Outcome recorded against `state.review_decision` once `wait_for_review`
/// resumes; distinct from [`crate::types::ReviewAction`] only in that it
/// carries the resolved overrides alongside the action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReviewOutcome {
    Approved,
    Overridden { overridden_questions: Vec<String> },
    Rejected,
}

/// The graph-specific channels §4.6 names, beyond the core set every graph
/// carries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExamPaperState {
    pub core: CoreChannels,
    pub submission_id: Versioned<String>,
    pub file_refs: Versioned<Vec<String>>,
    pub rubric: Versioned<String>,
    pub rubric_hash: Versioned<u64>,
    pub regions: Versioned<Vec<QuestionRegion>>,
    pub grading_results: Versioned<Vec<GradingResult>>,
    pub needs_review: Versioned<bool>,
    pub total_score: Versioned<f64>,
    pub max_total_score: Versioned<f64>,
    pub min_confidence: Versioned<f64>,
    /// Set by `wait_for_review`'s resumption; `REJECT` routes the next
    /// conditional edge to `END` instead of `persist`.
    pub review_outcome: Versioned<Option<ReviewOutcome>>,
    /// Latched by a `REJECT` resume decision; the conditional edge after
    /// `wait_for_review` reads this instead of inventing a separate
    /// terminal-marker channel.
    pub rejected: Versioned<bool>,
}

/// A node's state-update for `ExamPaperState`. Every field is optional /
/// additive; [`ExamPaperState::merge`] applies each through its declared
/// reducer.
#[derive(Debug, Clone, Default)]
pub struct ExamPaperPartial {
    pub core: CorePartial,
    pub submission_id: Option<String>,
    pub file_refs: Option<Vec<String>>,
    pub rubric: Option<String>,
    pub rubric_hash: Option<u64>,
    pub regions: Option<Vec<QuestionRegion>>,
    pub grading_results: Vec<GradingResult>,
    pub needs_review: Option<bool>,
    pub total_score: Option<f64>,
    pub max_total_score: Option<f64>,
    pub min_confidence: Option<f64>,
    pub review_outcome: Option<ReviewOutcome>,
    pub rejected: Option<bool>,
}

impl ExamPaperPartial {
    #[must_use]
    pub fn with_progress(mut self, stage: impl Into<String>, fraction: f32) -> Self {
        self.core = self.core.with_progress(stage, fraction);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: crate::channels::errors::ErrorEvent) -> Self {
        self.core.errors.push(error);
        self
    }
}

impl GraphState for ExamPaperState {
    type Partial = ExamPaperPartial;

    fn initial(input: serde_json::Value) -> Result<Self, GraphStateError> {
        #[derive(Deserialize)]
        struct Input {
            submission_id: String,
            #[serde(default)]
            file_refs: Vec<String>,
            rubric: String,
        }
        let parsed: Input = serde_json::from_value(input)
            .map_err(|e| GraphStateError::InvalidInput(e.to_string()))?;
        if parsed.submission_id.trim().is_empty() {
            return Err(GraphStateError::InvalidInput("submission_id must not be empty".into()));
        }
        let rh = crate::cache::rubric_hash(&parsed.rubric);
        Ok(Self {
            core: CoreChannels::default(),
            submission_id: Versioned::new(parsed.submission_id),
            file_refs: Versioned::new(parsed.file_refs),
            rubric: Versioned::new(parsed.rubric),
            rubric_hash: Versioned::new(rh),
            regions: Versioned::default(),
            grading_results: Versioned::default(),
            needs_review: Versioned::default(),
            total_score: Versioned::default(),
            max_total_score: Versioned::default(),
            min_confidence: Versioned::new(1.0),
            review_outcome: Versioned::default(),
            rejected: Versioned::default(),
        })
    }

    fn merge(&mut self, partial: Self::Partial) {
        self.core.merge_partial(partial.core);
        if let Some(v) = partial.submission_id {
            reduce_last_write(&mut self.submission_id, v);
        }
        if let Some(v) = partial.file_refs {
            reduce_last_write(&mut self.file_refs, v);
        }
        if let Some(v) = partial.rubric {
            reduce_last_write(&mut self.rubric, v);
        }
        if let Some(v) = partial.rubric_hash {
            reduce_last_write(&mut self.rubric_hash, v);
        }
        if let Some(v) = partial.regions {
            reduce_last_write(&mut self.regions, v);
        }
        reduce_list_append(&mut self.grading_results, partial.grading_results);
        if let Some(v) = partial.needs_review {
            reduce_or(&mut self.needs_review, v);
        }
        if let Some(v) = partial.total_score {
            reduce_last_write(&mut self.total_score, v);
        }
        if let Some(v) = partial.max_total_score {
            reduce_last_write(&mut self.max_total_score, v);
        }
        if let Some(v) = partial.min_confidence {
            reduce_min(&mut self.min_confidence, v);
        }
        if let Some(v) = partial.review_outcome {
            reduce_last_write(&mut self.review_outcome, Some(v));
        }
        if let Some(v) = partial.rejected {
            reduce_or(&mut self.rejected, v);
        }
    }

    fn core(&self) -> &CoreChannels {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CoreChannels {
        &mut self.core
    }

    fn output_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "submission_id": self.submission_id.get(),
            "total_score": self.total_score.get(),
            "max_total_score": self.max_total_score.get(),
            "min_confidence": self.min_confidence.get(),
            "needs_review": self.needs_review.get(),
            "grading_results": self.grading_results.get(),
        })
    }

    fn channel_versions(&self) -> Vec<(&'static str, u32)> {
        let mut v = vec![
            ("progress", self.core.progress.version()),
            ("errors", self.core.errors.version()),
            ("attempts", self.core.attempts.version()),
            ("cancel_requested", self.core.cancel_requested.version()),
            ("submission_id", self.submission_id.version()),
            ("file_refs", self.file_refs.version()),
            ("rubric", self.rubric.version()),
            ("rubric_hash", self.rubric_hash.version()),
            ("regions", self.regions.version()),
            ("grading_results", self.grading_results.version()),
            ("needs_review", self.needs_review.version()),
            ("total_score", self.total_score.version()),
            ("max_total_score", self.max_total_score.version()),
            ("min_confidence", self.min_confidence.version()),
            ("review_outcome", self.review_outcome.version()),
            ("rejected", self.rejected.version()),
        ];
        v.shrink_to_fit();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: &str) -> QuestionRegion {
        QuestionRegion {
            question_id: id.to_string(),
            page_index: 0,
            bounding_box: BoundingBox { x: 0, y: 0, width: 10, height: 10 },
            image_ref: format!("obj://{id}"),
            question_type: QuestionType::Objective,
            max_score: 10.0,
            rubric_ref: "rubric://1".to_string(),
        }
    }

    #[test]
    fn initial_rejects_empty_submission_id() {
        let err = ExamPaperState::initial(serde_json::json!({"submission_id": "", "rubric": "r"}));
        assert!(err.is_err());
    }

    #[test]
    fn initial_computes_rubric_hash() {
        let s = ExamPaperState::initial(serde_json::json!({
            "submission_id": "sub-1", "rubric": "Award 1 point per correct answer"
        }))
        .unwrap();
        assert_eq!(*s.rubric_hash.get(), crate::cache::rubric_hash("Award 1 point per correct answer"));
    }

    #[test]
    fn grading_results_list_append_across_fan_out_merges() {
        let mut s = ExamPaperState::initial(serde_json::json!({"submission_id": "s", "rubric": "r"})).unwrap();
        s.merge(ExamPaperPartial {
            regions: Some(vec![region("q1"), region("q2")]),
            ..Default::default()
        });
        s.merge(ExamPaperPartial {
            grading_results: vec![GradingResult::degraded("q1", 10.0, QuestionType::Objective)],
            ..Default::default()
        });
        s.merge(ExamPaperPartial {
            grading_results: vec![GradingResult {
                question_id: "q2".into(),
                score: 10.0,
                max_score: 10.0,
                confidence: 0.95,
                agent_type: QuestionType::Objective,
                evidence_chain: vec![],
                visual_annotations: vec![],
                feedback_text: "correct".into(),
            }],
            ..Default::default()
        });
        assert_eq!(s.grading_results.get().len(), 2);
    }

    #[test]
    fn min_confidence_only_moves_down() {
        let mut s = ExamPaperState::initial(serde_json::json!({"submission_id": "s", "rubric": "r"})).unwrap();
        assert_eq!(*s.min_confidence.get(), 1.0);
        s.merge(ExamPaperPartial { min_confidence: Some(0.6), ..Default::default() });
        assert_eq!(*s.min_confidence.get(), 0.6);
        s.merge(ExamPaperPartial { min_confidence: Some(0.9), ..Default::default() });
        assert_eq!(*s.min_confidence.get(), 0.6);
    }

    #[test]
    fn degraded_result_matches_specification_contract() {
        let r = GradingResult::degraded("q1", 10.0, QuestionType::Essay);
        assert_eq!(r.score, 0.0);
        assert_eq!(r.confidence, 0.0);
        assert_eq!(r.feedback_text, "needs human review");
        assert!(r.is_bounded());
    }

    #[test]
    fn stepwise_consistency_checks_evidence_sum() {
        let mut r = GradingResult {
            question_id: "q1".into(),
            score: 7.0,
            max_score: 10.0,
            confidence: 0.8,
            agent_type: QuestionType::Stepwise,
            evidence_chain: vec![
                EvidenceItem { scoring_point: "a".into(), image_region: None, reasoning: "ok".into(), rubric_reference: "r1".into(), points_awarded: 3.0 },
                EvidenceItem { scoring_point: "b".into(), image_region: None, reasoning: "ok".into(), rubric_reference: "r2".into(), points_awarded: 4.0 },
            ],
            visual_annotations: vec![],
            feedback_text: String::new(),
        };
        assert!(r.stepwise_consistent());
        r.score = 8.0;
        assert!(!r.stepwise_consistent());
    }
}
