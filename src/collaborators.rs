//! Collaborator contracts (§6): the external services grading nodes call.
//!
//! Nodes never talk to an LLM grader, a segmentation service, a database,
//! or a notification sink directly — they go through one of these traits.
//! That keeps every node testable against an in-process fake and lets a
//! deployment swap backends without touching graph logic.

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use crate::graphs::batch_grading::state::StudentBoundary;
use crate::graphs::exam_paper::state::{GradingResult, QuestionRegion};
use crate::graphs::rule_upgrade::state::{GeneratedRule, MonitorReport, RegressionReport, RuleCandidate};
use crate::types::QuestionType;

#[derive(Debug, Error, Diagnostic)]
pub enum CollaboratorError {
    #[error("transient failure calling {provider}: {message}")]
    #[diagnostic(code(examflow::collaborators::transient))]
    Transient {
        provider: &'static str,
        message: String,
    },

    #[error("{provider} response violated its schema: {message}")]
    #[diagnostic(code(examflow::collaborators::schema_violation))]
    SchemaViolation {
        provider: &'static str,
        message: String,
    },
}

/// `LayoutAnalysis.Segment(file_refs) -> Vec<QuestionRegion>`. The
/// collaborator behind the `segment` node: locates each question's
/// bounding box and resolved type across the submission's pages.
#[async_trait]
pub trait LayoutAnalysis: Send + Sync {
    async fn segment(
        &self,
        file_refs: &[String],
        rubric: &str,
    ) -> Result<Vec<QuestionRegion>, CollaboratorError>;
}

/// `Grader.Grade(region, rubric) -> GradingResult`. The collaborator behind
/// `grade_question`, dispatched per [`QuestionType::resolved_agent`].
#[async_trait]
pub trait Grader: Send + Sync {
    async fn grade(&self, region: &QuestionRegion, rubric: &str) -> Result<GradingResult, CollaboratorError>;
}

/// `Persistence.SaveResults(run_id, results)`. The collaborator behind
/// `persist`.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_results(
        &self,
        submission_id: &str,
        results: &[GradingResult],
    ) -> Result<(), CollaboratorError>;
}

/// `Notifier.Notify(submission_id, event)`. The collaborator behind
/// `notify`; fire-and-forget from the graph's perspective (a failure here
/// is logged, never fatal to the run).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, submission_id: &str, event: &str) -> Result<(), CollaboratorError>;
}

/// `BoundaryDetector.Detect(file_refs) -> StudentBoundary[]`. The
/// collaborator behind BatchGrading's `detect_student_boundaries` node
/// (§4.7): partitions a multi-student page stream into per-student slices.
#[async_trait]
pub trait BoundaryDetector: Send + Sync {
    async fn detect(&self, file_refs: &[String]) -> Result<Vec<StudentBoundary>, CollaboratorError>;
}

/// The external rule-mining/regression/deployment pipeline behind the
/// RuleUpgrade graph's nodes (§4.7). Real rule-mining and deployment logic
/// is out of scope for this crate — the graph provides the shape (typed
/// state, edges, the approval interrupt, the conditional rollback edge) and
/// delegates each stage's body to an implementation of this trait.
#[async_trait]
pub trait RuleUpgradeCollaborator: Send + Sync {
    async fn mine(&self) -> Result<Vec<RuleCandidate>, CollaboratorError>;
    async fn generate(&self, candidates: &[RuleCandidate]) -> Result<Vec<GeneratedRule>, CollaboratorError>;
    async fn regression_test(&self, rules: &[GeneratedRule]) -> Result<RegressionReport, CollaboratorError>;
    async fn deploy(&self, rules: &[GeneratedRule]) -> Result<String, CollaboratorError>;
    async fn monitor(&self, deployment_ref: &str) -> Result<MonitorReport, CollaboratorError>;
    async fn rollback(&self, deployment_ref: &str) -> Result<(), CollaboratorError>;
}

/// In-process fakes for integration tests. Each fake is deterministic and
/// configurable enough to drive every tested edge case (P1-P12) without a
/// real LLM, object store, or database behind it.
pub mod fakes {
    use super::{
        BoundaryDetector, CollaboratorError, GeneratedRule, Grader, GradingResult, LayoutAnalysis, MonitorReport,
        Notifier, Persistence, QuestionRegion, RegressionReport, RuleCandidate, RuleUpgradeCollaborator,
        StudentBoundary,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Segments a fixed, caller-supplied set of regions regardless of the
    /// file refs it's given — real layout analysis is out of scope here,
    /// only its contract shape.
    pub struct FakeLayoutAnalysis {
        regions: Vec<QuestionRegion>,
    }

    impl FakeLayoutAnalysis {
        #[must_use]
        pub fn new(regions: Vec<QuestionRegion>) -> Self {
            Self { regions }
        }
    }

    #[async_trait]
    impl LayoutAnalysis for FakeLayoutAnalysis {
        async fn segment(
            &self,
            _file_refs: &[String],
            _rubric: &str,
        ) -> Result<Vec<QuestionRegion>, CollaboratorError> {
            Ok(self.regions.clone())
        }
    }

    /// Grades deterministically: full score and high confidence unless the
    /// question id was pre-registered via [`FakeGrader::fail_question`] (to
    /// force a transient error for retry/degradation tests) or
    /// [`FakeGrader::score_question`] (to pin a specific score/confidence).
    #[derive(Default)]
    pub struct FakeGrader {
        failing: Mutex<std::collections::HashSet<String>>,
        pinned: Mutex<std::collections::HashMap<String, (f64, f64)>>,
        calls: Arc<std::sync::atomic::AtomicU32>,
    }

    impl FakeGrader {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Every call to `grade` for `question_id` fails with a transient
        /// error until this is cleared.
        pub fn fail_question(&self, question_id: impl Into<String>) {
            self.failing.lock().insert(question_id.into());
        }

        pub fn stop_failing(&self, question_id: &str) {
            self.failing.lock().remove(question_id);
        }

        pub fn score_question(&self, question_id: impl Into<String>, score: f64, confidence: f64) {
            self.pinned.lock().insert(question_id.into(), (score, confidence));
        }

        #[must_use]
        pub fn call_count(&self) -> u32 {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Grader for FakeGrader {
        async fn grade(&self, region: &QuestionRegion, _rubric: &str) -> Result<GradingResult, CollaboratorError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.failing.lock().contains(&region.question_id) {
                return Err(CollaboratorError::Transient {
                    provider: "fake_grader",
                    message: "forced failure".to_string(),
                });
            }
            let (score, confidence) = self
                .pinned
                .lock()
                .get(&region.question_id)
                .copied()
                .unwrap_or((region.max_score, 0.98));
            Ok(GradingResult {
                question_id: region.question_id.clone(),
                score,
                max_score: region.max_score,
                confidence,
                agent_type: region.question_type.resolved_agent(),
                evidence_chain: Vec::new(),
                visual_annotations: Vec::new(),
                feedback_text: "graded".to_string(),
            })
        }
    }

    /// Records every call it receives; tests assert against `saved()`.
    #[derive(Default)]
    pub struct FakePersistence {
        saved: Mutex<Vec<(String, Vec<GradingResult>)>>,
    }

    impl FakePersistence {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        #[must_use]
        pub fn saved(&self) -> Vec<(String, Vec<GradingResult>)> {
            self.saved.lock().clone()
        }
    }

    #[async_trait]
    impl Persistence for FakePersistence {
        async fn save_results(
            &self,
            submission_id: &str,
            results: &[GradingResult],
        ) -> Result<(), CollaboratorError> {
            self.saved.lock().push((submission_id.to_string(), results.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeNotifier {
        events: Mutex<Vec<(String, String)>>,
    }

    impl FakeNotifier {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        #[must_use]
        pub fn events(&self) -> Vec<(String, String)> {
            self.events.lock().clone()
        }
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn notify(&self, submission_id: &str, event: &str) -> Result<(), CollaboratorError> {
            self.events.lock().push((submission_id.to_string(), event.to_string()));
            Ok(())
        }
    }

    /// Detects a fixed, caller-supplied set of boundaries regardless of the
    /// file refs it's given, mirroring [`FakeLayoutAnalysis`]'s shape.
    pub struct FakeBoundaryDetector {
        boundaries: Vec<StudentBoundary>,
    }

    impl FakeBoundaryDetector {
        #[must_use]
        pub fn new(boundaries: Vec<StudentBoundary>) -> Self {
            Self { boundaries }
        }
    }

    #[async_trait]
    impl BoundaryDetector for FakeBoundaryDetector {
        async fn detect(&self, _file_refs: &[String]) -> Result<Vec<StudentBoundary>, CollaboratorError> {
            Ok(self.boundaries.clone())
        }
    }

    /// Drives a deterministic rule-upgrade pipeline: mines one fixed
    /// candidate, generates one rule per candidate, and passes regression
    /// unless [`FakeRuleUpgradeCollaborator::fail_regression`] was called.
    #[derive(Default)]
    pub struct FakeRuleUpgradeCollaborator {
        candidates: Vec<RuleCandidate>,
        regression_fails: Mutex<bool>,
        rolled_back: Mutex<Vec<String>>,
    }

    impl FakeRuleUpgradeCollaborator {
        #[must_use]
        pub fn new(candidates: Vec<RuleCandidate>) -> Self {
            Self {
                candidates,
                regression_fails: Mutex::new(false),
                rolled_back: Mutex::new(Vec::new()),
            }
        }

        pub fn fail_regression(&self) {
            *self.regression_fails.lock() = true;
        }

        #[must_use]
        pub fn rolled_back(&self) -> Vec<String> {
            self.rolled_back.lock().clone()
        }
    }

    #[async_trait]
    impl RuleUpgradeCollaborator for FakeRuleUpgradeCollaborator {
        async fn mine(&self) -> Result<Vec<RuleCandidate>, CollaboratorError> {
            Ok(self.candidates.clone())
        }

        async fn generate(&self, candidates: &[RuleCandidate]) -> Result<Vec<GeneratedRule>, CollaboratorError> {
            Ok(candidates
                .iter()
                .map(|c| GeneratedRule {
                    rule_id: format!("{}-rule", c.candidate_id),
                    candidate_id: c.candidate_id.clone(),
                    body: format!("derived from {}", c.description),
                })
                .collect())
        }

        async fn regression_test(&self, rules: &[GeneratedRule]) -> Result<RegressionReport, CollaboratorError> {
            let failing = *self.regression_fails.lock();
            Ok(RegressionReport {
                passed: !failing,
                regressions: if failing { rules.iter().map(|r| r.rule_id.clone()).collect() } else { Vec::new() },
                sample_size: rules.len() as u32 * 25,
            })
        }

        async fn deploy(&self, rules: &[GeneratedRule]) -> Result<String, CollaboratorError> {
            Ok(format!("deployment-{}", rules.len()))
        }

        async fn monitor(&self, deployment_ref: &str) -> Result<MonitorReport, CollaboratorError> {
            Ok(MonitorReport {
                healthy: true,
                observations: vec![format!("{deployment_ref} stable")],
            })
        }

        async fn rollback(&self, deployment_ref: &str) -> Result<(), CollaboratorError> {
            self.rolled_back.lock().push(deployment_ref.to_string());
            Ok(())
        }
    }
}
