//! Wires the ExamPaper node bodies (§4.6) into a [`GraphDef`].
//!
//! `segment` carries its own bookkeeping home via a plain `Command::Update`;
//! the edge that follows it is an [`Edge::FanOut`] that reads the freshly
//! merged `regions` channel to build the `grade_question` dispatch list,
//! joining at `aggregate`. Every other edge is `Static` except `aggregate`
//! (conditional on `needs_review`) and `wait_for_review` (conditional on
//! `rejected`).

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::cache::SemanticCache;
use crate::collaborators::{LayoutAnalysis, Notifier, Persistence};
use crate::config::ExamflowConfig;
use crate::engine::{Edge, GraphDef};
use crate::graph_state::GraphState as _;
use crate::imaging::ImageHasher;
use crate::node::Node;
use crate::retry::RetryPolicy;
use crate::types::{GraphName, NodeKind};

use super::nodes::{
    AggregateNode, GradeQuestionNode, GraderTable, NotifyNode, PersistNode, SegmentNode,
    WaitForReviewNode, segment_fanout_targets,
};
use super::state::ExamPaperState;

/// The collaborator set a deployment wires up to drive the ExamPaper graph;
/// see [`crate::collaborators`] for each trait's contract.
pub struct ExamPaperCollaborators {
    pub layout: Arc<dyn LayoutAnalysis>,
    pub graders: GraderTable,
    pub persistence: Arc<dyn Persistence>,
    pub notifier: Arc<dyn Notifier>,
    pub image_hasher: Arc<dyn ImageHasher>,
}

fn custom(name: &str) -> NodeKind {
    NodeKind::Custom(name.to_string())
}

/// Compiles the ExamPaper pipeline: `segment -> (fan-out) grade_question ->
/// aggregate -> [wait_for_review] -> [persist] -> notify -> End`.
#[must_use]
pub fn build(
    collaborators: ExamPaperCollaborators,
    cache: SemanticCache<super::state::GradingResult>,
    config: &ExamflowConfig,
) -> Arc<GraphDef<ExamPaperState>> {
    let segment = custom("segment");
    let grade_question = custom("grade_question");
    let aggregate = custom("aggregate");
    let wait_for_review = custom("wait_for_review");
    let persist = custom("persist");
    let notify = custom("notify");

    let mut nodes: FxHashMap<NodeKind, Arc<dyn Node<ExamPaperState>>> = FxHashMap::default();
    nodes.insert(
        segment.clone(),
        Arc::new(SegmentNode {
            layout: collaborators.layout,
            retry_policy: RetryPolicy::default(),
        }),
    );
    nodes.insert(
        grade_question.clone(),
        Arc::new(GradeQuestionNode {
            graders: collaborators.graders,
            cache,
            image_hasher: collaborators.image_hasher,
            retry_policy: RetryPolicy::default(),
            cache_confidence_threshold: config.confidence_cache_threshold,
            cache_ttl: config.cache_ttl,
        }),
    );
    nodes.insert(
        aggregate.clone(),
        Arc::new(AggregateNode {
            confidence_review_threshold: config.confidence_review_threshold,
        }),
    );
    nodes.insert(wait_for_review.clone(), Arc::new(WaitForReviewNode));
    nodes.insert(
        persist.clone(),
        Arc::new(PersistNode { persistence: collaborators.persistence }),
    );
    nodes.insert(notify.clone(), Arc::new(NotifyNode { notifier: collaborators.notifier }));

    let mut edges: FxHashMap<NodeKind, Edge<ExamPaperState>> = FxHashMap::default();
    edges.insert(
        segment.clone(),
        Edge::FanOut {
            build_targets: Arc::new(segment_fanout_targets),
            join: aggregate.clone(),
        },
    );
    edges.insert(
        aggregate.clone(),
        Edge::Conditional(Arc::new({
            let wait_for_review = wait_for_review.clone();
            let persist = persist.clone();
            move |state: &ExamPaperState| {
                if *state.needs_review.get() {
                    wait_for_review.clone()
                } else {
                    persist.clone()
                }
            }
        })),
    );
    edges.insert(
        wait_for_review.clone(),
        Edge::Conditional(Arc::new({
            let persist = persist.clone();
            move |state: &ExamPaperState| {
                if *state.rejected.get() {
                    NodeKind::End
                } else {
                    persist.clone()
                }
            }
        })),
    );
    edges.insert(persist.clone(), Edge::Static(notify.clone()));
    edges.insert(notify.clone(), Edge::Static(NodeKind::End));

    Arc::new(GraphDef {
        name: GraphName::ExamPaper,
        nodes,
        edges,
        fanout_join: FxHashMap::default(),
        entry: segment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeGrader, FakeLayoutAnalysis, FakeNotifier, FakePersistence};
    use crate::engine::{Engine, EngineStatus};
    use crate::graphs::exam_paper::state::{BoundingBox, QuestionRegion};
    use crate::imaging::AverageHasher;
    use crate::types::QuestionType;
    use std::time::Duration;

    fn region(id: &str, question_type: QuestionType, score: f64, confidence: f64) -> (QuestionRegion, f64, f64) {
        (
            QuestionRegion {
                question_id: id.to_string(),
                page_index: 0,
                bounding_box: BoundingBox { x: 0, y: 0, width: 4, height: 4 },
                image_ref: format!("obj://{id}"),
                question_type,
                max_score: 10.0,
                rubric_ref: "r1".to_string(),
            },
            score,
            confidence,
        )
    }

    fn emitter() -> Arc<dyn crate::event_bus::EventEmitter> {
        crate::event_bus::EventBus::default().get_emitter()
    }

    #[tokio::test]
    async fn single_objective_question_completes_without_review() {
        let (region, score, confidence) = region("q1", QuestionType::Objective, 10.0, 0.99);
        let grader = Arc::new(FakeGrader::new());
        grader.score_question("q1", score, confidence);
        let persistence = Arc::new(FakePersistence::new());
        let notifier = Arc::new(FakeNotifier::new());

        let collaborators = ExamPaperCollaborators {
            layout: Arc::new(FakeLayoutAnalysis::new(vec![region])),
            graders: GraderTable {
                objective: grader.clone(),
                stepwise: grader.clone(),
                essay: grader.clone(),
                lab_design: grader,
            },
            persistence: persistence.clone(),
            notifier: notifier.clone(),
            image_hasher: Arc::new(AverageHasher),
        };
        let cache = SemanticCache::new(Arc::new(crate::cache::MokaBackend::default()));
        let config = ExamflowConfig::default();
        let graph = build(collaborators, cache, &config);

        let engine = Engine::new(graph.clone(), config.fanout_concurrency_cap, Duration::from_secs(5));
        let state = ExamPaperState::initial(serde_json::json!({
            "submission_id": "sub-1",
            "file_refs": ["obj://page1"],
            "rubric": "award full credit for correct final answer",
        }))
        .unwrap();
        let outcome = engine.run(state, graph.entry.clone(), None, 0, emitter()).await.unwrap();

        assert!(matches!(outcome.status, EngineStatus::Completed));
        assert_eq!(*outcome.state.total_score.get(), 10.0);
        assert_eq!(*outcome.state.max_total_score.get(), 10.0);
        assert!(!*outcome.state.needs_review.get());
        assert_eq!(persistence.saved().len(), 1);
        assert_eq!(notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn low_confidence_region_pauses_for_review() {
        let (region, score, confidence) = region("q1", QuestionType::Essay, 4.0, 0.5);
        let grader = Arc::new(FakeGrader::new());
        grader.score_question("q1", score, confidence);
        let collaborators = ExamPaperCollaborators {
            layout: Arc::new(FakeLayoutAnalysis::new(vec![region])),
            graders: GraderTable {
                objective: grader.clone(),
                stepwise: grader.clone(),
                essay: grader.clone(),
                lab_design: grader,
            },
            persistence: Arc::new(FakePersistence::new()),
            notifier: Arc::new(FakeNotifier::new()),
            image_hasher: Arc::new(AverageHasher),
        };
        let cache = SemanticCache::new(Arc::new(crate::cache::MokaBackend::default()));
        let config = ExamflowConfig::default();
        let graph = build(collaborators, cache, &config);
        let engine = Engine::new(graph.clone(), config.fanout_concurrency_cap, Duration::from_secs(5));
        let state = ExamPaperState::initial(serde_json::json!({
            "submission_id": "sub-1",
            "file_refs": ["obj://page1"],
            "rubric": "r",
        }))
        .unwrap();
        let outcome = engine.run(state, graph.entry.clone(), None, 0, emitter()).await.unwrap();

        let (at, _payload) = match outcome.status {
            EngineStatus::Interrupted { at, payload } => (at, payload),
            EngineStatus::Completed => panic!("expected a review gate interrupt"),
            EngineStatus::Cancelled => panic!("expected a review gate interrupt, got cancelled"),
        };
        assert_eq!(at, NodeKind::Custom("wait_for_review".to_string()));

        let resumed = engine
            .run(outcome.state, at, Some(serde_json::json!({"action": "approve"})), 1, emitter())
            .await
            .unwrap();
        assert!(matches!(resumed.status, EngineStatus::Completed));
        assert_eq!(*resumed.state.total_score.get(), 4.0);
    }

    #[tokio::test]
    async fn zero_regions_routes_straight_through_to_review_gate() {
        let collaborators = ExamPaperCollaborators {
            layout: Arc::new(FakeLayoutAnalysis::new(vec![])),
            graders: GraderTable {
                objective: Arc::new(FakeGrader::new()),
                stepwise: Arc::new(FakeGrader::new()),
                essay: Arc::new(FakeGrader::new()),
                lab_design: Arc::new(FakeGrader::new()),
            },
            persistence: Arc::new(FakePersistence::new()),
            notifier: Arc::new(FakeNotifier::new()),
            image_hasher: Arc::new(AverageHasher),
        };
        let cache = SemanticCache::new(Arc::new(crate::cache::MokaBackend::default()));
        let config = ExamflowConfig::default();
        let graph = build(collaborators, cache, &config);
        let engine = Engine::new(graph.clone(), config.fanout_concurrency_cap, Duration::from_secs(5));
        let state = ExamPaperState::initial(serde_json::json!({
            "submission_id": "sub-1",
            "file_refs": [],
            "rubric": "r",
        }))
        .unwrap();
        let outcome = engine.run(state, graph.entry.clone(), None, 0, emitter()).await.unwrap();
        assert!(matches!(outcome.status, EngineStatus::Interrupted { .. }));
    }
}
