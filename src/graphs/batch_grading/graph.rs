//! Wires the BatchGrading node bodies (§4.7) into a [`GraphDef`]:
//! `detect_student_boundaries -> boundary_review -> (fan-out) grade_student
//! -> finalize -> End`.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::collaborators::BoundaryDetector;
use crate::engine::{Edge, GraphDef};
use crate::graphs::exam_paper::state::ExamPaperState;
use crate::node::Node;
use crate::retry::RetryPolicy;
use crate::types::{GraphName, NodeKind};

use super::nodes::{BoundaryReviewNode, DetectBoundariesNode, FinalizeNode, GradeStudentNode, student_fanout_targets};
use super::state::BatchGradingState;

fn custom(name: &str) -> NodeKind {
    NodeKind::Custom(name.to_string())
}

/// Compiles the BatchGrading pipeline. `exam_paper_graph` is the compiled
/// ExamPaper `GraphDef` each `grade_student` fan-out child drives to
/// completion as a nested run.
#[must_use]
pub fn build(
    detector: Arc<dyn BoundaryDetector>,
    exam_paper_graph: Arc<GraphDef<ExamPaperState>>,
    confidence_review_threshold: f64,
    fanout_concurrency_cap: usize,
    node_timeout: Duration,
) -> Arc<GraphDef<BatchGradingState>> {
    let detect = custom("detect_student_boundaries");
    let review = custom("boundary_review");
    let grade_student = custom("grade_student");
    let finalize = custom("finalize");

    let mut nodes: FxHashMap<NodeKind, Arc<dyn Node<BatchGradingState>>> = FxHashMap::default();
    nodes.insert(
        detect.clone(),
        Arc::new(DetectBoundariesNode {
            detector,
            retry_policy: RetryPolicy::default(),
            confidence_review_threshold,
        }),
    );
    nodes.insert(review.clone(), Arc::new(BoundaryReviewNode));
    nodes.insert(
        grade_student.clone(),
        Arc::new(GradeStudentNode { exam_paper_graph, fanout_concurrency_cap, node_timeout }),
    );
    nodes.insert(finalize.clone(), Arc::new(FinalizeNode));

    let mut edges: FxHashMap<NodeKind, Edge<BatchGradingState>> = FxHashMap::default();
    edges.insert(detect.clone(), Edge::Static(review.clone()));
    edges.insert(
        review.clone(),
        Edge::FanOut {
            build_targets: Arc::new(student_fanout_targets),
            join: finalize.clone(),
        },
    );
    edges.insert(finalize.clone(), Edge::Static(NodeKind::End));

    Arc::new(GraphDef {
        name: GraphName::BatchGrading,
        nodes,
        edges,
        fanout_join: FxHashMap::default(),
        entry: detect,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeBoundaryDetector, FakeGrader, FakeLayoutAnalysis, FakeNotifier, FakePersistence};
    use crate::engine::{Engine, EngineStatus};
    use crate::graph_state::GraphState as _;
    use crate::graphs::exam_paper::graph::ExamPaperCollaborators;
    use crate::graphs::exam_paper::nodes::GraderTable;
    use crate::graphs::batch_grading::state::StudentBoundary;
    use crate::imaging::AverageHasher;
    use crate::types::QuestionType;

    fn exam_paper_graph() -> Arc<GraphDef<ExamPaperState>> {
        let grader = Arc::new(FakeGrader::new());
        let collaborators = ExamPaperCollaborators {
            layout: Arc::new(FakeLayoutAnalysis::new(vec![crate::graphs::exam_paper::state::QuestionRegion {
                question_id: "q1".into(),
                page_index: 0,
                bounding_box: crate::graphs::exam_paper::state::BoundingBox { x: 0, y: 0, width: 4, height: 4 },
                image_ref: "obj://q1".into(),
                question_type: QuestionType::Objective,
                max_score: 10.0,
                rubric_ref: "r".into(),
            }])),
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
        let cache = crate::cache::SemanticCache::new(Arc::new(crate::cache::MokaBackend::default()));
        crate::graphs::exam_paper::graph::build(collaborators, cache, &crate::config::ExamflowConfig::default())
    }

    #[tokio::test]
    async fn two_students_fold_into_student_runs() {
        let boundaries = vec![
            StudentBoundary { student_id: "s1".into(), file_refs: vec!["p1".into()], confidence: 0.95 },
            StudentBoundary { student_id: "s2".into(), file_refs: vec!["p2".into()], confidence: 0.9 },
        ];
        let graph = build(
            Arc::new(FakeBoundaryDetector::new(boundaries)),
            exam_paper_graph(),
            0.75,
            10,
            Duration::from_secs(5),
        );
        let engine = Engine::new(graph.clone(), 10, Duration::from_secs(5));
        let state = BatchGradingState::initial(serde_json::json!({
            "file_refs": ["p1", "p2"],
            "rubric": "award full credit",
        }))
        .unwrap();
        let emitter = crate::event_bus::EventBus::default().get_emitter();
        let outcome = engine.run(state, graph.entry.clone(), None, 0, emitter).await.unwrap();

        assert!(matches!(outcome.status, EngineStatus::Completed));
        assert_eq!(outcome.state.student_runs.get().len(), 2);
    }

    #[tokio::test]
    async fn low_confidence_boundary_pauses_before_fanout() {
        let boundaries = vec![StudentBoundary { student_id: "s1".into(), file_refs: vec!["p1".into()], confidence: 0.4 }];
        let graph = build(
            Arc::new(FakeBoundaryDetector::new(boundaries)),
            exam_paper_graph(),
            0.75,
            10,
            Duration::from_secs(5),
        );
        let engine = Engine::new(graph.clone(), 10, Duration::from_secs(5));
        let state = BatchGradingState::initial(serde_json::json!({"file_refs": ["p1"], "rubric": "r"})).unwrap();
        let emitter = crate::event_bus::EventBus::default().get_emitter();
        let outcome = engine.run(state, graph.entry.clone(), None, 0, emitter).await.unwrap();
        assert!(matches!(outcome.status, EngineStatus::Interrupted { .. }));
    }
}
