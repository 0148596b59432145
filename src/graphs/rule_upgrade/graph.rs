//! Wires the RuleUpgrade node bodies (§4.7) into a [`GraphDef`]: a linear
//! pipeline with one approval gate and one conditional rollback edge.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::collaborators::RuleUpgradeCollaborator;
use crate::engine::{Edge, GraphDef};
use crate::node::Node;
use crate::retry::RetryPolicy;
use crate::types::{GraphName, NodeKind};

use super::nodes::{
    AwaitApprovalNode, DeployNode, GenerateNode, MineNode, MonitorNode, RegressionTestNode, RollbackNode,
};
use super::state::RuleUpgradeState;

fn custom(name: &str) -> NodeKind {
    NodeKind::Custom(name.to_string())
}

/// Compiles the pipeline: `mine -> generate -> regression_test ->
/// await_approval -> deploy -> monitor -> [rollback if unhealthy] -> End`.
#[must_use]
pub fn build(collaborator: Arc<dyn RuleUpgradeCollaborator>) -> Arc<GraphDef<RuleUpgradeState>> {
    let mine = custom("mine");
    let generate = custom("generate");
    let regression_test = custom("regression_test");
    let await_approval = custom("await_approval");
    let deploy = custom("deploy");
    let monitor = custom("monitor");
    let rollback = custom("rollback");

    let mut nodes: FxHashMap<NodeKind, Arc<dyn Node<RuleUpgradeState>>> = FxHashMap::default();
    nodes.insert(mine.clone(), Arc::new(MineNode { collaborator: collaborator.clone(), retry_policy: RetryPolicy::default() }));
    nodes.insert(
        generate.clone(),
        Arc::new(GenerateNode { collaborator: collaborator.clone(), retry_policy: RetryPolicy::default() }),
    );
    nodes.insert(
        regression_test.clone(),
        Arc::new(RegressionTestNode { collaborator: collaborator.clone(), retry_policy: RetryPolicy::default() }),
    );
    nodes.insert(await_approval.clone(), Arc::new(AwaitApprovalNode));
    nodes.insert(
        deploy.clone(),
        Arc::new(DeployNode { collaborator: collaborator.clone(), retry_policy: RetryPolicy::default() }),
    );
    nodes.insert(
        monitor.clone(),
        Arc::new(MonitorNode { collaborator: collaborator.clone(), retry_policy: RetryPolicy::default() }),
    );
    nodes.insert(rollback.clone(), Arc::new(RollbackNode { collaborator, retry_policy: RetryPolicy::default() }));

    let mut edges: FxHashMap<NodeKind, Edge<RuleUpgradeState>> = FxHashMap::default();
    edges.insert(mine.clone(), Edge::Static(generate.clone()));
    edges.insert(generate.clone(), Edge::Static(regression_test.clone()));
    edges.insert(regression_test.clone(), Edge::Static(await_approval.clone()));
    edges.insert(await_approval.clone(), Edge::Static(deploy.clone()));
    edges.insert(deploy.clone(), Edge::Static(monitor.clone()));
    edges.insert(
        monitor.clone(),
        Edge::Conditional(Arc::new({
            let rollback = rollback.clone();
            move |state: &RuleUpgradeState| {
                let healthy = state.monitor_report.get().as_ref().is_some_and(|r| r.healthy);
                if healthy { NodeKind::End } else { rollback.clone() }
            }
        })),
    );
    edges.insert(rollback.clone(), Edge::Static(NodeKind::End));

    Arc::new(GraphDef {
        name: GraphName::RuleUpgrade,
        nodes,
        edges,
        fanout_join: FxHashMap::default(),
        entry: mine,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::FakeRuleUpgradeCollaborator;
    use crate::engine::{Engine, EngineStatus};
    use crate::graph_state::GraphState as _;
    use crate::graphs::rule_upgrade::state::RuleCandidate;
    use std::time::Duration;

    fn emitter() -> Arc<dyn crate::event_bus::EventEmitter> {
        crate::event_bus::EventBus::default().get_emitter()
    }

    #[tokio::test]
    async fn healthy_deployment_completes_without_rollback() {
        let collaborator = Arc::new(FakeRuleUpgradeCollaborator::new(vec![RuleCandidate {
            candidate_id: "c1".into(),
            description: "penalize missing units".into(),
            support: 10,
        }]));
        let graph = build(collaborator);
        let engine = Engine::new(graph.clone(), 10, Duration::from_secs(5));
        let state = RuleUpgradeState::initial(serde_json::json!({})).unwrap();
        let outcome = engine.run(state, graph.entry.clone(), None, 0, emitter()).await.unwrap();

        let (at, _) = match outcome.status {
            EngineStatus::Interrupted { at, payload } => (at, payload),
            EngineStatus::Completed => panic!("expected an approval interrupt"),
            EngineStatus::Cancelled => panic!("expected an approval interrupt, got cancelled"),
        };
        assert_eq!(at, NodeKind::Custom("await_approval".to_string()));

        let resumed = engine
            .run(outcome.state, at, Some(serde_json::json!({"approved": true})), 1, emitter())
            .await
            .unwrap();
        assert!(matches!(resumed.status, EngineStatus::Completed));
        assert!(resumed.state.deployment_ref.get().is_some());
        assert!(!*resumed.state.rolled_back.get());
    }

    #[tokio::test]
    async fn failed_regression_still_reaches_approval_gate_with_report_attached() {
        let collaborator = Arc::new(FakeRuleUpgradeCollaborator::new(vec![RuleCandidate {
            candidate_id: "c1".into(),
            description: "penalize missing units".into(),
            support: 10,
        }]));
        collaborator.fail_regression();
        let graph = build(collaborator);
        let engine = Engine::new(graph.clone(), 10, Duration::from_secs(5));
        let state = RuleUpgradeState::initial(serde_json::json!({})).unwrap();
        let outcome = engine.run(state, graph.entry.clone(), None, 0, emitter()).await.unwrap();

        match outcome.status {
            EngineStatus::Interrupted { payload, .. } => {
                assert_eq!(payload["regression_report"]["passed"], false);
            }
            EngineStatus::Completed => panic!("expected an approval interrupt"),
            EngineStatus::Cancelled => panic!("expected an approval interrupt, got cancelled"),
        }
    }
}
