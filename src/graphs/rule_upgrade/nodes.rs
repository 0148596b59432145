//! Node bodies for the RuleUpgrade graph (§4.7): `mine -> generate ->
//! regression_test -> [interrupt for approval] -> deploy -> monitor ->
//! [conditional rollback]`. Every node delegates to an injected
//! `RuleUpgradeCollaborator`; this crate owns only the shape.

use std::sync::Arc;

use async_trait::async_trait;

use crate::collaborators::{CollaboratorError, RuleUpgradeCollaborator};
use crate::control::Command;
use crate::node::{Node, NodeContext, NodeError};
use crate::retry::{RetryOutcome, RetryPolicy, retry};

use super::state::{RuleUpgradePartial, RuleUpgradeState};

fn classify_collaborator_error(err: &CollaboratorError) -> bool {
    matches!(err, CollaboratorError::Transient { .. })
}

fn into_node_error(provider: &'static str, attempts: u32, last_error: CollaboratorError) -> NodeError {
    let _ = attempts;
    match last_error {
        CollaboratorError::Transient { message, .. } => NodeError::Transient { provider, message },
        CollaboratorError::SchemaViolation { message, .. } => NodeError::SchemaViolation { provider, message },
    }
}

/// `mine`: surfaces candidate rules mined from recent grading history.
pub struct MineNode {
    pub collaborator: Arc<dyn RuleUpgradeCollaborator>,
    pub retry_policy: RetryPolicy,
}

#[async_trait]
impl Node<RuleUpgradeState> for MineNode {
    async fn run(
        &self,
        _snapshot: RuleUpgradeState,
        _ctx: NodeContext,
    ) -> Result<Command<RuleUpgradePartial>, NodeError> {
        let outcome = retry(self.retry_policy, classify_collaborator_error, |_attempt| {
            let collaborator = self.collaborator.clone();
            async move { collaborator.mine().await }
        })
        .await;

        let candidates = match outcome {
            RetryOutcome::Succeeded { value, .. } => value,
            RetryOutcome::Exhausted { last_error, attempts } => {
                return Err(into_node_error("rule_miner", attempts, last_error));
            }
        };

        Ok(Command::Update(RuleUpgradePartial {
            rule_candidates: candidates,
            ..RuleUpgradePartial::default().with_progress("mined", 0.15)
        }))
    }
}

/// `generate`: turns mined candidates into concrete rule bodies.
pub struct GenerateNode {
    pub collaborator: Arc<dyn RuleUpgradeCollaborator>,
    pub retry_policy: RetryPolicy,
}

#[async_trait]
impl Node<RuleUpgradeState> for GenerateNode {
    async fn run(
        &self,
        snapshot: RuleUpgradeState,
        _ctx: NodeContext,
    ) -> Result<Command<RuleUpgradePartial>, NodeError> {
        let candidates = snapshot.rule_candidates.get().clone();
        let outcome = retry(self.retry_policy, classify_collaborator_error, |_attempt| {
            let collaborator = self.collaborator.clone();
            let candidates = candidates.clone();
            async move { collaborator.generate(&candidates).await }
        })
        .await;

        let rules = match outcome {
            RetryOutcome::Succeeded { value, .. } => value,
            RetryOutcome::Exhausted { last_error, attempts } => {
                return Err(into_node_error("rule_generator", attempts, last_error));
            }
        };

        Ok(Command::Update(RuleUpgradePartial {
            generated_rules: rules,
            ..RuleUpgradePartial::default().with_progress("generated", 0.3)
        }))
    }
}

/// `regression_test`: runs the generated rule set against held-out history.
pub struct RegressionTestNode {
    pub collaborator: Arc<dyn RuleUpgradeCollaborator>,
    pub retry_policy: RetryPolicy,
}

#[async_trait]
impl Node<RuleUpgradeState> for RegressionTestNode {
    async fn run(
        &self,
        snapshot: RuleUpgradeState,
        _ctx: NodeContext,
    ) -> Result<Command<RuleUpgradePartial>, NodeError> {
        let rules = snapshot.generated_rules.get().clone();
        let outcome = retry(self.retry_policy, classify_collaborator_error, |_attempt| {
            let collaborator = self.collaborator.clone();
            let rules = rules.clone();
            async move { collaborator.regression_test(&rules).await }
        })
        .await;

        let report = match outcome {
            RetryOutcome::Succeeded { value, .. } => value,
            RetryOutcome::Exhausted { last_error, attempts } => {
                return Err(into_node_error("regression_tester", attempts, last_error));
            }
        };

        Ok(Command::Update(RuleUpgradePartial {
            regression_report: Some(report),
            ..RuleUpgradePartial::default().with_progress("regression_tested", 0.45)
        }))
    }
}

/// `await_approval`: interrupts so a human can review the regression report
/// before deployment; resumes on `resume_payload.approved: bool`.
pub struct AwaitApprovalNode;

#[async_trait]
impl Node<RuleUpgradeState> for AwaitApprovalNode {
    async fn run(
        &self,
        snapshot: RuleUpgradeState,
        ctx: NodeContext,
    ) -> Result<Command<RuleUpgradePartial>, NodeError> {
        if let Some(payload) = ctx.resume_payload {
            let approved = payload.get("approved").and_then(|v| v.as_bool()).unwrap_or(false);
            return Ok(Command::Update(RuleUpgradePartial {
                approval: Some(approved),
                ..RuleUpgradePartial::default().with_progress("approval_recorded", 0.5)
            }));
        }
        Ok(Command::Interrupt(serde_json::json!({
            "reason": "awaiting_deployment_approval",
            "regression_report": snapshot.regression_report.get(),
        })))
    }
}

/// `deploy`: ships the generated rules once approved.
pub struct DeployNode {
    pub collaborator: Arc<dyn RuleUpgradeCollaborator>,
    pub retry_policy: RetryPolicy,
}

#[async_trait]
impl Node<RuleUpgradeState> for DeployNode {
    async fn run(
        &self,
        snapshot: RuleUpgradeState,
        _ctx: NodeContext,
    ) -> Result<Command<RuleUpgradePartial>, NodeError> {
        let rules = snapshot.generated_rules.get().clone();
        let outcome = retry(self.retry_policy, classify_collaborator_error, |_attempt| {
            let collaborator = self.collaborator.clone();
            let rules = rules.clone();
            async move { collaborator.deploy(&rules).await }
        })
        .await;

        let deployment_ref = match outcome {
            RetryOutcome::Succeeded { value, .. } => value,
            RetryOutcome::Exhausted { last_error, attempts } => {
                return Err(into_node_error("rule_deployer", attempts, last_error));
            }
        };

        Ok(Command::Update(RuleUpgradePartial {
            deployment_ref: Some(deployment_ref),
            ..RuleUpgradePartial::default().with_progress("deployed", 0.7)
        }))
    }
}

/// `monitor`: reads post-deploy health; the following edge routes to
/// `rollback` when the report comes back unhealthy.
pub struct MonitorNode {
    pub collaborator: Arc<dyn RuleUpgradeCollaborator>,
    pub retry_policy: RetryPolicy,
}

#[async_trait]
impl Node<RuleUpgradeState> for MonitorNode {
    async fn run(
        &self,
        snapshot: RuleUpgradeState,
        _ctx: NodeContext,
    ) -> Result<Command<RuleUpgradePartial>, NodeError> {
        let deployment_ref = snapshot
            .deployment_ref
            .get()
            .clone()
            .ok_or(NodeError::MissingInput { what: "deployment_ref" })?;
        let outcome = retry(self.retry_policy, classify_collaborator_error, |_attempt| {
            let collaborator = self.collaborator.clone();
            let deployment_ref = deployment_ref.clone();
            async move { collaborator.monitor(&deployment_ref).await }
        })
        .await;

        let report = match outcome {
            RetryOutcome::Succeeded { value, .. } => value,
            RetryOutcome::Exhausted { last_error, attempts } => {
                return Err(into_node_error("deployment_monitor", attempts, last_error));
            }
        };

        Ok(Command::Update(RuleUpgradePartial {
            monitor_report: Some(report),
            ..RuleUpgradePartial::default().with_progress("monitored", 0.9)
        }))
    }
}

/// `rollback`: only reached when `monitor`'s report comes back unhealthy.
pub struct RollbackNode {
    pub collaborator: Arc<dyn RuleUpgradeCollaborator>,
    pub retry_policy: RetryPolicy,
}

#[async_trait]
impl Node<RuleUpgradeState> for RollbackNode {
    async fn run(
        &self,
        snapshot: RuleUpgradeState,
        _ctx: NodeContext,
    ) -> Result<Command<RuleUpgradePartial>, NodeError> {
        let deployment_ref = snapshot
            .deployment_ref
            .get()
            .clone()
            .ok_or(NodeError::MissingInput { what: "deployment_ref" })?;
        let outcome = retry(self.retry_policy, classify_collaborator_error, |_attempt| {
            let collaborator = self.collaborator.clone();
            let deployment_ref = deployment_ref.clone();
            async move { collaborator.rollback(&deployment_ref).await }
        })
        .await;

        if let RetryOutcome::Exhausted { last_error, attempts } = outcome {
            return Err(into_node_error("rule_deployer", attempts, last_error));
        }

        Ok(Command::Update(RuleUpgradePartial {
            rolled_back: Some(true),
            ..RuleUpgradePartial::default().with_progress("rolled_back", 1.0)
        }))
    }
}
