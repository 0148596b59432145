//! State and domain types for the RuleUpgrade graph (§4.7): a linear
//! mine/generate/regression-test/approve/deploy/monitor pipeline whose node
//! logic is external, delegated to an injected `RuleUpgradeCollaborator`.

use serde::{Deserialize, Serialize};

use crate::channels::{Versioned, reduce_last_write, reduce_list_append, reduce_or};
use crate::graph_state::{CoreChannels, CorePartial, GraphState, GraphStateError};

/// One candidate grading-rule mined from recent grading history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCandidate {
    pub candidate_id: String,
    pub description: String,
    pub support: u32,
}

/// A generated rule ready for regression testing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedRule {
    pub rule_id: String,
    pub candidate_id: String,
    pub body: String,
}

/// `regression_test`'s verdict over the generated rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionReport {
    pub passed: bool,
    pub regressions: Vec<String>,
    pub sample_size: u32,
}

/// `monitor`'s post-deploy health read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub healthy: bool,
    pub observations: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleUpgradeState {
    pub core: CoreChannels,
    pub rule_candidates: Versioned<Vec<RuleCandidate>>,
    pub generated_rules: Versioned<Vec<GeneratedRule>>,
    pub regression_report: Versioned<Option<RegressionReport>>,
    pub approval: Versioned<bool>,
    pub deployment_ref: Versioned<Option<String>>,
    pub monitor_report: Versioned<Option<MonitorReport>>,
    pub rolled_back: Versioned<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct RuleUpgradePartial {
    pub core: CorePartial,
    pub rule_candidates: Vec<RuleCandidate>,
    pub generated_rules: Vec<GeneratedRule>,
    pub regression_report: Option<RegressionReport>,
    pub approval: Option<bool>,
    pub deployment_ref: Option<String>,
    pub monitor_report: Option<MonitorReport>,
    pub rolled_back: Option<bool>,
}

impl RuleUpgradePartial {
    #[must_use]
    pub fn with_progress(mut self, stage: impl Into<String>, fraction: f32) -> Self {
        self.core = self.core.with_progress(stage, fraction);
        self
    }
}

impl GraphState for RuleUpgradeState {
    type Partial = RuleUpgradePartial;

    fn initial(input: serde_json::Value) -> Result<Self, GraphStateError> {
        #[derive(Deserialize)]
        struct Input {
            #[serde(default)]
            seed_candidates: Vec<RuleCandidate>,
        }
        let parsed: Input = serde_json::from_value(input)
            .map_err(|e| GraphStateError::InvalidInput(e.to_string()))?;
        Ok(Self {
            core: CoreChannels::default(),
            rule_candidates: Versioned::new(parsed.seed_candidates),
            generated_rules: Versioned::default(),
            regression_report: Versioned::default(),
            approval: Versioned::default(),
            deployment_ref: Versioned::default(),
            monitor_report: Versioned::default(),
            rolled_back: Versioned::default(),
        })
    }

    fn merge(&mut self, partial: Self::Partial) {
        self.core.merge_partial(partial.core);
        reduce_list_append(&mut self.rule_candidates, partial.rule_candidates);
        reduce_list_append(&mut self.generated_rules, partial.generated_rules);
        if let Some(v) = partial.regression_report {
            reduce_last_write(&mut self.regression_report, Some(v));
        }
        if let Some(v) = partial.approval {
            reduce_or(&mut self.approval, v);
        }
        if let Some(v) = partial.deployment_ref {
            reduce_last_write(&mut self.deployment_ref, Some(v));
        }
        if let Some(v) = partial.monitor_report {
            reduce_last_write(&mut self.monitor_report, Some(v));
        }
        if let Some(v) = partial.rolled_back {
            reduce_or(&mut self.rolled_back, v);
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
            "deployment_ref": self.deployment_ref.get(),
            "monitor_report": self.monitor_report.get(),
            "rolled_back": self.rolled_back.get(),
        })
    }

    fn channel_versions(&self) -> Vec<(&'static str, u32)> {
        vec![
            ("progress", self.core.progress.version()),
            ("errors", self.core.errors.version()),
            ("attempts", self.core.attempts.version()),
            ("cancel_requested", self.core.cancel_requested.version()),
            ("rule_candidates", self.rule_candidates.version()),
            ("generated_rules", self.generated_rules.version()),
            ("regression_report", self.regression_report.version()),
            ("approval", self.approval.version()),
            ("deployment_ref", self.deployment_ref.version()),
            ("monitor_report", self.monitor_report.version()),
            ("rolled_back", self.rolled_back.version()),
        ]
    }
}
