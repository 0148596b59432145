//! The RuleUpgrade graph (§4.7): a linear mine/generate/regression-test/
//! approve/deploy/monitor pipeline whose node logic is external, delegated
//! to an injected [`crate::collaborators::RuleUpgradeCollaborator`].

pub mod graph;
pub mod nodes;
pub mod state;

pub use graph::build;
pub use state::{GeneratedRule, MonitorReport, RegressionReport, RuleCandidate, RuleUpgradePartial, RuleUpgradeState};
