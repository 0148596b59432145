//! Core identifying types shared across the Graph Engine and Graph Catalog.
//!
//! [`NodeKind`] names a node within a graph's node set; the domain enums
//! below (`GraphName`, `RunStatus`, `QuestionType`, `ReviewAction`) name the
//! closed, small vocabularies the Orchestrator and ExamPaper graph dispatch
//! on. Per the redesign note on runtime channel lookups, there is no
//! `ChannelType` here — each concrete graph state type owns its channels as
//! named struct fields rather than entries in a string-keyed map.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a node within a workflow graph's node set.
///
/// # Persistence
///
/// `NodeKind` supports serialization for checkpointing through both serde
/// and the [`encode`](Self::encode)/[`decode`](Self::decode) methods.
///
/// ```rust
/// use examflow::types::NodeKind;
///
/// let processor = NodeKind::Custom("segment".to_string());
/// let encoded = processor.encode();
/// let decoded = NodeKind::decode(&encoded);
/// assert_eq!(processor, decoded);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Virtual entry point; never implemented by a node body.
    Start,
    /// Virtual terminal sink; never implemented by a node body.
    End,
    /// A concrete node, named by its function in the graph (`"segment"`,
    /// `"grade_question"`, `"aggregate"`, ...).
    Custom(String),
}

impl NodeKind {
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            NodeKind::Start => "Start".to_string(),
            NodeKind::End => "End".to_string(),
            NodeKind::Custom(s) => format!("Custom:{s}"),
        }
    }

    pub fn decode(s: &str) -> Self {
        if s == "Start" {
            NodeKind::Start
        } else if s == "End" {
            NodeKind::End
        } else if let Some(rest) = s.strip_prefix("Custom:") {
            NodeKind::Custom(rest.to_string())
        } else {
            NodeKind::Custom(s.to_string())
        }
    }

    #[must_use]
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start)
    }

    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }

    #[must_use]
    pub fn is_custom(&self) -> bool {
        matches!(self, Self::Custom(_))
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "Start"),
            Self::End => write!(f, "End"),
            Self::Custom(name) => write!(f, "{}", name),
        }
    }
}

impl From<&str> for NodeKind {
    fn from(s: &str) -> Self {
        match s {
            "Start" => NodeKind::Start,
            "End" => NodeKind::End,
            other => NodeKind::Custom(other.to_string()),
        }
    }
}

impl From<String> for NodeKind {
    fn from(s: String) -> Self {
        NodeKind::from(s.as_str())
    }
}

/// The closed set of graphs in the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphName {
    ExamPaper,
    BatchGrading,
    RuleUpgrade,
}

impl fmt::Display for GraphName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphName::ExamPaper => write!(f, "exam_paper"),
            GraphName::BatchGrading => write!(f, "batch_grading"),
            GraphName::RuleUpgrade => write!(f, "rule_upgrade"),
        }
    }
}

impl std::str::FromStr for GraphName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exam_paper" | "ExamPaper" => Ok(GraphName::ExamPaper),
            "batch_grading" | "BatchGrading" => Ok(GraphName::BatchGrading),
            "rule_upgrade" | "RuleUpgrade" => Ok(GraphName::RuleUpgrade),
            other => Err(format!("unknown graph name: {other}")),
        }
    }
}

/// A run's lifecycle status. Transitions are enforced by the Orchestrator
/// and the Worker Pool, never set arbitrarily by a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses are never left once entered.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// The question-type vocabulary the `grade_question` node dispatches on.
/// Unknown types resolve to the essay branch (a table lookup, not dynamic
/// dispatch — see the design notes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Objective,
    Stepwise,
    Essay,
    LabDesign,
    Unknown,
}

impl QuestionType {
    /// The agent routine this question type resolves to. `Unknown` falls
    /// back to `Essay`, matching the source's "choose an agent by question
    /// type" table lookup.
    #[must_use]
    pub fn resolved_agent(&self) -> QuestionType {
        match self {
            QuestionType::Unknown => QuestionType::Essay,
            other => *other,
        }
    }
}

impl fmt::Display for QuestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QuestionType::Objective => "objective",
            QuestionType::Stepwise => "stepwise",
            QuestionType::Essay => "essay",
            QuestionType::LabDesign => "lab_design",
            QuestionType::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// The human reviewer's decision, delivered via `SendEvent` while a run is
/// `PAUSED` at `wait_for_review`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Override,
    Reject,
}
