//! The `GraphState` trait uniting every concrete per-graph state type.
//!
//! The specification requires three concrete graphs (ExamPaper,
//! BatchGrading, RuleUpgrade), each with its own named channels. Rather
//! than a single dynamically-typed state value shared by all three (the
//! source's design), this crate gives each graph its own Rust struct and
//! unites them behind this trait so the scheduler, checkpointer, and
//! engine can operate on any of them generically. Every concrete state
//! type embeds a [`CoreChannels`] value for the three channels the
//! specification requires in every graph: `progress`, `errors`, `attempts`
//! — plus `cancel_requested`, which every graph also needs for cooperative
//! cancellation.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::channels::errors::ErrorEvent;
use crate::channels::{Versioned, reduce_increment, reduce_list_append, reduce_or};

/// Stage label + completion fraction, the `progress` channel's value type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: String,
    pub fraction: f32,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            stage: "pending".to_string(),
            fraction: 0.0,
        }
    }
}

/// The channels every graph in the catalog carries, per the specification's
/// state-model section. Embedded by value in each concrete graph state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreChannels {
    pub progress: Versioned<Progress>,
    pub errors: Versioned<Vec<ErrorEvent>>,
    pub attempts: Versioned<u32>,
    pub cancel_requested: Versioned<bool>,
}

impl CoreChannels {
    pub fn set_progress(&mut self, stage: impl Into<String>, fraction: f32) {
        self.progress.set(Progress {
            stage: stage.into(),
            fraction,
        });
    }

    pub fn push_errors(&mut self, errors: Vec<ErrorEvent>) {
        reduce_list_append(&mut self.errors, errors);
    }

    pub fn increment_attempts(&mut self) {
        reduce_increment(&mut self.attempts, 1);
    }

    pub fn request_cancel(&mut self) {
        reduce_or(&mut self.cancel_requested, true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_requested.get()
    }
}

/// A partial update to the core channels, merged the same way any other
/// graph-specific partial is merged (see `GraphState::merge`). Every
/// concrete partial type embeds one of these alongside its own fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorePartial {
    pub progress: Option<Progress>,
    pub errors: Vec<ErrorEvent>,
    pub attempts_delta: u32,
    pub cancel_requested: Option<bool>,
}

impl CorePartial {
    pub fn with_progress(mut self, stage: impl Into<String>, fraction: f32) -> Self {
        self.progress = Some(Progress {
            stage: stage.into(),
            fraction,
        });
        self
    }

    pub fn with_errors(mut self, errors: Vec<ErrorEvent>) -> Self {
        self.errors = errors;
        self
    }
}

impl CoreChannels {
    pub fn merge_partial(&mut self, partial: CorePartial) {
        if let Some(progress) = partial.progress {
            self.progress.set(progress);
        }
        self.push_errors(partial.errors);
        if partial.attempts_delta > 0 {
            reduce_increment(&mut self.attempts, partial.attempts_delta);
        }
        if let Some(flag) = partial.cancel_requested {
            reduce_or(&mut self.cancel_requested, flag);
        }
    }
}

/// Implemented by every concrete per-graph state type (`ExamPaperState`,
/// `BatchGradingState`, `RuleUpgradeState`). The engine, scheduler, and
/// checkpointer are written against this trait, never a concrete state
/// type, so adding a fourth graph to the catalog does not touch them.
pub trait GraphState:
    Clone + Send + Sync + Serialize + DeserializeOwned + std::fmt::Debug + 'static
{
    /// The state-update value a node's `Command::Update` carries. Merged
    /// into `Self` via `merge`, field by field, each field through its own
    /// declared reducer.
    type Partial: Send + Sync + Clone + std::fmt::Debug + 'static;

    /// Construct the initial state for a new run from its opaque input
    /// payload (the `StartRun` payload).
    fn initial(input: serde_json::Value) -> Result<Self, GraphStateError>
    where
        Self: Sized;

    /// Merge a node's partial update into this state.
    fn merge(&mut self, partial: Self::Partial);

    fn core(&self) -> &CoreChannels;
    fn core_mut(&mut self) -> &mut CoreChannels;

    fn progress(&self) -> &Progress {
        self.core().progress.get()
    }

    fn errors(&self) -> &[ErrorEvent] {
        self.core().errors.get()
    }

    fn is_cancel_requested(&self) -> bool {
        self.core().is_cancelled()
    }

    /// The opaque output payload returned on `COMPLETED`, consumed by
    /// `GetStatus`/`Retry` callers. Only meaningful once the graph has run
    /// its terminal node.
    fn output_payload(&self) -> serde_json::Value;

    /// Fingerprint used by the scheduler's version-gating: a node is
    /// skipped on a superstep where none of these versions moved since its
    /// last run. The default covers only the core channels; concrete graph
    /// states should override it to extend the vector with their own
    /// channels so fan-out branches reading graph-specific state are gated
    /// correctly too.
    fn channel_versions(&self) -> Vec<(&'static str, u32)> {
        let core = self.core();
        vec![
            ("progress", core.progress.version()),
            ("errors", core.errors.version()),
            ("attempts", core.attempts.version()),
            ("cancel_requested", core.cancel_requested.version()),
        ]
    }
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum GraphStateError {
    #[error("invalid input payload for graph state: {0}")]
    #[diagnostic(
        code(examflow::graph_state::invalid_input),
        help("Check the StartRun payload against the graph's expected shape")
    )]
    InvalidInput(String),

    #[error("state serialization failed: {0}")]
    #[diagnostic(code(examflow::graph_state::serde))]
    Serde(#[from] serde_json::Error),
}
