//! # Examflow: a durable workflow orchestrator for AI-assisted exam grading
//!
//! Examflow drives long-running, checkpointed workflows ("runs") over a
//! small closed catalog of graphs — segmenting and grading an exam paper,
//! partitioning and grading a batch submission, and mining/deploying a
//! rubric rule upgrade — on top of typed, versioned state and a pluggable
//! durable [`StateStore`](runtimes::StateStore). A run can fan out into
//! bounded concurrent children, suspend for a human reviewer's decision,
//! and resume from exactly where it left off after a crash.
//!
//! ## Core Concepts
//!
//! - **[`graph_state`]** — the versioned, channel-based state each graph
//!   threads through its nodes
//! - **[`node`]** — the `Node` trait: an async function from a state
//!   snapshot to a [`control::Command`]
//! - **[`engine`]** — the Graph Engine: drives one run's `GraphDef` from
//!   entry to completion, an interrupt, or a fatal error, including bounded
//!   fan-out/fan-in
//! - **[`graphs`]** — the Graph Catalog: `ExamPaper`, `BatchGrading`, and
//!   `RuleUpgrade`, each a concrete state type, node set, and wiring
//! - **[`runtimes`]** — the State Store: durable `Run`/`Attempt`/
//!   `Checkpoint` records behind one trait, backed by an in-memory store
//!   for tests and SQLite/Postgres for production
//! - **[`orchestrator`]** — the public façade: `StartRun`, `GetStatus`,
//!   `ListRuns`, `Cancel`, `Retry`, `SendEvent`
//! - **[`worker`]** — the Worker Pool: claims pending runs, drives them
//!   through the Graph Catalog, renews leases, and sweeps crashed workers'
//!   abandoned claims back to `PENDING`
//! - **[`collaborators`]** — the trait boundary between a node and the
//!   external services it calls (a grader, a layout analyzer, a notifier, ...)
//! - **[`cache`]** — the semantic cache keyed by rubric hash × perceptual
//!   image hash, so an unchanged answer sheet under an unchanged rubric
//!   never pays for a second LLM call
//! - **[`rate_limiter`]** — the process-global sliding-window limiter over
//!   LLM calls
//! - **[`retry`]** — the bounded exponential-backoff combinator every node
//!   wraps its collaborator calls in
//! - **[`config`]** — environment-variable-driven tunables for the worker
//!   pool and support services
//! - **[`event_bus`]** — the observability backbone: nodes emit events,
//!   the bus fans them out to sinks (stdout, channel, memory)
//!
//! ## Starting a run
//!
//! ```
//! use std::sync::Arc;
//!
//! use examflow::orchestrator::Orchestrator;
//! use examflow::runtimes::InMemoryStateStore;
//! use examflow::types::GraphName;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryStateStore::new());
//! let orchestrator = Orchestrator::new(store);
//!
//! let run = orchestrator
//!     .start_run(
//!         GraphName::ExamPaper,
//!         serde_json::json!({ "exam_id": "midterm-2026", "page_images": [] }),
//!         Some("exam-upload-17".to_string()),
//!     )
//!     .await?;
//!
//! let status = orchestrator.get_status(run.run_id).await?;
//! println!("run {} is {:?}", status.run_id, status.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Defining a node
//!
//! ```
//! use async_trait::async_trait;
//! use examflow::control::Command;
//! use examflow::graph_state::{CoreChannels, CorePartial, GraphState, GraphStateError};
//! use examflow::node::{Node, NodeContext, NodeError};
//!
//! #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
//! struct GreetingState {
//!     core: CoreChannels,
//!     greeting: examflow::channels::Versioned<String>,
//! }
//!
//! #[derive(Debug, Clone, Default)]
//! struct GreetingPartial {
//!     core: CorePartial,
//!     greeting: Option<String>,
//! }
//!
//! impl GraphState for GreetingState {
//!     type Partial = GreetingPartial;
//!
//!     fn initial(_input: serde_json::Value) -> Result<Self, GraphStateError> {
//!         Ok(Self::default())
//!     }
//!
//!     fn merge(&mut self, partial: Self::Partial) {
//!         self.core.merge_partial(partial.core);
//!         if let Some(greeting) = partial.greeting {
//!             self.greeting.set(greeting);
//!         }
//!     }
//!
//!     fn core(&self) -> &CoreChannels { &self.core }
//!     fn core_mut(&mut self) -> &mut CoreChannels { &mut self.core }
//!
//!     fn output_payload(&self) -> serde_json::Value {
//!         serde_json::json!({ "greeting": self.greeting.get() })
//!     }
//! }
//!
//! struct GreetingNode;
//!
//! #[async_trait]
//! impl Node<GreetingState> for GreetingNode {
//!     async fn run(
//!         &self,
//!         _snapshot: GreetingState,
//!         _ctx: NodeContext,
//!     ) -> Result<Command<GreetingPartial>, NodeError> {
//!         Ok(Command::Update(GreetingPartial {
//!             greeting: Some("Hello! How can I help you today?".to_string()),
//!             ..Default::default()
//!         }))
//!     }
//! }
//! ```
//!
//! ## Module Guide
//!
//! - [`graph_state`] - versioned per-graph state and the channels every
//!   graph shares
//! - [`channels`] - the `Versioned<T>` cell and its reducer functions
//! - [`control`] - the `Command`/`SendTarget` vocabulary a node returns
//! - [`node`] - the `Node` trait and node-level error classification
//! - [`engine`] - the Graph Engine
//! - [`graphs`] - the Graph Catalog (`exam_paper`, `batch_grading`, `rule_upgrade`)
//! - [`runtimes`] - the State Store trait and its backends
//! - [`orchestrator`] - the public `StartRun`/`GetStatus`/.../`SendEvent` façade
//! - [`worker`] - the Worker Pool that actually drives runs
//! - [`collaborators`] - external-service trait boundaries, with in-process fakes
//! - [`cache`] - the semantic grading-result cache
//! - [`rate_limiter`] - the LLM call rate limiter
//! - [`retry`] - the generic retry-with-backoff combinator
//! - [`config`] - environment-driven tunables
//! - [`event_bus`] - event fan-out and sinks
//! - [`telemetry`] - plain-text event/error rendering for sinks
//! - [`ids`] - `RunId`/`AttemptId`/`CheckpointId` newtypes
//! - [`types`] - shared closed-vocabulary enums (`GraphName`, `RunStatus`, ...)
//! - [`imaging`] - perceptual image hashing for the semantic cache key

pub mod cache;
pub mod channels;
pub mod collaborators;
pub mod config;
pub mod control;
pub mod engine;
pub mod event_bus;
pub mod graph_state;
pub mod graphs;
pub mod ids;
pub mod imaging;
pub mod node;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;
pub mod runtimes;
pub mod telemetry;
pub mod types;
pub mod worker;
