//! The Worker Pool (§4.5): the process that actually drives runs.
//!
//! A [`Worker`] repeatedly claims one `PENDING` run at a time per concurrent
//! slot, looks up the matching entry in its [`GraphCatalog`], drives the
//! Graph Engine to completion or suspension, and persists the outcome back
//! through [`StateStore`]. A background task renews the claimed lease while
//! a run is in flight; a second background task sweeps expired leases so a
//! crashed worker's runs are picked up by someone else (§4.5's crash
//! recovery contract). Graceful shutdown drains in-flight runs rather than
//! abandoning them mid-node.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

use crate::engine::{Engine, EngineError, EngineStatus};
use crate::event_bus::EventEmitter;
use crate::graph_state::{GraphState, GraphStateError};
use crate::ids::RunId;
use crate::runtimes::{StateStore, StateStoreError};
use crate::types::{GraphName, NodeKind};

#[derive(Debug, Error, Diagnostic)]
pub enum WorkerError {
    #[error("no graph registered in the catalog under the name {name}")]
    #[diagnostic(code(examflow::worker::unknown_graph))]
    UnknownGraph { name: GraphName },

    #[error("failed to (de)serialize run state: {0}")]
    #[diagnostic(code(examflow::worker::serde))]
    Serde(#[from] serde_json::Error),

    #[error("failed to construct initial state: {0}")]
    #[diagnostic(code(examflow::worker::graph_state))]
    GraphState(#[from] GraphStateError),

    #[error("graph engine failed: {0}")]
    #[diagnostic(code(examflow::worker::engine))]
    Engine(#[from] EngineError),

    #[error("state store error: {0}")]
    #[diagnostic(code(examflow::worker::store))]
    Store(#[from] StateStoreError),
}

/// Where a run's execution landed after one [`GraphRunner::run`] call.
pub enum RunOutcomeStatus {
    Completed { output_payload: serde_json::Value },
    Interrupted { at: NodeKind, payload: serde_json::Value },
    /// The engine observed `cancel_requested` before its next node and
    /// wound down without reaching `End` (§4.1/§4.4).
    Cancelled,
}

pub struct RunOutcome {
    pub state_snapshot: serde_json::Value,
    pub status: RunOutcomeStatus,
}

/// Type-erased entry point into one registered graph's [`Engine`]. Exists so
/// [`GraphCatalog`] can hold engines over distinct concrete [`GraphState`]
/// types in one map, keyed by [`GraphName`] — the worker loop never names a
/// concrete state type.
#[async_trait]
trait GraphRunner: Send + Sync {
    async fn run(
        &self,
        state_snapshot: Option<serde_json::Value>,
        input_payload: serde_json::Value,
        start: NodeKind,
        resume_payload: Option<serde_json::Value>,
        step: u64,
        cancel_requested: bool,
        emitter: Arc<dyn EventEmitter>,
    ) -> Result<RunOutcome, WorkerError>;

    fn entry(&self) -> NodeKind;
}

struct EngineRunner<S: GraphState> {
    engine: Engine<S>,
}

#[async_trait]
impl<S: GraphState> GraphRunner for EngineRunner<S> {
    async fn run(
        &self,
        state_snapshot: Option<serde_json::Value>,
        input_payload: serde_json::Value,
        start: NodeKind,
        resume_payload: Option<serde_json::Value>,
        step: u64,
        cancel_requested: bool,
        emitter: Arc<dyn EventEmitter>,
    ) -> Result<RunOutcome, WorkerError> {
        let mut state: S = match state_snapshot {
            Some(value) => serde_json::from_value(value)?,
            None => S::initial(input_payload)?,
        };
        if cancel_requested {
            state.core_mut().request_cancel();
        }

        let outcome = self.engine.run(state, start, resume_payload, step, emitter).await?;
        let status = match outcome.status {
            EngineStatus::Completed => RunOutcomeStatus::Completed {
                output_payload: outcome.state.output_payload(),
            },
            EngineStatus::Interrupted { at, payload } => RunOutcomeStatus::Interrupted { at, payload },
            EngineStatus::Cancelled => RunOutcomeStatus::Cancelled,
        };
        let state_snapshot = serde_json::to_value(&outcome.state)?;
        Ok(RunOutcome { state_snapshot, status })
    }

    fn entry(&self) -> NodeKind {
        self.engine.entry()
    }
}

/// The closed registry of graphs a worker can drive, keyed by
/// [`GraphName`]. The Graph Catalog modules ([`crate::graphs::exam_paper`],
/// [`crate::graphs::batch_grading`], [`crate::graphs::rule_upgrade`]) build
/// an [`Engine`] each; the application wires the engines' collaborators and
/// registers the results here once at startup.
#[derive(Default)]
pub struct GraphCatalog {
    runners: FxHashMap<GraphName, Arc<dyn GraphRunner>>,
}

impl GraphCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a built [`Engine`] under its own [`GraphName`].
    pub fn register<S: GraphState>(&mut self, engine: Engine<S>) {
        self.runners.insert(engine.name(), Arc::new(EngineRunner { engine }));
    }

    fn get(&self, name: GraphName) -> Result<Arc<dyn GraphRunner>, WorkerError> {
        self.runners.get(&name).cloned().ok_or(WorkerError::UnknownGraph { name })
    }
}

/// Tunables for one [`Worker`] process.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub max_concurrent_runs: usize,
    pub lease: Duration,
    /// How often the heartbeat task renews a held lease. Kept well under
    /// `lease` so a GC pause or slow node doesn't let the lease lapse
    /// before the next renewal fires.
    pub lease_renewal_interval: Duration,
    /// How often the janitor sweeps expired leases back to `PENDING`.
    pub sweep_interval: Duration,
    /// How long the poll loop sleeps after finding no claimable run.
    pub idle_poll_interval: Duration,
}

impl WorkerConfig {
    #[must_use]
    pub fn from_examflow_config(worker_id: impl Into<String>, config: &crate::config::ExamflowConfig) -> Self {
        Self {
            worker_id: worker_id.into(),
            max_concurrent_runs: config.max_concurrent_runs_per_worker,
            lease: config.worker_lease,
            lease_renewal_interval: config.worker_lease / 3,
            sweep_interval: config.worker_lease,
            idle_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Drives runs from a [`StateStore`] through a [`GraphCatalog`] until told
/// to stop. One worker process holds one [`Worker`]; concurrency within the
/// process is bounded by `config.max_concurrent_runs`.
pub struct Worker {
    store: Arc<dyn StateStore>,
    catalog: Arc<GraphCatalog>,
    emitter: Arc<dyn EventEmitter>,
    config: WorkerConfig,
}

impl Worker {
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        catalog: Arc<GraphCatalog>,
        emitter: Arc<dyn EventEmitter>,
        config: WorkerConfig,
    ) -> Self {
        Self { store, catalog, emitter, config }
    }

    /// Runs the worker loop until `shutdown` reports `true`. Spawns the
    /// janitor as its own task for the duration of the call; in-flight runs
    /// are allowed to drain before this returns.
    pub async fn run_until(&self, mut shutdown: watch::Receiver<bool>) {
        let janitor_store = self.store.clone();
        let sweep_interval = self.config.sweep_interval;
        let mut janitor_shutdown = shutdown.clone();
        let janitor: JoinHandle<()> = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(sweep_interval) => {
                        if let Err(err) = janitor_store.sweep_expired_leases().await {
                            tracing::warn!(error = %err, "lease sweep failed");
                        }
                    }
                    _ = janitor_shutdown.changed() => {
                        if *janitor_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_runs.max(1)));
        let mut in_flight = Vec::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            match self.store.claim_pending_run(&self.config.worker_id, self.config.lease).await {
                Ok(Some(claimed)) => {
                    let store = self.store.clone();
                    let catalog = self.catalog.clone();
                    let emitter = self.emitter.clone();
                    let config = self.config.clone();
                    let handle = tokio::spawn(async move {
                        let _permit = permit;
                        drive_claimed_run(store, catalog, emitter, config, claimed).await;
                    });
                    in_flight.push(handle);
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.idle_poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    drop(permit);
                    tracing::error!(error = %err, "claim_pending_run failed");
                    tokio::time::sleep(self.config.idle_poll_interval).await;
                }
            }

            in_flight.retain(|h| !h.is_finished());
        }

        for handle in in_flight {
            let _ = handle.await;
        }
        let _ = janitor.await;
    }
}

async fn drive_claimed_run(
    store: Arc<dyn StateStore>,
    catalog: Arc<GraphCatalog>,
    emitter: Arc<dyn EventEmitter>,
    config: WorkerConfig,
    claimed: crate::runtimes::ClaimedRun,
) {
    let run_id = claimed.run.run_id;
    let (heartbeat_stop_tx, mut heartbeat_stop_rx) = watch::channel(false);
    let heartbeat_store = store.clone();
    let worker_id = config.worker_id.clone();
    let lease = config.lease;
    let renewal_interval = config.lease_renewal_interval;
    let heartbeat = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(renewal_interval) => {
                    if let Err(err) = heartbeat_store.renew_lease(run_id, &worker_id, lease).await {
                        tracing::warn!(run_id = %run_id, error = %err, "lease renewal failed");
                    }
                }
                _ = heartbeat_stop_rx.changed() => break,
            }
        }
    });

    let result = execute_once(&store, &catalog, &emitter, claimed).await;

    let _ = heartbeat_stop_tx.send(true);
    let _ = heartbeat.await;

    if let Err(err) = result {
        tracing::error!(run_id = %run_id, error = %err, "run attempt failed");
        if let Err(store_err) = store.fail_run(run_id, err.to_string()).await {
            tracing::error!(run_id = %run_id, error = %store_err, "failed to persist failure");
        }
    }
}

async fn execute_once(
    store: &Arc<dyn StateStore>,
    catalog: &Arc<GraphCatalog>,
    emitter: &Arc<dyn EventEmitter>,
    claimed: crate::runtimes::ClaimedRun,
) -> Result<(), WorkerError> {
    let run_id = claimed.run.run_id;
    let runner = catalog.get(claimed.run.graph_name)?;

    let (state_snapshot, start, resume_payload) = match claimed.checkpoint {
        Some(checkpoint) => (
            Some(checkpoint.state_snapshot),
            NodeKind::decode(&checkpoint.next_node),
            claimed.run.resume_payload,
        ),
        None => (None, runner.entry(), None),
    };

    let outcome = runner
        .run(
            state_snapshot,
            claimed.run.input_payload,
            start.clone(),
            resume_payload,
            claimed.attempt.attempt_number as u64,
            claimed.run.cancel_requested,
            emitter.clone(),
        )
        .await?;

    match outcome.status {
        RunOutcomeStatus::Completed { output_payload } => {
            store.write_checkpoint(
                run_id,
                None,
                outcome.state_snapshot,
                NodeKind::End.encode(),
                serde_json::json!({}),
            ).await?;
            store.complete_run(run_id, output_payload).await?;
        }
        RunOutcomeStatus::Interrupted { at, payload } => {
            let previous = store.latest_checkpoint(run_id).await?;
            store
                .write_checkpoint(
                    run_id,
                    previous.map(|c| c.checkpoint_id),
                    outcome.state_snapshot,
                    at.encode(),
                    serde_json::json!({ "interrupt_payload": payload }),
                )
                .await?;
            store.pause_run(run_id).await?;
        }
        RunOutcomeStatus::Cancelled => {
            let previous = store.latest_checkpoint(run_id).await?;
            store
                .write_checkpoint(
                    run_id,
                    previous.map(|c| c.checkpoint_id),
                    outcome.state_snapshot,
                    start.encode(),
                    serde_json::json!({}),
                )
                .await?;
            store.cancel_run_terminal(run_id).await?;
        }
    }

    Ok(())
}
