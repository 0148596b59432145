use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::{sync::oneshot, task};

use super::diagnostics::{DiagnosticsStream, SinkDiagnostic, SinkHealth};
use super::emitter::EventEmitter;
use super::event::Event;
use super::hub::{EventHub, EventHubMetrics, EventStream};
use super::sink::{EventSink, StdOutSink};

/// Central event broadcasting system for workflow execution events.
///
/// `EventBus` receives events from node bodies (via [`NodeContext::emit`](crate::node::NodeContext::emit))
/// and broadcasts them to multiple sinks (stdout, channels, files, monitoring
/// systems, etc.). It's the backbone of Examflow's observability and
/// streaming capabilities.
///
/// # Architecture
///
/// Per the design notes on global mutable state, one `EventBus` is created
/// at worker-process startup and shared (an `Arc`) across every run the
/// [`Worker`](crate::worker::Worker) drives — it is not per-run state and is
/// never checkpointed. This allows:
/// - A worker to fan events from every concurrently-running run into one
///   observability pipeline
/// - Flexible sink composition (stdout for operators, a channel sink for a
///   status-streaming HTTP endpoint, a memory sink in tests)
///
/// ```text
/// Node bodies
///     │ ctx.emit()
///     ▼
/// EventBus
///     │ broadcast
///     ├─────┬─────┬─────┐
///     ▼     ▼     ▼     ▼
/// StdOut Channel File Custom
///  Sink   Sink   Sink  Sink
/// ```
///
/// # Usage Patterns
///
/// ## Default EventBus (Stdout Only)
///
/// ```rust
/// use examflow::event_bus::EventBus;
///
/// let bus = EventBus::default();
/// bus.listen_for_events();
/// // Events emitted by nodes go to stdout until the bus is dropped.
/// ```
///
/// ## Custom EventBus (Streaming to Web Clients)
///
/// Build a multi-sink bus once, hand its emitter to the worker, and let an
/// HTTP adapter subscribe a channel sink for live status streaming:
///
/// ```rust
/// use examflow::event_bus::{EventBus, ChannelSink, StdOutSink};
///
/// // Create channel for streaming
/// let (tx, rx) = flume::unbounded();
///
/// // Create EventBus with multiple sinks
/// let bus = EventBus::with_sinks(vec![
///     Box::new(StdOutSink::default()),  // operator logs
///     Box::new(ChannelSink::new(tx)),   // client streaming
/// ]);
/// bus.listen_for_events();
///
/// // Consume events from the channel, e.g. to forward over SSE/WebSocket.
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv_async().await {
///         println!("Event: {:?}", event);
///     }
/// });
/// ```
///
/// # Available Sinks
///
/// - [`StdOutSink`](crate::event_bus::StdOutSink) - Write to stdout (default)
/// - [`ChannelSink`](crate::event_bus::ChannelSink) - Stream to async channels
/// - [`MemorySink`](crate::event_bus::MemorySink) - Capture for testing
/// - Custom sinks implementing [`EventSink`](crate::event_bus::EventSink)
const DEFAULT_BUFFER_CAPACITY: usize = 1024;

pub struct EventBus {
    sinks: Arc<Mutex<Vec<SinkEntry>>>,
    hub: Arc<EventHub>,
    started: AtomicBool,
    diagnostics: Option<DiagnosticsHandle>,
}

#[derive(Clone)]
struct DiagnosticsHandle {
    sender: broadcast::Sender<SinkDiagnostic>,
    emit_to_events: bool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sink(StdOutSink::default())
    }
}

impl EventBus {
    pub fn with_sink<T>(sink: T) -> Self
    where
        T: EventSink + 'static,
    {
        Self::with_sinks(vec![Box::new(sink)])
    }

    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self::with_capacity(sinks, DEFAULT_BUFFER_CAPACITY)
    }

    pub(crate) fn with_capacity(sinks: Vec<Box<dyn EventSink>>, buffer_capacity: usize) -> Self {
        Self::with_capacity_and_diagnostics(sinks, buffer_capacity, None)
    }

    /// Used by [`super::config::EventBusConfig::build_event_bus`] to wire up
    /// an optional sink-health diagnostics channel alongside the main hub.
    pub(crate) fn with_capacity_and_diagnostics(
        sinks: Vec<Box<dyn EventSink>>,
        buffer_capacity: usize,
        diagnostics: Option<(usize, bool)>,
    ) -> Self {
        let hub = EventHub::new(buffer_capacity);
        let entries = sinks.into_iter().map(SinkEntry::new).collect();
        let diagnostics = diagnostics.map(|(capacity, emit_to_events)| {
            let (sender, _rx) = broadcast::channel(capacity.max(1));
            DiagnosticsHandle {
                sender,
                emit_to_events,
            }
        });
        Self {
            sinks: Arc::new(Mutex::new(entries)),
            hub,
            started: AtomicBool::new(false),
            diagnostics,
        }
    }

    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        self.add_boxed_sink(Box::new(sink));
    }

    pub fn add_boxed_sink(&self, sink: Box<dyn EventSink>) {
        let mut sinks = self.sinks.lock().unwrap();
        let mut entry = SinkEntry::new(sink);
        if self.started.load(Ordering::SeqCst) {
            entry.spawn_worker(self.hub.clone(), self.diagnostics.clone());
        }
        sinks.push(entry);
    }

    pub fn get_emitter(&self) -> Arc<dyn EventEmitter> {
        Arc::new(self.hub.emitter())
    }

    pub fn subscribe(&self) -> EventStream {
        self.hub.subscribe()
    }

    /// Broadcast capacity and lifetime drop count for the underlying hub.
    pub fn metrics(&self) -> EventHubMetrics {
        self.hub.metrics()
    }

    /// Subscribes to per-sink error diagnostics. Only receives anything if
    /// this bus was built with diagnostics enabled (see
    /// [`super::config::EventBusConfig::with_diagnostics`]); otherwise the
    /// returned stream never yields.
    pub fn diagnostics(&self) -> DiagnosticsStream {
        let receiver = match &self.diagnostics {
            Some(handle) => handle.sender.subscribe(),
            None => broadcast::channel(1).0.subscribe(),
        };
        DiagnosticsStream::new(receiver)
    }

    /// A snapshot of cumulative error counts for every registered sink.
    pub fn sink_health(&self) -> Vec<SinkHealth> {
        let sinks = self.sinks.lock().unwrap();
        sinks.iter().map(|entry| entry.health.lock().unwrap().clone()).collect()
    }

    pub fn listen_for_events(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut sinks = self.sinks.lock().unwrap();
        for entry in sinks.iter_mut() {
            entry.spawn_worker(self.hub.clone(), self.diagnostics.clone());
        }
    }

    pub async fn stop_listener(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut sinks = self.sinks.lock().unwrap();
        for entry in sinks.iter_mut() {
            entry.stop_worker().await;
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if self.started.load(Ordering::SeqCst) {
            if let Ok(mut sinks) = self.sinks.lock() {
                for entry in sinks.iter_mut() {
                    entry.abort_worker();
                }
            }
        }
    }
}

struct SinkEntry {
    sink: Arc<Mutex<Box<dyn EventSink>>>,
    health: Arc<Mutex<SinkHealth>>,
    worker: Option<SinkWorker>,
}

impl SinkEntry {
    fn new(sink: Box<dyn EventSink>) -> Self {
        let name = sink.name();
        Self {
            sink: Arc::new(Mutex::new(sink)),
            health: Arc::new(Mutex::new(SinkHealth::new(name))),
            worker: None,
        }
    }

    fn spawn_worker(&mut self, hub: Arc<EventHub>, diagnostics: Option<DiagnosticsHandle>) {
        if self.worker.is_some() {
            return;
        }
        let sink = Arc::clone(&self.sink);
        let health = Arc::clone(&self.health);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let mut stream = hub.subscribe();
        let handle = task::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    event = stream.recv() => match event {
                        Ok(event) => {
                            let outcome = sink.lock().ok().and_then(|mut guard| guard.handle(&event).err());
                            if let Some(err) = outcome {
                                eprintln!("EventBus sink error: {err}");
                                let when = Utc::now();
                                let (sink_name, occurrence) = {
                                    let mut h = health.lock().unwrap();
                                    let occurrence = h.record_error(err.to_string(), when);
                                    (h.sink.clone(), occurrence)
                                };
                                if let Some(handle) = &diagnostics {
                                    let _ = handle.sender.send(SinkDiagnostic {
                                        sink: sink_name,
                                        error: err.to_string(),
                                        when,
                                        occurrence,
                                    });
                                    if handle.emit_to_events {
                                        let _ = hub.publish(Event::diagnostic(
                                            "event_bus.sink_error",
                                            err.to_string(),
                                        ));
                                    }
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        });
        self.worker = Some(SinkWorker {
            shutdown: shutdown_tx,
            handle,
        });
    }

    async fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(());
            let _ = worker.handle.await;
        }
    }

    fn abort_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown.send(());
            worker.handle.abort();
        }
    }
}

struct SinkWorker {
    shutdown: oneshot::Sender<()>,
    handle: task::JoinHandle<()>,
}
