//! Declarative construction for [`EventBus`]: pick sinks and diagnostics
//! behavior up front (e.g. from environment-driven [`crate::config`]
//! tunables) instead of wiring `add_sink` calls by hand.

use super::bus::EventBus;
use super::sink::{MemorySink, StdOutSink};

/// One sink to attach when building an [`EventBus`] from an
/// [`EventBusConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SinkConfig {
    /// Write rendered events to stdout via [`StdOutSink`].
    #[default]
    StdOut,
    /// Capture events in-process via [`MemorySink`], for tests.
    Memory,
}

/// Sink-health reporting configuration for an [`EventBus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsConfig {
    /// Whether a diagnostics channel is created at all.
    pub enabled: bool,
    /// Broadcast buffer size for [`EventBus::diagnostics`]; defaults to 256.
    pub buffer_capacity: Option<usize>,
    /// When `true`, every sink error is also published as an
    /// `Event::Diagnostic` on the bus's main event stream, in addition to
    /// the dedicated diagnostics channel.
    pub emit_to_events: bool,
}

const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 256;

/// Builder for an [`EventBus`]: broadcast capacity, the sinks to attach, and
/// optional sink-health diagnostics.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    capacity: usize,
    sinks: Vec<SinkConfig>,
    diagnostics: Option<DiagnosticsConfig>,
}

impl EventBusConfig {
    #[must_use]
    pub fn new(capacity: usize, sinks: Vec<SinkConfig>) -> Self {
        Self {
            capacity,
            sinks,
            diagnostics: None,
        }
    }

    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: DiagnosticsConfig) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Builds the configured [`EventBus`]. Callers still need to call
    /// [`EventBus::listen_for_events`] to start draining sinks.
    #[must_use]
    pub fn build_event_bus(&self) -> EventBus {
        let sinks: Vec<Box<dyn super::sink::EventSink>> = self
            .sinks
            .iter()
            .map(|cfg| -> Box<dyn super::sink::EventSink> {
                match cfg {
                    SinkConfig::StdOut => Box::new(StdOutSink::default()),
                    SinkConfig::Memory => Box::new(MemorySink::new()),
                }
            })
            .collect();

        let diagnostics = self.diagnostics.as_ref().and_then(|cfg| {
            if !cfg.enabled {
                return None;
            }
            let capacity = cfg.buffer_capacity.unwrap_or(DEFAULT_DIAGNOSTICS_CAPACITY);
            Some((capacity, cfg.emit_to_events))
        });

        EventBus::with_capacity_and_diagnostics(sinks, self.capacity, diagnostics)
    }
}
