//! Node event recording
//!
//! Every disruption decision leaves a visible trail on the node objects so
//! operators can answer "why did this node go away" (or "why won't it")
//! from `kubectl describe node` alone.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Events the engine records against nodes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisruptionEvent {
    /// The node was considered but cannot be consolidated right now
    Unconsolidatable {
        /// Human-readable explanation
        reason: String,
    },
    /// The node was chosen for removal by a consolidation action
    TerminatingForConsolidation {
        /// Description of the action
        action: String,
    },
    /// A replacement launch was requested before removing this node
    LaunchingForConsolidation {
        /// Description of the action
        action: String,
    },
    /// Consolidation is paused waiting for the replacement to initialize
    WaitingOnReadiness,
    /// Consolidation is paused waiting for this node to finish deleting
    WaitingOnDeletion,
    /// A forceful interruption event arrived for this node
    Interrupted {
        /// Interruption kind, e.g. "spotWarning"
        kind: String,
    },
}

impl DisruptionEvent {
    fn reason(&self) -> &'static str {
        match self {
            Self::Unconsolidatable { .. } => "Unconsolidatable",
            Self::TerminatingForConsolidation { .. } => "TerminatingForConsolidation",
            Self::LaunchingForConsolidation { .. } => "LaunchingForConsolidation",
            Self::WaitingOnReadiness => "WaitingOnReadiness",
            Self::WaitingOnDeletion => "WaitingOnDeletion",
            Self::Interrupted { .. } => "Interrupted",
        }
    }

    fn note(&self) -> String {
        match self {
            Self::Unconsolidatable { reason } => reason.clone(),
            Self::TerminatingForConsolidation { action }
            | Self::LaunchingForConsolidation { action } => action.clone(),
            Self::WaitingOnReadiness => "waiting for the replacement node to initialize".into(),
            Self::WaitingOnDeletion => "waiting for the node object to be deleted".into(),
            Self::Interrupted { kind } => format!("interruption event received: {kind}"),
        }
    }
}

/// Sink for node events
pub trait EventRecorder: Send + Sync {
    /// Record an event against the named node
    fn record(&self, node_name: &str, event: DisruptionEvent);
}

/// Recorder publishing Kubernetes Events via the API server
///
/// Publishing is fire-and-forget: an event that fails to post must never
/// stall a disruption decision.
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    /// Create a recorder reporting as the given controller name
    pub fn new(client: Client, controller: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_string(),
                instance: None,
            },
        }
    }
}

impl EventRecorder for KubeEventRecorder {
    fn record(&self, node_name: &str, event: DisruptionEvent) {
        let reference = kube::runtime::reflector::ObjectRef::<k8s_openapi::api::core::v1::Node>::new(
            node_name,
        )
        .into();
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        let node_name = node_name.to_string();
        tokio::spawn(async move {
            let result = recorder
                .publish(Event {
                    type_: EventType::Normal,
                    reason: event.reason().to_string(),
                    note: Some(event.note()),
                    action: event.reason().to_string(),
                    secondary: None,
                })
                .await;
            if let Err(e) = result {
                warn!(node = %node_name, error = %e, "failed to publish node event");
            }
        });
    }
}

/// Recorder that keeps events in memory; backs the test suites
#[derive(Default)]
pub struct MemoryEventRecorder {
    events: parking_lot::Mutex<Vec<(String, DisruptionEvent)>>,
}

impl MemoryEventRecorder {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, in order
    pub fn events(&self) -> Vec<(String, DisruptionEvent)> {
        self.events.lock().clone()
    }

    /// Events recorded against one node
    pub fn for_node(&self, node_name: &str) -> Vec<DisruptionEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(n, _)| n == node_name)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

impl EventRecorder for MemoryEventRecorder {
    fn record(&self, node_name: &str, event: DisruptionEvent) {
        self.events.lock().push((node_name.to_string(), event));
    }
}

/// Shared handle type used across the engine
pub type SharedRecorder = Arc<dyn EventRecorder>;
