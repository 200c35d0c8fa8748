//! Typed research progress events.
//!
//! Events are ordered per research request and opportunistic: when nobody
//! listens, emission is a no-op and correctness is unaffected.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted over the life of one research request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResearchEvent {
    SearchStarted {
        query: String,
        engine: String,
    },
    CandidateChecking {
        url: String,
        title: String,
    },
    CandidateAccepted {
        url: String,
        title: String,
    },
    CandidateRejected {
        url: String,
        reason: String,
    },
    Progress {
        message: String,
        completed: usize,
        total: usize,
    },
    PhaseStarted {
        phase: String,
    },
    PhaseComplete {
        phase: String,
    },
    ResearchComplete {
        total_products: usize,
        viable_products: usize,
        vendors: Vec<String>,
    },
}

/// Fire-and-forget emitter. Cloneable; all clones feed the same listener.
#[derive(Clone, Default)]
pub struct EventEmitter {
    sender: Option<mpsc::UnboundedSender<ResearchEvent>>,
}

impl EventEmitter {
    /// An emitter nobody listens to.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// An emitter plus the receiving end for the listener.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ResearchEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Emit an event. A closed or absent listener is not an error.
    pub fn emit(&self, event: ResearchEvent) {
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                tracing::trace!("event listener gone");
            }
        }
    }

    pub fn phase_started(&self, phase: &str) {
        self.emit(ResearchEvent::PhaseStarted {
            phase: phase.to_string(),
        });
    }

    pub fn phase_complete(&self, phase: &str) {
        self.emit(ResearchEvent::PhaseComplete {
            phase: phase.to_string(),
        });
    }

    pub fn progress(&self, message: impl Into<String>, completed: usize, total: usize) {
        self.emit(ResearchEvent::Progress {
            message: message.into(),
            completed,
            total,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (emitter, mut receiver) = EventEmitter::channel();

        emitter.phase_started("search");
        emitter.progress("checking candidates", 1, 10);
        emitter.phase_complete("search");

        assert!(matches!(
            receiver.recv().await.unwrap(),
            ResearchEvent::PhaseStarted { .. }
        ));
        assert!(matches!(
            receiver.recv().await.unwrap(),
            ResearchEvent::Progress { completed: 1, .. }
        ));
        assert!(matches!(
            receiver.recv().await.unwrap(),
            ResearchEvent::PhaseComplete { .. }
        ));
    }

    #[test]
    fn test_emit_without_listener_is_noop() {
        let emitter = EventEmitter::disabled();
        emitter.phase_started("search");
    }

    #[tokio::test]
    async fn test_emit_after_listener_dropped_is_noop() {
        let (emitter, receiver) = EventEmitter::channel();
        drop(receiver);
        emitter.progress("still fine", 0, 1);
    }
}
