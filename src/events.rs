//! Phase-structured event history of a repair run.
//!
//! Every message is mirrored to `tracing` as it is recorded. Finished phases
//! can also be forwarded to a listener over an mpsc channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Severity of a recorded message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// The run cannot continue
    Fatal,
    Error,
    Warning,
    Debug,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal"),
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Debug => write!(f, "debug"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub kind: MessageKind,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// A named stretch of the run (setup, one generation, validation...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub messages: Vec<EventMessage>,
}

impl Phase {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started_at: Utc::now(),
            finished_at: None,
            messages: Vec::new(),
        }
    }

    /// Number of messages of the given kind in this phase.
    pub fn count(&self, kind: MessageKind) -> usize {
        self.messages.iter().filter(|m| m.kind == kind).count()
    }
}

/// Event recorder owned by a single repair run.
#[derive(Debug, Default)]
pub struct EventLog {
    phases: Vec<Phase>,
    forward: Option<mpsc::UnboundedSender<Phase>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward a copy of every finished phase to `sender`.
    pub fn with_forwarder(sender: mpsc::UnboundedSender<Phase>) -> Self {
        Self {
            phases: Vec::new(),
            forward: Some(sender),
        }
    }

    /// Open a new phase. The previous phase is finished first.
    pub fn start_phase(&mut self, name: impl Into<String>) {
        self.finish_phase();
        let phase = Phase::new(name);
        tracing::info!("=== {} ===", phase.name);
        self.phases.push(phase);
    }

    /// Close the current phase, if one is open.
    pub fn finish_phase(&mut self) {
        let Some(phase) = self.phases.last_mut() else {
            return;
        };
        if phase.finished_at.is_some() {
            return;
        }
        phase.finished_at = Some(Utc::now());

        // A listener that went away is not an error for the run
        let delivered = self.forward.as_ref().map(|s| s.send(phase.clone()).is_ok());
        if delivered == Some(false) {
            self.forward = None;
        }
    }

    pub fn fatal(&mut self, text: impl Into<String>) {
        let text = text.into();
        tracing::error!("FATAL: {}", text);
        self.record(MessageKind::Fatal, text);
    }

    pub fn error(&mut self, text: impl Into<String>) {
        let text = text.into();
        tracing::error!("{}", text);
        self.record(MessageKind::Error, text);
    }

    pub fn warning(&mut self, text: impl Into<String>) {
        let text = text.into();
        tracing::warn!("{}", text);
        self.record(MessageKind::Warning, text);
    }

    pub fn debug(&mut self, text: impl Into<String>) {
        let text = text.into();
        tracing::debug!("{}", text);
        self.record(MessageKind::Debug, text);
    }

    fn record(&mut self, kind: MessageKind, text: String) {
        if !matches!(self.phases.last(), Some(p) if p.finished_at.is_none()) {
            self.phases.push(Phase::new("Unnamed"));
        }
        if let Some(phase) = self.phases.last_mut() {
            phase.messages.push(EventMessage {
                kind,
                text,
                at: Utc::now(),
            });
        }
    }

    /// Finish the open phase and hand back the full history.
    pub fn into_phases(mut self) -> Vec<Phase> {
        self.finish_phase();
        std::mem::take(&mut self.phases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_go_to_current_phase() {
        let mut log = EventLog::new();
        log.start_phase("Setup");
        log.debug("copying project");
        log.warning("no compile command");
        log.start_phase("Generation 1");
        log.error("mutation tool failed");

        let phases = log.into_phases();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].name, "Setup");
        assert_eq!(phases[0].messages.len(), 2);
        assert_eq!(phases[0].count(MessageKind::Warning), 1);
        assert_eq!(phases[1].count(MessageKind::Error), 1);
        assert!(phases[0].finished_at.is_some());
    }

    #[test]
    fn test_message_without_phase_opens_one() {
        let mut log = EventLog::new();
        log.warning("early");
        let phases = log.into_phases();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].name, "Unnamed");
    }

    #[test]
    fn test_message_after_finish_opens_new_phase() {
        let mut log = EventLog::new();
        log.start_phase("Setup");
        log.finish_phase();
        log.debug("late");
        let phases = log.into_phases();
        assert_eq!(phases.len(), 2);
        assert!(phases[0].messages.is_empty());
        assert_eq!(phases[1].name, "Unnamed");
    }

    #[test]
    fn test_finish_phase_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut log = EventLog::with_forwarder(tx);
        log.start_phase("Setup");
        log.finish_phase();
        log.finish_phase();
        let phases = log.into_phases();
        assert_eq!(phases.len(), 1);
        assert!(phases[0].finished_at.is_some());

        assert_eq!(rx.try_recv().unwrap().name, "Setup");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forwarder_receives_finished_phases() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut log = EventLog::with_forwarder(tx);
        log.start_phase("Setup");
        log.debug("hello");
        log.start_phase("Generation 1");
        let _ = log.into_phases();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name, "Setup");
        assert_eq!(first.messages.len(), 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.name, "Generation 1");
    }

    #[test]
    fn test_dropped_listener_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut log = EventLog::with_forwarder(tx);
        log.start_phase("Setup");
        log.start_phase("Generation 1");
        assert_eq!(log.into_phases().len(), 2);
    }

    #[test]
    fn test_message_kind_display() {
        assert_eq!(MessageKind::Fatal.to_string(), "fatal");
        assert_eq!(MessageKind::Warning.to_string(), "warning");
    }
}
