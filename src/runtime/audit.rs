//! Session lifecycle audit hooks.
//!
//! Records carry a stage plus structured details so a host can log, buffer
//! or assert on the session's progression without touching the poller.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde_json::Value;

/// Checkpoints emitted by `Messenger`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAuditStage {
    /// A listening socket was bound and the listener thread spawned.
    SessionStarted,
    /// The poller observed a newly accepted client.
    ClientAccepted,
    /// The host agreed to launch a run.
    RunLaunched,
    /// A queued message finished dispatching.
    MessageDispatched,
    /// The host's run lifecycle finished.
    RunEnded,
    /// Graceful stop.
    SessionStopped,
    /// Unconditional teardown.
    ForceStopped,
}

#[derive(Debug, Clone)]
pub struct SessionAuditEvent {
    pub timestamp: SystemTime,
    pub stage: SessionAuditStage,
    pub details: Vec<(String, Value)>,
}

impl SessionAuditEvent {
    fn new(stage: SessionAuditStage) -> Self {
        Self {
            timestamp: SystemTime::now(),
            stage,
            details: Vec::new(),
        }
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }
}

pub struct SessionAuditEventBuilder {
    event: SessionAuditEvent,
}

impl SessionAuditEventBuilder {
    pub fn new(stage: SessionAuditStage) -> Self {
        Self {
            event: SessionAuditEvent::new(stage),
        }
    }

    pub fn detail(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.event.details.push((key.into(), value));
        self
    }

    pub fn finish(self) -> SessionAuditEvent {
        self.event
    }
}

pub trait SessionAudit: Send + Sync {
    fn record(&self, event: SessionAuditEvent);
}

#[derive(Debug, Default)]
pub struct NullSessionAudit;

impl SessionAudit for NullSessionAudit {
    fn record(&self, _event: SessionAuditEvent) {}
}

/// Buffers every event. Clones share the buffer.
#[derive(Debug, Default, Clone)]
pub struct RecordingAudit {
    events: Arc<Mutex<Vec<SessionAuditEvent>>>,
}

impl RecordingAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SessionAuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn stages(&self) -> Vec<SessionAuditStage> {
        self.events().into_iter().map(|event| event.stage).collect()
    }

    pub fn count(&self, stage: SessionAuditStage) -> usize {
        self.events()
            .iter()
            .filter(|event| event.stage == stage)
            .count()
    }
}

impl SessionAudit for RecordingAudit {
    fn record(&self, event: SessionAuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_collects_details() {
        let mut builder = SessionAuditEventBuilder::new(SessionAuditStage::RunLaunched);
        builder.detail("run", json!(2)).detail("of", json!(5));
        let event = builder.finish();
        assert_eq!(event.stage, SessionAuditStage::RunLaunched);
        assert_eq!(event.detail("of"), Some(&json!(5)));
        assert!(event.detail("missing").is_none());
    }

    #[test]
    fn recording_audit_shares_buffer_across_clones() {
        let audit = RecordingAudit::new();
        let handle: Arc<dyn SessionAudit> = Arc::new(audit.clone());
        handle.record(SessionAuditEventBuilder::new(SessionAuditStage::SessionStarted).finish());
        handle.record(SessionAuditEventBuilder::new(SessionAuditStage::ForceStopped).finish());
        assert_eq!(
            audit.stages(),
            vec![SessionAuditStage::SessionStarted, SessionAuditStage::ForceStopped]
        );
        assert_eq!(audit.count(SessionAuditStage::ForceStopped), 1);
    }
}
