use crate::logging::{LogEvent, LogFields, LogLevel};
use serde_json::json;
use std::time::Duration;

/// Session counters. Shared between the listener thread and the poller
/// behind an `Arc<Mutex<_>>`.
#[derive(Debug, Default, Clone)]
pub struct SessionMetrics {
    connections_accepted: u64,
    messages_received: u64,
    messages_sent: u64,
    send_failures: u64,
    runs_launched: u64,
    fitness_accepted: u64,
    fitness_denied: u64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection(&mut self) {
        self.connections_accepted = self.connections_accepted.saturating_add(1);
    }

    pub fn record_received(&mut self, count: usize) {
        self.messages_received = self.messages_received.saturating_add(count as u64);
    }

    pub fn record_sent(&mut self) {
        self.messages_sent = self.messages_sent.saturating_add(1);
    }

    pub fn record_send_failure(&mut self) {
        self.send_failures = self.send_failures.saturating_add(1);
    }

    pub fn record_run_launched(&mut self) {
        self.runs_launched = self.runs_launched.saturating_add(1);
    }

    pub fn record_decision(&mut self, accepted: bool) {
        if accepted {
            self.fitness_accepted = self.fitness_accepted.saturating_add(1);
        } else {
            self.fitness_denied = self.fitness_denied.saturating_add(1);
        }
    }

    pub fn snapshot(&self, uptime: Duration) -> MetricSnapshot {
        MetricSnapshot {
            uptime_ms: uptime.as_millis() as u64,
            connections_accepted: self.connections_accepted,
            messages_received: self.messages_received,
            messages_sent: self.messages_sent,
            send_failures: self.send_failures,
            runs_launched: self.runs_launched,
            fitness_accepted: self.fitness_accepted,
            fitness_denied: self.fitness_denied,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSnapshot {
    pub uptime_ms: u64,
    pub connections_accepted: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
    pub runs_launched: u64,
    pub fitness_accepted: u64,
    pub fitness_denied: u64,
}

impl MetricSnapshot {
    pub fn to_log_event(&self, target: &str) -> LogEvent {
        LogEvent::with_fields(LogLevel::Info, target, "session_metrics", self.as_fields())
    }

    pub fn as_fields(&self) -> LogFields {
        let mut map = LogFields::new();
        map.insert("uptime_ms".to_string(), json!(self.uptime_ms));
        map.insert(
            "connections_accepted".to_string(),
            json!(self.connections_accepted),
        );
        map.insert("messages_received".to_string(), json!(self.messages_received));
        map.insert("messages_sent".to_string(), json!(self.messages_sent));
        map.insert("send_failures".to_string(), json!(self.send_failures));
        map.insert("runs_launched".to_string(), json!(self.runs_launched));
        map.insert("fitness_accepted".to_string(), json!(self.fitness_accepted));
        map.insert("fitness_denied".to_string(), json!(self.fitness_denied));
        map
    }
}
