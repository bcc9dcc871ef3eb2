use std::net::SocketAddr;

use serde_json::json;

use crate::Result;
use crate::logging::{LogLevel, Logger, event_with_fields, json_kv};

use super::host::TickKind;
use super::{EventFlow, SessionContext, SessionPlugin};

pub const LIFECYCLE_TARGET: &str = "tunelink::session.lifecycle";

/// Logs session lifecycle events for observability/debugging.
///
/// Never consumes a message. Register it before other plugins so it sees
/// every message before one of them consumes it.
pub struct LifecycleLoggerPlugin {
    logger: Logger,
    level: LogLevel,
    log_messages: bool,
    log_heartbeats: bool,
    log_ticks: bool,
    preview_chars: usize,
}

impl LifecycleLoggerPlugin {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger,
            level: LogLevel::Debug,
            log_messages: true,
            log_heartbeats: false,
            log_ticks: false,
            preview_chars: 48,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn log_messages(mut self, enabled: bool) -> Self {
        self.log_messages = enabled;
        self
    }

    pub fn log_heartbeats(mut self, enabled: bool) -> Self {
        self.log_heartbeats = enabled;
        self
    }

    pub fn log_ticks(mut self, enabled: bool) -> Self {
        self.log_ticks = enabled;
        self
    }

    /// Longest message prefix copied into a log line.
    pub fn preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }

    fn emit(&self, message: &str, fields: impl IntoIterator<Item = (String, serde_json::Value)>) {
        let event = event_with_fields(self.level, LIFECYCLE_TARGET, message, fields);
        let _ = self.logger.log_event(event);
    }
}

impl SessionPlugin for LifecycleLoggerPlugin {
    fn name(&self) -> &str {
        "diagnostics.lifecycle_logger"
    }

    fn on_message(&mut self, ctx: &mut SessionContext<'_>, message: &str) -> Result<EventFlow> {
        let is_heartbeat = message == ctx.vocabulary().heartbeat;
        if self.log_messages && (!is_heartbeat || self.log_heartbeats) {
            let preview: String = message.chars().take(self.preview_chars).collect();
            self.emit(
                "message.received",
                [
                    json_kv("preview", json!(preview)),
                    json_kv("chars", json!(message.chars().count())),
                ],
            );
        }
        Ok(EventFlow::Continue)
    }

    fn on_client_connected(&mut self, _ctx: &mut SessionContext<'_>, peer: SocketAddr) -> Result<()> {
        self.emit("client.connected", [json_kv("peer", json!(peer.to_string()))]);
        Ok(())
    }

    fn on_begin_run(&mut self, _ctx: &mut SessionContext<'_>) -> Result<()> {
        self.emit("run.begin", std::iter::empty());
        Ok(())
    }

    fn on_end_run(&mut self, _ctx: &mut SessionContext<'_>) -> Result<()> {
        self.emit("run.end", std::iter::empty());
        Ok(())
    }

    fn on_simulation_started(&mut self, _ctx: &mut SessionContext<'_>) -> Result<()> {
        self.emit("simulation.started", std::iter::empty());
        Ok(())
    }

    fn on_run_ended(&mut self, ctx: &mut SessionContext<'_>) -> Result<()> {
        self.emit(
            "simulation.returned",
            [json_kv("state", json!(format!("{:?}", ctx.state())))],
        );
        Ok(())
    }

    fn on_tick(&mut self, _ctx: &mut SessionContext<'_>, kind: TickKind) -> Result<()> {
        if self.log_ticks {
            self.emit("tick", [json_kv("kind", json!(kind.as_str()))]);
        }
        Ok(())
    }
}
