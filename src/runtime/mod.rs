use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::config::{LinkSettings, Vocabulary};
use crate::logging::{LogLevel, Logger, emit_to, json_kv, json_str};
use crate::metrics::SessionMetrics;
use crate::queue::MessageQueue;
use crate::{EndpointError, Result};

pub mod audit;
pub mod diagnostics;
pub mod driver;
pub mod host;

use audit::{SessionAudit, SessionAuditEventBuilder, SessionAuditStage};
use driver::{ListenerContext, ListenerHandle, SocketEndpoint};
use host::{SimulationHost, TickKind, TimerHandle};

pub const SESSION_TARGET: &str = "tunelink::session";

/// Configuration knobs for the messenger.
#[derive(Clone)]
pub struct MessengerConfig {
    pub settings: LinkSettings,
    /// Optional structured logger used by the messenger and its listener.
    pub logger: Option<Logger>,
    /// Counters shared with the listener thread.
    pub metrics: Option<Arc<Mutex<SessionMetrics>>>,
    /// Interval between metrics snapshot emissions. Zero disables snapshots.
    pub metrics_interval: Duration,
    pub metrics_target: String,
    pub audit: Option<Arc<dyn SessionAudit>>,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            settings: LinkSettings::default(),
            logger: None,
            metrics: None,
            metrics_interval: Duration::from_secs(5),
            metrics_target: "tunelink::session.metrics".to_string(),
            audit: None,
        }
    }
}

impl MessengerConfig {
    pub fn with_settings(settings: LinkSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn SessionAudit>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn enable_metrics(&mut self) {
        if self.metrics.is_none() {
            self.metrics = Some(Arc::new(Mutex::new(SessionMetrics::new())));
        }
    }

    pub fn disable_metrics(&mut self) {
        self.metrics = None;
    }

    pub fn metrics_handle(&self) -> Option<Arc<Mutex<SessionMetrics>>> {
        self.metrics.as_ref().map(Arc::clone)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing bound.
    Idle,
    /// Socket bound, no client observed yet.
    Listening,
    /// A client was accepted.
    Connected,
    /// Stopped gracefully after the end-run message.
    Ended,
}

/// Control the propagation of a message across plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFlow {
    Continue,
    Consumed,
}

/// Context passed to plugins. Requests are queued and applied by the
/// messenger once the hook returns.
pub struct SessionContext<'a> {
    settings: &'a LinkSettings,
    logger: Option<&'a Logger>,
    state: SessionState,
    run_started: bool,
    sends: Vec<String>,
    payloads: Vec<(String, String)>,
    decisions: Vec<bool>,
    start_requested: bool,
    stop_requested: bool,
}

impl<'a> SessionContext<'a> {
    fn new(config: &'a MessengerConfig, state: SessionState, run_started: bool) -> Self {
        Self {
            settings: &config.settings,
            logger: config.logger.as_ref(),
            state,
            run_started,
            sends: Vec::new(),
            payloads: Vec::new(),
            decisions: Vec::new(),
            start_requested: false,
            stop_requested: false,
        }
    }

    pub fn vocabulary(&self) -> &'a Vocabulary {
        &self.settings.vocabulary
    }

    pub fn settings(&self) -> &'a LinkSettings {
        self.settings
    }

    pub fn logger(&self) -> Option<&'a Logger> {
        self.logger
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn has_started_run(&self) -> bool {
        self.run_started
    }

    /// Queue a message for the connected client.
    pub fn send(&mut self, message: impl Into<String>) {
        self.sends.push(message.into());
    }

    /// Queue a payload for the host's next run.
    pub fn apply_payload(&mut self, target: impl Into<String>, payload: impl Into<String>) {
        self.payloads.push((target.into(), payload.into()));
    }

    /// Count an accept/deny decision in the session metrics.
    pub fn record_decision(&mut self, accepted: bool) {
        self.decisions.push(accepted);
    }

    pub fn request_start(&mut self) {
        self.start_requested = true;
    }

    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    fn into_outcome(self) -> ContextOutcome {
        ContextOutcome {
            sends: self.sends,
            payloads: self.payloads,
            decisions: self.decisions,
            start_requested: self.start_requested,
            stop_requested: self.stop_requested,
        }
    }
}

struct ContextOutcome {
    sends: Vec<String>,
    payloads: Vec<(String, String)>,
    decisions: Vec<bool>,
    start_requested: bool,
    stop_requested: bool,
}

/// Extension point layered over the base dispatch.
///
/// `on_message` runs for every plugin in registration order until one
/// returns [`EventFlow::Consumed`]. The base begin/end/heartbeat handling
/// only runs when no plugin consumed the message. Every other hook is a
/// notification delivered to all plugins.
pub trait SessionPlugin: Send {
    fn name(&self) -> &str {
        "session_plugin"
    }

    fn on_message(&mut self, _ctx: &mut SessionContext<'_>, _message: &str) -> Result<EventFlow> {
        Ok(EventFlow::Continue)
    }

    fn on_client_connected(&mut self, _ctx: &mut SessionContext<'_>, _peer: SocketAddr) -> Result<()> {
        Ok(())
    }

    fn on_begin_run(&mut self, _ctx: &mut SessionContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_end_run(&mut self, _ctx: &mut SessionContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_heartbeat(&mut self, _ctx: &mut SessionContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_simulation_started(&mut self, _ctx: &mut SessionContext<'_>) -> Result<()> {
        Ok(())
    }

    /// The host's run lifecycle has fully ended.
    fn on_run_ended(&mut self, _ctx: &mut SessionContext<'_>) -> Result<()> {
        Ok(())
    }

    fn on_tick(&mut self, _ctx: &mut SessionContext<'_>, _kind: TickKind) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BaseToken {
    BeginRun,
    EndRun,
    Heartbeat,
}

/// Controller side of the link: one listening endpoint per `start()`, a
/// background listener feeding a queue, and a poller (`tick`) that the host
/// drives.
pub struct Messenger {
    config: MessengerConfig,
    host: Box<dyn SimulationHost>,
    plugins: Vec<Box<dyn SessionPlugin>>,
    endpoint: Option<Arc<SocketEndpoint>>,
    listener: Option<ListenerHandle>,
    queue: MessageQueue,
    state: SessionState,
    run_started: bool,
    waiting_to_return: bool,
    seen_accepts: u64,
    idle_timer: Option<TimerHandle>,
    active_timer: Option<TimerHandle>,
    started_at: Instant,
    last_metrics_emit: Option<Instant>,
}

impl Messenger {
    pub fn new<H>(config: MessengerConfig, host: H) -> Self
    where
        H: SimulationHost + 'static,
    {
        Self::with_boxed_host(config, Box::new(host))
    }

    pub fn with_boxed_host(mut config: MessengerConfig, host: Box<dyn SimulationHost>) -> Self {
        if config.metrics.is_none() && config.metrics_interval > Duration::ZERO {
            config.enable_metrics();
        }
        let now = Instant::now();
        let mut messenger = Self {
            config,
            host,
            plugins: Vec::new(),
            endpoint: None,
            listener: None,
            queue: MessageQueue::new(),
            state: SessionState::Idle,
            run_started: false,
            waiting_to_return: false,
            seen_accepts: 0,
            idle_timer: None,
            active_timer: None,
            started_at: now,
            last_metrics_emit: Some(now),
        };
        messenger.start_idle_timer();
        messenger
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut MessengerConfig {
        &mut self.config
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.config.settings
    }

    pub fn host_mut(&mut self) -> &mut dyn SimulationHost {
        self.host.as_mut()
    }

    pub fn register_plugin<P>(&mut self, plugin: P)
    where
        P: SessionPlugin + 'static,
    {
        self.log(
            LogLevel::Debug,
            "plugin_registered",
            [json_str("plugin", plugin.name())],
        );
        self.plugins.push(Box::new(plugin));
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.iter().any(|plugin| plugin.name() == name)
    }

    /// Bind a fresh endpoint, spawn its listener and launch a run.
    ///
    /// Never fails: problems are logged and leave the messenger idle.
    pub fn start(&mut self) {
        if self.endpoint.is_some() || self.listener.is_some() {
            self.log(LogLevel::Warn, "restarting_active_session", []);
            self.teardown();
        }

        let settings = &self.config.settings;
        let endpoint = match SocketEndpoint::bind_and_listen(
            &settings.address,
            settings.port,
            settings.accept_poll(),
        ) {
            Ok(endpoint) => Arc::new(endpoint.with_send_timeout(settings.send_timeout())),
            Err(err) => {
                self.log(
                    LogLevel::Error,
                    "bind_failed",
                    [json_str("error", err.to_string())],
                );
                self.state = SessionState::Idle;
                return;
            }
        };

        self.queue.clear();
        let context = ListenerContext {
            endpoint: Arc::clone(&endpoint),
            queue: self.queue.clone(),
            chunk_size: settings.listen_buffer_size,
            sleep: settings.listen_sleep(),
            logger: self.config.logger.clone(),
            metrics: self.config.metrics_handle(),
        };

        let greeter = Arc::clone(&endpoint);
        let greeting = settings.vocabulary.greeting.clone();
        let logger = self.config.logger.clone();
        let metrics = self.config.metrics_handle();
        let on_accepted = Box::new(move |_peer: SocketAddr| match greeter.send(&greeting) {
            Ok(()) => {
                if let Some(Ok(mut guard)) = metrics.as_ref().map(|m| m.lock()) {
                    guard.record_sent();
                }
            }
            Err(err) => emit_to(
                logger.as_ref(),
                LogLevel::Error,
                SESSION_TARGET,
                "greeting_failed",
                [json_str("error", err.to_string())],
            ),
        });

        let listener = match ListenerHandle::spawn(context, on_accepted) {
            Ok(listener) => listener,
            Err(err) => {
                self.log(
                    LogLevel::Error,
                    "listener_spawn_failed",
                    [json_str("error", err.to_string())],
                );
                endpoint.close();
                self.state = SessionState::Idle;
                return;
            }
        };

        let addr = endpoint.local_addr();
        self.endpoint = Some(endpoint);
        self.listener = Some(listener);
        self.seen_accepts = 0;
        self.state = SessionState::Listening;
        self.log(
            LogLevel::Info,
            "session_started",
            [json_str("addr", addr.to_string())],
        );
        self.audit(SessionAuditStage::SessionStarted, [("addr", json!(addr.to_string()))]);

        self.launch_run();
    }

    /// Graceful stop: optional goodbye, teardown, end the host run.
    pub fn stop(&mut self) {
        let was_active = self.state != SessionState::Idle;
        if self.config.settings.send_goodbye_on_stop && self.is_socket_connected() {
            let goodbye = self.config.settings.vocabulary.goodbye.clone();
            self.send_message(&goodbye);
        }
        self.teardown();
        if was_active {
            self.state = SessionState::Ended;
        }
        self.log(LogLevel::Info, "session_stopped", []);
        self.audit(SessionAuditStage::SessionStopped, []);
    }

    /// Tear everything down unconditionally and rest in `Idle`. Safe to
    /// call at any time, any number of times.
    pub fn force_stop(&mut self) {
        self.teardown();
        self.state = SessionState::Idle;
        self.log(LogLevel::Warn, "session_force_stopped", []);
        self.audit(SessionAuditStage::ForceStopped, []);
    }

    fn teardown(&mut self) {
        match self.listener.take() {
            Some(mut listener) => listener.stop(),
            None => self.log(LogLevel::Debug, "listener_absent", []),
        }

        match self.endpoint.take() {
            Some(endpoint) => {
                if !endpoint.close_client() {
                    self.log(LogLevel::Debug, "client_absent", []);
                }
                if !endpoint.close_listener() {
                    self.log(LogLevel::Debug, "listening_socket_absent", []);
                }
                endpoint.close();
            }
            None => self.log(LogLevel::Debug, "endpoint_absent", []),
        }

        self.queue.clear();
        self.end_run();
    }

    fn launch_run(&mut self) {
        if self.run_started {
            return;
        }
        if self.host.launch_run() {
            self.run_started = true;
            self.with_metrics(|m| m.record_run_launched());
            self.log(LogLevel::Info, "run_launched", []);
            self.audit(SessionAuditStage::RunLaunched, []);
        } else {
            self.log(LogLevel::Error, "run_launch_refused", []);
        }
    }

    fn end_run(&mut self) {
        if self.run_started {
            self.run_started = false;
            self.host.end_run();
            self.log(LogLevel::Info, "run_end_requested", []);
        }
    }

    /// Send `message` to the connected client. A reset peer forces a full
    /// teardown. Returns whether the write went out.
    pub fn send_message(&mut self, message: &str) -> bool {
        let Some(endpoint) = self.endpoint.as_ref().filter(|ep| ep.is_connected()).cloned() else {
            self.log(
                LogLevel::Error,
                "send_without_client",
                [json_str("message", message)],
            );
            return false;
        };

        match endpoint.send(message) {
            Ok(()) => {
                self.with_metrics(|m| m.record_sent());
                self.log(LogLevel::Debug, "message_sent", [json_str("message", message)]);
                true
            }
            Err(EndpointError::PeerReset) => {
                self.with_metrics(|m| m.record_send_failure());
                self.log(LogLevel::Error, "peer_reset_on_send", []);
                self.force_stop();
                false
            }
            Err(err) => {
                self.with_metrics(|m| m.record_send_failure());
                self.log(
                    LogLevel::Error,
                    "send_failed",
                    [json_str("error", err.to_string())],
                );
                false
            }
        }
    }

    /// Dispatch one message. Plugins see it first; the begin/end/heartbeat
    /// handling runs only when neither the caller nor a plugin handled it.
    pub fn receive_message(&mut self, message: &str, already_handled: bool) {
        let mut handled = already_handled;

        if !handled {
            for idx in 0..self.plugins.len() {
                let (flow, outcome, name) = {
                    let plugin = &mut self.plugins[idx];
                    let mut ctx = SessionContext::new(&self.config, self.state, self.run_started);
                    let flow = plugin.on_message(&mut ctx, message);
                    (flow, ctx.into_outcome(), plugin.name().to_string())
                };
                let flow = self.settle(&name, "on_message", flow).unwrap_or(EventFlow::Continue);
                self.apply_outcome(outcome);
                if flow == EventFlow::Consumed {
                    handled = true;
                    break;
                }
            }
        }

        if !handled {
            match self.classify(message) {
                Some(BaseToken::BeginRun) => self.handle_begin_run(),
                Some(BaseToken::EndRun) => self.handle_end_run(),
                Some(BaseToken::Heartbeat) => self.handle_heartbeat(),
                None => self.log(
                    LogLevel::Debug,
                    "message_unhandled",
                    [json_str("message", message)],
                ),
            }
        }

        self.audit(
            SessionAuditStage::MessageDispatched,
            [("consumed_by_plugin", json!(handled && !already_handled))],
        );
    }

    fn classify(&self, message: &str) -> Option<BaseToken> {
        let vocab = &self.config.settings.vocabulary;
        if message == vocab.begin_run {
            Some(BaseToken::BeginRun)
        } else if message == vocab.end_run {
            Some(BaseToken::EndRun)
        } else if message == vocab.heartbeat {
            Some(BaseToken::Heartbeat)
        } else {
            None
        }
    }

    fn handle_begin_run(&mut self) {
        self.log(LogLevel::Info, "runtime_begin_run", []);
        self.notify("on_begin_run", |plugin, ctx| plugin.on_begin_run(ctx));
    }

    fn handle_end_run(&mut self) {
        self.log(LogLevel::Info, "runtime_end_run", []);
        self.notify("on_end_run", |plugin, ctx| plugin.on_end_run(ctx));
        self.stop();
    }

    fn handle_heartbeat(&mut self) {
        self.log(LogLevel::Trace, "runtime_heartbeat", []);
        self.notify("on_heartbeat", |plugin, ctx| plugin.on_heartbeat(ctx));
    }

    /// Periodic callback. Must be called by the host on its own thread; it
    /// never blocks.
    pub fn tick(&mut self, kind: TickKind) {
        self.observe_connection();
        match kind {
            TickKind::Idle => {
                if self.waiting_to_return {
                    self.waiting_to_return = false;
                    self.handle_run_ended();
                }
            }
            TickKind::Active => {
                while let Some(message) = self.queue.pop() {
                    self.receive_message(&message, false);
                }
            }
        }
        self.notify("on_tick", |plugin, ctx| plugin.on_tick(ctx, kind));
        self.maybe_emit_metrics();
    }

    fn observe_connection(&mut self) {
        let Some(endpoint) = self.endpoint.as_ref() else {
            return;
        };
        let accepted = endpoint.accepted_count();
        if accepted <= self.seen_accepts {
            return;
        }
        self.seen_accepts = accepted;
        let Some(peer) = endpoint.peer_addr() else {
            return;
        };
        if self.state == SessionState::Listening {
            self.state = SessionState::Connected;
        }
        self.log(
            LogLevel::Info,
            "client_connected",
            [json_str("peer", peer.to_string())],
        );
        self.audit(
            SessionAuditStage::ClientAccepted,
            [("peer", json!(peer.to_string()))],
        );
        self.notify("on_client_connected", |plugin, ctx| {
            plugin.on_client_connected(ctx, peer)
        });
    }

    fn handle_run_ended(&mut self) {
        self.log(LogLevel::Info, "run_ended", []);
        self.audit(SessionAuditStage::RunEnded, []);
        self.notify("on_run_ended", |plugin, ctx| plugin.on_run_ended(ctx));
    }

    /// Host notification: a simulation run has begun.
    pub fn on_simulation_started(&mut self) {
        self.cancel_timer(TickKind::Active);
        let interval = self.config.settings.active_tick();
        self.active_timer = Some(self.host.register_periodic(TickKind::Active, interval));
        self.log(LogLevel::Debug, "simulation_started", []);
        self.notify("on_simulation_started", |plugin, ctx| {
            plugin.on_simulation_started(ctx)
        });
    }

    /// Host notification: the run is ending. The next idle tick reports
    /// the run as ended.
    pub fn on_simulation_ending(&mut self) {
        self.waiting_to_return = true;
        self.run_started = false;
        self.cancel_timer(TickKind::Active);
        self.log(LogLevel::Debug, "simulation_ending", []);
    }

    /// Host notification: the editor world changed.
    pub fn on_world_changed(&mut self) {
        if !self.run_started {
            self.start_idle_timer();
        }
    }

    fn start_idle_timer(&mut self) {
        self.cancel_timer(TickKind::Idle);
        let interval = self.config.settings.idle_tick();
        self.idle_timer = Some(self.host.register_periodic(TickKind::Idle, interval));
    }

    fn cancel_timer(&mut self, kind: TickKind) {
        let slot = match kind {
            TickKind::Idle => &mut self.idle_timer,
            TickKind::Active => &mut self.active_timer,
        };
        if let Some(handle) = slot.take() {
            self.host.cancel_periodic(handle);
        }
    }

    pub fn pending_message_count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_waiting_to_return(&self) -> bool {
        self.waiting_to_return
    }

    pub fn is_socket_connected(&self) -> bool {
        self.endpoint
            .as_ref()
            .is_some_and(|endpoint| endpoint.is_connected())
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| listener.is_running())
    }

    pub fn has_started_run(&self) -> bool {
        self.run_started
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Address of the current endpoint generation.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().map(|endpoint| endpoint.local_addr())
    }

    /// Read chunk size for endpoints bound after this call.
    pub fn set_listen_buffer_size(&mut self, size: usize) {
        self.config.settings.listen_buffer_size = size.max(1);
    }

    /// How often the host should currently be ticking.
    pub fn poll_interval(&self) -> Duration {
        if self.run_started {
            self.config.settings.active_tick()
        } else {
            self.config.settings.idle_tick()
        }
    }

    pub fn help_text(&self) -> String {
        let vocab = &self.config.settings.vocabulary;
        format!(
            "tunelink controller on {addr}\n\
             runtime -> controller: {begin} | {end} | {heartbeat} | {props} <payload> | {fitness} <value>\n\
             controller -> runtime: {greeting} (on accept) | {accept} | {deny} | {goodbye}\n\
             lower fitness is better; a report strictly below the best so far is accepted",
            addr = self.config.settings.bind_target(),
            begin = vocab.begin_run,
            end = vocab.end_run,
            heartbeat = vocab.heartbeat,
            props = vocab.incoming_properties,
            fitness = vocab.incoming_fitness,
            greeting = vocab.greeting,
            accept = vocab.accept_properties,
            deny = vocab.deny_properties,
            goodbye = vocab.goodbye,
        )
    }

    fn notify<F>(&mut self, hook: &str, mut f: F)
    where
        F: FnMut(&mut dyn SessionPlugin, &mut SessionContext<'_>) -> Result<()>,
    {
        for idx in 0..self.plugins.len() {
            let (result, outcome, name) = {
                let plugin = &mut self.plugins[idx];
                let mut ctx = SessionContext::new(&self.config, self.state, self.run_started);
                let result = f(plugin.as_mut(), &mut ctx);
                (result, ctx.into_outcome(), plugin.name().to_string())
            };
            self.settle(&name, hook, result);
            self.apply_outcome(outcome);
        }
    }

    fn settle<T>(&self, plugin: &str, hook: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.log(
                    LogLevel::Error,
                    "plugin_failed",
                    [
                        json_str("plugin", plugin),
                        json_str("hook", hook),
                        json_str("error", err.to_string()),
                    ],
                );
                None
            }
        }
    }

    fn apply_outcome(&mut self, outcome: ContextOutcome) {
        let ContextOutcome {
            sends,
            payloads,
            decisions,
            start_requested,
            stop_requested,
        } = outcome;

        for (target, payload) in payloads {
            self.host.apply_payload(&target, &payload);
            self.log(
                LogLevel::Debug,
                "payload_applied",
                [json_str("target", target), json_kv("bytes", payload.len())],
            );
        }

        if !decisions.is_empty() {
            self.with_metrics(|m| {
                for accepted in decisions {
                    m.record_decision(accepted);
                }
            });
        }

        for message in sends {
            self.send_message(&message);
        }

        if stop_requested {
            self.stop();
        }

        if start_requested {
            self.start();
        }
    }

    fn log<I>(&self, level: LogLevel, message: &str, fields: I)
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        emit_to(self.config.logger.as_ref(), level, SESSION_TARGET, message, fields);
    }

    fn audit<'k, I>(&self, stage: SessionAuditStage, details: I)
    where
        I: IntoIterator<Item = (&'k str, serde_json::Value)>,
    {
        if let Some(audit) = self.config.audit.as_ref() {
            let mut builder = SessionAuditEventBuilder::new(stage);
            for (key, value) in details {
                builder.detail(key, value);
            }
            audit.record(builder.finish());
        }
    }

    fn with_metrics(&self, f: impl FnOnce(&mut SessionMetrics)) {
        if let Some(metrics) = self.config.metrics.as_ref() {
            if let Ok(mut guard) = metrics.lock() {
                f(&mut guard);
            }
        }
    }

    fn maybe_emit_metrics(&mut self) {
        if self.config.metrics.is_none() || self.config.metrics_interval == Duration::ZERO {
            return;
        }

        let now = Instant::now();
        match self.last_metrics_emit {
            Some(last) if now.duration_since(last) < self.config.metrics_interval => return,
            _ => self.last_metrics_emit = Some(now),
        }

        let uptime = now.duration_since(self.started_at);
        if let (Some(logger), Some(metrics)) =
            (self.config.logger.as_ref(), self.config.metrics.as_ref())
        {
            if let Ok(guard) = metrics.lock() {
                let event = guard.snapshot(uptime).to_log_event(&self.config.metrics_target);
                let _ = logger.log_event(event);
            }
        }
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close();
        }
        self.cancel_timer(TickKind::Idle);
        self.cancel_timer(TickKind::Active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LinkError;
    use crate::logging::MemorySink;
    use audit::RecordingAudit;
    use host::RecordingHost;

    fn messenger() -> (Messenger, host::SharedJournal, MemorySink) {
        let sink = MemorySink::new();
        let host = RecordingHost::new();
        let journal = host.journal();
        let config = MessengerConfig::with_settings(LinkSettings::loopback_ephemeral())
            .with_logger(Logger::new(sink.clone()));
        (Messenger::new(config, host), journal, sink)
    }

    #[derive(Default)]
    struct Tally {
        seen: Arc<Mutex<Vec<String>>>,
        consume: Option<&'static str>,
    }

    impl SessionPlugin for Tally {
        fn name(&self) -> &str {
            "tally"
        }

        fn on_message(&mut self, _ctx: &mut SessionContext<'_>, message: &str) -> Result<EventFlow> {
            self.seen.lock().unwrap().push(message.to_string());
            if self.consume == Some(message) {
                return Ok(EventFlow::Consumed);
            }
            Ok(EventFlow::Continue)
        }

        fn on_heartbeat(&mut self, _ctx: &mut SessionContext<'_>) -> Result<()> {
            self.seen.lock().unwrap().push("<heartbeat hook>".to_string());
            Ok(())
        }
    }

    struct Failing;

    impl SessionPlugin for Failing {
        fn on_message(&mut self, _ctx: &mut SessionContext<'_>, _message: &str) -> Result<EventFlow> {
            Err(LinkError::Plugin {
                plugin: "failing".into(),
                reason: "boom".into(),
            })
        }
    }

    #[test]
    fn new_registers_idle_timer() {
        let (_messenger, journal, _) = messenger();
        let live = journal.lock().unwrap().live_timers();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].1, TickKind::Idle);
    }

    #[test]
    fn force_stop_twice_on_a_never_started_messenger() {
        let (mut messenger, journal, _) = messenger();
        messenger.force_stop();
        messenger.force_stop();
        assert_eq!(messenger.state(), SessionState::Idle);
        assert_eq!(journal.lock().unwrap().ends, 0);
    }

    #[test]
    fn start_binds_listens_and_launches_once() {
        let (mut messenger, journal, sink) = messenger();
        messenger.start();
        assert_eq!(messenger.state(), SessionState::Listening);
        assert!(messenger.is_listening());
        assert!(messenger.has_started_run());
        assert!(messenger.local_addr().is_some());
        assert!(sink.contains("session_started"));
        assert_eq!(journal.lock().unwrap().launches, 1);

        messenger.force_stop();
        messenger.force_stop();
        assert_eq!(messenger.state(), SessionState::Idle);
        assert!(!messenger.is_listening());
        assert!(messenger.local_addr().is_none());
        assert_eq!(journal.lock().unwrap().ends, 1);
    }

    #[test]
    fn bind_failure_is_logged_not_raised() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut settings = LinkSettings::loopback_ephemeral();
        settings.port = blocker.local_addr().unwrap().port();
        let sink = MemorySink::new();
        let config = MessengerConfig::with_settings(settings).with_logger(Logger::new(sink.clone()));
        let mut messenger = Messenger::new(config, RecordingHost::new());

        messenger.start();
        assert_eq!(messenger.state(), SessionState::Idle);
        assert!(!messenger.has_started_run());
        assert!(sink.contains("bind_failed"));
    }

    #[test]
    fn end_run_token_stops_the_session() {
        let (mut messenger, journal, _) = messenger();
        messenger.start();
        messenger.receive_message("end_play", false);
        assert_eq!(messenger.state(), SessionState::Ended);
        assert!(!messenger.is_listening());
        assert!(!messenger.has_started_run());
        assert_eq!(journal.lock().unwrap().ends, 1);
    }

    #[test]
    fn already_handled_skips_everything() {
        let (mut messenger, _, _) = messenger();
        let seen = Arc::new(Mutex::new(Vec::new()));
        messenger.register_plugin(Tally {
            seen: Arc::clone(&seen),
            consume: None,
        });
        messenger.start();
        messenger.receive_message("end_play", true);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(messenger.state(), SessionState::Listening);
        messenger.force_stop();
    }

    #[test]
    fn consumed_message_skips_base_handling() {
        let (mut messenger, _, _) = messenger();
        let seen = Arc::new(Mutex::new(Vec::new()));
        messenger.register_plugin(Tally {
            seen: Arc::clone(&seen),
            consume: Some("heartbeat"),
        });
        messenger.receive_message("heartbeat", false);
        assert_eq!(*seen.lock().unwrap(), vec!["heartbeat".to_string()]);
    }

    #[test]
    fn unconsumed_heartbeat_reaches_base_and_hook() {
        let (mut messenger, _, _) = messenger();
        let seen = Arc::new(Mutex::new(Vec::new()));
        messenger.register_plugin(Tally {
            seen: Arc::clone(&seen),
            consume: None,
        });
        messenger.receive_message("heartbeat", false);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["heartbeat".to_string(), "<heartbeat hook>".to_string()]
        );
    }

    #[test]
    fn failing_plugin_is_logged_and_dispatch_continues() {
        let (mut messenger, _, sink) = messenger();
        let seen = Arc::new(Mutex::new(Vec::new()));
        messenger.register_plugin(Failing);
        messenger.register_plugin(Tally {
            seen: Arc::clone(&seen),
            consume: None,
        });
        messenger.receive_message("anything", false);
        assert!(sink.contains("plugin_failed"));
        assert_eq!(*seen.lock().unwrap(), vec!["anything".to_string()]);
    }

    #[test]
    fn lifecycle_notifications_drive_timers_and_flags() {
        let (mut messenger, journal, _) = messenger();
        messenger.start();
        messenger.on_simulation_started();
        assert!(
            journal
                .lock()
                .unwrap()
                .live_timers()
                .iter()
                .any(|(_, kind)| *kind == TickKind::Active)
        );
        assert_eq!(messenger.poll_interval(), messenger.settings().active_tick());

        messenger.on_simulation_ending();
        assert!(messenger.is_waiting_to_return());
        assert!(!messenger.has_started_run());
        assert!(
            journal
                .lock()
                .unwrap()
                .live_timers()
                .iter()
                .all(|(_, kind)| *kind == TickKind::Idle)
        );

        messenger.tick(TickKind::Idle);
        assert!(!messenger.is_waiting_to_return());
        messenger.force_stop();
    }

    #[test]
    fn world_change_rearms_idle_timer_only_without_a_run() {
        let (mut messenger, journal, _) = messenger();
        messenger.on_world_changed();
        assert_eq!(journal.lock().unwrap().timers.len(), 2);
        assert_eq!(journal.lock().unwrap().live_timers().len(), 1);

        messenger.start();
        messenger.on_world_changed();
        assert_eq!(journal.lock().unwrap().timers.len(), 2);
        messenger.force_stop();
    }

    #[test]
    fn audit_records_lifecycle_stages() {
        let audit = RecordingAudit::new();
        let config = MessengerConfig::with_settings(LinkSettings::loopback_ephemeral())
            .with_audit(Arc::new(audit.clone()));
        let mut messenger = Messenger::new(config, RecordingHost::new());
        messenger.start();
        messenger.receive_message("end_play", false);
        assert_eq!(
            audit.stages(),
            vec![
                SessionAuditStage::SessionStarted,
                SessionAuditStage::RunLaunched,
                SessionAuditStage::SessionStopped,
                SessionAuditStage::MessageDispatched,
            ]
        );
    }

    #[test]
    fn send_without_client_reports_false() {
        let (mut messenger, _, sink) = messenger();
        assert!(!messenger.send_message("greeting"));
        assert!(sink.contains("send_without_client"));
    }

    #[test]
    fn metrics_snapshot_emitted_after_interval() {
        let sink = MemorySink::new();
        let mut config = MessengerConfig::with_settings(LinkSettings::loopback_ephemeral())
            .with_logger(Logger::new(sink.clone()));
        config.metrics_interval = Duration::from_millis(1);
        let mut messenger = Messenger::new(config, RecordingHost::new());
        std::thread::sleep(Duration::from_millis(5));
        messenger.tick(TickKind::Idle);
        assert!(sink.contains("session_metrics"));
    }

    #[test]
    fn help_text_names_the_vocabulary() {
        let (messenger, _, _) = messenger();
        let help = messenger.help_text();
        assert!(help.contains("incoming_race_time"));
        assert!(help.contains("deny_control_properties"));
    }
}
