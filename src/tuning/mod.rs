//! Run iteration: launch a fixed number of runs, keep the best fitness the
//! runtime reports, and tell the runtime after each report whether its
//! candidate parameters beat everything so far.
//!
//! The runtime announces what comes next with a token:
//!
//! ```text
//! incoming_control_properties   -> next message is an opaque payload
//! incoming_race_time            -> next message is a fitness value
//! ```
//!
//! Lower fitness is better. A report strictly below the best so far is
//! accepted; anything else, including text that does not parse, is denied.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::TUNING_LISTEN_BUFFER_SIZE;
use crate::error::TuningError;
use crate::logging::{LogLevel, emit_to, json_kv, json_str};
use crate::runtime::{EventFlow, Messenger, SessionContext, SessionPlugin};
use crate::Result;

pub const TUNING_TARGET: &str = "tunelink::tuning";
pub const RUN_ITERATION_PLUGIN: &str = "tuning.run_iteration";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuningPlan {
    pub total_runs: u32,
    /// Host-side location the cached payload is applied to before each
    /// follow-up run.
    pub payload_target: String,
}

impl TuningPlan {
    pub fn new(total_runs: u32, payload_target: impl Into<String>) -> Self {
        Self {
            total_runs,
            payload_target: payload_target.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitnessReport {
    /// Zero-based run the report arrived in.
    pub run: u32,
    pub raw: String,
    pub value: Option<f64>,
    pub decision: Decision,
}

#[derive(Debug, Clone)]
pub struct TuningProgress {
    pub plan: TuningPlan,
    pub active: bool,
    pub runs_completed: u32,
    pub best_fitness: f64,
    /// Latest payload announced by the runtime.
    pub cached_payload: Option<String>,
    /// Payload cached when the best fitness was last accepted.
    pub best_payload: Option<String>,
    pub expecting_payload: bool,
    pub expecting_fitness: bool,
    pub reports: Vec<FitnessReport>,
    pub started_at: Option<Instant>,
    pub elapsed: Option<Duration>,
}

impl Default for TuningProgress {
    fn default() -> Self {
        Self {
            plan: TuningPlan::new(0, ""),
            active: false,
            runs_completed: 0,
            best_fitness: f64::INFINITY,
            cached_payload: None,
            best_payload: None,
            expecting_payload: false,
            expecting_fitness: false,
            reports: Vec::new(),
            started_at: None,
            elapsed: None,
        }
    }
}

impl TuningProgress {
    fn reset(&mut self, plan: TuningPlan) {
        *self = Self {
            plan,
            active: true,
            started_at: Some(Instant::now()),
            ..Self::default()
        };
    }

    pub fn decisions(&self) -> Vec<Decision> {
        self.reports.iter().map(|report| report.decision).collect()
    }

    pub fn is_finished(&self) -> bool {
        !self.active && self.elapsed.is_some()
    }
}

pub type SharedTuning = Arc<RwLock<TuningProgress>>;

fn read(shared: &SharedTuning) -> RwLockReadGuard<'_, TuningProgress> {
    shared.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(shared: &SharedTuning) -> RwLockWriteGuard<'_, TuningProgress> {
    shared.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Parse a fitness report. Surrounding whitespace is ignored.
pub fn parse_fitness(raw: &str) -> std::result::Result<f64, TuningError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| TuningError::FitnessParse {
            raw: raw.to_string(),
        })
}

/// Session plugin carrying the payload sub-protocol and the run loop.
pub struct RunIterationPlugin {
    shared: SharedTuning,
}

impl RunIterationPlugin {
    pub fn new(shared: SharedTuning) -> Self {
        Self { shared }
    }

    fn evaluate(&self, ctx: &mut SessionContext<'_>, state: &mut TuningProgress, raw: &str) {
        let logger = ctx.logger();
        let (value, decision) = match parse_fitness(raw) {
            Ok(value) if value < state.best_fitness => {
                state.best_fitness = value;
                state.best_payload = state.cached_payload.clone();
                (Some(value), Decision::Accept)
            }
            Ok(value) => (Some(value), Decision::Deny),
            Err(err) => {
                emit_to(
                    logger,
                    LogLevel::Error,
                    TUNING_TARGET,
                    "fitness_unparsed",
                    [json_str("error", err.to_string())],
                );
                (None, Decision::Deny)
            }
        };

        let vocab = ctx.vocabulary();
        let reply = match decision {
            Decision::Accept => vocab.accept_properties.clone(),
            Decision::Deny => vocab.deny_properties.clone(),
        };
        ctx.send(reply);
        ctx.record_decision(decision == Decision::Accept);

        emit_to(
            logger,
            LogLevel::Info,
            TUNING_TARGET,
            "fitness_evaluated",
            [
                json_kv("run", state.runs_completed),
                json_kv("value", json!(value)),
                json_kv("best", json!(state.best_fitness)),
                json_kv("decision", json!(decision)),
            ],
        );

        state.reports.push(FitnessReport {
            run: state.runs_completed,
            raw: raw.to_string(),
            value,
            decision,
        });
    }
}

impl SessionPlugin for RunIterationPlugin {
    fn name(&self) -> &str {
        RUN_ITERATION_PLUGIN
    }

    fn on_message(&mut self, ctx: &mut SessionContext<'_>, message: &str) -> Result<EventFlow> {
        let shared = Arc::clone(&self.shared);
        let mut state = write(&shared);
        let vocab = ctx.vocabulary();

        if message == vocab.incoming_properties {
            state.expecting_payload = true;
            state.expecting_fitness = false;
        } else if state.expecting_payload {
            state.expecting_payload = false;
            state.cached_payload = Some(message.to_string());
            emit_to(
                ctx.logger(),
                LogLevel::Debug,
                TUNING_TARGET,
                "payload_cached",
                [json_kv("bytes", message.len())],
            );
        } else if message == vocab.incoming_fitness {
            state.expecting_fitness = true;
            state.expecting_payload = false;
        } else if state.expecting_fitness {
            state.expecting_fitness = false;
            self.evaluate(ctx, &mut state, message);
        } else {
            return Ok(EventFlow::Continue);
        }

        Ok(EventFlow::Consumed)
    }

    fn on_run_ended(&mut self, ctx: &mut SessionContext<'_>) -> Result<()> {
        let mut state = write(&self.shared);
        if !state.active {
            return Ok(());
        }

        state.runs_completed += 1;
        let logger = ctx.logger();

        if state.runs_completed < state.plan.total_runs {
            emit_to(
                logger,
                LogLevel::Info,
                TUNING_TARGET,
                "run_starting",
                [
                    json_kv("run", state.runs_completed + 1),
                    json_kv("of", state.plan.total_runs),
                ],
            );

            if state.plan.payload_target.is_empty() {
                emit_to(logger, LogLevel::Error, TUNING_TARGET, "payload_target_empty", []);
            }

            match state.cached_payload.as_deref().filter(|payload| !payload.is_empty()) {
                Some(payload) => ctx.apply_payload(state.plan.payload_target.clone(), payload),
                None => emit_to(
                    logger,
                    LogLevel::Warn,
                    TUNING_TARGET,
                    "payload_missing",
                    [json_str("error", TuningError::MissingPayload.to_string())],
                ),
            }
            ctx.request_start();
        } else {
            state.active = false;
            let elapsed = state.started_at.map(|start| start.elapsed()).unwrap_or_default();
            state.elapsed = Some(elapsed);
            emit_to(
                logger,
                LogLevel::Info,
                TUNING_TARGET,
                "tuning_finished",
                [
                    json_kv("runs", state.runs_completed),
                    json_kv("elapsed_s", elapsed.as_secs_f64()),
                    json_kv("best", json!(state.best_fitness)),
                ],
            );
        }
        Ok(())
    }
}

/// Owns the shared tuning state and drives a messenger through a plan.
#[derive(Debug, Clone, Default)]
pub struct RunTuner {
    shared: SharedTuning,
}

impl RunTuner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> SharedTuning {
        Arc::clone(&self.shared)
    }

    /// Prepare the host, reset progress and start the first run.
    ///
    /// Returns false when the plan is empty or the host refused to prepare.
    pub fn begin_tuning(&self, messenger: &mut Messenger, plan: TuningPlan) -> bool {
        let logger = messenger.config().logger.clone();
        if plan.total_runs == 0 {
            emit_to(logger.as_ref(), LogLevel::Error, TUNING_TARGET, "plan_empty", []);
            return false;
        }
        if !messenger.host_mut().prepare_tuning(&plan) {
            emit_to(
                logger.as_ref(),
                LogLevel::Error,
                TUNING_TARGET,
                "prepare_failed",
                [json_str("target", plan.payload_target.as_str())],
            );
            return false;
        }

        emit_to(
            logger.as_ref(),
            LogLevel::Info,
            TUNING_TARGET,
            "tuning_started",
            [
                json_kv("runs", plan.total_runs),
                json_str("target", plan.payload_target.as_str()),
            ],
        );
        write(&self.shared).reset(plan);

        messenger.set_listen_buffer_size(TUNING_LISTEN_BUFFER_SIZE);
        if !messenger.has_plugin(RUN_ITERATION_PLUGIN) {
            messenger.register_plugin(RunIterationPlugin::new(self.shared()));
        }
        messenger.start();
        true
    }

    pub fn progress(&self) -> TuningProgress {
        read(&self.shared).clone()
    }

    pub fn best_fitness(&self) -> f64 {
        read(&self.shared).best_fitness
    }

    pub fn cached_payload(&self) -> Option<String> {
        read(&self.shared).cached_payload.clone()
    }

    pub fn is_expecting_payload(&self) -> bool {
        read(&self.shared).expecting_payload
    }

    pub fn is_expecting_fitness(&self) -> bool {
        read(&self.shared).expecting_fitness
    }

    pub fn runs_completed(&self) -> u32 {
        read(&self.shared).runs_completed
    }

    pub fn total_runs(&self) -> u32 {
        read(&self.shared).plan.total_runs
    }

    pub fn is_finished(&self) -> bool {
        read(&self.shared).is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkSettings;
    use crate::logging::{Logger, MemorySink};
    use crate::runtime::host::{RecordingHost, SharedJournal, TickKind};
    use crate::runtime::MessengerConfig;

    fn setup() -> (Messenger, RunTuner, SharedJournal, MemorySink) {
        let sink = MemorySink::new();
        let host = RecordingHost::new();
        let journal = host.journal();
        let mut config = MessengerConfig::with_settings(LinkSettings::loopback_ephemeral())
            .with_logger(Logger::new(sink.clone()));
        config.metrics_interval = Duration::ZERO;
        (Messenger::new(config, host), RunTuner::new(), journal, sink)
    }

    fn report(messenger: &mut Messenger, raw: &str) {
        messenger.receive_message("incoming_race_time", false);
        messenger.receive_message(raw, false);
    }

    fn finish_run(messenger: &mut Messenger) {
        messenger.receive_message("end_play", false);
        messenger.on_simulation_ending();
        messenger.tick(TickKind::Idle);
    }

    #[test]
    fn fitness_sequence_accepts_only_improvements() {
        let (mut messenger, tuner, _, _) = setup();
        assert!(tuner.begin_tuning(&mut messenger, TuningPlan::new(1, "/Game/Controller")));

        for raw in ["5.0", "3.0", "4.0", "2.0"] {
            report(&mut messenger, raw);
        }

        let progress = tuner.progress();
        assert_eq!(
            progress.decisions(),
            vec![Decision::Accept, Decision::Accept, Decision::Deny, Decision::Accept]
        );
        assert_eq!(progress.best_fitness, 2.0);
        messenger.force_stop();
    }

    #[test]
    fn equal_fitness_is_denied() {
        let (mut messenger, tuner, _, _) = setup();
        tuner.begin_tuning(&mut messenger, TuningPlan::new(1, "/Game/Controller"));
        report(&mut messenger, "3.5");
        report(&mut messenger, "3.5");
        assert_eq!(tuner.progress().decisions(), vec![Decision::Accept, Decision::Deny]);
        messenger.force_stop();
    }

    #[test]
    fn unparsable_fitness_is_denied_and_logged() {
        let (mut messenger, tuner, _, sink) = setup();
        tuner.begin_tuning(&mut messenger, TuningPlan::new(1, "/Game/Controller"));
        report(&mut messenger, "fast");
        report(&mut messenger, " 12.5 ");

        let progress = tuner.progress();
        assert_eq!(progress.decisions(), vec![Decision::Deny, Decision::Accept]);
        assert_eq!(progress.reports[0].value, None);
        assert_eq!(progress.best_fitness, 12.5);
        assert!(sink.contains("fitness_unparsed"));
        messenger.force_stop();
    }

    #[test]
    fn three_runs_launch_exactly_three_times() {
        let (mut messenger, tuner, journal, _) = setup();
        assert!(tuner.begin_tuning(&mut messenger, TuningPlan::new(3, "/Game/Controller")));
        assert_eq!(journal.lock().unwrap().launches, 1);

        for _ in 0..3 {
            messenger.receive_message("incoming_control_properties", false);
            messenger.receive_message(r#"{"gain":1.0}"#, false);
            finish_run(&mut messenger);
        }

        // A stray extra lifecycle end changes nothing.
        messenger.on_simulation_ending();
        messenger.tick(TickKind::Idle);

        let journal = journal.lock().unwrap();
        assert_eq!(journal.launches, 3);
        assert_eq!(journal.payloads.len(), 2);
        assert_eq!(journal.payloads[0].0, "/Game/Controller");
        assert!(tuner.is_finished());
        assert_eq!(tuner.runs_completed(), 3);
        assert_eq!(tuner.total_runs(), 3);
    }

    #[test]
    fn missing_payload_reruns_unchanged() {
        let (mut messenger, tuner, journal, sink) = setup();
        tuner.begin_tuning(&mut messenger, TuningPlan::new(2, "/Game/Controller"));
        finish_run(&mut messenger);

        assert!(sink.contains("payload_missing"));
        let journal = journal.lock().unwrap();
        assert!(journal.payloads.is_empty());
        assert_eq!(journal.launches, 2);
        drop(journal);
        messenger.force_stop();
    }

    #[test]
    fn expecting_flags_are_exclusive() {
        let (mut messenger, tuner, _, _) = setup();
        tuner.begin_tuning(&mut messenger, TuningPlan::new(1, "/Game/Controller"));

        messenger.receive_message("incoming_control_properties", false);
        assert!(tuner.is_expecting_payload());
        messenger.receive_message("incoming_race_time", false);
        assert!(tuner.is_expecting_fitness());
        assert!(!tuner.is_expecting_payload());

        messenger.receive_message("incoming_control_properties", false);
        assert!(tuner.is_expecting_payload());
        assert!(!tuner.is_expecting_fitness());

        messenger.receive_message("heartbeat", false);
        assert_eq!(tuner.cached_payload().as_deref(), Some("heartbeat"));
        assert!(!tuner.is_expecting_payload());
        messenger.force_stop();
    }

    #[test]
    fn begin_tuning_raises_buffer_and_registers_once() {
        let (mut messenger, tuner, journal, _) = setup();
        tuner.begin_tuning(&mut messenger, TuningPlan::new(1, "/Game/A"));
        messenger.force_stop();
        tuner.begin_tuning(&mut messenger, TuningPlan::new(1, "/Game/B"));

        assert_eq!(messenger.settings().listen_buffer_size, TUNING_LISTEN_BUFFER_SIZE);
        assert_eq!(journal.lock().unwrap().prepared.len(), 2);
        assert_eq!(tuner.progress().plan.payload_target, "/Game/B");

        report(&mut messenger, "1.0");
        assert_eq!(tuner.progress().reports.len(), 1);
        messenger.force_stop();
    }

    #[test]
    fn refused_preparation_does_not_start() {
        let sink = MemorySink::new();
        let config = MessengerConfig::with_settings(LinkSettings::loopback_ephemeral())
            .with_logger(Logger::new(sink.clone()));
        let host = RecordingHost::new().refusing_prepare();
        let journal = host.journal();
        let mut messenger = Messenger::new(config, host);
        let tuner = RunTuner::new();

        assert!(!tuner.begin_tuning(&mut messenger, TuningPlan::new(2, "/Game/A")));
        assert!(!tuner.begin_tuning(&mut messenger, TuningPlan::new(0, "/Game/A")));
        assert_eq!(journal.lock().unwrap().launches, 0);
        assert!(sink.contains("prepare_failed"));
        assert!(sink.contains("plan_empty"));
    }
}
