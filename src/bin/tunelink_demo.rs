//! Loopback tuning session.
//!
//! The host below stands in for an editor: it owns the periodic timers,
//! and every launched run spawns a simulated runtime that connects back
//! to the controller, reports a race time for a perturbed parameter set and
//! keeps or discards the candidate depending on the controller's verdict.
//!
//! Usage: `tunelink-demo [--config settings.json] [--runs N] [--log-file tunelink.log]`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tunelink::logging::{FileSink, StderrSink, json_kv, json_str};
use tunelink::{
    LifecycleLoggerPlugin, LinkSettings, LogLevel, Logger, Messenger, MessengerConfig,
    RuntimeClient, RunTuner, SimulationHost, TickKind, TimerHandle, TuningPlan, Vocabulary,
};

const DEMO_TARGET: &str = "tunelink::demo";
const DEFAULT_RUNS: u32 = 8;
const LOG_FILE_MAX_BYTES: u64 = 4 * 1024 * 1024;
const PAYLOAD_TARGET: &str = "/Game/Racing/AIController_Tuned";
const SESSION_DEADLINE: Duration = Duration::from_secs(120);
// Each runtime message has to land in its own receive batch.
const SEND_GAP: Duration = Duration::from_millis(80);

type DemoResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

fn main() -> DemoResult<()> {
    let args = parse_args()?;
    let settings = match &args.config {
        Some(path) => LinkSettings::from_path(path)?,
        None => LinkSettings {
            idle_tick_ms: 100,
            active_tick_ms: 50,
            ..LinkSettings::default()
        },
    };
    let addr = settings
        .socket_addr()
        .ok_or_else(|| format!("{} is not an IP socket address", settings.bind_target()))?;

    let logger = match &args.log_file {
        Some(path) => Logger::new(FileSink::new(path, LOG_FILE_MAX_BYTES)?),
        None => Logger::new(StderrSink),
    }
    .with_min_level(LogLevel::Info);
    let (events_tx, events_rx) = mpsc::channel();
    let timers = Arc::new(Mutex::new(Vec::new()));
    let host = LoopbackHost::new(
        addr,
        settings.vocabulary.clone(),
        events_tx,
        Arc::clone(&timers),
        logger.clone(),
    );
    let properties = host.properties();

    let config = MessengerConfig::with_settings(settings).with_logger(logger.clone());
    let mut messenger = Messenger::new(config, host);
    messenger.register_plugin(
        LifecycleLoggerPlugin::new(logger.clone())
            .with_level(LogLevel::Info)
            .log_messages(false),
    );
    logger.emit(
        LogLevel::Info,
        DEMO_TARGET,
        "help",
        [json_str("text", messenger.help_text())],
    );

    let tuner = RunTuner::new();
    if !tuner.begin_tuning(&mut messenger, TuningPlan::new(args.runs, PAYLOAD_TARGET)) {
        return Err("tuning session could not start".into());
    }

    pump(&mut messenger, &tuner, &events_rx, &timers);

    let progress = tuner.progress();
    let best = properties.lock().map(|p| p.clone()).unwrap_or_default();
    logger.emit(
        LogLevel::Info,
        DEMO_TARGET,
        "summary",
        [
            json_kv("runs", progress.runs_completed),
            json_kv("best_race_time", json!(progress.best_fitness)),
            json_kv("decisions", json!(progress.decisions())),
            json_kv("properties", json!(best)),
        ],
    );
    messenger.force_stop();
    Ok(())
}

struct Args {
    config: Option<PathBuf>,
    runs: u32,
    log_file: Option<PathBuf>,
}

fn parse_args() -> DemoResult<Args> {
    let mut args = Args {
        config: None,
        runs: DEFAULT_RUNS,
        log_file: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                args.config = Some(iter.next().ok_or("--config needs a path")?.into());
            }
            "--log-file" => {
                args.log_file = Some(iter.next().ok_or("--log-file needs a path")?.into());
            }
            "--runs" => {
                args.runs = iter.next().ok_or("--runs needs a count")?.parse()?;
            }
            other => return Err(format!("unknown argument {other}").into()),
        }
    }
    Ok(args)
}

/// The host's main loop: forward lifecycle events and fire due timers.
fn pump(
    messenger: &mut Messenger,
    tuner: &RunTuner,
    events: &Receiver<HostEvent>,
    timers: &Arc<Mutex<Vec<Timer>>>,
) {
    let deadline = Instant::now() + SESSION_DEADLINE;
    while !tuner.is_finished() && Instant::now() < deadline {
        for event in events.try_iter() {
            match event {
                HostEvent::SimulationStarted => messenger.on_simulation_started(),
                HostEvent::SimulationEnding => messenger.on_simulation_ending(),
            }
        }
        for kind in due_timers(timers) {
            messenger.tick(kind);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn due_timers(timers: &Arc<Mutex<Vec<Timer>>>) -> Vec<TickKind> {
    let now = Instant::now();
    let Ok(mut timers) = timers.lock() else {
        return Vec::new();
    };
    timers
        .iter_mut()
        .filter(|timer| now >= timer.next_due)
        .map(|timer| {
            timer.next_due = now + timer.interval;
            timer.kind
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum HostEvent {
    SimulationStarted,
    SimulationEnding,
}

#[derive(Debug)]
struct Timer {
    handle: TimerHandle,
    kind: TickKind,
    interval: Duration,
    next_due: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ControlProperties {
    steer_gain: f64,
    brake_bias: f64,
    throttle_curve: f64,
}

impl Default for ControlProperties {
    fn default() -> Self {
        Self {
            steer_gain: 1.0,
            brake_bias: 0.3,
            throttle_curve: 2.0,
        }
    }
}

impl ControlProperties {
    fn race_time(&self) -> f64 {
        let dist = (self.steer_gain - 1.8).powi(2)
            + (self.brake_bias - 0.55).powi(2)
            + (self.throttle_curve - 1.2).powi(2);
        60.0 + 40.0 * dist
    }

    fn perturbed(&self, seed: u64) -> Self {
        let mut state = seed | 1;
        let mut nudge = |value: f64| value + (next_unit(&mut state) - 0.5) * 0.4;
        Self {
            steer_gain: nudge(self.steer_gain),
            brake_bias: nudge(self.brake_bias),
            throttle_curve: nudge(self.throttle_curve),
        }
    }
}

// xorshift64
fn next_unit(state: &mut u64) -> f64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    (*state >> 11) as f64 / (1u64 << 53) as f64
}

struct LoopbackHost {
    addr: SocketAddr,
    vocabulary: Vocabulary,
    events: Sender<HostEvent>,
    timers: Arc<Mutex<Vec<Timer>>>,
    properties: Arc<Mutex<ControlProperties>>,
    logger: Logger,
    next_timer: u64,
    launches: u64,
    run_active: bool,
}

impl LoopbackHost {
    fn new(
        addr: SocketAddr,
        vocabulary: Vocabulary,
        events: Sender<HostEvent>,
        timers: Arc<Mutex<Vec<Timer>>>,
        logger: Logger,
    ) -> Self {
        Self {
            addr,
            vocabulary,
            events,
            timers,
            properties: Arc::new(Mutex::new(ControlProperties::default())),
            logger,
            next_timer: 0,
            launches: 0,
            run_active: false,
        }
    }

    fn properties(&self) -> Arc<Mutex<ControlProperties>> {
        Arc::clone(&self.properties)
    }
}

impl SimulationHost for LoopbackHost {
    fn register_periodic(&mut self, kind: TickKind, interval: Duration) -> TimerHandle {
        self.next_timer += 1;
        let handle = TimerHandle(self.next_timer);
        if let Ok(mut timers) = self.timers.lock() {
            timers.push(Timer {
                handle,
                kind,
                interval,
                next_due: Instant::now() + interval,
            });
        }
        handle
    }

    fn cancel_periodic(&mut self, handle: TimerHandle) {
        if let Ok(mut timers) = self.timers.lock() {
            timers.retain(|timer| timer.handle != handle);
        }
    }

    fn launch_run(&mut self) -> bool {
        if self.run_active {
            return true;
        }
        self.run_active = true;
        self.launches += 1;
        let _ = self.events.send(HostEvent::SimulationStarted);

        let baseline = self.properties.lock().map(|p| p.clone()).unwrap_or_default();
        let addr = self.addr;
        let vocabulary = self.vocabulary.clone();
        let logger = self.logger.clone();
        let seed = 0x9E37_79B9_7F4A_7C15 ^ self.launches;
        thread::spawn(move || {
            if let Err(err) = simulated_runtime(addr, &vocabulary, baseline, seed) {
                logger.emit(
                    LogLevel::Error,
                    DEMO_TARGET,
                    "runtime_failed",
                    [json_str("error", err.to_string())],
                );
            }
        });
        true
    }

    fn end_run(&mut self) {
        if self.run_active {
            self.run_active = false;
            let _ = self.events.send(HostEvent::SimulationEnding);
        }
    }

    fn apply_payload(&mut self, target: &str, payload: &str) {
        match serde_json::from_str::<ControlProperties>(payload) {
            Ok(parsed) => {
                if let Ok(mut properties) = self.properties.lock() {
                    *properties = parsed;
                }
            }
            Err(err) => self.logger.emit(
                LogLevel::Error,
                DEMO_TARGET,
                "payload_rejected",
                [json_str("target", target), json_str("error", err.to_string())],
            ),
        }
    }

    fn prepare_tuning(&mut self, plan: &TuningPlan) -> bool {
        self.logger.emit(
            LogLevel::Info,
            DEMO_TARGET,
            "assets_prepared",
            [json_str("target", plan.payload_target.as_str())],
        );
        true
    }
}

fn connect_with_retry(addr: SocketAddr) -> DemoResult<RuntimeClient> {
    let mut last = None;
    for _ in 0..50 {
        match RuntimeClient::connect(addr, Duration::from_millis(200)) {
            Ok(client) => return Ok(client),
            Err(err) => last = Some(err),
        }
        thread::sleep(Duration::from_millis(20));
    }
    Err(last.map(Into::into).unwrap_or_else(|| "connect failed".into()))
}

fn simulated_runtime(
    addr: SocketAddr,
    vocab: &Vocabulary,
    baseline: ControlProperties,
    seed: u64,
) -> DemoResult<()> {
    let mut client = connect_with_retry(addr)?;
    if !client.wait_for(&vocab.greeting, Duration::from_secs(2))? {
        return Err("controller never greeted".into());
    }

    say(&mut client, &vocab.begin_run)?;
    let candidate = baseline.perturbed(seed);
    say(&mut client, &vocab.incoming_fitness)?;
    say(&mut client, &format!("{:.4}", candidate.race_time()))?;

    let verdicts = [vocab.accept_properties.as_str(), vocab.deny_properties.as_str()];
    let keep = match client.wait_for_any(&verdicts, Duration::from_secs(5))? {
        Some(0) => candidate,
        Some(_) => baseline,
        None => return Err("no verdict from controller".into()),
    };

    say(&mut client, &vocab.incoming_properties)?;
    say(&mut client, &serde_json::to_string(&keep)?)?;
    say(&mut client, &vocab.end_run)?;
    Ok(())
}

fn say(client: &mut RuntimeClient, message: &str) -> DemoResult<()> {
    client.send(message)?;
    thread::sleep(SEND_GAP);
    Ok(())
}
