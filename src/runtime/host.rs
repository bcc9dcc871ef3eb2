//! The narrow interface the messenger needs from its hosting application.
//!
//! Lifecycle notifications flow the other way: the host calls
//! `Messenger::on_simulation_started`, `on_simulation_ending` and
//! `on_world_changed`, and calls `Messenger::tick` whenever a timer it
//! registered on the messenger's behalf fires.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::tuning::TuningPlan;

/// Which periodic callback is firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TickKind {
    /// Slow tick while no run is active.
    Idle,
    /// Fast tick that drains the message queue during a run.
    Active,
}

impl TickKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TickKind::Idle => "idle",
            TickKind::Active => "active",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

pub trait SimulationHost: Send {
    /// Schedule `Messenger::tick(kind)` every `interval` until cancelled.
    fn register_periodic(&mut self, kind: TickKind, interval: Duration) -> TimerHandle;

    fn cancel_periodic(&mut self, handle: TimerHandle);

    /// Launch a simulation run. Returns false when the host refused.
    fn launch_run(&mut self) -> bool;

    /// End the active run, if any.
    fn end_run(&mut self);

    /// Apply an opaque payload to the configuration of the next run.
    /// Failures are the host's to log.
    fn apply_payload(&mut self, target: &str, payload: &str);

    /// Prepare whatever assets a tuning session needs. Returning false
    /// aborts the session before the first run.
    fn prepare_tuning(&mut self, _plan: &TuningPlan) -> bool {
        true
    }
}

/// Everything a [`RecordingHost`] was asked to do.
#[derive(Debug, Default, Clone)]
pub struct HostJournal {
    pub launches: usize,
    pub ends: usize,
    pub payloads: Vec<(String, String)>,
    pub timers: Vec<(TimerHandle, TickKind, Duration)>,
    pub cancelled: Vec<TimerHandle>,
    pub prepared: Vec<TuningPlan>,
    pub run_active: bool,
}

impl HostJournal {
    /// Timers registered and not cancelled yet.
    pub fn live_timers(&self) -> Vec<(TimerHandle, TickKind)> {
        self.timers
            .iter()
            .filter(|(handle, _, _)| !self.cancelled.contains(handle))
            .map(|(handle, kind, _)| (*handle, *kind))
            .collect()
    }
}

pub type SharedJournal = Arc<Mutex<HostJournal>>;

/// Host that performs nothing and writes every request to a shared
/// [`HostJournal`].
#[derive(Debug, Default)]
pub struct RecordingHost {
    journal: SharedJournal,
    next_timer: u64,
    refuse_launch: bool,
    refuse_prepare: bool,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing_launch(mut self) -> Self {
        self.refuse_launch = true;
        self
    }

    pub fn refusing_prepare(mut self) -> Self {
        self.refuse_prepare = true;
        self
    }

    pub fn journal(&self) -> SharedJournal {
        Arc::clone(&self.journal)
    }

    fn entry(&self) -> MutexGuard<'_, HostJournal> {
        self.journal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SimulationHost for RecordingHost {
    fn register_periodic(&mut self, kind: TickKind, interval: Duration) -> TimerHandle {
        self.next_timer += 1;
        let handle = TimerHandle(self.next_timer);
        self.entry().timers.push((handle, kind, interval));
        handle
    }

    fn cancel_periodic(&mut self, handle: TimerHandle) {
        self.entry().cancelled.push(handle);
    }

    fn launch_run(&mut self) -> bool {
        if self.refuse_launch {
            return false;
        }
        let mut journal = self.entry();
        journal.launches += 1;
        journal.run_active = true;
        true
    }

    fn end_run(&mut self) {
        let mut journal = self.entry();
        journal.ends += 1;
        journal.run_active = false;
    }

    fn apply_payload(&mut self, target: &str, payload: &str) {
        self.entry()
            .payloads
            .push((target.to_string(), payload.to_string()));
    }

    fn prepare_tuning(&mut self, plan: &TuningPlan) -> bool {
        self.entry().prepared.push(plan.clone());
        !self.refuse_prepare
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_get_distinct_handles() {
        let mut host = RecordingHost::new();
        let idle = host.register_periodic(TickKind::Idle, Duration::from_millis(500));
        let active = host.register_periodic(TickKind::Active, Duration::from_millis(50));
        assert_ne!(idle, active);

        host.cancel_periodic(idle);
        let journal = host.journal();
        let live = journal.lock().unwrap().live_timers();
        assert_eq!(live, vec![(active, TickKind::Active)]);
    }

    #[test]
    fn refusing_host_records_nothing() {
        let mut host = RecordingHost::new().refusing_launch();
        assert!(!host.launch_run());
        assert_eq!(host.journal().lock().unwrap().launches, 0);
    }
}
