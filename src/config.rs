//! Connection settings and the message vocabulary.
//!
//! Both are plain serde structs so a host can keep them in a JSON document
//! next to its own configuration. Missing keys fall back to the defaults.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9876;
pub const DEFAULT_LISTEN_BUFFER_SIZE: usize = 32;
/// Large enough for a serialized properties payload in one read.
pub const TUNING_LISTEN_BUFFER_SIZE: usize = 4096;

/// Tokens exchanged with the runtime. Hosts usually supply their own values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vocabulary {
    pub heartbeat: String,
    pub greeting: String,
    pub goodbye: String,
    pub begin_run: String,
    pub end_run: String,
    pub incoming_properties: String,
    pub incoming_fitness: String,
    pub accept_properties: String,
    pub deny_properties: String,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            heartbeat: "heartbeat".to_string(),
            greeting: "greeting".to_string(),
            goodbye: "goodbye".to_string(),
            begin_run: "begin_play".to_string(),
            end_run: "end_play".to_string(),
            incoming_properties: "incoming_control_properties".to_string(),
            incoming_fitness: "incoming_race_time".to_string(),
            accept_properties: "accept_control_properties".to_string(),
            deny_properties: "deny_control_properties".to_string(),
        }
    }
}

impl Vocabulary {
    /// Every token in wire order of declaration.
    pub fn tokens(&self) -> [&str; 9] {
        [
            self.heartbeat.as_str(),
            self.greeting.as_str(),
            self.goodbye.as_str(),
            self.begin_run.as_str(),
            self.end_run.as_str(),
            self.incoming_properties.as_str(),
            self.incoming_fitness.as_str(),
            self.accept_properties.as_str(),
            self.deny_properties.as_str(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    pub address: String,
    pub port: u16,
    /// Chunk size for each read in `receive_all_available`.
    pub listen_buffer_size: usize,
    /// Pause between listener iterations.
    pub listen_sleep_ms: u64,
    /// Poll period of the non-blocking accept loop.
    pub accept_poll_ms: u64,
    /// Period the host should use for idle ticks.
    pub idle_tick_ms: u64,
    /// Period the host should use while a run is active.
    pub active_tick_ms: u64,
    /// Write timeout on the accepted client, so a stalled runtime cannot
    /// hold up the poller.
    pub send_timeout_ms: u64,
    pub send_goodbye_on_stop: bool,
    pub vocabulary: Vocabulary,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            listen_buffer_size: DEFAULT_LISTEN_BUFFER_SIZE,
            listen_sleep_ms: 10,
            accept_poll_ms: 10,
            idle_tick_ms: 500,
            active_tick_ms: 500,
            send_timeout_ms: 2000,
            send_goodbye_on_stop: false,
            vocabulary: Vocabulary::default(),
        }
    }
}

impl LinkSettings {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Loopback settings on an ephemeral port.
    pub fn loopback_ephemeral() -> Self {
        Self {
            port: 0,
            ..Self::default()
        }
    }

    pub fn bind_target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.bind_target().parse().ok()
    }

    pub fn listen_sleep(&self) -> Duration {
        Duration::from_millis(self.listen_sleep_ms)
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(1))
    }

    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }

    pub fn active_tick(&self) -> Duration {
        Duration::from_millis(self.active_tick_ms)
    }
}
