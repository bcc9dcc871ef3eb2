//! Controller side of a single-client TCP link that drives repeated
//! simulation runs of an external runtime.
//!
//! A [`Messenger`] binds one endpoint per session, a background listener
//! thread frames incoming bytes into a [`MessageQueue`], and the host's
//! periodic callback drains the queue through [`Messenger::tick`]. The
//! [`tuning`] module layers the run-iteration protocol on top as a
//! [`SessionPlugin`].

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod runtime;
pub mod tuning;

pub use client::RuntimeClient;
pub use config::{LinkSettings, Vocabulary};
pub use error::{ConfigError, EndpointError, FrameError, LinkError, Result, TuningError};
pub use frame::{Framer, encode_frame};
pub use logging::{LogEvent, LogFields, LogLevel, Logger, LoggingError, LoggingResult};
pub use metrics::{MetricSnapshot, SessionMetrics};
pub use queue::MessageQueue;
pub use runtime::audit::{
    NullSessionAudit, RecordingAudit, SessionAudit, SessionAuditEvent, SessionAuditEventBuilder,
    SessionAuditStage,
};
pub use runtime::diagnostics::LifecycleLoggerPlugin;
pub use runtime::driver::{ListenerHandle, SocketEndpoint};
pub use runtime::host::{HostJournal, RecordingHost, SimulationHost, TickKind, TimerHandle};
pub use runtime::{
    EventFlow, Messenger, MessengerConfig, SessionContext, SessionPlugin, SessionState,
};
pub use tuning::{
    Decision, FitnessReport, RunIterationPlugin, RunTuner, TuningPlan, TuningProgress,
};
