mod types;

pub use types::{ConfigError, EndpointError, FrameError, LinkError, Result, TuningError};
