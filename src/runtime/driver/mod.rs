//! Socket plumbing that runs off the poller: the endpoint and the
//! background listener thread that feeds the message queue.

pub mod listener;
pub mod socket;

pub use listener::{AcceptCallback, ListenerContext, ListenerHandle};
pub use socket::{EndpointResult, SocketEndpoint};
