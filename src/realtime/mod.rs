//! Live connections and targeted push.

mod registry;

pub use registry::{ConnectionId, ConnectionRegistry, PushChannel, PushError, PushOutcome};
