//! Live container log relay.

mod relay;

pub use relay::{DEFAULT_LOG_BUFFER, LogEvent, LogLine, LogRelay, LogSubscription, split_lines};
