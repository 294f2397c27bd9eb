//! Small runtime helpers shared across layers.

pub mod clock;
pub mod lock;

pub use clock::{Clock, ManualClock, SystemClock, format_timestamp, parse_timestamp};
