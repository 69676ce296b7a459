//! Stream utilities

mod throttle;

pub use throttle::{Throttle, ThrottleExt};
