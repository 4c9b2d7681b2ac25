//! Shared infrastructure for the tachyon client stack: structured logging
//! and wall-clock timestamps.

pub mod logging;
pub mod time;
