//! State machine test utilities.

pub mod utils;
