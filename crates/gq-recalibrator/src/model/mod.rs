//! Recalibrator network and the host-to-device batch bridge.

pub mod bridge;
pub mod recalibrator;
