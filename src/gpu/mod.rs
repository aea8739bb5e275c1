//! Accelerator discovery.
//!
//! - [`device`]: Accelerator probing and device info

pub mod device;
