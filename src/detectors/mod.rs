//! The four anomaly detectors.
//!
//! Each returns a confidence in `[0, 1]` that its signal deviates from the
//! baseline in a way a hypervisor would cause. They share nothing but the
//! baseline and the measurement primitives, and never look at each other.

pub mod cache;
pub mod counters;
pub mod memory;
pub mod timing;
