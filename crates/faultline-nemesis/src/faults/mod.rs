//! Fault catalog.
//!
//! - [`Noop`]: does nothing
//! - [`ProcessKill`]: stops database roles with a signal and restarts them
//! - [`ProcessPause`]: suspends database roles and resumes them
//! - [`Partition`]: drops traffic between groups of nodes
//! - [`ClockBump`], [`ClockReset`], [`ClockSkew`]: wall clock skew

mod clock;
mod noop;
mod partition;
mod process;

pub use clock::{ClockBump, ClockReset, ClockSkew, SkewLevel, sample_skew};
pub use noop::Noop;
pub use partition::{Partition, Partitioner, complete_grudge, majorities_ring};
pub use process::{ProcessKill, ProcessPause};
