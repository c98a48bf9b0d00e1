//! The nemesis registry.
//!
//! Maps nemesis names to a fault plus the schedule that drives it. Names
//! follow `start-<stop|kill|pause>-<tserver|master|node>`,
//! `partition-<random-halves|random-node|majorities-ring>` and
//! `<small|medium|large|xlarge>-skew`; the short names used by older run
//! scripts (`kill-tserver`, `partition-half`, `clock-skew`, ...) are accepted
//! as aliases.

use std::sync::Arc;

use tracing::debug;

use crate::controller::{Role, Signal};
use crate::error::{NemesisError, Result};
use crate::faults::{ClockSkew, Noop, Partition, Partitioner, ProcessKill, ProcessPause, SkewLevel};
use crate::schedule::{ClockSchedule, Schedule, ScheduleConfig, StartStopSchedule};
use crate::traits::SharedFault;

/// Canonical nemesis names, in matrix order.
pub const NEMESIS_NAMES: &[&str] = &[
    "none",
    "start-stop-tserver",
    "start-kill-tserver",
    "start-pause-tserver",
    "start-stop-master",
    "start-kill-master",
    "start-pause-master",
    "start-stop-node",
    "start-kill-node",
    "start-pause-node",
    "partition-random-halves",
    "partition-random-node",
    "partition-majorities-ring",
    "small-skew",
    "medium-skew",
    "large-skew",
    "xlarge-skew",
];

/// A fault together with its schedule.
pub struct NemesisPackage {
    /// The fault to apply.
    pub fault: SharedFault,
    /// When to apply and revert it.
    pub schedule: Schedule,
}

impl std::fmt::Debug for NemesisPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NemesisPackage")
            .field("fault", &self.fault.name())
            .field("schedule", &self.schedule)
            .finish()
    }
}

/// Builds nemesis packages by name.
#[derive(Debug, Clone, Default)]
pub struct NemesisRegistry {
    config: ScheduleConfig,
    seed: u64,
}

impl NemesisRegistry {
    /// Creates a registry with the given schedule timing.
    pub fn new(config: ScheduleConfig) -> Self {
        Self { config, seed: 0 }
    }

    /// Seeds the clock schedules.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Returns every canonical name.
    pub fn names() -> &'static [&'static str] {
        NEMESIS_NAMES
    }

    /// Resolves a name or alias to its canonical name.
    pub fn canonical(name: &str) -> Option<&'static str> {
        let alias = match name {
            "stop-tserver" => "start-stop-tserver",
            "kill-tserver" => "start-kill-tserver",
            "pause-tserver" => "start-pause-tserver",
            "stop-master" => "start-stop-master",
            "kill-master" => "start-kill-master",
            "pause-master" => "start-pause-master",
            "stop" => "start-stop-node",
            "kill" => "start-kill-node",
            "pause" => "start-pause-node",
            "partition-half" => "partition-random-halves",
            "partition-one" => "partition-random-node",
            "partition-ring" => "partition-majorities-ring",
            "clock-skew" => "medium-skew",
            other => other,
        };
        NEMESIS_NAMES.iter().copied().find(|n| *n == alias)
    }

    /// Returns true for the clock nemeses.
    pub fn is_clock(name: &str) -> bool {
        Self::canonical(name).is_some_and(|n| n.ends_with("-skew"))
    }

    /// Builds the package registered under `name`.
    pub fn build(&self, name: &str) -> Result<NemesisPackage> {
        let canonical =
            Self::canonical(name).ok_or_else(|| NemesisError::UnknownNemesis(name.to_string()))?;
        debug!(nemesis = canonical, requested = name, "Building nemesis");

        let fault: SharedFault = match canonical {
            "none" => Arc::new(Noop),
            "start-stop-tserver" => Arc::new(ProcessKill::graceful(&[Role::TServer])),
            "start-kill-tserver" => Arc::new(ProcessKill::forceful(&[Role::TServer])),
            "start-pause-tserver" => Arc::new(ProcessPause::new(&[Role::TServer])),
            "start-stop-master" => Arc::new(ProcessKill::graceful(&[Role::Master])),
            "start-kill-master" => Arc::new(ProcessKill::forceful(&[Role::Master])),
            "start-pause-master" => Arc::new(ProcessPause::new(&[Role::Master])),
            "start-stop-node" => Arc::new(ProcessKill::new(&Role::ALL, Signal::Term)),
            "start-kill-node" => Arc::new(ProcessKill::new(&Role::ALL, Signal::Kill)),
            "start-pause-node" => Arc::new(ProcessPause::new(&Role::ALL)),
            "partition-random-halves" => Arc::new(Partition::new(Partitioner::RandomHalves)),
            "partition-random-node" => Arc::new(Partition::new(Partitioner::RandomNode)),
            "partition-majorities-ring" => Arc::new(Partition::new(Partitioner::MajoritiesRing)),
            "small-skew" => Arc::new(ClockSkew::new(SkewLevel::Small)),
            "medium-skew" => Arc::new(ClockSkew::new(SkewLevel::Medium)),
            "large-skew" => Arc::new(ClockSkew::new(SkewLevel::Large)),
            "xlarge-skew" => Arc::new(ClockSkew::new(SkewLevel::XLarge)),
            other => return Err(NemesisError::UnknownNemesis(other.to_string())),
        };

        let schedule = if canonical == "none" {
            Schedule::Idle
        } else if Self::is_clock(canonical) {
            Schedule::Clock(ClockSchedule::new(self.config.clock_delay(), self.seed))
        } else {
            Schedule::StartStop(StartStopSchedule::new(
                self.config.interval(),
                self.config.duration(),
            ))
        };

        Ok(NemesisPackage { fault, schedule })
    }
}
