//! Fault event schedules.
//!
//! A schedule is an unbounded, pull-based sequence of [`FaultEvent`]s. The
//! runner pulls the next event only when the previous one has finished, so
//! dropping the schedule is all it takes to stop emission. Every schedule
//! also names its terminal sequence: the events that must run after the
//! schedule is abandoned, whatever phase it was in.

use std::fmt;
use std::time::Duration;

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Timing of fault schedules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Sleep before each start, in seconds.
    pub interval_secs: u64,
    /// How long a started fault stays active, in seconds.
    pub duration_secs: u64,
    /// Sleep between clock events, in seconds.
    pub clock_delay_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            duration_secs: 10,
            clock_delay_secs: 5,
        }
    }
}

impl ScheduleConfig {
    /// Returns the interval as a Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Returns the active duration as a Duration.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Returns the clock delay as a Duration.
    pub fn clock_delay(&self) -> Duration {
        Duration::from_secs(self.clock_delay_secs)
    }
}

/// One step of a fault schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultEvent {
    /// Wait without touching the cluster.
    Sleep(Duration),
    /// Apply the fault.
    Start,
    /// Revert the fault.
    Stop,
    /// Shift clocks.
    Bump,
    /// Resynchronize clocks.
    Reset,
}

impl FaultEvent {
    /// Returns the history function name, or `None` for sleeps.
    pub fn f(&self) -> Option<&'static str> {
        match self {
            FaultEvent::Sleep(_) => None,
            FaultEvent::Start => Some("start"),
            FaultEvent::Stop => Some("stop"),
            FaultEvent::Bump => Some("bump"),
            FaultEvent::Reset => Some("reset"),
        }
    }

    /// Returns true for events that apply a fault.
    pub fn is_apply(&self) -> bool {
        matches!(self, FaultEvent::Start | FaultEvent::Bump)
    }
}

impl fmt::Display for FaultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultEvent::Sleep(d) => write!(f, "sleep {d:?}"),
            other => f.write_str(other.f().unwrap_or_default()),
        }
    }
}

/// `sleep(interval) → start → sleep(duration) → stop`, forever.
#[derive(Debug, Clone)]
pub struct StartStopSchedule {
    interval: Duration,
    duration: Duration,
    phase: u8,
}

impl StartStopSchedule {
    /// Creates a start/stop schedule.
    pub fn new(interval: Duration, duration: Duration) -> Self {
        Self {
            interval,
            duration,
            phase: 0,
        }
    }
}

impl Iterator for StartStopSchedule {
    type Item = FaultEvent;

    fn next(&mut self) -> Option<FaultEvent> {
        let event = match self.phase {
            0 => FaultEvent::Sleep(self.interval),
            1 => FaultEvent::Start,
            2 => FaultEvent::Sleep(self.duration),
            _ => FaultEvent::Stop,
        };
        self.phase = (self.phase + 1) % 4;
        Some(event)
    }
}

/// `sleep(delay)` followed by a weighted choice of reset (1) or bump (3),
/// forever.
#[derive(Debug, Clone)]
pub struct ClockSchedule {
    delay: Duration,
    rng: ChaCha8Rng,
    sleeping: bool,
}

impl ClockSchedule {
    const CHOICES: [FaultEvent; 4] = [
        FaultEvent::Reset,
        FaultEvent::Bump,
        FaultEvent::Bump,
        FaultEvent::Bump,
    ];

    /// Creates a clock schedule with a seeded choice sequence.
    pub fn new(delay: Duration, seed: u64) -> Self {
        Self {
            delay,
            rng: ChaCha8Rng::seed_from_u64(seed),
            sleeping: true,
        }
    }
}

impl Iterator for ClockSchedule {
    type Item = FaultEvent;

    fn next(&mut self) -> Option<FaultEvent> {
        let event = if self.sleeping {
            FaultEvent::Sleep(self.delay)
        } else {
            Self::CHOICES
                .choose(&mut self.rng)
                .copied()
                .unwrap_or(FaultEvent::Bump)
        };
        self.sleeping = !self.sleeping;
        Some(event)
    }
}

/// The schedule of one nemesis.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Emits nothing.
    Idle,
    /// Start/stop cycle.
    StartStop(StartStopSchedule),
    /// Clock bump/reset mix.
    Clock(ClockSchedule),
}

impl Schedule {
    /// The events to run once the schedule is abandoned.
    pub fn final_events(&self) -> Vec<FaultEvent> {
        match self {
            Schedule::Idle => Vec::new(),
            Schedule::StartStop(_) => vec![FaultEvent::Stop],
            Schedule::Clock(_) => vec![FaultEvent::Reset],
        }
    }
}

impl Iterator for Schedule {
    type Item = FaultEvent;

    fn next(&mut self) -> Option<FaultEvent> {
        match self {
            Schedule::Idle => None,
            Schedule::StartStop(s) => s.next(),
            Schedule::Clock(s) => s.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_stop_cycle() {
        let schedule = StartStopSchedule::new(Duration::from_secs(5), Duration::from_secs(2));
        let events: Vec<_> = schedule.take(8).collect();
        assert_eq!(
            events,
            vec![
                FaultEvent::Sleep(Duration::from_secs(5)),
                FaultEvent::Start,
                FaultEvent::Sleep(Duration::from_secs(2)),
                FaultEvent::Stop,
                FaultEvent::Sleep(Duration::from_secs(5)),
                FaultEvent::Start,
                FaultEvent::Sleep(Duration::from_secs(2)),
                FaultEvent::Stop,
            ]
        );
    }

    #[test]
    fn test_clock_schedule_mix() {
        let delay = Duration::from_secs(1);
        let events: Vec<_> = ClockSchedule::new(delay, 11).take(8000).collect();

        for pair in events.chunks(2) {
            assert_eq!(pair[0], FaultEvent::Sleep(delay));
            assert!(matches!(pair[1], FaultEvent::Bump | FaultEvent::Reset));
        }

        let bumps = events.iter().filter(|e| **e == FaultEvent::Bump).count();
        let resets = events.iter().filter(|e| **e == FaultEvent::Reset).count();
        assert_eq!(bumps + resets, 4000);
        // Expect roughly three bumps per reset.
        assert!(bumps > resets * 2 && bumps < resets * 4, "bumps={bumps} resets={resets}");
    }

    #[test]
    fn test_seeded_clock_schedule_repeats() {
        let a: Vec<_> = ClockSchedule::new(Duration::ZERO, 5).take(50).collect();
        let b: Vec<_> = ClockSchedule::new(Duration::ZERO, 5).take(50).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_final_events() {
        assert!(Schedule::Idle.final_events().is_empty());
        assert_eq!(Schedule::Idle.next(), None);

        let s = Schedule::StartStop(StartStopSchedule::new(Duration::ZERO, Duration::ZERO));
        assert_eq!(s.final_events(), vec![FaultEvent::Stop]);

        let s = Schedule::Clock(ClockSchedule::new(Duration::ZERO, 0));
        assert_eq!(s.final_events(), vec![FaultEvent::Reset]);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(FaultEvent::Bump.to_string(), "bump");
        assert_eq!(FaultEvent::Sleep(Duration::ZERO).f(), None);
        assert!(FaultEvent::Start.is_apply());
        assert!(!FaultEvent::Reset.is_apply());
    }
}
