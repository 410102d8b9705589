//! Hardware tick counter to wall-clock conversion
//!
//! Some instruments stamp their binary records with a free-running counter
//! instead of a clock. The counter has a fixed bit width and wraps back to
//! zero; [`CounterTimeBase`] turns the raw tick values into monotonic wall
//! time anchored at the session start.
//!
//! A backwards step is accepted as a rollover only when the step across the
//! wrap is close to the usual sample spacing. Anything else is reported as a
//! [`TimeBaseError::CounterDiscontinuity`]; the caller decides whether the
//! device was reset (see [`CounterTimeBase::rebase`]).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Time base errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimeBaseError {
    /// Counter went backwards by more than a rollover explains
    #[error("counter discontinuity: tick {tick} after {previous} (typical delta {typical:?})")]
    CounterDiscontinuity {
        /// Last accepted tick
        previous: u32,
        /// Offending tick
        tick: u32,
        /// Typical spacing when the step was seen
        typical: Option<u64>,
    },

    /// Tick does not fit the configured counter width
    #[error("tick {tick} exceeds a {width}-bit counter")]
    TickOutOfRange {
        /// Offending tick
        tick: u32,
        /// Counter width in bits
        width: u8,
    },
}

/// Counter characteristics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeBaseSettings {
    /// Ticks per second
    pub tick_rate: f64,
    /// Counter width in bits (modulus is 2^width)
    pub counter_width: u8,
    /// Largest accepted wrap step, as a multiple of the typical spacing
    pub rollover_tolerance: f64,
}

impl Default for TimeBaseSettings {
    fn default() -> Self {
        Self {
            tick_rate: 1.0,
            counter_width: 32,
            rollover_tolerance: 2.1,
        }
    }
}

impl TimeBaseSettings {
    /// Counter modulus
    pub fn modulus(&self) -> u64 {
        1u64 << self.counter_width
    }
}

/// Mutable part of the time base; saved in checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBaseState {
    /// Wall time of the first tick
    pub start: DateTime<Utc>,
    /// Rollovers accepted so far
    pub rollover_count: u32,
    /// First tick seen
    pub first_tick: Option<u32>,
    /// Last accepted tick
    pub last_tick: Option<u32>,
    /// Last positive spacing between accepted ticks
    pub typical_delta: Option<u64>,
}

impl TimeBaseState {
    /// Fresh state anchored at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            rollover_count: 0,
            first_tick: None,
            last_tick: None,
            typical_delta: None,
        }
    }
}

/// Rollover-aware tick converter
#[derive(Debug, Clone)]
pub struct CounterTimeBase {
    settings: TimeBaseSettings,
    state: TimeBaseState,
}

impl CounterTimeBase {
    /// Create a time base anchored at `start`
    pub fn new(settings: TimeBaseSettings, start: DateTime<Utc>) -> Self {
        Self {
            settings,
            state: TimeBaseState::new(start),
        }
    }

    /// Settings
    pub fn settings(&self) -> &TimeBaseSettings {
        &self.settings
    }

    /// Current state
    pub fn state(&self) -> TimeBaseState {
        self.state
    }

    /// Replace the state, e.g. from a checkpoint
    pub fn restore(&mut self, state: TimeBaseState) {
        self.state = state;
    }

    /// Rollovers accepted so far
    pub fn rollover_count(&self) -> u32 {
        self.state.rollover_count
    }

    /// Restart counting at `tick`, anchored at `start`
    pub fn rebase(&mut self, tick: u32, start: DateTime<Utc>) {
        tracing::info!(tick, %start, "rebasing counter time base");
        self.state = TimeBaseState {
            start,
            rollover_count: 0,
            first_tick: Some(tick),
            last_tick: Some(tick),
            typical_delta: None,
        };
    }

    /// Convert a raw tick into wall time, updating rollover tracking
    pub fn timestamp(&mut self, tick: u32) -> Result<DateTime<Utc>, TimeBaseError> {
        let modulus = self.settings.modulus();
        if u64::from(tick) >= modulus {
            return Err(TimeBaseError::TickOutOfRange {
                tick,
                width: self.settings.counter_width,
            });
        }

        let Some(previous) = self.state.last_tick else {
            self.state.first_tick = Some(tick);
            self.state.last_tick = Some(tick);
            return Ok(self.state.start);
        };

        if tick >= previous {
            let delta = u64::from(tick - previous);
            if delta > 0 {
                self.state.typical_delta = Some(delta);
            }
        } else {
            let wrapped = u64::from(tick) + modulus - u64::from(previous);
            let accepted = self
                .state
                .typical_delta
                .is_some_and(|typical| wrapped as f64 <= typical as f64 * self.settings.rollover_tolerance);
            if !accepted {
                tracing::warn!(previous, tick, typical = ?self.state.typical_delta, "counter discontinuity");
                return Err(TimeBaseError::CounterDiscontinuity {
                    previous,
                    tick,
                    typical: self.state.typical_delta,
                });
            }
            self.state.rollover_count += 1;
            self.state.typical_delta = Some(wrapped);
            tracing::debug!(rollovers = self.state.rollover_count, "counter rollover");
        }

        self.state.last_tick = Some(tick);
        Ok(self.wall_time(tick))
    }

    fn wall_time(&self, tick: u32) -> DateTime<Utc> {
        let first = u64::from(self.state.first_tick.unwrap_or(tick));
        let elapsed = u64::from(tick) + u64::from(self.state.rollover_count) * self.settings.modulus() - first;
        let nanos = (elapsed as f64 / self.settings.tick_rate * 1e9).round() as i64;
        self.state.start + Duration::nanoseconds(nanos)
    }
}
