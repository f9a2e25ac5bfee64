//! Time-based position estimate for one shutter.
//!
//! The FSB61NP never reports a position, only that the motor started, stopped or hit an end
//! stop. Between those reports the position is interpolated from how long the motor has been
//! running and the configured full travel times. Positions use Home Assistant's convention:
//! 0 is closed, 100 is open.

use std::fmt::{self, Display};
use std::time::Duration;

use enocean::Direction;
use tokio::time::Instant;

pub const CLOSED: f64 = 0.0;
pub const OPEN: f64 = 100.0;

/// Within this distance of an end stop, a stopped shutter is taken to be at the end stop.
const SNAP: f64 = 1.0;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Motion {
    Stopped,
    Moving {
        direction: Direction,
        start_position: f64,
        started: Instant,
    },
}

/// State as published to Home Assistant.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CoverState {
    Open,
    Closed,
    Opening,
    Closing,
}

impl CoverState {
    pub fn as_str(self) -> &'static str {
        match self {
            CoverState::Open => "open",
            CoverState::Closed => "closed",
            CoverState::Opening => "opening",
            CoverState::Closing => "closing",
        }
    }
}

impl Display for CoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn clamp(position: f64) -> f64 {
    if position.is_nan() {
        CLOSED
    } else {
        position.max(CLOSED).min(OPEN)
    }
}

fn snap(position: f64) -> f64 {
    let position = clamp(position);
    if position < CLOSED + SNAP {
        CLOSED
    } else if position > OPEN - SNAP {
        OPEN
    } else {
        position
    }
}

fn limit(direction: Direction) -> f64 {
    match direction {
        Direction::Open => OPEN,
        Direction::Close => CLOSED,
    }
}

#[derive(Clone, Debug)]
pub struct PositionEstimator {
    full_open_time: Duration,
    full_close_time: Duration,
    /// Position when stopped. While moving, see `Motion::Moving::start_position`.
    position: f64,
    motion: Motion,
    changed_at: Instant,
}

impl PositionEstimator {
    pub fn new(
        full_open_time: Duration,
        full_close_time: Duration,
        position: f64,
        now: Instant,
    ) -> Self {
        Self {
            full_open_time,
            full_close_time,
            position: clamp(position),
            motion: Motion::Stopped,
            changed_at: now,
        }
    }

    pub fn full_travel_time(&self, direction: Direction) -> Duration {
        match direction {
            Direction::Open => self.full_open_time,
            Direction::Close => self.full_close_time,
        }
    }

    /// How long the motor has to run to get from `from` to `to`.
    pub fn travel_time(&self, from: f64, to: f64) -> Duration {
        let (from, to) = (clamp(from), clamp(to));
        let direction = if to > from {
            Direction::Open
        } else {
            Direction::Close
        };
        self.full_travel_time(direction)
            .mul_f64((to - from).abs() / (OPEN - CLOSED))
    }

    /// Distance covered by running in `direction` for `run_time`.
    fn distance(&self, direction: Direction, run_time: Duration) -> f64 {
        let full = self.full_travel_time(direction).as_secs_f64();
        let travelled = (OPEN - CLOSED) * run_time.as_secs_f64() / full;
        match direction {
            Direction::Open => travelled,
            Direction::Close => -travelled,
        }
    }

    pub fn position(&self, now: Instant) -> f64 {
        match self.motion {
            Motion::Stopped => self.position,
            Motion::Moving {
                direction,
                start_position,
                started,
            } => clamp(
                start_position + self.distance(direction, now.saturating_duration_since(started)),
            ),
        }
    }

    /// Position rounded for publishing.
    pub fn published_position(&self, now: Instant) -> u8 {
        self.position(now).round() as u8
    }

    pub fn direction(&self) -> Option<Direction> {
        match self.motion {
            Motion::Stopped => None,
            Motion::Moving { direction, .. } => Some(direction),
        }
    }

    pub fn is_moving(&self) -> bool {
        self.motion != Motion::Stopped
    }

    /// When the motion state last changed.
    pub fn changed_at(&self) -> Instant {
        self.changed_at
    }

    pub fn state(&self, now: Instant) -> CoverState {
        match self.motion {
            Motion::Moving {
                direction: Direction::Open,
                ..
            } => CoverState::Opening,
            Motion::Moving {
                direction: Direction::Close,
                ..
            } => CoverState::Closing,
            Motion::Stopped if self.position(now) > CLOSED => CoverState::Open,
            Motion::Stopped => CoverState::Closed,
        }
    }

    /// Starts moving from wherever the shutter is now.
    pub fn start(&mut self, direction: Direction, now: Instant) {
        let from = self.position(now);
        self.start_from(direction, from, now);
    }

    /// Starts moving from a known position, discarding the current estimate.
    pub fn start_from(&mut self, direction: Direction, from: f64, now: Instant) {
        self.position = clamp(from);
        self.motion = Motion::Moving {
            direction,
            start_position: self.position,
            started: now,
        };
        self.changed_at = now;
    }

    /// Freezes the estimate where it is now.
    pub fn stop(&mut self, now: Instant) -> f64 {
        self.position = snap(self.position(now));
        self.motion = Motion::Stopped;
        self.changed_at = now;
        self.position
    }

    /// Applies an actuator stop report. A report with run time and direction replaces the
    /// elapsed-time guess with the distance the actuator says it drove.
    pub fn confirm_stop(
        &mut self,
        run_time: Option<Duration>,
        direction: Option<Direction>,
        now: Instant,
    ) -> f64 {
        match (run_time, direction) {
            (Some(run_time), Some(direction)) => {
                let from = match self.motion {
                    Motion::Moving { start_position, .. } => start_position,
                    Motion::Stopped => self.position,
                };
                self.position = snap(from + self.distance(direction, run_time));
                self.motion = Motion::Stopped;
                self.changed_at = now;
                self.position
            }
            _ => self.stop(now),
        }
    }

    /// The actuator reached the end stop in `direction`.
    pub fn arrive(&mut self, direction: Direction, now: Instant) {
        self.position = limit(direction);
        self.motion = Motion::Stopped;
        self.changed_at = now;
    }

    /// Whether an end-stop report for `direction` can be believed: the shutter is at rest or
    /// heading that way.
    pub fn accepts_end_position(&self, direction: Direction) -> bool {
        match self.motion {
            Motion::Stopped => true,
            Motion::Moving { direction: moving, .. } => moving == direction,
        }
    }

    /// Resets to a snapshot taken before a command that was never acknowledged.
    pub fn revert(&mut self, snapshot: f64, now: Instant) {
        self.position = clamp(snapshot);
        self.motion = Motion::Stopped;
        self.changed_at = now;
    }

    /// Stops the motion once the estimate reaches the end stop it is heading for. Returns
    /// whether it did.
    pub fn tick(&mut self, now: Instant) -> bool {
        match self.motion {
            Motion::Moving { direction, .. } if self.position(now) == limit(direction) => {
                self.arrive(direction, now);
                true
            }
            _ => false,
        }
    }
}
