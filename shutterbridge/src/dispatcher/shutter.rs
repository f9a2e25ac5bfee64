//! One task per shutter owns its position estimate and its in-flight command. Everything that
//! touches a shutter, from MQTT commands to actuator reports and timers, arrives as an `Event` on
//! the task's channel.

use std::fmt::{self, Display};
use std::time::Duration;

use enocean::{command_packet, teach_in_packet, CommandKind, DeviceId, Direction, StatusIndication};
use shutterbridge_helpers::{timer, Generation, Generations};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use super::queue::{OutboundQueue, OutboundQueueEntry, MIN_TELEGRAM_SPACING};
use crate::config::ShutterConfig;
use crate::estimator::{CoverState, PositionEstimator, CLOSED, OPEN};
use crate::sender::SenderAddress;
use crate::store::PositionStore;
use crate::{ErrorKind, Result};

/// How long to wait for the actuator to report after the last attempt.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Wait after each attempt before retrying.
pub const RETRY_BACKOFF: [Duration; 2] = [Duration::from_secs(5), Duration::from_secs(10)];
pub const MAX_ATTEMPTS: usize = RETRY_BACKOFF.len() + 1;
/// Interval between position updates while moving.
pub const TICK: Duration = Duration::from_millis(500);
/// Position targets closer than this to the estimate are ignored.
const POSITION_TOLERANCE: f64 = 1.0;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Command {
    Open,
    Close,
    Stop,
    SetPosition(f64),
    TeachIn,
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Open => write!(f, "OPEN"),
            Command::Close => write!(f, "CLOSE"),
            Command::Stop => write!(f, "STOP"),
            Command::SetPosition(target) => write!(f, "SET_POSITION {}", target),
            Command::TeachIn => write!(f, "TEACH_IN"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Update {
    State(CoverState),
    Position(u8),
    Availability(bool),
}

/// Something to publish about a shutter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ShutterUpdate {
    pub device_id: DeviceId,
    pub update: Update,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ShutterSnapshot {
    pub position: f64,
    pub state: CoverState,
    /// When the motion state last changed.
    pub changed_at: Instant,
    pub awaiting_ack: bool,
}

#[derive(Debug)]
enum Event {
    Submit(Command),
    Status(StatusIndication),
    AckTimeout {
        generation: Generation,
    },
    AutoStop {
        generation: Generation,
    },
    Availability(bool),
    Snapshot(oneshot::Sender<ShutterSnapshot>),
}

/// A command resolved against the current estimate.
#[derive(Copy, Clone, Debug)]
struct Dispatch {
    kind: CommandKind,
    run_time: Duration,
    /// Send a STOP after this long.
    auto_stop: Option<Duration>,
}

#[derive(Debug)]
struct InFlight {
    /// Advanced for every attempt.
    generation: Generation,
    dispatch: Dispatch,
    /// Zero-based.
    attempt: usize,
    /// Position before the command was first sent.
    snapshot: f64,
}

impl InFlight {
    fn acknowledged_by(&self, status: StatusIndication) -> bool {
        match (self.dispatch.kind, status) {
            (CommandKind::Stop, status) => status.is_stop(),
            (kind, StatusIndication::Started(direction))
            | (kind, StatusIndication::EndPosition(direction)) => {
                kind.direction() == Some(direction)
            }
            _ => false,
        }
    }
}

/// Handle to a shutter's task.
#[derive(Clone)]
pub struct ShutterHandle {
    events: mpsc::Sender<Event>,
}

impl ShutterHandle {
    pub async fn submit(&self, command: Command) -> Result<()> {
        self.send(Event::Submit(command)).await
    }

    /// Passes on a status report from the actuator, as received.
    pub async fn status(&self, status: StatusIndication) -> Result<()> {
        self.send(Event::Status(status)).await
    }

    pub async fn set_available(&self, available: bool) -> Result<()> {
        self.send(Event::Availability(available)).await
    }

    pub async fn snapshot(&self) -> Result<ShutterSnapshot> {
        let (sender, receiver) = oneshot::channel();
        self.send(Event::Snapshot(sender)).await?;
        Ok(receiver.await?)
    }

    async fn send(&self, event: Event) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| ErrorKind::ChannelError)?;
        Ok(())
    }
}

pub fn spawn(
    config: ShutterConfig,
    sender: SenderAddress,
    position: f64,
    queue: OutboundQueue,
    updates: mpsc::UnboundedSender<ShutterUpdate>,
    store: PositionStore,
) -> ShutterHandle {
    let (events_tx, events_rx) = mpsc::channel(32);
    let now = Instant::now();

    let shutter = Shutter {
        estimator: PositionEstimator::new(
            config.full_open_time,
            config.full_close_time,
            position,
            now,
        ),
        config,
        sender,
        generations: Generations::new(),
        in_flight: None,
        pending: None,
        auto_stop: None,
        available: false,
        published_state: None,
        published_position: None,
        stored_position: Some(position),
        queue,
        updates,
        store,
        timers: events_tx.downgrade(),
        events: events_rx,
    };
    tokio::spawn(shutter.task());

    ShutterHandle { events: events_tx }
}

struct Shutter {
    config: ShutterConfig,
    sender: SenderAddress,
    estimator: PositionEstimator,
    generations: Generations,
    in_flight: Option<InFlight>,
    /// Latest command submitted while another was awaiting acknowledgement.
    pending: Option<Command>,
    /// Generation of the attempt whose automatic STOP is still armed.
    auto_stop: Option<Generation>,
    available: bool,
    published_state: Option<CoverState>,
    published_position: Option<u8>,
    stored_position: Option<f64>,
    queue: OutboundQueue,
    /// Unbounded: the task never waits on the broker.
    updates: mpsc::UnboundedSender<ShutterUpdate>,
    store: PositionStore,
    /// Timers must not keep the task alive once every handle is gone.
    timers: mpsc::WeakSender<Event>,
    events: mpsc::Receiver<Event>,
}

impl Shutter {
    async fn task(mut self) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if let Err(error) = self.publish().await {
            error!("{}: {}", self.config.name, error);
        }

        loop {
            let result = tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                _ = ticker.tick(), if self.estimator.is_moving() => self.tick().await,
            };

            if let Err(error) = result {
                error!("{}: {}", self.config.name, error);
            }
        }

        debug!("{}: shutter task exiting", self.config.name);
    }

    async fn handle(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Submit(command) => self.submit(command).await,
            Event::Status(status) => self.status(status).await,
            Event::AckTimeout { generation } => self.ack_timeout(generation).await,
            Event::AutoStop { generation } => self.auto_stop(generation).await,
            Event::Availability(available) => self.set_available(available).await,
            Event::Snapshot(sender) => {
                let now = Instant::now();
                let _ = sender.send(ShutterSnapshot {
                    position: self.estimator.position(now),
                    state: self.estimator.state(now),
                    changed_at: self.estimator.changed_at(),
                    awaiting_ack: self.in_flight.is_some(),
                });
                Ok(())
            }
        }
    }

    async fn submit(&mut self, command: Command) -> Result<()> {
        if command == Command::TeachIn {
            return self.teach_in().await;
        }

        if let Some(in_flight) = &self.in_flight {
            debug!(
                "{}: holding {} until {} is acknowledged",
                self.config.name, command, in_flight.dispatch.kind
            );
            self.pending = Some(command);
            return Ok(());
        }

        self.start(command).await
    }

    async fn start(&mut self, command: Command) -> Result<()> {
        let now = Instant::now();
        let dispatch = match self.resolve(command, now) {
            Some(dispatch) => dispatch,
            None => return self.publish().await,
        };

        self.in_flight = Some(InFlight {
            generation: self.generations.advance(),
            dispatch,
            attempt: 0,
            snapshot: self.estimator.position(now),
        });

        match dispatch.auto_stop {
            Some(delay) => info!(
                "{}: {} for {:.1}s to reach {}",
                self.config.name,
                dispatch.kind,
                delay.as_secs_f64(),
                command
            ),
            None => info!("{}: {}", self.config.name, dispatch.kind),
        }

        self.send_attempt().await
    }

    fn resolve(&self, command: Command, now: Instant) -> Option<Dispatch> {
        let run = |direction: Direction| Dispatch {
            kind: direction.into(),
            run_time: self.estimator.full_travel_time(direction),
            auto_stop: None,
        };

        match command {
            Command::Open => Some(run(Direction::Open)),
            Command::Close => Some(run(Direction::Close)),
            Command::Stop => Some(Dispatch {
                kind: CommandKind::Stop,
                run_time: Duration::ZERO,
                auto_stop: None,
            }),
            Command::SetPosition(target) if target <= CLOSED => Some(run(Direction::Close)),
            Command::SetPosition(target) if target >= OPEN => Some(run(Direction::Open)),
            Command::SetPosition(target) => {
                let current = self.estimator.position(now);
                if (target - current).abs() < POSITION_TOLERANCE {
                    debug!(
                        "{}: already at {:.1}, ignoring {}",
                        self.config.name, current, command
                    );
                    return None;
                }

                let direction = if target > current {
                    Direction::Open
                } else {
                    Direction::Close
                };
                let run_time = self.estimator.travel_time(current, target);
                Some(Dispatch {
                    kind: direction.into(),
                    run_time,
                    auto_stop: Some(run_time),
                })
            }
            Command::TeachIn => None,
        }
    }

    /// Sends the in-flight command and arms its acknowledgement timer. The estimate restarts
    /// from the snapshot, as if this attempt were the one that started the motor, and the
    /// automatic STOP counts from this attempt too.
    async fn send_attempt(&mut self) -> Result<()> {
        let (generation, dispatch, attempt, snapshot) = match &self.in_flight {
            Some(in_flight) => (
                in_flight.generation,
                in_flight.dispatch,
                in_flight.attempt,
                in_flight.snapshot,
            ),
            None => return Ok(()),
        };

        let now = Instant::now();
        match dispatch.kind.direction() {
            Some(direction) => self.estimator.start_from(direction, snapshot, now),
            None => {
                self.estimator.stop(now);
            }
        }

        let kind = if self.config.invert_direction {
            dispatch.kind.inverted()
        } else {
            dispatch.kind
        };
        let packet = command_packet(
            self.sender.id(),
            self.config.device_id,
            kind,
            dispatch.run_time,
        );
        self.queue
            .push(OutboundQueueEntry {
                packet,
                min_delay: MIN_TELEGRAM_SPACING,
                label: format!(
                    "{} to {} (attempt {}/{})",
                    dispatch.kind,
                    self.config.name,
                    attempt + 1,
                    MAX_ATTEMPTS
                ),
            })
            .await?;

        self.auto_stop = dispatch.auto_stop.map(|delay| {
            timer::schedule(self.timers.clone(), delay, Event::AutoStop { generation });
            generation
        });
        let wait = RETRY_BACKOFF.get(attempt).copied().unwrap_or(ACK_TIMEOUT);
        timer::schedule(self.timers.clone(), wait, Event::AckTimeout { generation });

        self.publish().await
    }

    async fn ack_timeout(&mut self, generation: Generation) -> Result<()> {
        if !self.generations.is_current(generation) {
            return Ok(());
        }
        let in_flight = match self.in_flight.take() {
            Some(in_flight) => in_flight,
            None => return Ok(()),
        };
        let attempt = in_flight.attempt;
        let now = Instant::now();

        if let Some(pending) = self.pending.take() {
            warn!(
                "{}: {} was not acknowledged, reverting to {:.0} and sending {} instead",
                self.config.name, in_flight.dispatch.kind, in_flight.snapshot, pending
            );
            self.estimator.revert(in_flight.snapshot, now);
            self.auto_stop = None;
            return self.start(pending).await;
        }

        if attempt + 1 < MAX_ATTEMPTS {
            warn!(
                "{}: no acknowledgement for {}, retrying ({}/{})",
                self.config.name,
                in_flight.dispatch.kind,
                attempt + 2,
                MAX_ATTEMPTS
            );
            self.in_flight = Some(InFlight {
                generation: self.generations.advance(),
                attempt: attempt + 1,
                ..in_flight
            });
            return self.send_attempt().await;
        }

        warn!(
            "{}: {} not acknowledged after {} attempts, reverting position to {:.0}",
            self.config.name, in_flight.dispatch.kind, MAX_ATTEMPTS, in_flight.snapshot
        );
        self.estimator.revert(in_flight.snapshot, now);
        self.auto_stop = None;
        self.publish().await
    }

    async fn auto_stop(&mut self, generation: Generation) -> Result<()> {
        if self.auto_stop != Some(generation) {
            return Ok(());
        }
        self.auto_stop = None;

        debug!("{}: target reached, stopping", self.config.name);
        self.submit(Command::Stop).await
    }

    async fn status(&mut self, status: StatusIndication) -> Result<()> {
        let status = if self.config.invert_direction {
            status.inverted()
        } else {
            status
        };
        let now = Instant::now();

        let acknowledged = match &self.in_flight {
            Some(in_flight) if in_flight.acknowledged_by(status) => {
                debug!(
                    "{}: {} acknowledged by {:?}",
                    self.config.name, in_flight.dispatch.kind, status
                );
                true
            }
            _ => false,
        };
        if acknowledged {
            self.in_flight = None;
        }

        match status {
            StatusIndication::Started(direction) => {
                if self.estimator.direction() != Some(direction) {
                    info!("{}: started moving {}", self.config.name, direction);
                    self.estimator.start(direction, now);
                }
            }
            StatusIndication::EndPosition(direction) => {
                if self.estimator.accepts_end_position(direction) {
                    info!("{}: end position {}", self.config.name, direction);
                    self.estimator.arrive(direction, now);
                    self.auto_stop = None;
                } else {
                    debug!(
                        "{}: ignoring stale end position {} while moving the other way",
                        self.config.name, direction
                    );
                }
            }
            StatusIndication::Stopped {
                run_time,
                direction,
            } => {
                let position = self.estimator.confirm_stop(run_time, direction, now);
                self.auto_stop = None;
                info!("{}: stopped at {:.0}", self.config.name, position);
            }
        }

        if acknowledged {
            if let Some(pending) = self.pending.take() {
                return self.start(pending).await;
            }
        }
        self.publish().await
    }

    async fn tick(&mut self) -> Result<()> {
        let now = Instant::now();
        if self.estimator.tick(now) {
            info!(
                "{}: full travel time elapsed, assuming {}",
                self.config.name,
                self.estimator.state(now)
            );
        }
        self.publish().await
    }

    async fn teach_in(&mut self) -> Result<()> {
        info!(
            "{}: sending teach-in from {}. Put the actuator in learn mode first",
            self.config.name, self.sender
        );
        self.queue
            .push(OutboundQueueEntry {
                packet: teach_in_packet(self.sender.id(), self.config.device_id),
                min_delay: MIN_TELEGRAM_SPACING,
                label: format!("teach-in to {}", self.config.name),
            })
            .await
    }

    async fn set_available(&mut self, available: bool) -> Result<()> {
        if self.available != available {
            self.available = available;
            info!(
                "{}: {}",
                self.config.name,
                if available { "online" } else { "offline" }
            );
        }
        self.send_update(Update::Availability(available))
    }

    /// Publishes state and position if they changed, and records the position when it moved.
    async fn publish(&mut self) -> Result<()> {
        let now = Instant::now();
        let state = self.estimator.state(now);
        let position = self.estimator.published_position(now);

        if self.published_state != Some(state) {
            self.published_state = Some(state);
            self.send_update(Update::State(state))?;
        }

        let moved = self.published_position != Some(position);
        if moved {
            self.published_position = Some(position);
            self.send_update(Update::Position(position))?;
        }

        let exact = self.estimator.position(now);
        if self.stored_position != Some(exact) && (moved || !self.estimator.is_moving()) {
            self.stored_position = Some(exact);
            self.store.record(self.config.device_id, exact).await?;
        }

        Ok(())
    }

    fn send_update(&self, update: Update) -> Result<()> {
        self.updates
            .send(ShutterUpdate {
                device_id: self.config.device_id,
                update,
            })
            .map_err(|_| ErrorKind::ChannelError)?;
        Ok(())
    }
}
