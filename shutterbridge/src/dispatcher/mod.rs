//! Turns shutter commands into telegrams. One outbound queue feeds the gateway; each shutter has
//! its own task tracking acknowledgement, retries and the automatic STOP for position targets.

pub mod queue;
pub mod shutter;

use std::collections::HashMap;

use enocean::{DeviceId, StatusIndication};
use tokio::sync::mpsc;

use crate::config::ShutterConfig;
use crate::sender::SenderAddress;
use crate::store::PositionStore;
use crate::{ErrorKind, Result};

pub use self::queue::{OutboundQueue, Transmit};
pub use self::shutter::{Command, ShutterHandle, ShutterSnapshot, ShutterUpdate, Update};

pub struct Dispatcher {
    queue: OutboundQueue,
    updates: mpsc::UnboundedSender<ShutterUpdate>,
    store: PositionStore,
    shutters: HashMap<DeviceId, ShutterHandle>,
}

impl Dispatcher {
    pub fn new<T>(
        transmitter: T,
        updates: mpsc::UnboundedSender<ShutterUpdate>,
        store: PositionStore,
    ) -> Self
    where
        T: Transmit,
    {
        Self {
            queue: OutboundQueue::new(transmitter),
            updates,
            store,
            shutters: HashMap::new(),
        }
    }

    /// Starts the task for one shutter, at its last known position.
    pub fn add(&mut self, config: ShutterConfig, sender: SenderAddress, position: f64) {
        let device_id = config.device_id;
        let handle = shutter::spawn(
            config,
            sender,
            position,
            self.queue.clone(),
            self.updates.clone(),
            self.store.clone(),
        );
        self.shutters.insert(device_id, handle);
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.shutters.contains_key(&id)
    }

    fn shutter(&self, id: DeviceId) -> Result<&ShutterHandle> {
        self.shutters
            .get(&id)
            .ok_or_else(|| ErrorKind::UnknownShutter(id).into())
    }

    pub async fn submit(&self, id: DeviceId, command: Command) -> Result<()> {
        self.shutter(id)?.submit(command).await
    }

    pub async fn set_position(&self, id: DeviceId, target: f64) -> Result<()> {
        self.submit(id, Command::SetPosition(target.clamp(0.0, 100.0)))
            .await
    }

    pub async fn status(&self, id: DeviceId, status: StatusIndication) -> Result<()> {
        self.shutter(id)?.status(status).await
    }

    pub async fn snapshot(&self, id: DeviceId) -> Result<ShutterSnapshot> {
        self.shutter(id)?.snapshot().await
    }

    pub async fn set_available(&self, available: bool) -> Result<()> {
        for shutter in self.shutters.values() {
            shutter.set_available(available).await?;
        }
        Ok(())
    }

    /// Records every shutter's current estimate and waits for it to reach the disk.
    pub async fn save_positions(&self) -> Result<()> {
        for (id, shutter) in &self.shutters {
            let snapshot = shutter.snapshot().await?;
            self.store.record(*id, snapshot.position).await?;
        }
        self.store.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::queue::tests::Recorder;
    use super::shutter::{ACK_TIMEOUT, MAX_ATTEMPTS};
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use enocean::{CommandKind, Direction, TelegramKind};
    use tokio::time::Instant;

    use crate::estimator::CoverState;

    const LIVING_ROOM: DeviceId = DeviceId(0x0512_3456);
    const BASE: DeviceId = DeviceId(0xFF80_0000);

    fn living_room(invert_direction: bool) -> ShutterConfig {
        ShutterConfig {
            device_id: LIVING_ROOM,
            name: "Living Room".to_string(),
            full_close_time: Duration::from_secs(25),
            full_open_time: Duration::from_secs(20),
            sender_offset: None,
            invert_direction,
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        recorder: Recorder,
        updates: Arc<Mutex<Vec<ShutterUpdate>>>,
        start: Instant,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(position: f64, invert_direction: bool) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = PositionStore::new(dir.path().join("positions.json"), HashMap::new());
            let recorder = Recorder::default();

            let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
            let updates = Arc::new(Mutex::new(Vec::new()));
            let collected = updates.clone();
            tokio::spawn(async move {
                while let Some(update) = updates_rx.recv().await {
                    collected.lock().unwrap().push(update);
                }
            });

            let mut dispatcher = Dispatcher::new(recorder.clone(), updates_tx, store);
            dispatcher.add(
                living_room(invert_direction),
                SenderAddress::new(BASE, 0x56),
                position,
            );

            Self {
                dispatcher,
                recorder,
                updates,
                start: Instant::now(),
                dir,
            }
        }

        /// Sleeps until `at` after the start of the test.
        async fn at(&self, at: Duration) {
            tokio::time::sleep_until(self.start + at).await;
        }

        /// Every telegram sent so far, with its time since the start of the test.
        fn sent(&self) -> Vec<(Duration, TelegramKind)> {
            self.recorder
                .packets()
                .into_iter()
                .map(|(at, packet)| {
                    let telegram = enocean::decode_packet(&packet).unwrap();
                    assert_eq!(telegram.sender, DeviceId(0xFF80_0056));
                    assert_eq!(telegram.destination, LIVING_ROOM);
                    (at - self.start, telegram.kind)
                })
                .collect()
        }

        fn sent_kinds(&self) -> Vec<(Duration, CommandKind)> {
            self.sent()
                .into_iter()
                .filter_map(|(at, kind)| match kind {
                    TelegramKind::Command { kind, .. } => Some((at, kind)),
                    _ => None,
                })
                .collect()
        }

        async fn snapshot(&self) -> ShutterSnapshot {
            self.dispatcher.snapshot(LIVING_ROOM).await.unwrap()
        }

        async fn report(&self, status: StatusIndication) {
            self.dispatcher.status(LIVING_ROOM, status).await.unwrap();
        }
    }

    fn secs(secs: f64) -> Duration {
        Duration::from_secs_f64(secs)
    }

    #[tokio::test(start_paused = true)]
    async fn set_position_opens_then_stops_after_travel_time() {
        let harness = Harness::new(20.0, false);
        harness
            .dispatcher
            .set_position(LIVING_ROOM, 60.0)
            .await
            .unwrap();
        harness.at(secs(0.5)).await;
        harness.report(StatusIndication::Started(Direction::Open)).await;

        harness.at(secs(7.9)).await;
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            (
                Duration::ZERO,
                TelegramKind::Command {
                    kind: CommandKind::Open,
                    run_time: Duration::from_secs(8),
                }
            )
        );
        assert_eq!(harness.snapshot().await.state, CoverState::Opening);

        harness.at(secs(8.5)).await;
        assert_eq!(
            harness.sent_kinds(),
            vec![
                (Duration::ZERO, CommandKind::Open),
                (Duration::from_secs(8), CommandKind::Stop),
            ]
        );
        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.state, CoverState::Open);
        assert!((snapshot.position - 60.0).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_command_retries_then_reverts() {
        let harness = Harness::new(35.0, false);
        harness
            .dispatcher
            .submit(LIVING_ROOM, Command::Open)
            .await
            .unwrap();

        harness.at(secs(19.9)).await;
        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.state, CoverState::Opening);
        assert!(snapshot.position > 35.0);
        assert!(snapshot.awaiting_ack);

        harness.at(secs(20.1)).await;
        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.position, 35.0);
        assert_eq!(snapshot.state, CoverState::Open);
        assert_eq!(snapshot.changed_at, harness.start + secs(20.0));
        assert!(!snapshot.awaiting_ack);

        harness.at(secs(60.0)).await;
        assert_eq!(
            harness.sent_kinds(),
            vec![
                (Duration::ZERO, CommandKind::Open),
                (Duration::from_secs(5), CommandKind::Open),
                (Duration::from_secs(15), CommandKind::Open),
            ]
        );
        assert_eq!(harness.sent_kinds().len(), MAX_ATTEMPTS);
        assert_eq!(harness.snapshot().await.position, 35.0);

        let updates = harness.updates.lock().unwrap().clone();
        let last_position = updates.iter().rev().find_map(|update| match update.update {
            Update::Position(position) => Some(position),
            _ => None,
        });
        assert_eq!(last_position, Some(35));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_stop_counts_from_the_acknowledged_retry() {
        let harness = Harness::new(20.0, false);
        harness
            .dispatcher
            .set_position(LIVING_ROOM, 60.0)
            .await
            .unwrap();
        harness.at(secs(5.3)).await;
        harness.report(StatusIndication::Started(Direction::Open)).await;

        harness.at(secs(12.9)).await;
        assert_eq!(
            harness.sent_kinds(),
            vec![
                (Duration::ZERO, CommandKind::Open),
                (Duration::from_secs(5), CommandKind::Open),
            ]
        );

        harness.at(secs(13.2)).await;
        harness
            .report(StatusIndication::Stopped {
                run_time: None,
                direction: None,
            })
            .await;

        harness.at(secs(40.0)).await;
        assert_eq!(
            harness.sent_kinds(),
            vec![
                (Duration::ZERO, CommandKind::Open),
                (Duration::from_secs(5), CommandKind::Open),
                (Duration::from_secs(13), CommandKind::Stop),
            ]
        );
        let snapshot = harness.snapshot().await;
        assert!((snapshot.position - 60.0).abs() < 0.01);
        assert_eq!(snapshot.state, CoverState::Open);
        assert!(!snapshot.awaiting_ack);
    }

    #[tokio::test(start_paused = true)]
    async fn undrained_updates_never_hold_up_commands() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path().join("positions.json"), HashMap::new());
        let recorder = Recorder::default();
        let (updates_tx, _updates_rx) = mpsc::unbounded_channel();

        let mut dispatcher = Dispatcher::new(recorder.clone(), updates_tx, store);
        dispatcher.add(living_room(false), SenderAddress::new(BASE, 0x56), 80.0);
        let start = Instant::now();

        dispatcher.submit(LIVING_ROOM, Command::Close).await.unwrap();
        tokio::time::sleep(secs(30.0)).await;

        let sent = recorder
            .packets()
            .into_iter()
            .map(|(at, _)| at - start)
            .collect::<Vec<_>>();
        assert_eq!(sent, vec![Duration::ZERO, secs(5.0), secs(15.0)]);
        let snapshot = dispatcher.snapshot(LIVING_ROOM).await.unwrap();
        assert_eq!(snapshot.position, 80.0);
        assert!(!snapshot.awaiting_ack);
    }

    #[tokio::test(start_paused = true)]
    async fn transmit_failures_count_as_unacknowledged() {
        let harness = Harness::new(80.0, false);
        harness.recorder.set_offline(true);
        harness
            .dispatcher
            .submit(LIVING_ROOM, Command::Close)
            .await
            .unwrap();

        harness.at(secs(21.0)).await;
        assert_eq!(harness.sent_kinds().len(), 3);
        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.position, 80.0);
        assert_eq!(snapshot.state, CoverState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledgement_cancels_retries() {
        let harness = Harness::new(100.0, false);
        harness
            .dispatcher
            .submit(LIVING_ROOM, Command::Close)
            .await
            .unwrap();
        harness.at(secs(1.0)).await;
        harness.report(StatusIndication::Started(Direction::Close)).await;

        harness.at(secs(10.0)).await;
        harness
            .report(StatusIndication::Stopped {
                run_time: None,
                direction: None,
            })
            .await;
        let snapshot = harness.snapshot().await;
        assert!((snapshot.position - 60.0).abs() < 0.01);
        assert_eq!(snapshot.state, CoverState::Open);

        harness.at(secs(60.0)).await;
        assert_eq!(
            harness.sent_kinds(),
            vec![(Duration::ZERO, CommandKind::Close)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn latest_submission_replaces_retry() {
        let harness = Harness::new(50.0, false);
        let dispatcher = &harness.dispatcher;
        dispatcher.submit(LIVING_ROOM, Command::Open).await.unwrap();
        dispatcher.submit(LIVING_ROOM, Command::Close).await.unwrap();
        dispatcher.submit(LIVING_ROOM, Command::Stop).await.unwrap();

        harness.at(ACK_TIMEOUT + secs(0.1)).await;
        harness
            .report(StatusIndication::Stopped {
                run_time: None,
                direction: None,
            })
            .await;

        harness.at(secs(30.0)).await;
        assert_eq!(
            harness.sent_kinds(),
            vec![
                (Duration::ZERO, CommandKind::Open),
                (Duration::from_secs(5), CommandKind::Stop),
            ]
        );
        assert_eq!(harness.snapshot().await.position, 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_command_starts_after_acknowledgement() {
        let harness = Harness::new(0.0, false);
        let dispatcher = &harness.dispatcher;
        dispatcher.submit(LIVING_ROOM, Command::Open).await.unwrap();
        dispatcher.submit(LIVING_ROOM, Command::Stop).await.unwrap();

        harness.at(secs(2.0)).await;
        harness.report(StatusIndication::Started(Direction::Open)).await;
        harness.at(secs(3.0)).await;

        let sent = harness.sent_kinds();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], (Duration::ZERO, CommandKind::Open));
        assert_eq!(sent[1], (Duration::from_secs(2), CommandKind::Stop));
        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.state, CoverState::Open);
        assert!((snapshot.position - 10.0).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_report_cancels_auto_stop() {
        let harness = Harness::new(20.0, false);
        harness
            .dispatcher
            .set_position(LIVING_ROOM, 60.0)
            .await
            .unwrap();
        harness.at(secs(0.2)).await;
        harness.report(StatusIndication::Started(Direction::Open)).await;

        harness.at(secs(4.0)).await;
        harness
            .report(StatusIndication::Stopped {
                run_time: Some(Duration::from_secs(4)),
                direction: Some(Direction::Open),
            })
            .await;

        harness.at(secs(20.0)).await;
        assert_eq!(
            harness.sent_kinds(),
            vec![(Duration::ZERO, CommandKind::Open)]
        );
        assert_eq!(harness.snapshot().await.position, 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_command_supersedes_auto_stop() {
        let harness = Harness::new(20.0, false);
        let dispatcher = &harness.dispatcher;
        dispatcher.set_position(LIVING_ROOM, 60.0).await.unwrap();
        harness.at(secs(0.2)).await;
        harness.report(StatusIndication::Started(Direction::Open)).await;

        // At 30 after 2 s, 50 more takes 10 s.
        harness.at(secs(2.0)).await;
        dispatcher.set_position(LIVING_ROOM, 80.0).await.unwrap();
        harness.at(secs(2.2)).await;
        harness.report(StatusIndication::Started(Direction::Open)).await;

        harness.at(secs(15.0)).await;
        assert_eq!(
            harness.sent_kinds(),
            vec![
                (Duration::ZERO, CommandKind::Open),
                (Duration::from_secs(2), CommandKind::Open),
                (Duration::from_secs(12), CommandKind::Stop),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn set_position_to_end_stops_runs_full_travel() {
        let harness = Harness::new(50.0, false);
        harness
            .dispatcher
            .set_position(LIVING_ROOM, 0.0)
            .await
            .unwrap();
        harness.at(secs(0.2)).await;
        harness.report(StatusIndication::Started(Direction::Close)).await;

        harness.at(secs(40.0)).await;
        let sent = harness.sent();
        assert_eq!(
            sent,
            vec![(
                Duration::ZERO,
                TelegramKind::Command {
                    kind: CommandKind::Close,
                    run_time: Duration::from_secs(25),
                }
            )]
        );
        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.position, 0.0);
        assert_eq!(snapshot.state, CoverState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn set_position_near_current_is_ignored() {
        let harness = Harness::new(50.0, false);
        harness
            .dispatcher
            .set_position(LIVING_ROOM, 50.5)
            .await
            .unwrap();
        harness.at(secs(10.0)).await;
        assert!(harness.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn inverted_shutter_swaps_directions() {
        let harness = Harness::new(0.0, true);
        harness
            .dispatcher
            .submit(LIVING_ROOM, Command::Open)
            .await
            .unwrap();
        harness.at(secs(0.5)).await;
        harness.report(StatusIndication::Started(Direction::Close)).await;
        harness.at(secs(1.0)).await;
        assert_eq!(harness.snapshot().await.state, CoverState::Opening);

        harness.report(StatusIndication::EndPosition(Direction::Close)).await;
        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.position, 100.0);
        assert_eq!(snapshot.state, CoverState::Open);

        harness.at(secs(30.0)).await;
        assert_eq!(
            harness.sent_kinds(),
            vec![(Duration::ZERO, CommandKind::Close)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn end_position_against_motion_is_ignored() {
        let harness = Harness::new(50.0, false);
        harness
            .dispatcher
            .submit(LIVING_ROOM, Command::Open)
            .await
            .unwrap();
        harness.at(secs(0.2)).await;
        harness.report(StatusIndication::Started(Direction::Open)).await;

        harness.at(secs(2.0)).await;
        harness
            .report(StatusIndication::EndPosition(Direction::Close))
            .await;
        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.state, CoverState::Opening);
        assert!((snapshot.position - 60.0).abs() < 0.01);

        harness
            .report(StatusIndication::EndPosition(Direction::Open))
            .await;
        assert_eq!(harness.snapshot().await.position, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn wall_switch_motion_is_tracked() {
        let harness = Harness::new(100.0, false);
        harness.report(StatusIndication::Started(Direction::Close)).await;
        harness.at(secs(30.0)).await;

        let snapshot = harness.snapshot().await;
        assert_eq!(snapshot.position, 0.0);
        assert_eq!(snapshot.state, CoverState::Closed);
        assert!(harness.sent().is_empty());

        let updates = harness.updates.lock().unwrap().clone();
        let states = updates
            .iter()
            .filter_map(|update| match update.update {
                Update::State(state) => Some(state),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(
            states,
            vec![CoverState::Open, CoverState::Closing, CoverState::Closed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn teach_in_is_sent_once_without_disturbing_commands() {
        let harness = Harness::new(0.0, false);
        let dispatcher = &harness.dispatcher;
        dispatcher.submit(LIVING_ROOM, Command::Open).await.unwrap();
        dispatcher.submit(LIVING_ROOM, Command::TeachIn).await.unwrap();

        harness.at(secs(1.0)).await;
        harness.report(StatusIndication::Started(Direction::Open)).await;
        harness.at(secs(30.0)).await;

        let sent = harness.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].1, TelegramKind::TeachIn);
        assert!(sent[1].0 >= queue::MIN_TELEGRAM_SPACING);
    }

    #[tokio::test(start_paused = true)]
    async fn availability_is_published_for_every_shutter() {
        let harness = Harness::new(0.0, false);
        harness.dispatcher.set_available(true).await.unwrap();
        harness.dispatcher.set_available(false).await.unwrap();
        harness.at(secs(1.0)).await;

        let updates = harness.updates.lock().unwrap().clone();
        let availability = updates
            .iter()
            .filter_map(|update| match update.update {
                Update::Availability(available) => Some(available),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(availability, vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_shutters_are_errors() {
        let harness = Harness::new(0.0, false);
        let result = harness
            .dispatcher
            .submit(DeviceId(0x0102_0304), Command::Open)
            .await;
        assert!(matches!(
            result,
            Err(crate::Error {
                kind: ErrorKind::UnknownShutter(_)
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn save_positions_writes_the_estimate() {
        let harness = Harness::new(0.0, false);
        harness.report(StatusIndication::Started(Direction::Open)).await;
        harness.at(secs(5.0)).await;
        harness.dispatcher.save_positions().await.unwrap();

        let positions = crate::store::load(harness.dir.path().join("positions.json"))
            .await
            .unwrap();
        let saved = positions[&LIVING_ROOM];
        assert!((saved - 25.0).abs() < 0.01);
    }
}
