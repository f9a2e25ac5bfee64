//! Last known shutter positions, kept in a small JSON file so a restart resumes near where the
//! shutters really are.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use enocean::DeviceId;
use tokio::sync::{mpsc, oneshot};

use crate::config::ShutterConfig;
use crate::{ErrorKind, Result};

/// Reads the position file. A missing file means no positions are known yet.
pub async fn load<P>(path: P) -> Result<HashMap<DeviceId, f64>>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            info!("no position file at {}, starting fresh", path.display());
            return Ok(HashMap::new());
        }
        Err(error) => return Err(error.into()),
    };

    let stored: BTreeMap<String, f64> = serde_json::from_slice(&contents)?;
    let mut positions = HashMap::with_capacity(stored.len());
    for (id, position) in stored {
        match id.parse::<DeviceId>() {
            Ok(id) if position.is_finite() => {
                positions.insert(id, position.clamp(0.0, 100.0));
            }
            _ => warn!("ignoring stored position {:?} = {}", id, position),
        }
    }
    Ok(positions)
}

/// The stored position for a shutter, or closed if there is none.
pub fn initial_position(positions: &HashMap<DeviceId, f64>, shutter: &ShutterConfig) -> f64 {
    match positions.get(&shutter.device_id) {
        Some(position) => *position,
        None => {
            info!(
                "{}: no stored position, assuming 0 (closed). This is a default, not a measurement",
                shutter.name
            );
            0.0
        }
    }
}

enum StoreCommand {
    Record(DeviceId, f64),
    Flush(oneshot::Sender<Result<()>>),
}

/// Handle to the task that owns the position file.
#[derive(Clone)]
pub struct PositionStore {
    commands: mpsc::Sender<StoreCommand>,
}

impl PositionStore {
    pub fn new(path: PathBuf, positions: HashMap<DeviceId, f64>) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(32);

        let writer = Writer {
            path,
            positions: positions.into_iter().collect(),
            commands: commands_rx,
        };
        tokio::spawn(writer.task());

        Self {
            commands: commands_tx,
        }
    }

    pub async fn record(&self, id: DeviceId, position: f64) -> Result<()> {
        self.commands
            .send(StoreCommand::Record(id, position))
            .await
            .map_err(|_| ErrorKind::ChannelError)?;
        Ok(())
    }

    /// Waits until everything recorded so far is on disk.
    pub async fn flush(&self) -> Result<()> {
        let (sender, receiver) = oneshot::channel();
        self.commands
            .send(StoreCommand::Flush(sender))
            .await
            .map_err(|_| ErrorKind::ChannelError)?;
        receiver.await?
    }
}

fn reply(result: Result<()>, flush: Option<oneshot::Sender<Result<()>>>) {
    match flush {
        Some(sender) => {
            let _ = sender.send(result);
        }
        None => {
            if let Err(error) = result {
                warn!("could not save positions: {}", error);
            }
        }
    }
}

struct Writer {
    path: PathBuf,
    positions: BTreeMap<DeviceId, f64>,
    commands: mpsc::Receiver<StoreCommand>,
}

impl Writer {
    async fn task(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                StoreCommand::Record(id, position) => {
                    let mut changed = self.record(id, position);
                    // Coalesce a burst of updates into one write.
                    let mut flush = None;
                    while let Ok(command) = self.commands.try_recv() {
                        match command {
                            StoreCommand::Record(id, position) => {
                                changed |= self.record(id, position);
                            }
                            StoreCommand::Flush(sender) => {
                                flush = Some(sender);
                                break;
                            }
                        }
                    }

                    if changed || flush.is_some() {
                        let result = self.write().await;
                        reply(result, flush);
                    }
                }
                StoreCommand::Flush(sender) => {
                    let result = self.write().await;
                    reply(result, Some(sender));
                }
            }
        }
    }

    fn record(&mut self, id: DeviceId, position: f64) -> bool {
        self.positions.insert(id, position) != Some(position)
    }

    /// Writes to a temporary file and renames it over the old one, so a crash never leaves a
    /// half-written file behind.
    async fn write(&self) -> Result<()> {
        let stored = self
            .positions
            .iter()
            .map(|(id, position)| (id.to_string(), *position))
            .collect::<BTreeMap<_, _>>();
        let json = serde_json::to_vec_pretty(&stored)?;

        let mut temporary = self.path.clone().into_os_string();
        temporary.push(".tmp");
        let temporary = PathBuf::from(temporary);

        tokio::fs::write(&temporary, json).await?;
        tokio::fs::rename(&temporary, &self.path).await?;
        debug!("saved {} positions to {}", stored.len(), self.path.display());
        Ok(())
    }
}
