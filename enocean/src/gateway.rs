use std::convert::TryFrom;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};

use crate::esp3::{self, Packet};
use crate::radio::TelegramReader;
use crate::{
    decode_packet, CommonCommand, DecodeError, DeviceId, Error, ErrorKind, PacketType, Response,
    Result, ReturnCode, Telegram,
};

/// How long the transceiver may take to answer a packet with a RESPONSE.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
const ID_BASE_ATTEMPTS: usize = 10;
const ID_BASE_RETRY: Duration = Duration::from_millis(500);

/// A command from Gateway to the Tx task: a packet to write and where to send its RESPONSE.
struct SerialCommand {
    packet: Packet,
    sender: oneshot::Sender<Result<Response>>,
}

/// Handle to a USB EnOcean transceiver speaking ESP3.
#[derive(Clone)]
pub struct Gateway {
    commands: mpsc::Sender<SerialCommand>,
    connected: watch::Receiver<bool>,
}

impl Gateway {
    pub fn new<R, W>(reader: R, writer: W) -> (Self, TelegramReader)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader = esp3::Reader::new(reader);
        let writer = esp3::Writer::new(writer);

        let (commands_tx, commands_rx) = mpsc::channel(1);
        let (connected_tx, connected_rx) = watch::channel(true);
        let (telegrams_tx, telegrams_rx) = mpsc::channel(32);

        let gateway = Self {
            commands: commands_tx,
            connected: connected_rx,
        };
        let telegram_reader = TelegramReader { rx: telegrams_rx };

        let shared = Arc::new(Shared::default());
        let rx = Rx {
            shared: shared.clone(),
            reader,
            telegrams: telegrams_tx,
            connected: connected_tx,
        };
        let tx = Tx {
            shared,
            writer,
            commands: commands_rx,
        };

        tokio::spawn(rx.task());
        tokio::spawn(tx.task());

        (gateway, telegram_reader)
    }

    pub async fn make_request(&self, packet: Packet) -> Result<Response> {
        let (sender, receiver) = oneshot::channel();

        self.commands
            .send(SerialCommand { packet, sender })
            .await
            .map_err(|_| ErrorKind::Offline)?;

        receiver.await.map_err(|_| ErrorKind::ChannelError)?
    }

    /// Writes a packet and waits for the transceiver to accept it.
    ///
    /// Acceptance only means the transceiver took the packet; nothing is known about whether
    /// anything on the air heard it.
    pub async fn transmit(&self, packet: Packet) -> Result<()> {
        if !self.is_connected() {
            return Err(ErrorKind::Offline.into());
        }

        let response = self.make_request(packet).await?;
        match response.code {
            ReturnCode::Ok => Ok(()),
            code => Err(ErrorKind::Rejected(code).into()),
        }
    }

    pub async fn read_id_base(&self) -> Result<DeviceId> {
        let response = self
            .make_request(CommonCommand::ReadIdBase.into_packet())
            .await?;
        match response.code {
            ReturnCode::Ok => Ok(response.id_base()?),
            code => Err(ErrorKind::Rejected(code).into()),
        }
    }

    /// Reads the base ID, retrying while the transceiver finishes starting up.
    pub async fn id_base(&self) -> Result<DeviceId> {
        let mut attempt = 1;
        loop {
            match self.read_id_base().await {
                Ok(id_base) => return Ok(id_base),
                Err(error) if attempt < ID_BASE_ATTEMPTS => {
                    debug!("read_id_base attempt {}: {}", attempt, error);
                }
                Err(error) => return Err(error),
            }
            attempt += 1;
            tokio::time::sleep(ID_BASE_RETRY).await;
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Flips to `false`, permanently, when the serial connection is lost.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }
}

/// Shared state between the Rx and Tx tasks. ESP3 has no sequence numbers, so the Tx task keeps
/// at most one packet outstanding and the next RESPONSE belongs to it.
#[derive(Default)]
struct Shared {
    awaiting: Mutex<Option<oneshot::Sender<Result<Response>>>>,
}

impl Shared {
    fn take_awaiting(&self) -> Option<oneshot::Sender<Result<Response>>> {
        self.awaiting.lock().expect("poisoned").take()
    }
}

/// Task responsible for reading frames from the transceiver.
///
/// Routes RESPONSE packets to the Tx task's outstanding request and forwards radio telegrams to
/// the TelegramReader. Framing errors are logged and skipped; a failed read ends the task and
/// marks the gateway disconnected.
struct Rx<R>
where
    R: AsyncRead + Unpin,
{
    shared: Arc<Shared>,
    reader: esp3::Reader<R>,
    telegrams: mpsc::Sender<Telegram>,
    connected: watch::Sender<bool>,
}

impl<R> Rx<R>
where
    R: AsyncRead + Unpin,
{
    async fn task(mut self) -> Result<()> {
        loop {
            let frame = match self.reader.read_frame().await {
                Ok(Ok(frame)) => frame,
                Ok(Err(error)) => {
                    warn!("rx read_frame: discarding bytes: {}", error);
                    continue;
                }
                Err(error) => {
                    error!("rx read_frame: {}", error);
                    self.disconnect();
                    return Err(error);
                }
            };

            match self.process_frame(&frame) {
                Ok(()) => {}
                Err(Error {
                    kind: ErrorKind::Decode(error @ DecodeError::UnknownTelegramType(_)),
                }) => debug!("rx process_frame: {}", error),
                Err(error) => warn!("rx process_frame: {}", error),
            }
        }
    }

    fn process_frame(&mut self, frame: &[u8]) -> Result<()> {
        debug!("received = {:02x?}", frame);
        let packet = Packet::from_frame(frame)?;

        match PacketType::try_from(packet.packet_type)? {
            PacketType::Response => self.route_response(Response::from_packet(&packet)?),
            PacketType::RadioErp1 => self.forward_telegram(decode_packet(&packet)?),
            other => {
                debug!("rx: ignoring {:?} packet", other);
                Ok(())
            }
        }
    }

    fn route_response(&mut self, response: Response) -> Result<()> {
        match self.shared.take_awaiting() {
            Some(sender) => sender.send(Ok(response)).map_err(|_| ErrorKind::ChannelError)?,
            None => return Err(ErrorKind::UnexpectedResponse.into()),
        }

        Ok(())
    }

    fn forward_telegram(&mut self, telegram: Telegram) -> Result<()> {
        // Never block on a slow consumer: RESPONSE routing shares this task.
        match self.telegrams.try_send(telegram) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(telegram)) => {
                warn!("rx: dropping telegram, reader is behind: {:?}", telegram);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ErrorKind::ChannelError.into()),
        }
    }

    fn disconnect(&mut self) {
        let _ = self.connected.send(false);
        if let Some(sender) = self.shared.take_awaiting() {
            let _ = sender.send(Err(ErrorKind::Offline.into()));
        }
    }
}

/// Task responsible for writing packets to the transceiver, one at a time.
struct Tx<W>
where
    W: AsyncWrite + Unpin,
{
    shared: Arc<Shared>,
    writer: esp3::Writer<W>,
    commands: mpsc::Receiver<SerialCommand>,
}

impl<W> Tx<W>
where
    W: AsyncWrite + Unpin,
{
    async fn task(mut self) -> Result<()> {
        while let Some(SerialCommand { packet, sender }) = self.commands.recv().await {
            let result = self.request(packet).await;
            if let Err(result) = sender.send(result) {
                debug!("tx: requester went away before {:?}", result);
            }
        }

        Ok(())
    }

    async fn request(&mut self, packet: Packet) -> Result<Response> {
        let (sender, receiver) = oneshot::channel();
        self.register_awaiting(sender);

        debug!("sending = {:02x?}", packet);
        if let Err(error) = self.writer.write_packet(&packet).await {
            self.shared.take_awaiting();
            return Err(error);
        }

        match tokio::time::timeout(RESPONSE_TIMEOUT, receiver).await {
            Ok(result) => result.map_err(|_| ErrorKind::ChannelError)?,
            Err(_) => {
                self.shared.take_awaiting();
                Err(ErrorKind::ResponseTimeout.into())
            }
        }
    }

    fn register_awaiting(&self, sender: oneshot::Sender<Result<Response>>) {
        *self.shared.awaiting.lock().expect("poisoned") = Some(sender);
    }
}
