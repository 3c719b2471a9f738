use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::control_interface::bulb_info::{
    BulbState, DeviceRecord, PowerStatus, Property, SharedRecord,
};
use crate::control_interface::command::{methods, Command};
use crate::control_interface::reply::{CorrelatedReply, ReplyStrategy};
use crate::control_interface::streaming::StreamingStatus;
use crate::control_interface::transport::{PendingReplies, Transport};
use crate::error::{BulbError, Result};
use crate::util::traits::LightControl;

pub mod bulb_info;
pub mod command;
mod reply;
pub mod streaming;
mod transport;

/// Timing and port settings for a bulb session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulbConfig {
    /// How often the poller requests the full property list.
    pub poll_interval: Duration,
    /// How long a command waits for its result.
    pub command_timeout: Duration,
    pub connect_timeout: Duration,
    /// Local port the bulb dials back to in streaming mode. `0` lets the
    /// OS choose.
    pub streaming_port: u16,
}

impl Default for BulbConfig {
    fn default() -> Self {
        BulbConfig {
            poll_interval: Duration::from_secs(2),
            command_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(3),
            streaming_port: 0,
        }
    }
}

impl BulbConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_streaming_port(mut self, streaming_port: u16) -> Self {
        self.streaming_port = streaming_port;
        self
    }
}

/// The command path of one connection: capability and power checks, id
/// allocation, framing, and the connection's reply strategy.
///
/// Only obtainable from a [`Bulb`] or a
/// [`StreamingBulb`](streaming::StreamingBulb) through [`LightControl::channel`].
#[derive(Debug, Clone)]
pub struct CommandChannel {
    record: SharedRecord,
    transport: Arc<Transport>,
    reply: Arc<dyn ReplyStrategy>,
    last_id: Arc<AtomicU32>,
}

impl CommandChannel {
    pub(crate) fn new(
        record: SharedRecord,
        transport: Arc<Transport>,
        reply: Arc<dyn ReplyStrategy>,
    ) -> Self {
        CommandChannel {
            record,
            transport,
            reply,
            last_id: Arc::new(AtomicU32::new(0)),
        }
    }

    fn next_id(&self) -> u32 {
        next_id(&self.last_id)
    }

    /// Sends `method` with `params` and returns the bulb's result values.
    ///
    /// Fails without writing anything when the bulb does not advertise the
    /// method, when the method needs the light on and it is known to be off,
    /// or when `cancel` has already fired. A bare `["ok"]` result comes back
    /// as an empty list.
    pub async fn execute(
        &self,
        method: &str,
        params: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let (supported, power) = self
            .record
            .with(|record| (record.supports(method), record.state.power));
        if !supported {
            return Err(BulbError::UnsupportedMethod(method.to_string()));
        }
        if power != PowerStatus::On && !methods::allowed_while_off(method) {
            return Err(BulbError::DeviceOff(method.to_string()));
        }
        if cancel.is_cancelled() {
            return Err(BulbError::Cancelled);
        }

        let command = Command::new(self.next_id(), method, params);
        self.reply.deliver(&self.transport, &command, cancel).await
    }

    pub fn power(&self) -> PowerStatus {
        self.record.with(|record| record.state.power)
    }

    pub fn snapshot(&self) -> DeviceRecord {
        self.record.with(DeviceRecord::clone)
    }

    pub(crate) fn update_state(&self, f: impl FnOnce(&mut BulbState)) {
        self.record.update(|record| f(&mut record.state));
    }

    pub(crate) fn record(&self) -> &SharedRecord {
        &self.record
    }

    pub(crate) fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }
}

/// A connected control session with one bulb.
///
/// While connected, a poller refreshes the record every
/// [`BulbConfig::poll_interval`] and a line reader applies push
/// notifications and routes command results. Both write straight into the
/// same record, so the snapshot is eventually consistent: a poll reply that
/// was produced before a notification may still overwrite it.
#[derive(Debug)]
pub struct Bulb {
    channel: CommandChannel,
    config: BulbConfig,
    session: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    streaming: Mutex<StreamingStatus>,
}

impl Bulb {
    /// Connects to the bulb described by `record` and starts the poller and
    /// the line reader.
    ///
    /// Cancelling `cancel` later tears the whole session down.
    pub async fn connect(
        record: DeviceRecord,
        config: BulbConfig,
        cancel: &CancellationToken,
    ) -> Result<Bulb> {
        let address = record.address;
        info!("Connecting to bulb {} at {}", record.device_id, address);

        let stream = tokio::select! {
            connected = tokio::time::timeout(config.connect_timeout, TcpStream::connect(address)) => {
                match connected {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        return Err(BulbError::network(format!("connect to {}", address), e))
                    }
                    Err(_) => {
                        return Err(BulbError::Timeout(format!(
                            "connect to {} within {:?}",
                            address, config.connect_timeout
                        )))
                    }
                }
            }
            _ = cancel.cancelled() => return Err(BulbError::Cancelled),
        };

        Self::start(stream, record, config, cancel)
    }

    fn start(
        stream: TcpStream,
        record: DeviceRecord,
        config: BulbConfig,
        cancel: &CancellationToken,
    ) -> Result<Bulb> {
        let session = cancel.child_token();
        let (transport, reader) = Transport::from_stream(stream)?;
        let transport = Arc::new(transport);
        let pending = Arc::new(PendingReplies::default());
        let record = SharedRecord::new(record);

        let reply = Arc::new(CorrelatedReply::new(
            pending.clone(),
            config.command_timeout,
            session.clone(),
        ));
        let channel = CommandChannel::new(record.clone(), transport.clone(), reply);

        let reader_task = transport::spawn_reader(
            reader,
            transport.clone(),
            pending,
            record,
            session.clone(),
        );
        let poller_task = spawn_poller(channel.clone(), config.poll_interval, session.clone());

        info!(
            "Connected to bulb at {} from {}",
            transport.peer_addr(),
            transport.local_addr()
        );

        Ok(Bulb {
            channel,
            config,
            session,
            tasks: Mutex::new(vec![reader_task, poller_task]),
            streaming: Mutex::new(StreamingStatus::default()),
        })
    }

    /// Sends a raw command. See [`CommandChannel::execute`].
    pub async fn execute(
        &self,
        method: &str,
        params: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        self.channel.execute(method, params, cancel).await
    }

    /// Polls all properties once, right now, and applies the reply.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<DeviceRecord> {
        poll_once(&self.channel, cancel).await?;
        Ok(self.channel.snapshot())
    }

    /// Saves the current state as the bulb's power-on default.
    pub async fn set_default(&self, cancel: &CancellationToken) -> Result<()> {
        self.channel
            .execute(methods::SET_DEFAULT, Vec::new(), cancel)
            .await
            .map(|_| ())
    }

    pub fn config(&self) -> &BulbConfig {
        &self.config
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.channel.transport().peer_addr()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.channel.transport().local_addr()
    }

    /// False once the session was cancelled or the connection dropped.
    pub fn is_connected(&self) -> bool {
        !self.session.is_cancelled()
    }

    /// Stops the background tasks and closes the connection.
    pub async fn disconnect(&self) {
        self.session.cancel();
        self.channel.transport().shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Bulb background task ended abnormally: {}", e);
            }
        }
        info!("Disconnected from bulb at {}", self.peer_addr());
    }

    pub(crate) fn streaming_status(&self) -> std::sync::MutexGuard<'_, StreamingStatus> {
        self.streaming.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LightControl for Bulb {
    fn channel(&self) -> &CommandChannel {
        &self.channel
    }
}

impl Drop for Bulb {
    fn drop(&mut self) {
        self.session.cancel();
    }
}

/// Ids start at 1. After `u32::MAX` the sequence wraps around to 1, never 0.
fn next_id(last_id: &AtomicU32) -> u32 {
    loop {
        let id = last_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        if id != 0 {
            return id;
        }
    }
}

fn polled_params() -> Vec<Value> {
    Property::POLLED
        .iter()
        .map(|property| Value::from(property.key()))
        .collect()
}

async fn poll_once(channel: &CommandChannel, cancel: &CancellationToken) -> Result<()> {
    let values = channel
        .execute(methods::GET_PROP, polled_params(), cancel)
        .await?;
    channel
        .record()
        .update(|record| record.state.apply_polled(&values));
    Ok(())
}

/// Refreshes the record on a fixed interval. The first poll runs right away
/// so the snapshot is filled in shortly after connecting.
fn spawn_poller(
    channel: CommandChannel,
    interval: Duration,
    session: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = session.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match poll_once(&channel, &session).await {
                Ok(()) => {}
                Err(BulbError::UnsupportedMethod(_)) => {
                    warn!("Bulb does not support get_prop, polling disabled");
                    break;
                }
                Err(BulbError::Cancelled) => break,
                Err(e) if e.is_terminal() => break,
                Err(e) => error!("Polling bulb properties failed: {}", e),
            }
        }
        debug!("Property poller stopped");
    })
}
