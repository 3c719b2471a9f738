use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Buf, BytesMut};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::control_interface::bulb_info::SharedRecord;
use crate::control_interface::command::{CommandResult, Incoming};
use crate::error::{BulbError, Result};

const READ_CHUNK: usize = 1024;

/// Longest unterminated input kept while waiting for a line ending.
const MAX_LINE_LEN: usize = 64 * 1024;

/// Method name of property change notifications.
const PROPS_NOTIFICATION: &str = "props";

/// Reassembles CRLF-terminated lines from arbitrary read chunks.
#[derive(Debug, Default)]
pub(crate) struct LineFramer {
    buffer: BytesMut,
}

impl LineFramer {
    pub(crate) fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete line without its terminator. Empty lines
    /// are skipped. Unterminated input longer than [`MAX_LINE_LEN`] is
    /// discarded.
    pub(crate) fn next_line(&mut self) -> Option<String> {
        loop {
            let Some(end) = self.buffer.windows(2).position(|w| w == b"\r\n") else {
                if self.buffer.len() > MAX_LINE_LEN {
                    warn!(
                        "Discarding {} bytes received without a line ending",
                        self.buffer.len()
                    );
                    self.buffer.clear();
                }
                return None;
            };
            let line = self.buffer.split_to(end);
            self.buffer.advance(2);
            if !line.is_empty() {
                return Some(String::from_utf8_lossy(&line).into_owned());
            }
        }
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

type ReplySender = oneshot::Sender<Result<CommandResult>>;

/// Commands waiting for their result, keyed by correlation id.
#[derive(Debug, Default)]
pub(crate) struct PendingReplies {
    waiters: Mutex<HashMap<u32, ReplySender>>,
}

impl PendingReplies {
    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<u32, ReplySender>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a waiter for `id`. The waiter is removed again when the
    /// returned registration is dropped.
    pub(crate) fn register(&self, id: u32) -> Registration<'_> {
        let (sender, receiver) = oneshot::channel();
        self.waiters().insert(id, sender);
        Registration {
            pending: self,
            id,
            receiver: Some(receiver),
        }
    }

    pub(crate) fn forget(&self, id: u32) {
        self.waiters().remove(&id);
    }

    /// Hands a result to its waiter. Returns false when nobody waits for it.
    pub(crate) fn resolve(&self, result: CommandResult) -> bool {
        match self.waiters().remove(&result.id) {
            Some(sender) => sender.send(Ok(result)).is_ok(),
            None => false,
        }
    }

    pub(crate) fn fail(&self, id: u32, err: BulbError) -> bool {
        match self.waiters().remove(&id) {
            Some(sender) => sender.send(Err(err)).is_ok(),
            None => false,
        }
    }

    pub(crate) fn fail_all(&self, make_err: impl Fn() -> BulbError) {
        for (_, sender) in self.waiters().drain() {
            let _ = sender.send(Err(make_err()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters().len()
    }
}

/// A waiter in [`PendingReplies`], forgotten on drop so an abandoned
/// command never leaves an entry behind.
#[derive(Debug)]
pub(crate) struct Registration<'a> {
    pending: &'a PendingReplies,
    id: u32,
    receiver: Option<oneshot::Receiver<Result<CommandResult>>>,
}

impl Registration<'_> {
    /// Waits for the result. Resolves to `ConnectionClosed` when the waiter
    /// was dropped without an answer.
    pub(crate) async fn reply(&mut self) -> Result<CommandResult> {
        match self.receiver.take() {
            Some(receiver) => receiver.await.unwrap_or(Err(BulbError::ConnectionClosed)),
            None => Err(BulbError::ConnectionClosed),
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.pending.forget(self.id);
    }
}

/// Owns the write side of one TCP connection to a bulb.
///
/// Every frame goes out in a single write while holding the writer lock, so
/// concurrent commands never interleave.
#[derive(Debug)]
pub(crate) struct Transport {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Transport {
    pub(crate) fn from_stream(stream: TcpStream) -> Result<(Transport, OwnedReadHalf)> {
        let local_addr = stream
            .local_addr()
            .map_err(|e| BulbError::network("read local address", e))?;
        let peer_addr = stream
            .peer_addr()
            .map_err(|e| BulbError::network("read peer address", e))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on {}: {}", peer_addr, e);
        }
        let (reader, writer) = stream.into_split();
        Ok((
            Transport {
                writer: tokio::sync::Mutex::new(Some(writer)),
                local_addr,
                peer_addr,
            },
            reader,
        ))
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Writes one frame. `cancel` is honoured only while waiting for the
    /// writer lock; once writing has started the frame is completed.
    pub(crate) async fn send(&self, line: &str, cancel: &CancellationToken) -> Result<()> {
        let mut writer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BulbError::Cancelled),
            writer = self.writer.lock() => writer,
        };
        let Some(writer) = writer.as_mut() else {
            return Err(BulbError::ConnectionClosed);
        };
        debug!("Sending to {}: {}", self.peer_addr, line.trim_end());
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BulbError::network(format!("write command to {}", self.peer_addr), e))
    }

    /// Shuts the write side down. Later sends fail with `ConnectionClosed`.
    pub(crate) async fn shutdown(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown of connection to {} failed: {}", self.peer_addr, e);
            }
        }
    }
}

/// Routes one inbound line to its waiter or into the device record.
pub(crate) fn route_line(line: &str, pending: &PendingReplies, record: &SharedRecord) {
    debug!("Received line: {}", line);
    match Incoming::parse(line) {
        Ok(Incoming::Result(result)) => {
            let id = result.id;
            if !pending.resolve(result) {
                warn!("Dropping result for unknown command id {}", id);
            }
        }
        Ok(Incoming::Notification(notification)) => {
            if notification.method == PROPS_NOTIFICATION {
                record.update(|record| record.state.apply_notification(&notification.params));
            } else {
                debug!("Ignoring notification {}", notification.method);
            }
        }
        Err(e) => {
            // A broken result still fails the command waiting on it.
            let id = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|value| value.get("id")?.as_u64())
                .and_then(|id| u32::try_from(id).ok());
            match id {
                Some(id) if pending.fail(id, BulbError::Parse(e.to_string())) => {}
                _ => warn!("Skipping line: {}", e),
            }
        }
    }
}

/// Reads lines until the session is cancelled or the connection fails.
///
/// On exit every pending command is failed, the session token is cancelled
/// so the poller stops too, and the write side is shut down.
pub(crate) fn spawn_reader(
    mut reader: OwnedReadHalf,
    transport: Arc<Transport>,
    pending: Arc<PendingReplies>,
    record: SharedRecord,
    session: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let peer = transport.peer_addr();
        let mut framer = LineFramer::default();
        let mut chunk = [0u8; READ_CHUNK];

        let failure: Option<io::ErrorKind> = loop {
            tokio::select! {
                _ = session.cancelled() => break None,
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => {
                        info!("Bulb at {} closed the connection", peer);
                        break Some(io::ErrorKind::UnexpectedEof);
                    }
                    Ok(n) => {
                        framer.push(&chunk[..n]);
                        while let Some(line) = framer.next_line() {
                            route_line(&line, &pending, &record);
                        }
                    }
                    Err(e) => {
                        error!("Reading from bulb at {} failed: {}", peer, e);
                        break Some(e.kind());
                    }
                },
            }
        };

        if pending.len() > 0 {
            debug!("Failing {} pending command(s) for {}", pending.len(), peer);
        }
        match failure {
            Some(io::ErrorKind::UnexpectedEof) | None => {
                pending.fail_all(|| BulbError::ConnectionClosed);
            }
            Some(kind) => pending.fail_all(|| {
                BulbError::network(format!("read from {}", peer), io::Error::from(kind))
            }),
        }
        if framer.pending_len() > 0 {
            debug!("Discarding {} unterminated bytes", framer.pending_len());
        }
        session.cancel();
        transport.shutdown().await;
        debug!("Line reader for {} stopped", peer);
    })
}
