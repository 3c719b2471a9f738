use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::control_interface::command::Command;
use crate::control_interface::transport::{PendingReplies, Transport};
use crate::error::{BulbError, Result};

/// How a connection turns a written command into a return value.
///
/// A control connection waits for the result carrying the command's id; a
/// streaming connection gets no replies at all.
#[async_trait]
pub(crate) trait ReplyStrategy: Send + Sync + fmt::Debug {
    async fn deliver(
        &self,
        transport: &Transport,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>>;
}

/// Waits for the matching result, the command timeout, cancellation or the
/// end of the connection, whichever comes first.
#[derive(Debug)]
pub(crate) struct CorrelatedReply {
    pending: Arc<PendingReplies>,
    timeout: Duration,
    session: CancellationToken,
}

impl CorrelatedReply {
    pub(crate) fn new(
        pending: Arc<PendingReplies>,
        timeout: Duration,
        session: CancellationToken,
    ) -> Self {
        CorrelatedReply {
            pending,
            timeout,
            session,
        }
    }
}

#[async_trait]
impl ReplyStrategy for CorrelatedReply {
    async fn deliver(
        &self,
        transport: &Transport,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        if self.session.is_cancelled() {
            return Err(BulbError::ConnectionClosed);
        }
        if cancel.is_cancelled() {
            return Err(BulbError::Cancelled);
        }

        let line = command.to_line()?;
        // Registered before writing so a fast reply cannot be missed.
        let mut waiter = self.pending.register(command.id);
        transport.send(&line, cancel).await?;

        let outcome = tokio::select! {
            biased;
            reply = waiter.reply() => reply,
            _ = tokio::time::sleep(self.timeout) => Err(BulbError::Timeout(format!(
                "no reply to {} (id {}) within {:?}",
                command.method, command.id, self.timeout
            ))),
            _ = cancel.cancelled() => Err(BulbError::Cancelled),
            _ = self.session.cancelled() => Err(BulbError::ConnectionClosed),
        };

        outcome?.into_values(&command.method)
    }
}

/// Streaming connections are write-only: the frame is sent and the command
/// counts as done.
#[derive(Debug, Default)]
pub(crate) struct FireAndForget;

#[async_trait]
impl ReplyStrategy for FireAndForget {
    async fn deliver(
        &self,
        transport: &Transport,
        command: &Command,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        if cancel.is_cancelled() {
            return Err(BulbError::Cancelled);
        }
        transport.send(&command.to_line()?, cancel).await?;
        Ok(Vec::new())
    }
}
