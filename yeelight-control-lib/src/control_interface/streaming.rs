//! Streaming ("music") mode.
//!
//! The bulb is told to open a TCP connection back to a listener on this
//! host. Commands written on that connection are applied without replies,
//! which allows tens of updates per second.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::control_interface::bulb_info::SharedRecord;
use crate::control_interface::command::methods;
use crate::control_interface::reply::FireAndForget;
use crate::control_interface::transport::Transport;
use crate::control_interface::{Bulb, CommandChannel};
use crate::error::{BulbError, Result};
use crate::util::traits::LightControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StreamingState {
    #[default]
    Idle,
    /// Listener opened, asking the bulb to dial back.
    Requesting,
    AwaitingPeerConnect,
    Active,
    Closing,
}

impl fmt::Display for StreamingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            StreamingState::Idle => "idle",
            StreamingState::Requesting => "requesting",
            StreamingState::AwaitingPeerConnect => "awaiting peer connect",
            StreamingState::Active => "active",
            StreamingState::Closing => "closing",
        };
        write!(f, "{}", state)
    }
}

#[derive(Debug, Default)]
pub(crate) struct StreamingStatus {
    state: StreamingState,
    /// Cancels the running session, if any.
    session: Option<CancellationToken>,
}

/// The restricted view handed to a streaming session.
///
/// It shares the device record with the control session it came from, but
/// its commands go over the bulb's inbound connection and are never
/// answered: a successful command only means the frame was written.
#[derive(Debug, Clone)]
pub struct StreamingBulb {
    channel: CommandChannel,
}

impl StreamingBulb {
    fn new(record: SharedRecord, transport: Arc<Transport>) -> Self {
        StreamingBulb {
            channel: CommandChannel::new(record, transport, Arc::new(FireAndForget)),
        }
    }

    /// Address the bulb connected from.
    pub fn peer_addr(&self) -> SocketAddr {
        self.channel.transport().peer_addr()
    }
}

impl LightControl for StreamingBulb {
    fn channel(&self) -> &CommandChannel {
        &self.channel
    }
}

impl Bulb {
    pub fn streaming_state(&self) -> StreamingState {
        self.streaming_status().state
    }

    fn set_streaming_state(&self, state: StreamingState) {
        let mut status = self.streaming_status();
        if status.state != state {
            info!("Streaming mode: {} -> {}", status.state, state);
            status.state = state;
        }
    }

    /// Switches the bulb into streaming mode and runs `session` with the
    /// streaming view until it returns or `cancel` fires.
    ///
    /// The session also receives a token that is cancelled when `cancel`
    /// fires or [`Bulb::disable_streaming_mode`] is called. Afterwards
    /// streaming mode is switched off on the control connection and the
    /// inbound connection and listener are closed; failures while doing so
    /// are logged so that the session's own result is what is returned.
    ///
    /// Waiting for the bulb to dial back has no timeout of its own.
    pub async fn enable_streaming_mode<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        session: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(StreamingBulb, CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<BulbError>,
    {
        {
            let mut status = self.streaming_status();
            if status.state != StreamingState::Idle {
                return Err(BulbError::InvalidState(format!(
                    "streaming mode is already {}",
                    status.state
                ))
                .into());
            }
            status.state = StreamingState::Requesting;
        }

        let outcome = self.run_streaming(cancel, session).await;

        {
            let mut status = self.streaming_status();
            status.session = None;
        }
        self.set_streaming_state(StreamingState::Idle);
        outcome
    }

    async fn run_streaming<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        session: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(StreamingBulb, CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<BulbError>,
    {
        let local_ip = self.local_addr().ip();
        let listener = TcpListener::bind((local_ip, self.config().streaming_port))
            .await
            .map_err(|e| BulbError::network("start streaming listener", e))?;
        let port = listener
            .local_addr()
            .map_err(|e| BulbError::network("read streaming listener address", e))?
            .port();
        info!("Waiting for the bulb on {}:{}", local_ip, port);

        if let Err(e) = self
            .channel()
            .execute(
                methods::SET_MUSIC,
                vec![json!(1), json!(local_ip.to_string()), json!(port)],
                cancel,
            )
            .await
        {
            // The request may have reached the bulb even though no answer
            // came back.
            if matches!(e, BulbError::Timeout(_) | BulbError::Cancelled) {
                self.close_streaming(None, listener).await;
            }
            return Err(e.into());
        }

        let session_token = cancel.child_token();
        self.streaming_status().session = Some(session_token.clone());
        self.set_streaming_state(StreamingState::AwaitingPeerConnect);

        let accepted = tokio::select! {
            accepted = listener.accept() => {
                accepted.map_err(|e| BulbError::network("accept connection from bulb", e))
            }
            _ = session_token.cancelled() => Err(BulbError::Cancelled),
        };
        let transport = accepted.and_then(|(stream, peer)| {
            info!("Bulb connected from {} for streaming", peer);
            // Nothing is read on this connection; the read half is dropped.
            Transport::from_stream(stream).map(|(transport, _reader)| Arc::new(transport))
        });
        let transport = match transport {
            Ok(transport) => transport,
            Err(e) => {
                self.close_streaming(None, listener).await;
                return Err(e.into());
            }
        };

        let bulb = StreamingBulb::new(self.channel().record().clone(), transport.clone());
        self.set_streaming_state(StreamingState::Active);

        let outcome = tokio::select! {
            biased;
            outcome = session(bulb, session_token.clone()) => outcome,
            _ = session_token.cancelled() => Err(BulbError::Cancelled.into()),
        };

        self.close_streaming(Some(&transport), listener).await;
        outcome
    }

    async fn close_streaming(&self, inbound: Option<&Transport>, listener: TcpListener) {
        self.set_streaming_state(StreamingState::Closing);

        // The caller's token may already be cancelled; the command timeout
        // still bounds this.
        if let Err(e) = self
            .channel()
            .execute(methods::SET_MUSIC, vec![json!(0)], &CancellationToken::new())
            .await
        {
            error!("Failed to disable streaming mode: {}", e);
        }
        if let Some(inbound) = inbound {
            inbound.shutdown().await;
        }
        drop(listener);
    }

    /// Cancels a running streaming session, if any, and tells the bulb to
    /// leave streaming mode.
    pub async fn disable_streaming_mode(&self, cancel: &CancellationToken) -> Result<()> {
        let session = self.streaming_status().session.take();
        if let Some(session) = session {
            warn!("Cancelling the running streaming session");
            session.cancel();
        }
        self.channel()
            .execute(methods::SET_MUSIC, vec![json!(0)], cancel)
            .await
            .map(|_| ())
    }
}
