// =============================================================================
// Exchange WebSocket client — subscriptions, liveness, reconnection
// =============================================================================
//
// One long-lived connection multiplexes every stream the pipeline needs.
// State machine:
//
//   Disconnected → Connecting → Connected ⇄ Reconnecting → Closed
//
// `Closed` is terminal. Subscriptions accumulate in the active set; after a
// reconnect the union of that set is re-issued before the client reports
// `Connected` again. A liveness ping goes out every `ping_interval`; a failed
// probe tears the session down into the reconnect path.
//
// Reconnect backoff starts at 1 s and doubles up to `reconnect_max_delay`,
// for at most `reconnect_max_attempts` tries, after which the client closes
// and surfaces a fatal error to the supervisor.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Build the SUBSCRIBE frame for `streams` with request id `id`.
pub fn subscribe_frame(streams: &[String], id: u64) -> String {
    json!({
        "method": "SUBSCRIBE",
        "params": streams,
        "id": id,
    })
    .to_string()
}

/// The backoff schedule for one reconnect episode: 1 s doubling, capped.
pub fn backoff_schedule(max_attempts: u32, max_delay: Duration) -> Vec<Duration> {
    let mut delays = Vec::with_capacity(max_attempts as usize);
    let mut delay = Duration::from_secs(1);
    for _ in 0..max_attempts {
        delays.push(delay);
        delay = (delay * 2).min(max_delay);
    }
    delays
}

pub struct WsClient {
    url: String,
    ping_interval: Duration,
    reconnect_max_attempts: u32,
    reconnect_max_delay: Duration,
    state: RwLock<ConnectionState>,
    /// Active-subscriptions set. Owned by the WS task; `subscribe` appends,
    /// reconnects read a snapshot copy.
    subscriptions: Mutex<HashSet<String>>,
    next_id: AtomicU64,
    /// Outbound frames for the live session, when one exists.
    command_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl WsClient {
    pub fn new(
        url: impl Into<String>,
        ping_interval: Duration,
        reconnect_max_attempts: u32,
        reconnect_max_delay: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            ping_interval,
            reconnect_max_attempts,
            reconnect_max_delay,
            state: RwLock::new(ConnectionState::Disconnected),
            subscriptions: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(0),
            command_tx: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Snapshot of the active-subscriptions set.
    pub fn active_subscriptions(&self) -> HashSet<String> {
        self.subscriptions.lock().clone()
    }

    /// Subscribe to additional streams. Only valid while `Connected`; the
    /// streams join the active set and are re-issued on every reconnect.
    pub fn subscribe(&self, streams: &[String]) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            bail!(PipelineError::transient(format!(
                "subscribe called in state {}",
                self.state()
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = subscribe_frame(streams, id);
        self.subscriptions.lock().extend(streams.iter().cloned());

        let guard = self.command_tx.lock();
        let tx = guard
            .as_ref()
            .context("no live session to send the subscribe frame on")?;
        tx.send(frame).context("session task went away")?;
        Ok(())
    }

    /// SUBSCRIBE frame re-issuing the union of the active set, or `None` when
    /// nothing was ever subscribed.
    fn resubscribe_frame(&self) -> Option<String> {
        let snapshot = self.subscriptions.lock();
        if snapshot.is_empty() {
            return None;
        }
        let mut streams: Vec<String> = snapshot.iter().cloned().collect();
        streams.sort();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Some(subscribe_frame(&streams, id))
    }

    /// Connection supervisor: connects, drives the session, reconnects with
    /// backoff. Parsed text frames go to `frame_tx` in arrival order, exactly
    /// once each.
    ///
    /// Returns `Ok(())` when the frame receiver is dropped (pipeline
    /// shutdown) and an error once reconnect attempts are exhausted.
    pub async fn run(self: Arc<Self>, frame_tx: mpsc::Sender<String>) -> Result<()> {
        let schedule = backoff_schedule(self.reconnect_max_attempts, self.reconnect_max_delay);
        let mut attempts: u32 = 0;

        loop {
            // connect() is a no-op while already connecting or connected.
            if matches!(
                self.state(),
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                bail!("run() entered twice");
            }
            if attempts == 0 {
                self.set_state(ConnectionState::Connecting);
            }

            match connect_async(self.url.as_str()).await {
                Ok((socket, _response)) => {
                    attempts = 0;
                    match self.drive_session(socket, &frame_tx).await {
                        Ok(()) => {
                            info!("frame receiver dropped, closing WebSocket client");
                            self.set_state(ConnectionState::Closed);
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(error = %e, "WebSocket session ended");
                        }
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "WebSocket connect failed");
                }
            }

            attempts += 1;
            if attempts > self.reconnect_max_attempts {
                self.set_state(ConnectionState::Closed);
                return Err(PipelineError::fatal(format!(
                    "reconnect attempts exhausted after {} tries",
                    self.reconnect_max_attempts
                ))
                .into());
            }
            self.set_state(ConnectionState::Reconnecting);
            let delay = schedule[(attempts - 1) as usize];
            info!(attempt = attempts, delay_s = delay.as_secs(), "reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    /// Drive one live session until it fails (`Err` → reconnect) or the frame
    /// receiver goes away (`Ok` → shut down).
    async fn drive_session(
        &self,
        socket: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        frame_tx: &mpsc::Sender<String>,
    ) -> Result<()> {
        let (mut write, mut read) = socket.split();

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        *self.command_tx.lock() = Some(cmd_tx);

        // Re-issue the union of active subscriptions before reporting
        // Connected, so downstream never observes a half-subscribed session.
        if let Some(frame) = self.resubscribe_frame() {
            write
                .send(Message::Text(frame))
                .await
                .context("failed to re-issue subscriptions")?;
            info!(
                count = self.subscriptions.lock().len(),
                "subscriptions re-issued"
            );
        }
        self.set_state(ConnectionState::Connected);
        info!(url = %self.url, "WebSocket connected");

        let mut ping = tokio::time::interval(self.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if frame_tx.send(text).await.is_err() {
                            return Ok(());
                        }
                    }
                    // Ping/Pong/Binary frames are handled by tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => bail!("WebSocket read error: {e}"),
                    None => bail!("WebSocket stream ended"),
                },
                Some(frame) = cmd_rx.recv() => {
                    write
                        .send(Message::Text(frame))
                        .await
                        .context("failed to send outbound frame")?;
                }
                _ = ping.tick() => {
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .context("liveness probe failed")?;
                }
            }
        }
    }
}
