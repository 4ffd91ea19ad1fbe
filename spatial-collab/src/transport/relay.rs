//! Relay transport: one WebSocket to a relay server, fanned out to a group.
//!
//! Hosting and browsing are the same operation here: join the configured
//! group. Outgoing envelopes are queued from the moment the transport
//! starts, so anything sent before the join completes follows the `Join`
//! frame in order.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{LinkFrame, PeerInfo, Transport, TransportError, TransportEvent, TransportKind};
use crate::config::RelayConfig;

pub struct RelayTransport {
    local: PeerInfo,
    config: RelayConfig,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl RelayTransport {
    pub fn new(local: PeerInfo, config: RelayConfig) -> Self {
        Self::with_capacity(local, config, 256)
    }

    pub fn with_capacity(local: PeerInfo, config: RelayConfig, event_capacity: usize) -> Self {
        let (event_tx, event_rx) = mpsc::channel(event_capacity);
        Self {
            local,
            config,
            event_tx,
            event_rx: Some(event_rx),
            outgoing: None,
            shutdown: None,
            task: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.outgoing.is_some()
    }

    fn join(&mut self) -> Result<(), TransportError> {
        if self.is_started() {
            log::debug!("Relay transport already joined to {}", self.config.group);
            return Ok(());
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.outgoing = Some(out_tx);
        self.shutdown = Some(shutdown_tx);
        self.task = Some(tokio::spawn(run_relay(
            self.config.clone(),
            self.local.clone(),
            self.event_tx.clone(),
            out_rx,
            shutdown_rx,
        )));
        Ok(())
    }
}

impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    fn start_hosting(&mut self) -> Result<(), TransportError> {
        self.join()
    }

    fn start_browsing(&mut self) -> Result<(), TransportError> {
        self.join()
    }

    /// Targets are ignored: the relay always fans out to the whole group.
    fn send(&self, bytes: &[u8], _targets: Option<&[Uuid]>) -> Result<(), TransportError> {
        let outgoing = self.outgoing.as_ref().ok_or(TransportError::NotStarted)?;
        let frame = LinkFrame::Relay {
            from: self.local.clone(),
            bytes: bytes.to_vec(),
        }
        .encode()?;
        outgoing.send(frame).map_err(|_| TransportError::Closed)
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        // The writer flushes whatever is queued once the sender is gone.
        if self.outgoing.take().is_some() {
            log::info!("Left relay group {}", self.config.group);
        }
        self.task = None;
    }

    fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_relay(
    config: RelayConfig,
    local: PeerInfo,
    events: mpsc::Sender<TransportEvent>,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let connect = tokio_tungstenite::connect_async(&config.url);
    let ws = match tokio::time::timeout(Duration::from_millis(config.connect_timeout_ms), connect).await {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => {
            let err = match e {
                tokio_tungstenite::tungstenite::Error::Io(io) => TransportError::from_io(&config.url, &io),
                other => TransportError::ConnectionFailed(format!("{}: {}", config.url, other)),
            };
            log::warn!("Relay connect failed: {}", err);
            let _ = events.send(TransportEvent::Error(err)).await;
            return;
        }
        Err(_) => {
            let err = TransportError::ConnectionFailed(format!("{}: timed out", config.url));
            let _ = events.send(TransportEvent::Error(err)).await;
            return;
        }
    };

    if *shutdown.borrow() {
        return;
    }

    let (mut sink, mut stream) = ws.split();
    let join = LinkFrame::Join {
        group: config.group.clone(),
        peer: local.clone(),
    };
    let joined = match join.encode() {
        Ok(bytes) => sink.send(Message::Binary(bytes.into())).await.is_ok(),
        Err(e) => {
            log::error!("Failed to encode join: {}", e);
            false
        }
    };
    if !joined {
        let _ = events
            .send(TransportEvent::Error(TransportError::ConnectionFailed("relay join failed".into())))
            .await;
        return;
    }
    log::info!("Joined relay group {} at {}", config.group, config.url);
    let _ = events.send(TransportEvent::SessionJoined).await;

    // Writer task: forward queued frames until the transport stops.
    tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if sink.send(Message::Binary(data.into())).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });

    let reason = loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => match LinkFrame::decode(&data) {
                    Ok(LinkFrame::Relay { from, bytes }) => {
                        if from.peer_id == local.peer_id {
                            continue;
                        }
                        let _ = events.send(TransportEvent::Received { bytes, from }).await;
                    }
                    Ok(LinkFrame::Membership { count }) => {
                        log::debug!("Relay group {} has {} members", config.group, count);
                        let _ = events.send(TransportEvent::MembershipChanged(count)).await;
                    }
                    Ok(LinkFrame::Ended { reason }) => break reason,
                    Ok(other) => log::debug!("Ignoring {:?} from relay", other),
                    Err(e) => log::warn!("Bad frame from relay: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break "relay connection closed".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("relay connection failed: {e}"),
            }
        }
    };

    log::info!("Relay session {} invalidated: {}", config.group, reason);
    let _ = events.send(TransportEvent::SessionInvalidated(reason)).await;
}
