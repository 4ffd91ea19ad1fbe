//! Direct peer-to-peer transport over WebSocket.
//!
//! Provides:
//! - Hosting: listen on `bind_addr`, accept joiners
//! - Browsing: dial seed hosts, retrying every `browse_interval_ms`
//! - Per-peer links with `Hello` handshake and ordered writer tasks
//!
//! Each link runs one reader (inline in its task) and one writer task that
//! drains an unbounded queue. Dropping the queue sender lets the writer flush
//! what is already queued and then close the socket, which is how `stop`
//! gets a final `session_ended` out before the links go away.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use super::{is_targeted, LinkError, LinkFrame, PeerInfo, Transport, TransportError, TransportEvent, TransportKind};
use crate::config::DirectConfig;

type Links = Arc<RwLock<HashMap<Uuid, PeerLink>>>;

/// One live connection to a remote peer.
struct PeerLink {
    info: PeerInfo,
    /// Distinguishes a reconnect from the link it replaced
    serial: u64,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

/// State shared by every link task.
#[derive(Clone)]
struct LinkContext {
    local: PeerInfo,
    links: Links,
    events: mpsc::Sender<TransportEvent>,
    serials: Arc<AtomicU64>,
    handshake_timeout: Duration,
}

/// WebSocket implementation of the direct channel.
pub struct DirectTransport {
    local: PeerInfo,
    config: DirectConfig,
    links: Links,
    serials: Arc<AtomicU64>,
    event_tx: mpsc::Sender<TransportEvent>,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
    /// Present while hosting or browsing
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl DirectTransport {
    pub fn new(local: PeerInfo, config: DirectConfig) -> Self {
        Self::with_capacity(local, config, 256)
    }

    pub fn with_capacity(local: PeerInfo, config: DirectConfig, event_capacity: usize) -> Self {
        let (event_tx, event_rx) = mpsc::channel(event_capacity);
        Self {
            local,
            config,
            links: Arc::new(RwLock::new(HashMap::new())),
            serials: Arc::new(AtomicU64::new(0)),
            event_tx,
            event_rx: Some(event_rx),
            shutdown: None,
            tasks: Vec::new(),
            local_addr: None,
        }
    }

    /// Address actually bound while hosting (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of live peer links.
    pub fn link_count(&self) -> usize {
        self.links.read().map(|links| links.len()).unwrap_or(0)
    }

    fn context(&self) -> LinkContext {
        LinkContext {
            local: self.local.clone(),
            links: self.links.clone(),
            events: self.event_tx.clone(),
            serials: self.serials.clone(),
            handshake_timeout: Duration::from_millis(self.config.connect_timeout_ms),
        }
    }

    /// Shutdown receiver for a new task, creating the signal on first use.
    fn shutdown_rx(&mut self) -> watch::Receiver<bool> {
        self.shutdown
            .get_or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }
}

impl Transport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    fn start_hosting(&mut self) -> Result<(), TransportError> {
        if self.local_addr.is_some() {
            log::warn!("Direct transport already hosting on {:?}", self.local_addr);
            return Ok(());
        }

        let std_listener = std::net::TcpListener::bind(&self.config.bind_addr)
            .map_err(|e| TransportError::from_io(&format!("bind {}", self.config.bind_addr), &e))?;
        std_listener
            .set_nonblocking(true)
            .map_err(|e| TransportError::from_io("listener", &e))?;
        let listener = TcpListener::from_std(std_listener).map_err(|e| TransportError::from_io("listener", &e))?;
        let addr = listener.local_addr().map_err(|e| TransportError::from_io("listener", &e))?;
        self.local_addr = Some(addr);
        log::info!("Direct transport hosting on ws://{}", addr);

        let ctx = self.context();
        let mut shutdown = self.shutdown_rx();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            tokio::spawn(accept_peer(stream, peer_addr, ctx.clone(), shutdown.clone()));
                        }
                        Err(e) => {
                            log::error!("Accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
            log::debug!("Direct listener on {} stopped", addr);
        }));
        Ok(())
    }

    fn start_browsing(&mut self) -> Result<(), TransportError> {
        if self.config.seed_peers.is_empty() {
            log::warn!("Browsing with no seed peers configured; nothing will be found");
        }
        let interval = Duration::from_millis(self.config.browse_interval_ms.max(1));
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        for seed in self.config.seed_peers.clone() {
            let ctx = self.context();
            let shutdown = self.shutdown_rx();
            self.tasks
                .push(tokio::spawn(browse_seed(seed, ctx, shutdown, interval, connect_timeout)));
        }
        Ok(())
    }

    fn send(&self, bytes: &[u8], targets: Option<&[Uuid]>) -> Result<(), TransportError> {
        let frame = LinkFrame::Data(bytes.to_vec()).encode()?;
        let links = self
            .links
            .read()
            .map_err(|_| TransportError::SendFailed("link table poisoned".into()))?;

        let mut failed = Vec::new();
        for (peer_id, link) in links.iter() {
            if !is_targeted(targets, peer_id) {
                continue;
            }
            if link.outgoing.send(frame.clone()).is_err() {
                failed.push(link.info.name.clone());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(TransportError::SendFailed(format!("link closed to {}", failed.join(", "))))
        }
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        // Dropping the senders lets each writer flush and close.
        match self.links.write() {
            Ok(mut links) => links.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
        if let Some(addr) = self.local_addr.take() {
            log::info!("Direct transport on {} stopped", addr);
        }
    }

    fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Host side: upgrade, handshake, run.
async fn accept_peer(stream: TcpStream, addr: SocketAddr, ctx: LinkContext, shutdown: watch::Receiver<bool>) {
    let mut ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("WebSocket upgrade from {} failed: {}", addr, e);
            return;
        }
    };

    match handshake(&mut ws, &ctx.local, ctx.handshake_timeout).await {
        Ok(info) => {
            log::info!("Peer {} ({}) connecting from {}", info.name, info.peer_id, addr);
            let _ = ctx.events.send(TransportEvent::PeerConnecting(info.clone())).await;
            run_link(ws, info, ctx, shutdown).await;
        }
        Err(e) => log::warn!("Handshake with {} failed: {}", addr, e),
    }
}

/// Joiner side: keep dialing `seed` until stopped, one link at a time.
async fn browse_seed(
    seed: String,
    ctx: LinkContext,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
    connect_timeout: Duration,
) {
    let url = if seed.starts_with("ws://") || seed.starts_with("wss://") {
        seed.clone()
    } else {
        format!("ws://{seed}")
    };

    loop {
        if *shutdown.borrow() {
            return;
        }

        match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(&url)).await {
            Ok(Ok((mut ws, _))) => match handshake(&mut ws, &ctx.local, ctx.handshake_timeout).await {
                Ok(info) => {
                    let _ = ctx.events.send(TransportEvent::PeerDiscovered(info.clone())).await;
                    let _ = ctx.events.send(TransportEvent::PeerConnecting(info.clone())).await;
                    let ended_by_peer = run_link(ws, info.clone(), ctx.clone(), shutdown.clone()).await;
                    if ended_by_peer {
                        let _ = ctx.events.send(TransportEvent::PeerLost(info)).await;
                    }
                }
                Err(e) => log::warn!("Handshake with {} failed: {}", url, e),
            },
            Ok(Err(e)) => {
                let err = map_ws_error(&url, e);
                if err.is_permission_error() {
                    let _ = ctx.events.send(TransportEvent::Error(err)).await;
                    return;
                }
                log::debug!("Seed {} not reachable: {}", url, err);
            }
            Err(_) => log::debug!("Seed {} timed out", url),
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Exchange `Hello` frames; returns the remote identity.
async fn handshake<S>(
    ws: &mut WebSocketStream<S>,
    local: &PeerInfo,
    timeout: Duration,
) -> Result<PeerInfo, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = LinkFrame::Hello(local.clone()).encode()?;
    ws.send(Message::Binary(hello.into()))
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

    let first = tokio::time::timeout(timeout, async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Binary(data)) => return LinkFrame::decode(&data).map_err(TransportError::from),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return Err(TransportError::ConnectionFailed(e.to_string())),
            }
        }
        Err(TransportError::Closed)
    })
    .await
    .map_err(|_| TransportError::ConnectionFailed("handshake timed out".into()))??;

    match first {
        LinkFrame::Hello(info) => Ok(info),
        other => Err(LinkError::Handshake(format!("expected hello, got {other:?}")).into()),
    }
}

/// Drive one established link until either side closes it.
///
/// Returns `true` when the remote end went away, `false` on local shutdown
/// (no disconnect event is emitted for a local stop).
async fn run_link<S>(
    ws: WebSocketStream<S>,
    info: PeerInfo,
    ctx: LinkContext,
    mut shutdown: watch::Receiver<bool>,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let serial = ctx.serials.fetch_add(1, Ordering::Relaxed);

    // Writer task: drain until every sender is gone, then close.
    tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if sink.send(Message::Binary(data.into())).await.is_err() {
                return;
            }
        }
        let _ = sink.close().await;
    });

    {
        let mut links = match ctx.links.write() {
            Ok(links) => links,
            Err(poisoned) => poisoned.into_inner(),
        };
        if links.contains_key(&info.peer_id) {
            log::info!("Replacing existing link to {}", info.name);
        }
        links.insert(
            info.peer_id,
            PeerLink {
                info: info.clone(),
                serial,
                outgoing: out_tx,
            },
        );
    }
    log::info!("Peer {} connected", info.name);
    let _ = ctx.events.send(TransportEvent::PeerConnected(info.clone())).await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return false,
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => match LinkFrame::decode(&data) {
                    Ok(LinkFrame::Data(bytes)) => {
                        let _ = ctx
                            .events
                            .send(TransportEvent::Received { bytes, from: info.clone() })
                            .await;
                    }
                    Ok(other) => log::debug!("Ignoring {:?} on direct link", other),
                    Err(e) => log::warn!("Bad frame from {}: {}", info.name, e),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // Ping/pong handled by tungstenite
                Some(Err(e)) => {
                    log::warn!("Link to {} failed: {}", info.name, e);
                    break;
                }
            }
        }
    }

    // Only remove our own entry; a reconnect may already have replaced it.
    let removed = {
        let mut links = match ctx.links.write() {
            Ok(links) => links,
            Err(poisoned) => poisoned.into_inner(),
        };
        match links.get(&info.peer_id) {
            Some(link) if link.serial == serial => links.remove(&info.peer_id).is_some(),
            _ => false,
        }
    };
    if removed {
        log::info!("Peer {} disconnected", info.name);
        let _ = ctx.events.send(TransportEvent::PeerDisconnected(info)).await;
    }
    true
}

fn map_ws_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    match err {
        tokio_tungstenite::tungstenite::Error::Io(e) => TransportError::from_io(url, &e),
        other => TransportError::ConnectionFailed(format!("{url}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_matching<F>(rx: &mut mpsc::Receiver<TransportEvent>, mut pred: F) -> TransportEvent
    where
        F: FnMut(&TransportEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_host_and_browser_connect() {
        let mut host = DirectTransport::new(PeerInfo::new("Host"), DirectConfig::for_testing());
        let mut host_rx = host.take_event_rx().unwrap();
        host.start_hosting().unwrap();
        let addr = host.local_addr().unwrap();

        let mut config = DirectConfig::for_testing();
        config.seed_peers = vec![addr.to_string()];
        let mut joiner = DirectTransport::new(PeerInfo::new("Joiner"), config);
        let mut joiner_rx = joiner.take_event_rx().unwrap();
        joiner.start_browsing().unwrap();

        let event = next_matching(&mut host_rx, |e| matches!(e, TransportEvent::PeerConnected(_))).await;
        let TransportEvent::PeerConnected(info) = event else { unreachable!() };
        assert_eq!(info.name, "Joiner");

        next_matching(&mut joiner_rx, |e| matches!(e, TransportEvent::PeerDiscovered(_))).await;
        next_matching(&mut joiner_rx, |e| matches!(e, TransportEvent::PeerConnected(_))).await;
        assert_eq!(host.link_count(), 1);

        host.send(b"hello", None).unwrap();
        let event = next_matching(&mut joiner_rx, |e| matches!(e, TransportEvent::Received { .. })).await;
        let TransportEvent::Received { bytes, from } = event else { unreachable!() };
        assert_eq!(bytes, b"hello");
        assert_eq!(from.name, "Host");

        host.stop();
        joiner.stop();
    }

    #[tokio::test]
    async fn test_send_without_links_is_noop() {
        let transport = DirectTransport::new(PeerInfo::new("Alone"), DirectConfig::for_testing());
        assert!(transport.send(b"x", None).is_ok());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_releases_port() {
        let mut host = DirectTransport::new(PeerInfo::new("Host"), DirectConfig::for_testing());
        host.start_hosting().unwrap();
        assert!(host.local_addr().is_some());
        host.stop();
        host.stop();
        assert!(host.local_addr().is_none());
        assert_eq!(host.link_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_reported() {
        let mut first = DirectTransport::new(PeerInfo::new("A"), DirectConfig::for_testing());
        first.start_hosting().unwrap();
        let addr = first.local_addr().unwrap();

        let mut config = DirectConfig::for_testing();
        config.bind_addr = addr.to_string();
        let mut second = DirectTransport::new(PeerInfo::new("B"), config);
        assert!(second.start_hosting().is_err());
    }
}
