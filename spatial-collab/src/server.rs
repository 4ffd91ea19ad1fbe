//! Relay server: named group sessions over WebSocket.
//!
//! Architecture:
//! ```text
//! Device A ──┐
//!            ├── Join{group} ── RoomManager ── BroadcastGroup(group)
//! Device B ──┘                                    │
//!                                      ┌──────────┼───────────┐
//!                                      ▼          ▼           ▼
//!                                  Device A   Device B    Device C
//! ```
//!
//! The server never decodes envelope bytes. It tracks group membership,
//! announces member counts, and fans `Relay` frames out to every other
//! member of the sender's group.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{BroadcastGroup, Outbound, RoomManager};
use crate::transport::{LinkFrame, PeerInfo};

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per group
    pub max_members_per_group: usize,
    /// Broadcast channel capacity per group
    pub broadcast_capacity: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_members_per_group: 16,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_groups: usize,
    pub rejected_joins: u64,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The relay server.
pub struct RelayServer {
    config: RelayServerConfig,
    room_manager: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: RelayServerConfig) -> Self {
        let room_manager = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            room_manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayServerConfig::default())
    }

    /// Bind `bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let stats = self.stats.clone();
            let config = self.config.clone();
            let room_manager = self.room_manager.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, stats, config, room_manager).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Tear a group down: every member is told the session ended.
    pub async fn end_group(&self, group: &str, reason: &str) -> usize {
        match self.room_manager.get(group).await {
            Some(room) => room
                .broadcast(&LinkFrame::Ended { reason: reason.to_string() }, None)
                .unwrap_or(0),
            None => 0,
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        stats: Arc<RwLock<ServerStats>>,
        config: RelayServerConfig,
        room_manager: Arc<RoomManager>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection
        let mut member: Option<(PeerInfo, String, Arc<BroadcastGroup>)> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Outbound>>> = None;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let data = match msg {
                            Some(Ok(Message::Binary(data))) => data,
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                log::debug!("WebSocket error from {addr}: {e}");
                                break;
                            }
                        };
                        {
                            let mut s = stats.write().await;
                            s.total_frames += 1;
                            s.total_bytes += data.len() as u64;
                        }

                        match LinkFrame::decode(&data) {
                            Ok(LinkFrame::Join { group, peer }) => {
                                if member.is_some() {
                                    log::warn!("{addr} sent a second join; ignoring");
                                    continue;
                                }
                                let Some((room, rx)) = room_manager
                                    .join(&group, peer.clone(), config.max_members_per_group)
                                    .await
                                else {
                                    stats.write().await.rejected_joins += 1;
                                    let ended = LinkFrame::Ended { reason: format!("group {group} is full") };
                                    ws_sender.send(Message::Binary(ended.encode()?.into())).await?;
                                    break;
                                };

                                broadcast_rx = Some(rx);
                                let count = room.member_count().await;
                                log::info!("{} joined group {} ({} members)", peer.name, group, count);
                                room.broadcast(&LinkFrame::Membership { count }, None)?;
                                member = Some((peer, group, room));
                            }
                            Ok(LinkFrame::Relay { bytes, .. }) => match &member {
                                // Stamp the joined identity, not the claimed one
                                Some((peer, _, room)) => {
                                    let frame = LinkFrame::Relay { from: peer.clone(), bytes };
                                    room.broadcast(&frame, Some(peer.peer_id))?;
                                }
                                None => log::warn!("Relay frame from {addr} before join; dropped"),
                            },
                            Ok(other) => log::debug!("Ignoring {:?} from {addr}", other),
                            Err(e) => log::warn!("Bad frame from {addr}: {e}"),
                        }
                    }

                    outbound = async {
                        match broadcast_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match outbound {
                            Ok(out) => {
                                let own = matches!((&member, out.sender), (Some((peer, _, _)), Some(sender)) if peer.peer_id == sender);
                                if own {
                                    continue;
                                }
                                ws_sender.send(Message::Binary(out.bytes.clone().into())).await?;
                                if let Ok(LinkFrame::Ended { .. }) = LinkFrame::decode(&out.bytes) {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Member at {addr} lagged by {n} frames");
                                if let Some((_, _, room)) = &member {
                                    room.record_dropped(n);
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup: leave the group and tell the rest
        if let Some((peer, group, room)) = member {
            room.remove_member(&peer.peer_id).await;
            let count = room.member_count().await;
            log::info!("{} left group {} ({} members)", peer.name, group, count);
            if count > 0 {
                let _ = room.broadcast(&LinkFrame::Membership { count }, None);
            } else if room_manager.remove_if_empty(&group).await {
                log::info!("Group {group} removed (empty)");
            }
        }
        let _ = ws_sender.close().await;

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_groups = room_manager.room_count().await;
        }
        result
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_groups = self.room_manager.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }
}
