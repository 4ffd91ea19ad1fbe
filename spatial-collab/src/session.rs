//! The session actor: the single writer of roster, anchor and diagrams.
//!
//! Architecture:
//! ```text
//!  SessionHandle ──Command──┐
//!                           ▼
//!  DirectTransport ──ev──► SessionActor ──watch──► SessionSnapshot
//!  RelayTransport  ──ev──►  (one task)  ──bcast──► SessionAlert
//!                           │
//!                           ├── DiagramStore
//!                           ├── AnchorCoordinator ── AnchorStore
//!                           └── Roster
//! ```
//!
//! Every command and every transport event runs to completion on the actor
//! task before the next one starts. After each one a fresh snapshot is
//! published if anything visible changed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use spatial_core::{filenames_match, now_ms, Diagram, Element, Pose, PoseUpdate, SharedAnchor, Vec3};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

use crate::alerts::SessionAlert;
use crate::anchor::{anchor_envelope, relay_anchor_envelope, AnchorCoordinator};
use crate::config::{Role, SessionConfig};
use crate::hooks::{NullObserver, PoseProvider, SessionObserver, StaticPoseProvider};
use crate::protocol::{Envelope, OpaqueBlob, ParticipantLeft, SessionEnded};
use crate::reconcile::DiagramStore;
use crate::roster::Roster;
use crate::storage::AnchorStore;
use crate::transport::direct::DirectTransport;
use crate::transport::relay::RelayTransport;
use crate::transport::{PeerInfo, Transport, TransportError, TransportEvent, TransportKind};

const PERMISSION_STATUS: &str = "Local network permission required";

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Hosting, waiting for peers.
    Hosting,
    /// Searching for a host.
    Joining,
    /// At least one peer (direct or relay) is reachable.
    Active,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Hosting => write!(f, "hosting"),
            SessionState::Joining => write!(f, "joining"),
            SessionState::Active => write!(f, "active"),
        }
    }
}

/// Immutable view of everything a renderer needs.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Human-readable status line
    pub status: String,
    pub is_host: bool,
    pub relay_active: bool,
    /// Relay group members, local device included
    pub relay_participants: usize,
    pub connected_peers: Vec<PeerInfo>,
    pub available_peers: Vec<PeerInfo>,
    pub anchor: Option<SharedAnchor>,
    pub diagrams: Vec<Diagram>,
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    /// Diagram by filename: exact first, then fuzzy.
    pub fn diagram(&self, filename: &str) -> Option<&Diagram> {
        self.diagrams
            .iter()
            .find(|d| d.filename == filename)
            .or_else(|| self.diagrams.iter().find(|d| filenames_match(filename, &d.filename)))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("Session actor has stopped")]
    Closed,
    #[error("Not permitted: {0}")]
    NotPermitted(String),
}

enum Command {
    StartHosting {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    JoinSession {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StopSession {
        reply: oneshot::Sender<()>,
    },
    ShareDiagram {
        filename: String,
        elements: Vec<Element>,
        pose: Option<Pose>,
        reply: oneshot::Sender<Option<Uuid>>,
    },
    RemoveDiagram {
        filename: String,
        reply: oneshot::Sender<bool>,
    },
    UpdateTransform {
        filename: String,
        update: PoseUpdate,
        reply: oneshot::Sender<bool>,
    },
    UpdateElementPosition {
        filename: String,
        element_id: String,
        position: Vec3,
        reply: oneshot::Sender<bool>,
    },
    BroadcastAnchor {
        confidence: f32,
        reply: oneshot::Sender<Option<SharedAnchor>>,
    },
    SendOpaqueBlob {
        data: Vec<u8>,
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Arc<SessionSnapshot>>,
    alerts: broadcast::Sender<SessionAlert>,
}

impl SessionHandle {
    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Change-notified snapshot stream.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionSnapshot>> {
        self.snapshot.clone()
    }

    pub fn alerts(&self) -> broadcast::Receiver<SessionAlert> {
        self.alerts.subscribe()
    }

    /// Wait until a snapshot satisfies `pred`, up to `timeout`.
    pub async fn wait_for<F>(&self, timeout: Duration, mut pred: F) -> Option<Arc<SessionSnapshot>>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        tokio::time::timeout(timeout, async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if pred(&current) {
                    return Some(current);
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn start_hosting(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::StartHosting { reply }).await?
    }

    pub async fn join_session(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::JoinSession { reply }).await?
    }

    /// Tell peers the session ended, then tear everything down. Returns
    /// once the session is back to idle.
    pub async fn stop_session(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::StopSession { reply }).await
    }

    /// Host only. Returns the diagram id, or `None` when refused.
    pub async fn share_diagram(
        &self,
        filename: impl Into<String>,
        elements: Vec<Element>,
        pose: Option<Pose>,
    ) -> Result<Option<Uuid>, SessionError> {
        let filename = filename.into();
        self.request(|reply| Command::ShareDiagram { filename, elements, pose, reply })
            .await
    }

    /// Host only. Returns whether anything was removed.
    pub async fn remove_diagram(&self, filename: impl Into<String>) -> Result<bool, SessionError> {
        let filename = filename.into();
        self.request(|reply| Command::RemoveDiagram { filename, reply }).await
    }

    pub async fn update_diagram_transform(
        &self,
        filename: impl Into<String>,
        update: PoseUpdate,
    ) -> Result<bool, SessionError> {
        let filename = filename.into();
        self.request(|reply| Command::UpdateTransform { filename, update, reply })
            .await
    }

    pub async fn update_element_position(
        &self,
        filename: impl Into<String>,
        element_id: impl Into<String>,
        position: Vec3,
    ) -> Result<bool, SessionError> {
        let filename = filename.into();
        let element_id = element_id.into();
        self.request(|reply| Command::UpdateElementPosition {
            filename,
            element_id,
            position,
            reply,
        })
        .await
    }

    /// Capture the device pose as the shared anchor and broadcast it.
    pub async fn broadcast_current_anchor(&self, confidence: f32) -> Result<Option<SharedAnchor>, SessionError> {
        self.request(|reply| Command::BroadcastAnchor { confidence, reply }).await
    }

    /// Forward device-specific data to every peer untouched.
    pub async fn send_opaque_blob(&self, data: Vec<u8>) -> Result<(), SessionError> {
        self.request(|reply| Command::SendOpaqueBlob { data, reply }).await
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(build(reply)).await.map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

/// Assembles a session and spawns its actor.
pub struct SessionBuilder {
    config: SessionConfig,
    local: PeerInfo,
    direct: Option<Box<dyn Transport>>,
    relay: Option<Box<dyn Transport>>,
    pose: Arc<dyn PoseProvider>,
    observer: Arc<dyn SessionObserver>,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        let local = PeerInfo::new(config.local_name.clone());
        Self {
            config,
            local,
            direct: None,
            relay: None,
            pose: Arc::new(StaticPoseProvider::default()),
            observer: Arc::new(NullObserver),
        }
    }

    /// Use an existing identity (its name overrides `local_name`).
    pub fn local_peer(mut self, local: PeerInfo) -> Self {
        self.local = local;
        self
    }

    /// Replace the WebSocket direct transport.
    pub fn direct_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.local = transport.local_peer().clone();
        self.direct = Some(transport);
        self
    }

    /// Replace the relay transport configured by `config.relay`.
    pub fn relay_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.relay = Some(transport);
        self
    }

    pub fn pose_provider(mut self, pose: Arc<dyn PoseProvider>) -> Self {
        self.pose = pose;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(self) -> SessionHandle {
        let SessionBuilder {
            config,
            local,
            direct,
            relay,
            pose,
            observer,
        } = self;

        let direct = direct.unwrap_or_else(|| {
            Box::new(DirectTransport::with_capacity(
                local.clone(),
                config.direct.clone(),
                config.event_capacity,
            ))
        });
        let relay = relay.or_else(|| {
            config.relay.clone().map(|relay_config| {
                Box::new(RelayTransport::with_capacity(local.clone(), relay_config, config.event_capacity))
                    as Box<dyn Transport>
            })
        });

        let mut anchors = AnchorCoordinator::new(config.anchor_path.clone().map(AnchorStore::new));
        anchors.restore();

        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
        let (alerts, _) = broadcast::channel(config.alert_capacity.max(1));

        let mut actor = SessionActor {
            store: DiagramStore::new(config.role),
            config,
            local,
            state: SessionState::Idle,
            is_host: false,
            relay_active: false,
            relay_participants: 0,
            notice: None,
            last_error: None,
            roster: Roster::new(),
            anchors,
            direct,
            relay,
            pose,
            observer,
            alerts: alerts.clone(),
            snapshot: None,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(actor.build_snapshot()));
        actor.snapshot = Some(snapshot_tx);

        log::info!(
            "Session for {} ready ({:?}, relay {})",
            actor.local.name,
            actor.config.role,
            if actor.relay.is_some() { "configured" } else { "off" }
        );
        tokio::spawn(actor.run(command_rx));

        SessionHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            alerts,
        }
    }
}

struct SessionActor {
    config: SessionConfig,
    local: PeerInfo,
    state: SessionState,
    is_host: bool,
    relay_active: bool,
    relay_participants: usize,
    /// Overrides the derived status line until the next transition
    notice: Option<String>,
    last_error: Option<String>,
    roster: Roster,
    store: DiagramStore,
    anchors: AnchorCoordinator,
    direct: Box<dyn Transport>,
    relay: Option<Box<dyn Transport>>,
    pose: Arc<dyn PoseProvider>,
    observer: Arc<dyn SessionObserver>,
    alerts: broadcast::Sender<SessionAlert>,
    snapshot: Option<watch::Sender<Arc<SessionSnapshot>>>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut direct_rx = self.direct.take_event_rx();
        let mut relay_rx = self.relay.as_mut().and_then(|relay| relay.take_event_rx());

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = next_event(&mut direct_rx) => match event {
                    Some(event) => self.handle_transport_event(TransportKind::Direct, event),
                    None => direct_rx = None,
                },
                event = next_event(&mut relay_rx) => match event {
                    Some(event) => self.handle_transport_event(TransportKind::Relay, event),
                    None => relay_rx = None,
                },
            }
            self.publish();
        }

        log::debug!("All session handles dropped; shutting down {}", self.local.name);
        self.stop_transports();
    }

    // --- Commands ---

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartHosting { reply } => {
                let result = self.start_hosting();
                self.respond(reply, result);
            }
            Command::JoinSession { reply } => {
                let result = self.join_session();
                self.respond(reply, result);
            }
            Command::StopSession { reply } => {
                self.stop_session();
                self.respond(reply, ());
            }
            Command::ShareDiagram {
                filename,
                elements,
                pose,
                reply,
            } => {
                let id = self.share_diagram(&filename, elements, pose);
                self.respond(reply, id);
            }
            Command::RemoveDiagram { filename, reply } => {
                let envelope = self.store.remove_diagram(&filename);
                let removed = self.broadcast_if_some(envelope);
                self.respond(reply, removed);
            }
            Command::UpdateTransform { filename, update, reply } => {
                let envelope = self.store.update_diagram_transform(&filename, update);
                let updated = self.broadcast_if_some(envelope);
                self.respond(reply, updated);
            }
            Command::UpdateElementPosition {
                filename,
                element_id,
                position,
                reply,
            } => {
                let envelope = self.store.update_element_position(&filename, &element_id, position);
                let updated = self.broadcast_if_some(envelope);
                self.respond(reply, updated);
            }
            Command::BroadcastAnchor { confidence, reply } => {
                let anchor = self.broadcast_current_anchor(confidence);
                self.respond(reply, anchor);
            }
            Command::SendOpaqueBlob { data, reply } => {
                self.broadcast(&Envelope::OpaqueBlob(OpaqueBlob { data }));
                self.respond(reply, ());
            }
        }
    }

    /// Publish first, so the caller sees its own change once the reply lands.
    fn respond<T>(&self, reply: oneshot::Sender<T>, value: T) {
        self.publish();
        let _ = reply.send(value);
    }

    fn broadcast_if_some(&mut self, envelope: Option<Envelope>) -> bool {
        match envelope {
            Some(envelope) => {
                self.broadcast(&envelope);
                true
            }
            None => false,
        }
    }

    fn start_hosting(&mut self) -> Result<(), SessionError> {
        if self.config.role == Role::ReceiveOnly {
            log::warn!("start_hosting refused: {} is receive-only", self.local.name);
            return Err(SessionError::NotPermitted("receive-only devices cannot host".into()));
        }
        if self.state != SessionState::Idle {
            log::warn!("start_hosting ignored: session is {}", self.state);
            return Ok(());
        }

        log::info!("{} starting to host", self.local.name);
        self.is_host = true;
        self.store.set_hosting(true);
        self.state = SessionState::Hosting;
        self.notice = None;

        if let Some(relay) = self.relay.as_mut() {
            if let Err(e) = relay.start_hosting() {
                self.on_transport_error(TransportKind::Relay, e);
            }
        }
        if self.state != SessionState::Idle {
            if let Err(e) = self.direct.start_hosting() {
                self.on_transport_error(TransportKind::Direct, e);
            }
        }
        Ok(())
    }

    fn join_session(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            log::warn!("join_session ignored: session is {}", self.state);
            return Ok(());
        }

        log::info!("{} searching for a session", self.local.name);
        self.is_host = false;
        self.store.set_hosting(false);
        self.state = SessionState::Joining;
        self.notice = None;

        if let Err(e) = self.direct.start_browsing() {
            self.on_transport_error(TransportKind::Direct, e);
        }
        if self.state != SessionState::Idle {
            if let Some(relay) = self.relay.as_mut() {
                if let Err(e) = relay.start_browsing() {
                    self.on_transport_error(TransportKind::Relay, e);
                }
            }
        }
        Ok(())
    }

    fn stop_session(&mut self) {
        if self.is_host && self.state != SessionState::Idle {
            let ended = Envelope::SessionEnded(SessionEnded {
                host: self.local.name.clone(),
                reason: "Host ended the session".to_string(),
                timestamp_ms: now_ms(),
            });
            self.broadcast(&ended);
        }

        self.stop_transports();
        self.roster.clear();
        self.anchors.clear();
        self.store.clear();
        self.reset_flags();
        self.notice = None;
        log::info!("{} session stopped", self.local.name);
    }

    fn share_diagram(&mut self, filename: &str, elements: Vec<Element>, pose: Option<Pose>) -> Option<Uuid> {
        let envelope = self.store.share_diagram(filename, elements, pose)?;
        let id = match &envelope {
            Envelope::Diagram(diagram) => Some(diagram.id),
            _ => None,
        };
        self.broadcast(&envelope);

        // First diagram with no frame of reference: establish one.
        if self.anchors.current().is_none() {
            self.broadcast_current_anchor(self.config.implicit_anchor_confidence);
        }
        id
    }

    fn broadcast_current_anchor(&mut self, confidence: f32) -> Option<SharedAnchor> {
        if !self.store.can_originate() {
            log::warn!("broadcast_current_anchor refused: not an originating host");
            return None;
        }
        let Some(transform) = self.pose.current_pose() else {
            log::warn!("No device pose available; anchor not captured");
            return None;
        };
        let anchor = self.anchors.capture(transform, confidence, self.pose.world_map());
        self.observer.on_anchor(&anchor);

        if !self.roster.connected().is_empty() {
            self.send_direct(&anchor_envelope(&anchor), None);
        }
        if self.relay_active {
            let envelope = relay_anchor_envelope(&anchor, self.config.relay_world_map_limit, &self.local.name);
            self.send_relay(&envelope);
        }
        Some(anchor)
    }

    // --- Transport events ---

    fn handle_transport_event(&mut self, kind: TransportKind, event: TransportEvent) {
        if self.state == SessionState::Idle {
            log::trace!("Ignoring {} event while idle: {:?}", kind, event);
            return;
        }

        match event {
            TransportEvent::PeerDiscovered(peer) => {
                log::debug!("Discovered {}", peer.name);
                self.roster.add_available(peer);
            }
            TransportEvent::PeerLost(peer) => self.roster.remove_available(&peer.peer_id),
            TransportEvent::PeerConnecting(peer) => {
                log::debug!("Connecting to {}", peer.name);
                self.notice = Some(format!("Connecting to {}", peer.name));
            }
            TransportEvent::PeerConnected(peer) => self.on_peer_connected(peer),
            TransportEvent::PeerDisconnected(peer) => self.on_peer_disconnected(peer),
            TransportEvent::Received { bytes, from } => match Envelope::decode(&bytes) {
                Ok(envelope) => self.apply_remote(kind, envelope, from),
                Err(e) => {
                    log::warn!("Dropping unrecognized data from {} via {}: {}", from.name, kind, e);
                    self.last_error = Some(format!("Unrecognized data from {}: {}", from.name, e));
                }
            },
            TransportEvent::SessionJoined => {
                log::info!("Relay group session joined");
                self.relay_active = true;
                self.state = SessionState::Active;
                self.notice = None;
            }
            TransportEvent::MembershipChanged(count) => {
                let previous = self.relay_participants;
                self.relay_participants = count;
                if self.is_host && count > 1 && count > previous {
                    log::info!("Relay membership grew to {}; resyncing", count);
                    self.resync_relay();
                }
            }
            TransportEvent::SessionInvalidated(reason) => {
                log::info!("Relay session ended: {}", reason);
                self.notice = Some(format!("Relay session ended: {}", reason));
                self.relay_active = false;
                self.relay_participants = 0;
                if self.roster.connected().is_empty() {
                    self.revert_to_waiting();
                }
            }
            TransportEvent::Error(e) => self.on_transport_error(kind, e),
        }
    }

    fn on_peer_connected(&mut self, peer: PeerInfo) {
        if !self.roster.add_connected(peer.clone()) {
            return;
        }
        log::info!("{} connected ({} peers)", peer.name, self.roster.connected().len());
        self.state = SessionState::Active;
        self.notice = None;
        if self.is_host {
            self.resync_peer(&peer);
        }
    }

    fn on_peer_disconnected(&mut self, peer: PeerInfo) {
        if self.roster.remove_connected(&peer.peer_id).is_none() {
            return;
        }
        log::info!("{} disconnected ({} peers left)", peer.name, self.roster.connected().len());

        let left = Envelope::ParticipantLeft(ParticipantLeft {
            peer_name: peer.name.clone(),
            timestamp_ms: now_ms(),
        });
        self.broadcast(&left);
        if self.is_host {
            self.alert(SessionAlert::ParticipantLeft { peer_name: peer.name });
        }

        if self.roster.connected().is_empty() && !(self.relay_active && self.relay_participants > 1) {
            self.revert_to_waiting();
        }
    }

    fn apply_remote(&mut self, kind: TransportKind, envelope: Envelope, from: PeerInfo) {
        log::trace!("{} envelope from {} via {}", envelope.tag(), from.name, kind);
        match envelope {
            Envelope::Anchor(payload) => {
                let anchor = self.anchors.apply_remote(payload.to_anchor()).clone();
                self.observer.on_anchor(&anchor);
            }
            Envelope::CoordinateAlignment(alignment) => {
                let anchor = self.anchors.apply_alignment(&alignment).clone();
                self.observer.on_anchor(&anchor);
            }
            Envelope::Diagram(_) | Envelope::Remove(_) | Envelope::TransformUpdate(_) | Envelope::ElementMove(_)
                if self.is_host =>
            {
                log::warn!("Host ignoring {} from {}", envelope.tag(), from.name);
            }
            Envelope::Diagram(diagram) => {
                self.store.apply_diagram(diagram);
            }
            Envelope::Remove(remove) => {
                self.store.apply_remove(&remove);
            }
            Envelope::TransformUpdate(update) => {
                self.store.apply_transform(&update);
            }
            Envelope::ElementMove(mv) => {
                self.store.apply_element_move(&mv);
            }
            Envelope::OpaqueBlob(blob) => self.observer.on_opaque_blob(&blob.data, &from),
            Envelope::SessionEnded(ended) => {
                log::info!("{} ended the session: {}", ended.host, ended.reason);
                self.store.clear();
                self.anchors.clear();
                self.alert(SessionAlert::SessionEnded {
                    host: ended.host,
                    message: ended.reason,
                });
            }
            Envelope::ParticipantLeft(left) => {
                self.alert(SessionAlert::ParticipantLeft {
                    peer_name: left.peer_name,
                });
            }
        }
    }

    fn on_transport_error(&mut self, kind: TransportKind, error: TransportError) {
        log::error!("{} transport error: {}", kind, error);
        self.last_error = Some(error.to_string());
        if error.is_permission_error() {
            self.reset_to_idle();
            self.notice = Some(PERMISSION_STATUS.to_string());
        } else {
            self.notice = Some(format!("{} transport error: {}", kind, error));
        }
    }

    // --- Sending ---

    /// Full state to one newly connected direct peer: diagrams, then anchor.
    fn resync_peer(&mut self, peer: &PeerInfo) {
        let targets = [peer.peer_id];
        let mut envelopes: Vec<Envelope> = self.store.diagrams().iter().cloned().map(Envelope::Diagram).collect();
        if let Some(anchor) = self.anchors.current() {
            envelopes.push(anchor_envelope(anchor));
        }
        log::debug!("Resyncing {} with {} envelopes", peer.name, envelopes.len());
        for envelope in &envelopes {
            self.send_direct(envelope, Some(&targets));
        }
    }

    /// Full state to the relay group.
    fn resync_relay(&mut self) {
        let mut envelopes: Vec<Envelope> = self.store.diagrams().iter().cloned().map(Envelope::Diagram).collect();
        if let Some(anchor) = self.anchors.current() {
            envelopes.push(relay_anchor_envelope(
                anchor,
                self.config.relay_world_map_limit,
                &self.local.name,
            ));
        }
        for envelope in &envelopes {
            self.send_relay(envelope);
        }
    }

    /// Same envelope on every active channel.
    fn broadcast(&mut self, envelope: &Envelope) {
        if !self.roster.connected().is_empty() {
            self.send_direct(envelope, None);
        }
        if self.relay_active {
            self.send_relay(envelope);
        }
    }

    fn send_direct(&mut self, envelope: &Envelope, targets: Option<&[Uuid]>) {
        let Some(bytes) = self.encode(envelope) else {
            return;
        };
        if let Err(e) = self.direct.send(&bytes, targets) {
            log::warn!("Direct send of {} failed: {}", envelope.tag(), e);
            self.last_error = Some(e.to_string());
        }
    }

    fn send_relay(&mut self, envelope: &Envelope) {
        let Some(bytes) = self.encode(envelope) else {
            return;
        };
        let result = match self.relay.as_ref() {
            Some(relay) => relay.send(&bytes, None),
            None => return,
        };
        if let Err(e) = result {
            log::warn!("Relay send of {} failed: {}", envelope.tag(), e);
            self.last_error = Some(e.to_string());
        }
    }

    fn encode(&mut self, envelope: &Envelope) -> Option<Vec<u8>> {
        match envelope.encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::error!("Not sending {} envelope: {}", envelope.tag(), e);
                self.last_error = Some(e.to_string());
                None
            }
        }
    }

    fn alert(&self, alert: SessionAlert) {
        log::info!("{}: {}", alert.title(), alert);
        // No subscribers is fine
        let _ = self.alerts.send(alert);
    }

    // --- State ---

    fn revert_to_waiting(&mut self) {
        self.state = if self.is_host {
            SessionState::Hosting
        } else {
            SessionState::Joining
        };
        log::info!("{} back to {}", self.local.name, self.state);
    }

    fn reset_to_idle(&mut self) {
        self.stop_transports();
        self.roster.clear();
        self.reset_flags();
    }

    fn reset_flags(&mut self) {
        self.state = SessionState::Idle;
        self.is_host = false;
        self.store.set_hosting(false);
        self.relay_active = false;
        self.relay_participants = 0;
    }

    fn stop_transports(&mut self) {
        self.direct.stop();
        if let Some(relay) = self.relay.as_mut() {
            relay.stop();
        }
    }

    fn status_line(&self) -> String {
        if let Some(notice) = &self.notice {
            return notice.clone();
        }
        match self.state {
            SessionState::Idle => "Not connected".to_string(),
            SessionState::Hosting => "Hosting, waiting for peers".to_string(),
            SessionState::Joining => "Searching for a session".to_string(),
            SessionState::Active => {
                let peers = self.roster.connected().len();
                let mut status = format!("Connected to {} peer{}", peers, if peers == 1 { "" } else { "s" });
                if self.relay_active {
                    status.push_str(&format!(" (relay: {} participants)", self.relay_participants));
                }
                status
            }
        }
    }

    fn build_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            status: self.status_line(),
            is_host: self.is_host,
            relay_active: self.relay_active,
            relay_participants: self.relay_participants,
            connected_peers: self.roster.connected().to_vec(),
            available_peers: self.roster.available().to_vec(),
            anchor: self.anchors.current().cloned(),
            diagrams: self.store.diagrams().to_vec(),
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&self) {
        let Some(tx) = &self.snapshot else {
            return;
        };
        let snapshot = self.build_snapshot();
        tx.send_if_modified(|current| {
            if **current == snapshot {
                false
            } else {
                *current = Arc::new(snapshot);
                true
            }
        });
    }
}

async fn next_event(rx: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
