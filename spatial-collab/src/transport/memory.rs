//! In-process transport for tests and simulations.
//!
//! A [`MemoryHub`] plays the network. Every [`MemoryTransport`] created from
//! it delivers events synchronously into the receivers' queues, so the
//! session logic can be exercised without sockets. The hub can also break
//! links, end the relay group and inject errors.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use uuid::Uuid;

use super::{is_targeted, PeerInfo, Transport, TransportError, TransportEvent, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Hosting,
    Browsing,
}

struct Member {
    info: PeerInfo,
    kind: TransportKind,
    mode: Mode,
    events: mpsc::Sender<TransportEvent>,
    links: HashSet<Uuid>,
}

impl Member {
    fn emit(&self, event: TransportEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::warn!("Dropping event for {}: {}", self.info.name, e);
        }
    }
}

#[derive(Default)]
struct HubState {
    /// Keyed by (peer_id, kind): one device may sit on both channels.
    members: HashMap<(Uuid, TransportKind), Member>,
}

impl HubState {
    fn active_relay(&self) -> impl Iterator<Item = &Member> {
        self.members
            .values()
            .filter(|m| m.kind == TransportKind::Relay && m.mode != Mode::Idle)
    }

    fn announce_membership(&self) {
        let count = self.active_relay().count();
        for member in self.active_relay() {
            member.emit(TransportEvent::MembershipChanged(count));
        }
    }

    fn link(&mut self, host: Uuid, joiner: Uuid) {
        let key_h = (host, TransportKind::Direct);
        let key_j = (joiner, TransportKind::Direct);
        let (Some(host_info), Some(joiner_info)) = (
            self.members.get(&key_h).map(|m| m.info.clone()),
            self.members.get(&key_j).map(|m| m.info.clone()),
        ) else {
            return;
        };
        if let Some(member) = self.members.get_mut(&key_j) {
            if !member.links.insert(host) {
                return;
            }
            member.emit(TransportEvent::PeerDiscovered(host_info.clone()));
            member.emit(TransportEvent::PeerConnecting(host_info.clone()));
            member.emit(TransportEvent::PeerConnected(host_info));
        }
        if let Some(member) = self.members.get_mut(&key_h) {
            member.links.insert(joiner);
            member.emit(TransportEvent::PeerConnecting(joiner_info.clone()));
            member.emit(TransportEvent::PeerConnected(joiner_info));
        }
    }

    fn unlink(&mut self, a: Uuid, b: Uuid) {
        let key_a = (a, TransportKind::Direct);
        let key_b = (b, TransportKind::Direct);
        let info_a = self.members.get(&key_a).map(|m| m.info.clone());
        let info_b = self.members.get(&key_b).map(|m| m.info.clone());
        if let (Some(member), Some(info)) = (self.members.get_mut(&key_a), info_b) {
            if member.links.remove(&b) {
                member.emit(TransportEvent::PeerDisconnected(info));
            }
        }
        if let (Some(member), Some(info)) = (self.members.get_mut(&key_b), info_a) {
            if member.links.remove(&a) {
                member.emit(TransportEvent::PeerDisconnected(info));
            }
        }
    }
}

/// The simulated network shared by every [`MemoryTransport`].
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this hub.
    pub fn transport(&self, local: PeerInfo, kind: TransportKind) -> MemoryTransport {
        let (events, event_rx) = mpsc::channel(1024);
        self.lock().members.insert(
            (local.peer_id, kind),
            Member {
                info: local.clone(),
                kind,
                mode: Mode::Idle,
                events,
                links: HashSet::new(),
            },
        );
        MemoryTransport {
            hub: self.clone(),
            local,
            kind,
            event_rx: Some(event_rx),
        }
    }

    /// Break the direct link between two peers, as a network failure would.
    pub fn disconnect(&self, a: Uuid, b: Uuid) {
        self.lock().unlink(a, b);
    }

    /// End the relay group for everyone, as the relay service would.
    pub fn end_relay(&self, reason: &str) {
        let mut state = self.lock();
        for member in state.members.values_mut() {
            if member.kind == TransportKind::Relay && member.mode != Mode::Idle {
                member.mode = Mode::Idle;
                member.emit(TransportEvent::SessionInvalidated(reason.to_string()));
            }
        }
    }

    /// Deliver a transport error to one member.
    pub fn inject_error(&self, peer_id: Uuid, kind: TransportKind, error: TransportError) {
        if let Some(member) = self.lock().members.get(&(peer_id, kind)) {
            member.emit(TransportEvent::Error(error));
        }
    }

    /// Peers directly linked to `peer_id`.
    pub fn links_of(&self, peer_id: Uuid) -> Vec<Uuid> {
        self.lock()
            .members
            .get(&(peer_id, TransportKind::Direct))
            .map(|m| m.links.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Active relay members.
    pub fn relay_members(&self) -> usize {
        self.lock().active_relay().count()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One endpoint on a [`MemoryHub`].
pub struct MemoryTransport {
    hub: MemoryHub,
    local: PeerInfo,
    kind: TransportKind,
    event_rx: Option<mpsc::Receiver<TransportEvent>>,
}

impl MemoryTransport {
    fn set_mode(&self, mode: Mode) {
        let mut state = self.hub.lock();
        let key = (self.local.peer_id, self.kind);
        let Some(member) = state.members.get_mut(&key) else {
            return;
        };
        let previous = member.mode;
        member.mode = mode;

        match self.kind {
            TransportKind::Relay => {
                if previous == Mode::Idle && mode != Mode::Idle {
                    member.emit(TransportEvent::SessionJoined);
                }
                state.announce_membership();
            }
            TransportKind::Direct => {
                let peers: Vec<(Uuid, Mode)> = state
                    .members
                    .values()
                    .filter(|m| m.kind == TransportKind::Direct && m.info.peer_id != self.local.peer_id)
                    .map(|m| (m.info.peer_id, m.mode))
                    .collect();
                for (peer, peer_mode) in peers {
                    match (mode, peer_mode) {
                        (Mode::Hosting, Mode::Browsing) => state.link(self.local.peer_id, peer),
                        (Mode::Browsing, Mode::Hosting) => state.link(peer, self.local.peer_id),
                        _ => {}
                    }
                }
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    fn start_hosting(&mut self) -> Result<(), TransportError> {
        self.set_mode(Mode::Hosting);
        Ok(())
    }

    fn start_browsing(&mut self) -> Result<(), TransportError> {
        self.set_mode(Mode::Browsing);
        Ok(())
    }

    fn send(&self, bytes: &[u8], targets: Option<&[Uuid]>) -> Result<(), TransportError> {
        let state = self.hub.lock();
        let Some(me) = state.members.get(&(self.local.peer_id, self.kind)) else {
            return Err(TransportError::Closed);
        };
        if me.mode == Mode::Idle {
            return Err(TransportError::NotStarted);
        }

        match self.kind {
            TransportKind::Direct => {
                for peer in me.links.iter().filter(|p| is_targeted(targets, p)) {
                    if let Some(member) = state.members.get(&(*peer, TransportKind::Direct)) {
                        member.emit(TransportEvent::Received {
                            bytes: bytes.to_vec(),
                            from: self.local.clone(),
                        });
                    }
                }
            }
            TransportKind::Relay => {
                for member in state.active_relay().filter(|m| m.info.peer_id != self.local.peer_id) {
                    member.emit(TransportEvent::Received {
                        bytes: bytes.to_vec(),
                        from: self.local.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.hub.lock();
        let key = (self.local.peer_id, self.kind);
        let Some(member) = state.members.get_mut(&key) else {
            return;
        };
        if member.mode == Mode::Idle && member.links.is_empty() {
            return;
        }
        member.mode = Mode::Idle;
        let links: Vec<Uuid> = member.links.iter().copied().collect();

        match self.kind {
            TransportKind::Direct => {
                for peer in links {
                    // The stopping side gets no events of its own.
                    if let Some(me) = state.members.get_mut(&key) {
                        me.links.remove(&peer);
                    }
                    if let Some(other) = state.members.get_mut(&(peer, TransportKind::Direct)) {
                        if other.links.remove(&self.local.peer_id) {
                            other.emit(TransportEvent::PeerDisconnected(self.local.clone()));
                            other.emit(TransportEvent::PeerLost(self.local.clone()));
                        }
                    }
                }
            }
            TransportKind::Relay => state.announce_membership(),
        }
    }

    fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.stop();
        self.hub.lock().members.remove(&(self.local.peer_id, self.kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::Receiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_direct_link_and_delivery() {
        let hub = MemoryHub::new();
        let host_info = PeerInfo::new("Host");
        let joiner_info = PeerInfo::new("Joiner");
        let mut host = hub.transport(host_info.clone(), TransportKind::Direct);
        let mut joiner = hub.transport(joiner_info.clone(), TransportKind::Direct);
        let mut host_rx = host.take_event_rx().unwrap();
        let mut joiner_rx = joiner.take_event_rx().unwrap();

        joiner.start_browsing().unwrap();
        host.start_hosting().unwrap();

        let host_events = drain(&mut host_rx);
        assert!(matches!(host_events.last(), Some(TransportEvent::PeerConnected(p)) if p.name == "Joiner"));
        let joiner_events = drain(&mut joiner_rx);
        assert!(matches!(joiner_events[0], TransportEvent::PeerDiscovered(_)));

        host.send(b"abc", Some(&[joiner_info.peer_id])).unwrap();
        match drain(&mut joiner_rx).pop() {
            Some(TransportEvent::Received { bytes, from }) => {
                assert_eq!(bytes, b"abc");
                assert_eq!(from.peer_id, host_info.peer_id);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Targeting someone else delivers nothing
        host.send(b"abc", Some(&[Uuid::new_v4()])).unwrap();
        assert!(drain(&mut joiner_rx).is_empty());
    }

    #[test]
    fn test_stop_notifies_remaining_peer() {
        let hub = MemoryHub::new();
        let mut host = hub.transport(PeerInfo::new("Host"), TransportKind::Direct);
        let joiner_info = PeerInfo::new("Joiner");
        let mut joiner = hub.transport(joiner_info.clone(), TransportKind::Direct);
        let mut host_rx = host.take_event_rx().unwrap();
        host.start_hosting().unwrap();
        joiner.start_browsing().unwrap();
        drain(&mut host_rx);

        joiner.stop();
        let events = drain(&mut host_rx);
        assert!(matches!(&events[0], TransportEvent::PeerDisconnected(p) if p.peer_id == joiner_info.peer_id));
        assert!(hub.links_of(host.local_peer().peer_id).is_empty());
    }

    #[test]
    fn test_relay_membership_and_fanout() {
        let hub = MemoryHub::new();
        let mut a = hub.transport(PeerInfo::new("A"), TransportKind::Relay);
        let mut b = hub.transport(PeerInfo::new("B"), TransportKind::Relay);
        let mut a_rx = a.take_event_rx().unwrap();
        let mut b_rx = b.take_event_rx().unwrap();

        a.start_hosting().unwrap();
        b.start_browsing().unwrap();
        assert_eq!(hub.relay_members(), 2);

        let a_events = drain(&mut a_rx);
        assert!(matches!(a_events[0], TransportEvent::SessionJoined));
        assert!(matches!(a_events.last(), Some(TransportEvent::MembershipChanged(2))));
        drain(&mut b_rx);

        a.send(b"x", None).unwrap();
        assert!(matches!(drain(&mut b_rx).pop(), Some(TransportEvent::Received { .. })));
        assert!(drain(&mut a_rx).is_empty());

        hub.end_relay("service gone");
        assert!(matches!(drain(&mut b_rx).pop(), Some(TransportEvent::SessionInvalidated(_))));
        assert_eq!(hub.relay_members(), 0);
    }

    #[test]
    fn test_send_when_idle_fails() {
        let hub = MemoryHub::new();
        let transport = hub.transport(PeerInfo::new("A"), TransportKind::Direct);
        assert_eq!(transport.send(b"x", None), Err(TransportError::NotStarted));
    }
}
