//! Session behavior over the in-memory hub: ownership rules, anchor
//! adoption, lifecycle transitions and relay participation.

use std::sync::{Arc, Mutex};

use spatial_collab::config::{Role, SessionConfig};
use spatial_collab::hooks::{SessionObserver, StaticPoseProvider};
use spatial_collab::protocol::Envelope;
use spatial_collab::session::{SessionBuilder, SessionHandle, SessionState};
use spatial_collab::transport::memory::{MemoryHub, MemoryTransport};
use spatial_collab::transport::{PeerInfo, Transport, TransportError, TransportEvent, TransportKind};
use spatial_collab::SessionAlert;
use spatial_core::{Diagram, Element, ElementKind, Matrix4, PoseUpdate, SharedAnchor, Vec3};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingObserver {
    blobs: Mutex<Vec<(Vec<u8>, String)>>,
    anchors: Mutex<Vec<SharedAnchor>>,
}

impl SessionObserver for RecordingObserver {
    fn on_opaque_blob(&self, data: &[u8], from: &PeerInfo) {
        self.blobs.lock().unwrap().push((data.to_vec(), from.name.clone()));
    }

    fn on_anchor(&self, anchor: &SharedAnchor) {
        self.anchors.lock().unwrap().push(anchor.clone());
    }
}

struct Device {
    handle: SessionHandle,
    info: PeerInfo,
    pose: Arc<StaticPoseProvider>,
    observer: Arc<RecordingObserver>,
}

fn device(hub: &MemoryHub, name: &str, role: Role, relay: bool) -> Device {
    device_on(hub, hub, name, role, relay)
}

/// Relay member that is not nearby: its direct transport sits on its own hub.
fn remote_device(hub: &MemoryHub, name: &str) -> Device {
    device_on(&MemoryHub::new(), hub, name, Role::ReceiveOnly, true)
}

fn device_on(direct_hub: &MemoryHub, hub: &MemoryHub, name: &str, role: Role, relay: bool) -> Device {
    let info = PeerInfo::new(name);
    let pose = Arc::new(StaticPoseProvider::new(Some(Matrix4::IDENTITY)));
    let observer = Arc::new(RecordingObserver::default());
    let mut builder = SessionBuilder::new(SessionConfig::for_testing(name).with_role(role))
        .direct_transport(Box::new(direct_hub.transport(info.clone(), TransportKind::Direct)))
        .pose_provider(pose.clone())
        .observer(observer.clone());
    if relay {
        builder = builder.relay_transport(Box::new(hub.transport(info.clone(), TransportKind::Relay)));
    }
    Device {
        handle: builder.spawn(),
        info,
        pose,
        observer,
    }
}

fn diagram_elements() -> Vec<Element> {
    vec![
        Element::node("A", ElementKind::Box, Vec3::new(0.0, 0.0, 0.0)),
        Element::node("B", ElementKind::Box, Vec3::new(1.0, 0.0, 0.0)),
        Element::edge("A->B", "A", "B"),
    ]
}

/// Host with one connected receive-only client.
async fn hosted_pair(hub: &MemoryHub) -> (Device, Device) {
    let host = device(hub, "Host", Role::CanOriginate, false);
    let client = device(hub, "Client", Role::ReceiveOnly, false);
    host.handle.start_hosting().await.unwrap();
    client.handle.join_session().await.unwrap();
    host.handle
        .wait_for(WAIT, |s| s.connected_peers.len() == 1)
        .await
        .expect("host never connected");
    client
        .handle
        .wait_for(WAIT, |s| s.state == SessionState::Active)
        .await
        .expect("client never connected");
    (host, client)
}

async fn next_envelope(events: &mut mpsc::Receiver<TransportEvent>) -> Envelope {
    loop {
        let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let TransportEvent::Received { bytes, .. } = event {
            return Envelope::decode(&bytes).unwrap();
        }
    }
}

#[tokio::test]
async fn test_non_host_edits_are_rejected() {
    let hub = MemoryHub::new();
    let (host, client) = hosted_pair(&hub).await;
    host.handle.share_diagram("tree", diagram_elements(), None).await.unwrap();
    client.handle.wait_for(WAIT, |s| s.diagrams.len() == 1).await.unwrap();

    assert_eq!(client.handle.share_diagram("other", diagram_elements(), None).await.unwrap(), None);
    assert!(!client.handle.remove_diagram("tree").await.unwrap());
    assert!(!client
        .handle
        .update_diagram_transform("tree", PoseUpdate::position(Vec3::new(5.0, 0.0, 0.0)))
        .await
        .unwrap());
    assert!(!client
        .handle
        .update_element_position("tree", "A", Vec3::new(9.0, 9.0, 9.0))
        .await
        .unwrap());
    assert!(client.handle.broadcast_current_anchor(1.0).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.handle.snapshot().diagrams, host.handle.snapshot().diagrams);
    assert_eq!(host.handle.snapshot().diagrams[0].element("A").unwrap().position, Vec3::new(0.0, 0.0, 0.0));
}

#[tokio::test]
async fn test_element_move_replicates_exactly() {
    let hub = MemoryHub::new();
    let (host, client) = hosted_pair(&hub).await;
    host.handle.share_diagram("tree", diagram_elements(), None).await.unwrap();

    assert!(host
        .handle
        .update_element_position("tree", "B", Vec3::new(2.0, 0.5, 0.0))
        .await
        .unwrap());
    let expected: Vec<Diagram> = host.handle.snapshot().diagrams.clone();
    let snapshot = client
        .handle
        .wait_for(WAIT, |s| s.diagrams == expected)
        .await
        .expect("element move never replicated");
    assert_eq!(snapshot.diagrams[0].element("B").unwrap().position, Vec3::new(2.0, 0.5, 0.0));
}

#[tokio::test]
async fn test_anchor_last_writer_wins_on_client() {
    let hub = MemoryHub::new();
    let (host, client) = hosted_pair(&hub).await;

    host.pose.set_pose(Some(Matrix4::from_translation(Vec3::new(1.0, 0.0, 0.0))));
    let first = host.handle.broadcast_current_anchor(0.9).await.unwrap().unwrap();
    host.pose.set_pose(Some(Matrix4::from_translation(Vec3::new(-1.0, 0.0, 0.0))));
    let second = host.handle.broadcast_current_anchor(0.3).await.unwrap().unwrap();
    assert_ne!(first.id, second.id);

    let snapshot = client
        .handle
        .wait_for(WAIT, |s| s.anchor.as_ref().map(|a| a.id) == Some(second.id))
        .await
        .expect("lower-confidence anchor was not adopted");
    assert_eq!(snapshot.anchor.as_ref().unwrap().confidence, 0.3);

    let seen = client.observer.anchors.lock().unwrap().clone();
    assert_eq!(seen.iter().map(|a| a.id).collect::<Vec<_>>(), vec![first.id, second.id]);
}

#[tokio::test]
async fn test_stop_session_clears_client() {
    let hub = MemoryHub::new();
    let (host, client) = hosted_pair(&hub).await;
    let mut alerts = client.handle.alerts();
    host.handle.share_diagram("tree", diagram_elements(), None).await.unwrap();
    client
        .handle
        .wait_for(WAIT, |s| s.diagrams.len() == 1 && s.anchor.is_some())
        .await
        .unwrap();

    host.handle.stop_session().await.unwrap();

    let alert = timeout(WAIT, alerts.recv()).await.unwrap().unwrap();
    assert_eq!(alert.title(), "Session Ended");
    let snapshot = client
        .handle
        .wait_for(WAIT, |s| s.diagrams.is_empty() && s.anchor.is_none() && s.connected_peers.is_empty())
        .await
        .expect("client state not cleared");
    assert_eq!(snapshot.state, SessionState::Joining);

    let host_view = host.handle.snapshot();
    assert_eq!(host_view.state, SessionState::Idle);
    assert!(host_view.diagrams.is_empty());
}

#[tokio::test]
async fn test_last_peer_leaving_keeps_hosting() {
    let hub = MemoryHub::new();
    let (host, client) = hosted_pair(&hub).await;
    host.handle.share_diagram("tree", diagram_elements(), None).await.unwrap();
    client.handle.wait_for(WAIT, |s| s.diagrams.len() == 1).await.unwrap();
    let before = host.handle.snapshot().diagrams.clone();
    let mut alerts = host.handle.alerts();

    hub.disconnect(host.info.peer_id, client.info.peer_id);

    let snapshot = host
        .handle
        .wait_for(WAIT, |s| s.connected_peers.is_empty())
        .await
        .unwrap();
    assert_eq!(snapshot.state, SessionState::Hosting);
    assert_eq!(snapshot.status, "Hosting, waiting for peers");
    assert_eq!(snapshot.diagrams, before);
    assert_eq!(
        timeout(WAIT, alerts.recv()).await.unwrap().unwrap(),
        SessionAlert::ParticipantLeft {
            peer_name: "Client".into()
        }
    );

    let client_view = client
        .handle
        .wait_for(WAIT, |s| s.connected_peers.is_empty())
        .await
        .unwrap();
    assert_eq!(client_view.state, SessionState::Joining);
}

#[tokio::test]
async fn test_permission_error_resets_client_but_keeps_content() {
    let hub = MemoryHub::new();
    let (host, client) = hosted_pair(&hub).await;
    host.handle.share_diagram("tree", diagram_elements(), None).await.unwrap();
    client
        .handle
        .wait_for(WAIT, |s| s.diagrams.len() == 1 && s.anchor.is_some())
        .await
        .unwrap();

    hub.inject_error(
        client.info.peer_id,
        TransportKind::Direct,
        TransportError::PermissionDenied("local network".into()),
    );

    let snapshot = client
        .handle
        .wait_for(WAIT, |s| s.state == SessionState::Idle)
        .await
        .unwrap();
    assert!(snapshot.status.contains("permission"));
    assert!(snapshot.connected_peers.is_empty());
    assert_eq!(snapshot.diagrams.len(), 1);
    assert!(snapshot.anchor.is_some());

    // The host lost its only peer
    host.handle
        .wait_for(WAIT, |s| s.state == SessionState::Hosting)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_resync_sends_diagrams_before_anchor() {
    let hub = MemoryHub::new();
    let host = device(&hub, "Host", Role::CanOriginate, false);
    host.handle.start_hosting().await.unwrap();
    host.handle.share_diagram("one", diagram_elements(), None).await.unwrap();
    host.handle.share_diagram("two", diagram_elements(), None).await.unwrap();

    let mut probe: MemoryTransport = hub.transport(PeerInfo::new("Probe"), TransportKind::Direct);
    let mut events = probe.take_event_rx().unwrap();
    probe.start_browsing().unwrap();

    let tags: Vec<&'static str> = [
        next_envelope(&mut events).await,
        next_envelope(&mut events).await,
        next_envelope(&mut events).await,
    ]
    .iter()
    .map(|e| e.tag())
    .collect();
    assert_eq!(tags, vec!["diagram", "diagram", "anchor"]);
}

#[tokio::test]
async fn test_host_ignores_structural_envelopes_from_peers() {
    let hub = MemoryHub::new();
    let host = device(&hub, "Host", Role::CanOriginate, false);
    host.handle.start_hosting().await.unwrap();

    let mut rogue = hub.transport(PeerInfo::new("Rogue"), TransportKind::Direct);
    let _events = rogue.take_event_rx();
    rogue.start_browsing().unwrap();
    host.handle
        .wait_for(WAIT, |s| s.connected_peers.len() == 1)
        .await
        .unwrap();

    let forged = Envelope::Diagram(Diagram::new("forged", diagram_elements(), None));
    rogue.send(&forged.encode().unwrap(), None).unwrap();
    let blob = Envelope::OpaqueBlob(spatial_collab::protocol::OpaqueBlob { data: vec![1, 2, 3] });
    rogue.send(&blob.encode().unwrap(), None).unwrap();

    // The blob is processed after the forged diagram
    for _ in 0..100 {
        if !host.observer.blobs.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(host.observer.blobs.lock().unwrap().clone(), vec![(vec![1, 2, 3], "Rogue".to_string())]);
    assert!(host.handle.snapshot().diagrams.is_empty());
}

#[tokio::test]
async fn test_reshare_keeps_identity_on_client() {
    let hub = MemoryHub::new();
    let (host, client) = hosted_pair(&hub).await;
    let id = host.handle.share_diagram("tree", diagram_elements(), None).await.unwrap().unwrap();

    let mut smaller = diagram_elements();
    smaller.truncate(1);
    let again = host.handle.share_diagram("tree", smaller, None).await.unwrap().unwrap();
    assert_eq!(id, again);

    let snapshot = client
        .handle
        .wait_for(WAIT, |s| s.diagrams.len() == 1 && s.diagrams[0].elements.len() == 1)
        .await
        .unwrap();
    assert_eq!(snapshot.diagrams[0].id, id);
}

#[tokio::test]
async fn test_opaque_blob_reaches_observer() {
    let hub = MemoryHub::new();
    let (host, client) = hosted_pair(&hub).await;

    host.handle.send_opaque_blob(b"collaboration-data".to_vec()).await.unwrap();
    for _ in 0..100 {
        if !client.observer.blobs.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let blobs = client.observer.blobs.lock().unwrap().clone();
    assert_eq!(blobs, vec![(b"collaboration-data".to_vec(), "Host".to_string())]);
}

#[tokio::test]
async fn test_relay_participation_keeps_session_active() {
    let hub = MemoryHub::new();
    let host = device(&hub, "Host", Role::CanOriginate, true);
    let nearby = device(&hub, "Nearby", Role::ReceiveOnly, false);
    let remote = remote_device(&hub, "Remote");

    host.handle.start_hosting().await.unwrap();
    host.handle.share_diagram("tree", diagram_elements(), None).await.unwrap();
    nearby.handle.join_session().await.unwrap();
    remote.handle.join_session().await.unwrap();

    host.handle
        .wait_for(WAIT, |s| s.relay_participants == 2 && s.connected_peers.len() == 1)
        .await
        .expect("host never saw both channels");
    remote
        .handle
        .wait_for(WAIT, |s| s.diagrams.len() == 1 && s.anchor.is_some())
        .await
        .expect("relay member never resynced");

    // Losing the only direct peer leaves the relay group, so still active
    hub.disconnect(host.info.peer_id, nearby.info.peer_id);
    let snapshot = host
        .handle
        .wait_for(WAIT, |s| s.connected_peers.is_empty())
        .await
        .unwrap();
    assert_eq!(snapshot.state, SessionState::Active);

    // Ending the relay group leaves nothing
    hub.end_relay("group closed");
    let snapshot = host.handle.wait_for(WAIT, |s| !s.relay_active).await.unwrap();
    assert_eq!(snapshot.state, SessionState::Hosting);
}

#[tokio::test]
async fn test_second_join_is_noop() {
    let hub = MemoryHub::new();
    let client = device(&hub, "Client", Role::ReceiveOnly, false);
    client.handle.join_session().await.unwrap();
    client.handle.join_session().await.unwrap();
    assert_eq!(client.handle.snapshot().state, SessionState::Joining);
    assert_eq!(hub.links_of(client.info.peer_id).len(), 0);
}
