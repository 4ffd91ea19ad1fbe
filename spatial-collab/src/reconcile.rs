//! The shared diagram set and the rules for changing it.
//!
//! Two entry points per operation:
//! - local (`share_diagram`, `remove_diagram`, ...): only a hosting device
//!   that may originate gets through; the change is applied here first and
//!   the envelope to broadcast is returned
//! - remote (`apply_*`): applied unconditionally, idempotent where the
//!   envelope carries enough to be
//!
//! Lookups by filename are fuzzy (see [`filenames_match`]); an exact match
//! always wins over a prefix match. Diagrams are values: an edit swaps in a
//! new `Diagram`, never mutates an element in place.

use spatial_core::{filenames_match, now_ms, Diagram, Element, Pose, PoseUpdate, Vec3};
use uuid::Uuid;

use crate::config::Role;
use crate::protocol::{ElementMove, Envelope, RemoveDiagram, TransformUpdate};

pub struct DiagramStore {
    role: Role,
    hosting: bool,
    diagrams: Vec<Diagram>,
}

impl DiagramStore {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            hosting: false,
            diagrams: Vec::new(),
        }
    }

    pub fn set_hosting(&mut self, hosting: bool) {
        self.hosting = hosting;
    }

    /// Whether local edits are allowed right now.
    pub fn can_originate(&self) -> bool {
        self.role == Role::CanOriginate && self.hosting
    }

    pub fn diagrams(&self) -> &[Diagram] {
        &self.diagrams
    }

    pub fn len(&self) -> usize {
        self.diagrams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagrams.is_empty()
    }

    /// Best match for `filename`: exact first, then fuzzy.
    pub fn find(&self, filename: &str) -> Option<&Diagram> {
        self.index_of(None, filename).map(|i| &self.diagrams[i])
    }

    pub fn get(&self, id: Uuid) -> Option<&Diagram> {
        self.diagrams.iter().find(|d| d.id == id)
    }

    // --- Local operations ---

    /// Share (or re-share) a diagram.
    ///
    /// Sharing a filename that already exists exactly refreshes that diagram
    /// in place and keeps its id, so the filename stays unique.
    pub fn share_diagram(&mut self, filename: &str, elements: Vec<Element>, pose: Option<Pose>) -> Option<Envelope> {
        if !self.guard("share_diagram") {
            return None;
        }
        if filename.is_empty() {
            log::warn!("Refusing to share a diagram with an empty filename");
            return None;
        }

        let diagram = match self.diagrams.iter().position(|d| d.filename == filename) {
            Some(i) => {
                let existing = &self.diagrams[i];
                let refreshed = Diagram {
                    id: existing.id,
                    filename: existing.filename.clone(),
                    elements,
                    timestamp_ms: now_ms(),
                    pose: pose.or(existing.pose),
                };
                log::info!("Re-sharing diagram {} ({})", filename, refreshed.id);
                self.diagrams[i] = refreshed.clone();
                refreshed
            }
            None => {
                let diagram = Diagram::new(filename, elements, pose);
                log::info!(
                    "Sharing diagram {} ({}, {} elements)",
                    filename,
                    diagram.id,
                    diagram.elements.len()
                );
                self.diagrams.push(diagram.clone());
                diagram
            }
        };

        let dangling = diagram.dangling_edges().len();
        if dangling > 0 {
            log::debug!("Diagram {} has {} dangling edges", diagram.filename, dangling);
        }
        Some(Envelope::Diagram(diagram))
    }

    /// Remove every diagram matching `filename`.
    ///
    /// Nothing is broadcast when nothing matched locally.
    pub fn remove_diagram(&mut self, filename: &str) -> Option<Envelope> {
        if !self.guard("remove_diagram") {
            return None;
        }
        let removed = self.remove_matching(filename);
        if removed == 0 {
            log::debug!("remove_diagram({}) matched nothing", filename);
            return None;
        }
        Some(Envelope::Remove(RemoveDiagram {
            filename: filename.to_string(),
        }))
    }

    pub fn update_diagram_transform(&mut self, filename: &str, update: PoseUpdate) -> Option<Envelope> {
        if !self.guard("update_diagram_transform") {
            return None;
        }
        if update.is_empty() {
            log::debug!("Empty transform update for {}; ignored", filename);
            return None;
        }
        let Some(i) = self.index_of(None, filename) else {
            log::warn!("update_diagram_transform: no diagram matches {}", filename);
            return None;
        };
        Self::apply_pose(&mut self.diagrams[i], &update);

        let diagram = &self.diagrams[i];
        Some(Envelope::TransformUpdate(TransformUpdate {
            filename: diagram.filename.clone(),
            diagram_id: Some(diagram.id),
            position: update.position,
            orientation: update.orientation,
            scale: update.scale,
        }))
    }

    pub fn update_element_position(&mut self, filename: &str, element_id: &str, position: Vec3) -> Option<Envelope> {
        if !self.guard("update_element_position") {
            return None;
        }
        let Some(i) = self.index_of(None, filename) else {
            log::warn!("update_element_position: no diagram matches {}", filename);
            return None;
        };
        let timestamp_ms = now_ms();
        let Some(updated) = self.diagrams[i].with_element_position(element_id, position, timestamp_ms) else {
            log::warn!("update_element_position: {} has no element {}", filename, element_id);
            return None;
        };
        let envelope = Envelope::ElementMove(ElementMove {
            filename: updated.filename.clone(),
            diagram_id: Some(updated.id),
            element_id: element_id.to_string(),
            position,
            timestamp_ms,
        });
        self.diagrams[i] = updated;
        Some(envelope)
    }

    // --- Remote application ---

    /// Upsert a received diagram by id. Returns `true` when it was new.
    ///
    /// A different id under the same exact filename is replaced, keeping
    /// filenames unique on this device too.
    pub fn apply_diagram(&mut self, diagram: Diagram) -> bool {
        if let Some(i) = self.diagrams.iter().position(|d| d.id == diagram.id) {
            self.diagrams[i] = diagram;
            return false;
        }
        if let Some(i) = self.diagrams.iter().position(|d| d.filename == diagram.filename) {
            log::debug!(
                "Diagram {} now has id {} (was {})",
                diagram.filename,
                diagram.id,
                self.diagrams[i].id
            );
            self.diagrams[i] = diagram;
            return true;
        }
        log::info!("Received diagram {} ({})", diagram.filename, diagram.id);
        self.diagrams.push(diagram);
        true
    }

    /// Returns the number of diagrams removed (0 is not an error).
    pub fn apply_remove(&mut self, remove: &RemoveDiagram) -> usize {
        let removed = self.remove_matching(&remove.filename);
        if removed == 0 {
            log::debug!("Remove for {} matched nothing", remove.filename);
        }
        removed
    }

    /// Returns `false` when no diagram matched.
    pub fn apply_transform(&mut self, update: &TransformUpdate) -> bool {
        let Some(i) = self.index_of(update.diagram_id, &update.filename) else {
            log::debug!("Transform for unknown diagram {}", update.filename);
            return false;
        };
        let pose_update = PoseUpdate {
            position: update.position,
            orientation: update.orientation,
            scale: update.scale,
        };
        Self::apply_pose(&mut self.diagrams[i], &pose_update);
        true
    }

    /// Returns `false` when the diagram or element is unknown.
    pub fn apply_element_move(&mut self, mv: &ElementMove) -> bool {
        let Some(i) = self.index_of(mv.diagram_id, &mv.filename) else {
            log::debug!("Element move for unknown diagram {}", mv.filename);
            return false;
        };
        match self.diagrams[i].with_element_position(&mv.element_id, mv.position, mv.timestamp_ms) {
            Some(updated) => {
                self.diagrams[i] = updated;
                true
            }
            None => {
                log::debug!("Element move for unknown element {} in {}", mv.element_id, mv.filename);
                false
            }
        }
    }

    pub fn clear(&mut self) {
        self.diagrams.clear();
    }

    // --- Internals ---

    fn guard(&self, op: &str) -> bool {
        if self.can_originate() {
            return true;
        }
        match self.role {
            Role::ReceiveOnly => log::warn!("{} refused: this device is receive-only", op),
            Role::CanOriginate => log::warn!("{} refused: not hosting", op),
        }
        false
    }

    fn remove_matching(&mut self, filename: &str) -> usize {
        let before = self.diagrams.len();
        self.diagrams.retain(|d| !filenames_match(filename, &d.filename));
        let removed = before - self.diagrams.len();
        if removed > 0 {
            log::info!("Removed {} diagram(s) matching {}", removed, filename);
        }
        removed
    }

    /// Id first, then exact filename, then the first fuzzy match.
    fn index_of(&self, id: Option<Uuid>, filename: &str) -> Option<usize> {
        if let Some(id) = id {
            if let Some(i) = self.diagrams.iter().position(|d| d.id == id) {
                return Some(i);
            }
        }
        self.diagrams
            .iter()
            .position(|d| !filename.is_empty() && d.filename == filename)
            .or_else(|| self.diagrams.iter().position(|d| filenames_match(filename, &d.filename)))
    }

    fn apply_pose(diagram: &mut Diagram, update: &PoseUpdate) {
        diagram.pose.get_or_insert(Pose::IDENTITY).apply(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spatial_core::{ElementKind, Quat};

    fn host_store() -> DiagramStore {
        let mut store = DiagramStore::new(Role::CanOriginate);
        store.set_hosting(true);
        store
    }

    fn tree() -> Vec<Element> {
        vec![
            Element::node("A", ElementKind::Box, Vec3::new(0.0, 0.0, 0.0)),
            Element::node("B", ElementKind::Sphere, Vec3::new(1.0, 0.0, 0.0)),
            Element::edge("A->B", "A", "B"),
        ]
    }

    #[test]
    fn test_share_returns_diagram_envelope() {
        let mut store = host_store();
        let envelope = store.share_diagram("tree", tree(), None).unwrap();
        let Envelope::Diagram(diagram) = envelope else { panic!("expected diagram") };
        assert_eq!(diagram.filename, "tree");
        assert_eq!(store.len(), 1);
        assert_eq!(store.diagrams()[0], diagram);
    }

    #[test]
    fn test_reshare_keeps_id_and_filename_unique() {
        let mut store = host_store();
        let Some(Envelope::Diagram(first)) = store.share_diagram("tree", tree(), None) else { panic!() };
        let Some(Envelope::Diagram(second)) = store.share_diagram("tree", vec![], None) else { panic!() };
        assert_eq!(first.id, second.id);
        assert_eq!(store.len(), 1);
        assert!(store.diagrams()[0].elements.is_empty());
    }

    #[test]
    fn test_receive_only_never_originates() {
        let mut store = DiagramStore::new(Role::ReceiveOnly);
        store.set_hosting(true);
        assert!(store.share_diagram("tree", tree(), None).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_not_hosting_never_originates() {
        let mut store = DiagramStore::new(Role::CanOriginate);
        assert!(store.share_diagram("tree", tree(), None).is_none());
        assert!(store.update_diagram_transform("tree", PoseUpdate::position(Vec3::ZERO)).is_none());
    }

    #[test]
    fn test_fuzzy_remove_matches_suffix() {
        let mut store = host_store();
        store.share_diagram("tree_1699999999", tree(), None);
        store.share_diagram("graph", tree(), None);

        let envelope = store.remove_diagram("tree").unwrap();
        assert_eq!(envelope, Envelope::Remove(RemoveDiagram { filename: "tree".into() }));
        assert_eq!(store.len(), 1);
        assert_eq!(store.diagrams()[0].filename, "graph");
    }

    #[test]
    fn test_remove_unmatched_broadcasts_nothing() {
        let mut store = host_store();
        store.share_diagram("graph", tree(), None);
        assert!(store.remove_diagram("tree").is_none());
        assert!(store.remove_diagram("").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_apply_remove_twice_is_idempotent() {
        let mut host = host_store();
        let mut client = DiagramStore::new(Role::ReceiveOnly);
        for filename in ["foo_1699999999", "bar"] {
            let Some(Envelope::Diagram(diagram)) = host.share_diagram(filename, tree(), None) else { panic!() };
            client.apply_diagram(diagram);
        }

        let remove = RemoveDiagram { filename: "foo".into() };
        assert_eq!(client.apply_remove(&remove), 1);
        let after_first = client.diagrams().to_vec();
        assert_eq!(client.apply_remove(&remove), 0);
        assert_eq!(client.diagrams(), after_first.as_slice());
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].filename, "bar");
    }

    #[test]
    fn test_fuzzy_remove_matches_prefix() {
        let mut store = host_store();
        store.share_diagram("foo", tree(), None);
        store.share_diagram("bar", tree(), None);

        assert!(store.remove_diagram("foo_1699999999").is_some());
        assert_eq!(store.len(), 1);
        assert_eq!(store.diagrams()[0].filename, "bar");
    }

    #[test]
    fn test_apply_remove_unknown_is_noop() {
        let mut store = DiagramStore::new(Role::ReceiveOnly);
        assert_eq!(store.apply_remove(&RemoveDiagram { filename: "nothing".into() }), 0);
    }

    #[test]
    fn test_exact_match_preferred() {
        let mut store = host_store();
        store.share_diagram("tree_2", tree(), None);
        store.share_diagram("tree", tree(), None);
        assert_eq!(store.find("tree").unwrap().filename, "tree");
        assert_eq!(store.find("tree_2").unwrap().filename, "tree_2");
    }

    #[test]
    fn test_partial_transform_leaves_other_fields() {
        let mut store = host_store();
        let pose = Pose {
            position: Vec3::new(1.0, 2.0, 3.0),
            orientation: Quat::from_yaw(0.5),
            scale: 2.0,
        };
        store.share_diagram("tree", tree(), Some(pose));

        let envelope = store.update_diagram_transform("tree", PoseUpdate::position(Vec3::new(9.0, 9.0, 9.0)));
        let Some(Envelope::TransformUpdate(update)) = envelope else { panic!() };
        assert!(update.orientation.is_none());
        assert!(update.scale.is_none());

        let result = store.find("tree").unwrap().pose.unwrap();
        assert_eq!(result.position, Vec3::new(9.0, 9.0, 9.0));
        assert_eq!(result.orientation, Quat::from_yaw(0.5));
        assert_eq!(result.scale, 2.0);
    }

    #[test]
    fn test_element_move_swaps_diagram() {
        let mut host = host_store();
        let mut client = DiagramStore::new(Role::ReceiveOnly);
        let Some(Envelope::Diagram(diagram)) = host.share_diagram("tree", tree(), None) else { panic!() };
        client.apply_diagram(diagram);

        let Some(Envelope::ElementMove(mv)) = host.update_element_position("tree", "B", Vec3::new(5.0, 5.0, 5.0))
        else {
            panic!()
        };
        assert!(client.apply_element_move(&mv));
        assert_eq!(client.diagrams(), host.diagrams());
        assert_eq!(client.find("tree").unwrap().element("B").unwrap().position, Vec3::new(5.0, 5.0, 5.0));
    }

    #[test]
    fn test_unknown_element_move_rejected() {
        let mut host = host_store();
        host.share_diagram("tree", tree(), None);
        assert!(host.update_element_position("tree", "Z", Vec3::ZERO).is_none());
    }

    #[test]
    fn test_apply_diagram_is_idempotent() {
        let mut host = host_store();
        let Some(Envelope::Diagram(diagram)) = host.share_diagram("tree", tree(), None) else { panic!() };

        let mut client = DiagramStore::new(Role::ReceiveOnly);
        assert!(client.apply_diagram(diagram.clone()));
        assert!(!client.apply_diagram(diagram.clone()));
        assert_eq!(client.len(), 1);
        assert_eq!(client.get(diagram.id), Some(&diagram));
    }

    #[test]
    fn test_transform_before_diagram_then_replay_converges() {
        let mut host = host_store();
        let Some(Envelope::Diagram(diagram)) = host.share_diagram("tree", tree(), None) else { panic!() };
        let Some(Envelope::TransformUpdate(update)) =
            host.update_diagram_transform("tree", PoseUpdate::position(Vec3::new(0.0, 1.0, 0.0)))
        else {
            panic!()
        };
        let latest = host.find("tree").unwrap().clone();

        // In order
        let mut a = DiagramStore::new(Role::ReceiveOnly);
        a.apply_diagram(diagram.clone());
        a.apply_transform(&update);

        // Transform first (dropped), then the diagram, then a replay
        let mut b = DiagramStore::new(Role::ReceiveOnly);
        assert!(!b.apply_transform(&update));
        b.apply_diagram(diagram);
        b.apply_transform(&update);

        assert_eq!(a.diagrams(), b.diagrams());
        assert_eq!(a.diagrams()[0].pose, latest.pose);
    }
}
