//! The shared map: keyframes and map points in generational arenas behind a
//! single exclusive mutation lock.
//!
//! Cross-references between keyframes and map points are `(index, generation)`
//! handles; chasing one requires the lock and is fallible. The `replaced_by`
//! relation on map points is resolved lazily through [`MapInner::resolve`].

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{Isometry3, Point3};
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use spoor_types::{FrameId, KeyframeId, MyFloat};

use crate::frame::{Descriptor, Frame, KeyPoint};
use crate::map_point::MapPoint;

/// Covisibility edges below this weight are kept only when a keyframe would
/// otherwise be disconnected.
const COVISIBILITY_MIN_WEIGHT: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Handle {
    index: u32,
    generation: u32,
}

/// Handle to a keyframe slot in the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyFrameHandle(Handle);

/// Handle to a map-point slot in the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapPointHandle(Handle);

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    fn insert(&mut self, value: T) -> Handle {
        self.len += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.value = Some(value);
                Handle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    value: Some(value),
                });
                Handle {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn get(&self, h: Handle) -> Option<&T> {
        let slot = self.slots.get(h.index as usize)?;
        if slot.generation != h.generation {
            return None;
        }
        slot.value.as_ref()
    }

    fn get_mut(&mut self, h: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(h.index as usize)?;
        if slot.generation != h.generation {
            return None;
        }
        slot.value.as_mut()
    }

    fn remove(&mut self, h: Handle) -> Option<T> {
        let slot = self.slots.get_mut(h.index as usize)?;
        if slot.generation != h.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(h.index);
        self.len -= 1;
        Some(value)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value.as_ref().map(|v| {
                (
                    Handle {
                        index: i as u32,
                        generation: slot.generation,
                    },
                    v,
                )
            })
        })
    }

    fn clear(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(i as u32);
            }
        }
        self.len = 0;
    }
}

/// A promoted frame: a vertex of the covisibility graph.
#[derive(Debug, Clone)]
pub struct KeyFrame {
    pub kf_id: KeyframeId,
    pub frame_id: FrameId,
    pub pose: Isometry3<MyFloat>,
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    /// per-keypoint depth; empty for sensors without depth
    pub depths: Vec<MyFloat>,
    pub mappoints: Vec<Option<MapPointHandle>>,
    /// covisible keyframe -> shared map-point count
    pub connections: BTreeMap<KeyFrameHandle, usize>,
    /// covisible keyframes, heaviest first
    pub ordered_neighbors: Vec<KeyFrameHandle>,
    pub parent: Option<KeyFrameHandle>,
    pub children: BTreeSet<KeyFrameHandle>,
}

impl KeyFrame {
    /// Promote a frame. Returns `None` if the frame has no pose yet.
    pub fn from_frame(frame: &Frame, kf_id: KeyframeId) -> Option<KeyFrame> {
        let pose = frame.pose?;
        Some(KeyFrame {
            kf_id,
            frame_id: frame.id,
            pose,
            keypoints: frame.keypoints.clone(),
            descriptors: frame.descriptors.clone(),
            depths: frame.depths.clone().unwrap_or_default(),
            mappoints: vec![None; frame.len()],
            connections: BTreeMap::new(),
            ordered_neighbors: Vec::new(),
            parent: None,
            children: BTreeSet::new(),
        })
    }

    pub fn camera_center(&self) -> Point3<MyFloat> {
        spoor_mvg::camera_center(&self.pose)
    }
}

/// Map contents. Only reachable through [`Map::lock`].
#[derive(Debug)]
pub struct MapInner {
    keyframes: Arena<KeyFrame>,
    mappoints: Arena<MapPoint>,
    /// insertion order, used by relocalization and trajectory recovery
    keyframe_order: Vec<KeyFrameHandle>,
    reference_mappoints: Vec<MapPointHandle>,
    next_kf_id: u64,
}

impl MapInner {
    fn new() -> Self {
        MapInner {
            keyframes: Arena::new(),
            mappoints: Arena::new(),
            keyframe_order: Vec::new(),
            reference_mappoints: Vec::new(),
            next_kf_id: 0,
        }
    }

    /// Allocate the next keyframe id. Ids stay monotone across `clear()`.
    pub fn next_keyframe_id(&mut self) -> KeyframeId {
        let id = KeyframeId(self.next_kf_id);
        self.next_kf_id += 1;
        id
    }

    pub fn add_keyframe(&mut self, kf: KeyFrame) -> KeyFrameHandle {
        let h = KeyFrameHandle(self.keyframes.insert(kf));
        self.keyframe_order.push(h);
        h
    }

    pub fn add_mappoint(&mut self, mp: MapPoint) -> MapPointHandle {
        MapPointHandle(self.mappoints.insert(mp))
    }

    pub fn keyframe(&self, h: KeyFrameHandle) -> Option<&KeyFrame> {
        self.keyframes.get(h.0)
    }

    pub fn keyframe_mut(&mut self, h: KeyFrameHandle) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(h.0)
    }

    pub fn mappoint(&self, h: MapPointHandle) -> Option<&MapPoint> {
        self.mappoints.get(h.0)
    }

    pub fn mappoint_mut(&mut self, h: MapPointHandle) -> Option<&mut MapPoint> {
        self.mappoints.get_mut(h.0)
    }

    pub fn keyframes_in_map(&self) -> usize {
        self.keyframes.len()
    }

    pub fn mappoints_in_map(&self) -> usize {
        self.mappoints.len()
    }

    /// Live keyframes in insertion order.
    pub fn all_keyframes(&self) -> Vec<KeyFrameHandle> {
        self.keyframe_order
            .iter()
            .copied()
            .filter(|h| self.keyframes.get(h.0).is_some())
            .collect()
    }

    pub fn all_mappoints(&self) -> Vec<MapPointHandle> {
        self.mappoints.iter().map(|(h, _)| MapPointHandle(h)).collect()
    }

    pub fn set_reference_mappoints(&mut self, v: Vec<MapPointHandle>) {
        self.reference_mappoints = v;
    }

    pub fn reference_mappoints(&self) -> &[MapPointHandle] {
        &self.reference_mappoints
    }

    /// Drop everything. Keyframe ids continue monotonically.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.mappoints.clear();
        self.keyframe_order.clear();
        self.reference_mappoints.clear();
        debug!("map cleared");
    }

    /// Chase `replaced_by` links and drop bad points. The result either has
    /// no `replaced_by` link or is `None`, so a second application is a
    /// no-op.
    pub fn resolve(&self, h: MapPointHandle) -> Option<MapPointHandle> {
        let mut current = h;
        for _ in 0..16 {
            let mp = self.mappoints.get(current.0)?;
            match mp.replaced_by {
                Some(next) => current = next,
                None => return (!mp.bad).then_some(current),
            }
        }
        None
    }

    /// Record that keypoint `idx` of `kf_h` observes `mp_h`, on both sides.
    pub fn add_observation(&mut self, kf_h: KeyFrameHandle, idx: usize, mp_h: MapPointHandle) {
        let Some(kf) = self.keyframes.get_mut(kf_h.0) else {
            return;
        };
        if idx >= kf.mappoints.len() {
            return;
        }
        let Some(mp) = self.mappoints.get_mut(mp_h.0) else {
            return;
        };
        kf.mappoints[idx] = Some(mp_h);
        mp.observations.insert(kf_h, idx);
        if mp.ref_keyframe.is_none() {
            mp.ref_keyframe = Some(kf_h);
        }
    }

    /// Remove the observation held by keypoint `idx` of `kf_h`, on both
    /// sides. A point losing its last observation is marked bad.
    pub fn erase_observation(&mut self, kf_h: KeyFrameHandle, idx: usize) {
        let Some(kf) = self.keyframes.get_mut(kf_h.0) else {
            return;
        };
        let Some(mp_h) = kf.mappoints.get_mut(idx).and_then(|slot| slot.take()) else {
            return;
        };
        if let Some(mp) = self.mappoints.get_mut(mp_h.0) {
            mp.observations.remove(&kf_h);
            if mp.ref_keyframe == Some(kf_h) {
                mp.ref_keyframe = mp.observations.keys().next().copied();
            }
            if mp.observations.is_empty() {
                mp.bad = true;
            }
        }
    }

    /// Map points of `kf_h` observed by at least `min_obs` keyframes.
    pub fn tracked_mappoints(&self, kf_h: KeyFrameHandle, min_obs: usize) -> usize {
        let Some(kf) = self.keyframes.get(kf_h.0) else {
            return 0;
        };
        kf.mappoints
            .iter()
            .flatten()
            .filter_map(|h| self.mappoints.get(h.0))
            .filter(|mp| !mp.bad && mp.n_observations() >= min_obs)
            .count()
    }

    /// Recompute covisibility edges of `kf_h` from its current observations
    /// and mirror them on the neighbors. Attaches the keyframe to the
    /// spanning tree on first connection.
    pub fn update_connections(&mut self, kf_h: KeyFrameHandle) {
        let mut counter: BTreeMap<KeyFrameHandle, usize> = BTreeMap::new();
        {
            let Some(kf) = self.keyframes.get(kf_h.0) else {
                return;
            };
            for mp_h in kf.mappoints.iter().flatten() {
                let Some(mp) = self.mappoints.get(mp_h.0) else {
                    continue;
                };
                if mp.bad {
                    continue;
                }
                for (&other, _) in &mp.observations {
                    if other != kf_h {
                        *counter.entry(other).or_insert(0) += 1;
                    }
                }
            }
        }

        let mut edges: BTreeMap<KeyFrameHandle, usize> = counter
            .iter()
            .filter(|(_, w)| **w >= COVISIBILITY_MIN_WEIGHT)
            .map(|(h, w)| (*h, *w))
            .collect();
        if edges.is_empty() {
            let strongest = counter
                .iter()
                .max_by_key(|(_, w)| **w)
                .map(|(h, w)| (*h, *w));
            if let Some((best, w)) = strongest {
                edges.insert(best, w);
            }
        }

        for (&other, &weight) in &edges {
            if let Some(neighbor) = self.keyframes.get_mut(other.0) {
                neighbor.connections.insert(kf_h, weight);
                neighbor.ordered_neighbors = ordered_by_weight(&neighbor.connections);
            }
        }

        let best_neighbor = edges.iter().max_by_key(|(_, w)| **w).map(|(h, _)| *h);
        let mut new_parent = None;
        if let Some(kf) = self.keyframes.get_mut(kf_h.0) {
            kf.connections = edges;
            kf.ordered_neighbors = ordered_by_weight(&kf.connections);
            if kf.parent.is_none() {
                if let Some(best) = best_neighbor {
                    kf.parent = Some(best);
                    new_parent = Some(best);
                }
            }
        }
        if let Some(parent) = new_parent {
            if let Some(p) = self.keyframes.get_mut(parent.0) {
                p.children.insert(kf_h);
            }
        }
    }

    /// Erase a keyframe: drop its observations, detach it from the
    /// covisibility graph and reparent its spanning-tree children.
    pub fn remove_keyframe(&mut self, h: KeyFrameHandle) {
        let Some(kf) = self.keyframes.get(h.0) else {
            return;
        };
        let slots: Vec<MapPointHandle> = kf.mappoints.iter().flatten().copied().collect();
        let neighbors: Vec<KeyFrameHandle> = kf.connections.keys().copied().collect();
        let parent = kf.parent;
        let children: Vec<KeyFrameHandle> = kf.children.iter().copied().collect();

        for mp_h in slots {
            if let Some(mp) = self.mappoints.get_mut(mp_h.0) {
                mp.observations.remove(&h);
                if mp.ref_keyframe == Some(h) {
                    mp.ref_keyframe = mp.observations.keys().next().copied();
                }
                if mp.observations.is_empty() {
                    mp.bad = true;
                }
            }
        }
        for n in neighbors {
            if let Some(neighbor) = self.keyframes.get_mut(n.0) {
                neighbor.connections.remove(&h);
                neighbor.ordered_neighbors = ordered_by_weight(&neighbor.connections);
            }
        }
        for c in children {
            if let Some(child) = self.keyframes.get_mut(c.0) {
                child.parent = parent;
            }
            if let Some(parent) = parent {
                if let Some(p) = self.keyframes.get_mut(parent.0) {
                    p.children.insert(c);
                }
            }
        }
        if let Some(parent) = parent {
            if let Some(p) = self.keyframes.get_mut(parent.0) {
                p.children.remove(&h);
            }
        }
        self.keyframe_order.retain(|x| *x != h);
        self.keyframes.remove(h.0);
    }

    /// Erase a map point and every slot that references it.
    pub fn remove_mappoint(&mut self, h: MapPointHandle) {
        let Some(mp) = self.mappoints.get(h.0) else {
            return;
        };
        let obs: Vec<(KeyFrameHandle, usize)> =
            mp.observations.iter().map(|(&k, &i)| (k, i)).collect();
        for (kf_h, idx) in obs {
            if let Some(kf) = self.keyframes.get_mut(kf_h.0) {
                if kf.mappoints.get(idx).copied().flatten() == Some(h) {
                    kf.mappoints[idx] = None;
                }
            }
        }
        self.mappoints.remove(h.0);
    }

    /// Replace `old` by `new`: migrate observations and counters, mark `old`
    /// bad and leave a `replaced_by` link for lazy chasing. The `old` slot
    /// stays in the arena so stale handles still resolve.
    pub fn replace_mappoint(&mut self, old: MapPointHandle, new: MapPointHandle) {
        if old == new {
            return;
        }
        let (obs, visible, found) = {
            let Some(mp) = self.mappoints.get_mut(old.0) else {
                return;
            };
            mp.bad = true;
            mp.replaced_by = Some(new);
            (
                std::mem::take(&mut mp.observations),
                mp.visible,
                mp.found,
            )
        };
        for (&kf_h, &idx) in &obs {
            let already = self
                .mappoints
                .get(new.0)
                .map(|mp| mp.observations.contains_key(&kf_h))
                .unwrap_or(true);
            if already {
                if let Some(kf) = self.keyframes.get_mut(kf_h.0) {
                    if kf.mappoints.get(idx).copied().flatten() == Some(old) {
                        kf.mappoints[idx] = None;
                    }
                }
            } else {
                self.add_observation(kf_h, idx, new);
            }
        }
        if let Some(mp) = self.mappoints.get_mut(new.0) {
            mp.increase_visible(visible);
            mp.increase_found(found);
        }
    }
}

fn ordered_by_weight(connections: &BTreeMap<KeyFrameHandle, usize>) -> Vec<KeyFrameHandle> {
    let mut v: Vec<(KeyFrameHandle, usize)> = connections.iter().map(|(&h, &w)| (h, w)).collect();
    v.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    v.into_iter().map(|(h, _)| h).collect()
}

/// The shared map. One exclusive mutation lock guards all contents; the
/// tracking thread holds it for the full duration of a `track()` call while
/// local mapping takes it around each structural mutation.
#[derive(Debug, Default)]
pub struct Map {
    inner: Mutex<MapInner>,
}

impl Default for MapInner {
    fn default() -> Self {
        Self::new()
    }
}

impl Map {
    pub fn new() -> Map {
        Map {
            inner: Mutex::new(MapInner::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, MapInner> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Descriptor;
    use nalgebra::Point3;

    fn dummy_kf(map: &mut MapInner, n_slots: usize) -> KeyFrameHandle {
        let kf_id = map.next_keyframe_id();
        map.add_keyframe(KeyFrame {
            kf_id,
            frame_id: FrameId(kf_id.0 + 1),
            pose: Isometry3::identity(),
            keypoints: Vec::new(),
            descriptors: Vec::new(),
            depths: Vec::new(),
            mappoints: vec![None; n_slots],
            connections: BTreeMap::new(),
            ordered_neighbors: Vec::new(),
            parent: None,
            children: BTreeSet::new(),
        })
    }

    fn dummy_mp(map: &mut MapInner) -> MapPointHandle {
        map.add_mappoint(MapPoint::new(Point3::new(0.0, 0.0, 1.0), Descriptor([0; 32])))
    }

    #[test]
    fn stale_handles_do_not_resolve_after_removal() {
        let mut map = MapInner::new();
        let h = dummy_mp(&mut map);
        assert!(map.mappoint(h).is_some());
        map.remove_mappoint(h);
        assert!(map.mappoint(h).is_none());
        // the slot is reused with a fresh generation
        let h2 = dummy_mp(&mut map);
        assert!(map.mappoint(h).is_none());
        assert!(map.mappoint(h2).is_some());
    }

    #[test]
    fn observations_stay_symmetric() {
        let mut map = MapInner::new();
        let kf = dummy_kf(&mut map, 4);
        let mp = dummy_mp(&mut map);
        map.add_observation(kf, 2, mp);
        assert_eq!(map.keyframe(kf).unwrap().mappoints[2], Some(mp));
        assert_eq!(map.mappoint(mp).unwrap().observations.get(&kf), Some(&2));

        map.erase_observation(kf, 2);
        assert_eq!(map.keyframe(kf).unwrap().mappoints[2], None);
        assert!(map.mappoint(mp).unwrap().observations.is_empty());
        assert!(map.mappoint(mp).unwrap().bad);
    }

    #[test]
    fn replacement_chase_is_idempotent_after_one_application() {
        let mut map = MapInner::new();
        let kf = dummy_kf(&mut map, 4);
        let a = dummy_mp(&mut map);
        let b = dummy_mp(&mut map);
        map.add_observation(kf, 0, a);
        map.replace_mappoint(a, b);

        let once = map.resolve(a);
        assert_eq!(once, Some(b));
        let twice = once.and_then(|h| map.resolve(h));
        assert_eq!(twice, once);
        // the observation migrated
        assert_eq!(map.keyframe(kf).unwrap().mappoints[0], Some(b));
        assert_eq!(map.mappoint(b).unwrap().observations.get(&kf), Some(&0));
    }

    #[test]
    fn keyframe_removal_reparents_children() {
        let mut map = MapInner::new();
        let a = dummy_kf(&mut map, 0);
        let b = dummy_kf(&mut map, 0);
        let c = dummy_kf(&mut map, 0);
        map.keyframe_mut(b).unwrap().parent = Some(a);
        map.keyframe_mut(a).unwrap().children.insert(b);
        map.keyframe_mut(c).unwrap().parent = Some(b);
        map.keyframe_mut(b).unwrap().children.insert(c);

        map.remove_keyframe(b);
        assert_eq!(map.keyframe(c).unwrap().parent, Some(a));
        assert!(map.keyframe(a).unwrap().children.contains(&c));
        assert_eq!(map.all_keyframes(), vec![a, c]);
    }

    #[test]
    fn clear_keeps_keyframe_ids_monotone() {
        let mut map = MapInner::new();
        let first = map.next_keyframe_id();
        dummy_kf(&mut map, 0);
        map.clear();
        assert_eq!(map.keyframes_in_map(), 0);
        let after = map.next_keyframe_id();
        assert!(after > first);
    }
}
