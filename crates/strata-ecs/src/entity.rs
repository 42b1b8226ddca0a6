//! Entity identifiers, handles and locations.
//!
//! An [`EntityId`] is a 64-bit handle that packs a *generation* counter in the
//! high 32 bits and an *index* in the low 32 bits. The generation is bumped
//! every time an index is recycled, which allows immediate stale-ID detection.
//!
//! An [`Entity`] is the caller-owned token for one live id. It is neither
//! `Clone` nor `Copy`: exactly one handle exists per spawned entity, and it
//! owns the entity's row. [`World::despawn`](crate::world::World::despawn)
//! consumes it eagerly; simply dropping it queues the id on its world, which
//! removes the row at its next `&mut` call. Archetype rows refer back to their
//! entity by [`EntityId`], so moving a handle around (into a `Vec`, across a
//! function boundary) never invalidates anything.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::archetype::ArchetypeId;
use crate::EcsError;

// ---------------------------------------------------------------------------
// WorldId
// ---------------------------------------------------------------------------

/// Identifies one world. Registries, bundles and handles carry it so that
/// nothing built for one world is ever resolved against another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorldId(u64);

impl WorldId {
    /// A process-unique id.
    pub(crate) fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "world#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A generational entity identifier.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// Construct an `EntityId` from an index and generation.
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The index portion (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation portion (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// DroppedHandles
// ---------------------------------------------------------------------------

/// Ids whose handles were dropped without an explicit despawn, shared
/// between a world and every handle it issued.
#[derive(Debug)]
pub(crate) struct DroppedHandles {
    world: WorldId,
    ids: Mutex<Vec<EntityId>>,
}

impl DroppedHandles {
    pub(crate) fn new(world: WorldId) -> Self {
        Self {
            world,
            ids: Mutex::new(Vec::new()),
        }
    }

    // A panic while holding the lock cannot leave the Vec half-updated.
    fn lock(&self) -> MutexGuard<'_, Vec<EntityId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, id: EntityId) {
        self.lock().push(id);
    }

    /// Drain every queued id.
    pub(crate) fn take(&self) -> Vec<EntityId> {
        std::mem::take(&mut *self.lock())
    }

    /// Copy of the queued ids, leaving the queue intact.
    pub(crate) fn pending(&self) -> Vec<EntityId> {
        self.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn contains(&self, id: EntityId) -> bool {
        self.lock().contains(&id)
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// Owning handle to one spawned entity.
///
/// Dropping the handle despawns the entity: its id is queued on the world,
/// which hides the row from queries at once and removes it (dropping every
/// component) at the start of its next `&mut` operation.
#[must_use = "dropping an entity handle despawns the entity"]
pub struct Entity {
    id: EntityId,
    world: WorldId,
    /// `None` once the handle has been despawned explicitly.
    owner: Option<Arc<DroppedHandles>>,
}

impl Entity {
    pub(crate) fn new(id: EntityId, owner: Arc<DroppedHandles>) -> Self {
        Self {
            id,
            world: owner.world,
            owner: Some(owner),
        }
    }

    /// The id stored in archetype backrefs and yielded by queries.
    #[inline]
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// The world that spawned this entity.
    #[inline]
    pub fn world(&self) -> WorldId {
        self.world
    }

    /// Consume the handle without queueing it; the caller despawns the id.
    pub(crate) fn disarm(mut self) -> EntityId {
        self.owner = None;
        self.id
    }
}

impl Drop for Entity {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.push(self.id);
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.world == other.world
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.world.hash(state);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", self.id)
    }
}

/// Where an attached entity's row lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityLocation {
    pub archetype: ArchetypeId,
    pub row: usize,
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Slot {
    generation: u32,
    alive: bool,
}

/// Hands out [`EntityId`]s and recycles freed indices.
///
/// Freed indices wait in a FIFO queue, so a recycled index has been idle for
/// as long as possible before its next generation is issued.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    slots: Vec<Slot>,
    free_indices: VecDeque<u32>,
    alive_count: usize,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue an id, reusing the oldest freed index when there is one.
    pub fn allocate(&mut self) -> EntityId {
        self.alive_count += 1;
        match self.free_indices.pop_front() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.alive = true;
                EntityId::new(index, slot.generation)
            }
            None => {
                let index =
                    u32::try_from(self.slots.len()).expect("entity index space exhausted");
                self.slots.push(Slot {
                    generation: 0,
                    alive: true,
                });
                EntityId::new(index, 0)
            }
        }
    }

    /// Retire `id` and bump its slot's generation. Returns `false` if `id`
    /// was not alive.
    pub fn deallocate(&mut self, id: EntityId) -> bool {
        if !self.is_alive(id) {
            return false;
        }
        let slot = &mut self.slots[id.index() as usize];
        slot.alive = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_indices.push_back(id.index());
        self.alive_count -= 1;
        true
    }

    pub fn is_alive(&self, id: EntityId) -> bool {
        self.slots
            .get(id.index() as usize)
            .is_some_and(|slot| slot.alive && slot.generation == id.generation())
    }

    #[inline]
    pub fn alive_count(&self) -> usize {
        self.alive_count
    }
}

// ---------------------------------------------------------------------------
// EntityTable
// ---------------------------------------------------------------------------

/// Allocator plus the per-index location of every live entity.
///
/// `locations[i]` is `None` both for dead indices and for live entities that
/// hold no components (unattached).
#[derive(Debug, Default)]
pub(crate) struct EntityTable {
    allocator: EntityAllocator,
    locations: Vec<Option<EntityLocation>>,
}

impl EntityTable {
    pub(crate) fn allocate(&mut self) -> EntityId {
        let id = self.allocator.allocate();
        let idx = id.index() as usize;
        if idx >= self.locations.len() {
            self.locations.resize(idx + 1, None);
        }
        self.locations[idx] = None;
        id
    }

    /// Release `id`. Returns `false` if it was not alive.
    pub(crate) fn free(&mut self, id: EntityId) -> bool {
        if !self.allocator.deallocate(id) {
            return false;
        }
        self.locations[id.index() as usize] = None;
        true
    }

    #[inline]
    pub(crate) fn is_alive(&self, id: EntityId) -> bool {
        self.allocator.is_alive(id)
    }

    /// Location of a live entity; `Ok(None)` means unattached.
    pub(crate) fn location(&self, id: EntityId) -> Result<Option<EntityLocation>, EcsError> {
        if !self.allocator.is_alive(id) {
            tracing::warn!(entity = %id, "stale entity handle used");
            return Err(EcsError::StaleEntity(id));
        }
        Ok(self.locations[id.index() as usize])
    }

    /// Overwrite the location of a live entity.
    pub(crate) fn set_location(&mut self, id: EntityId, location: Option<EntityLocation>) {
        debug_assert!(self.allocator.is_alive(id));
        self.locations[id.index() as usize] = location;
    }

    /// Retarget an entity that a swap-remove moved within its archetype.
    pub(crate) fn set_row(&mut self, id: EntityId, row: usize) {
        let location = self.locations[id.index() as usize]
            .as_mut()
            .expect("swapped entity must be attached");
        location.row = row;
    }

    #[inline]
    pub(crate) fn alive_count(&self) -> usize {
        self.allocator.alive_count()
    }

    /// Every live, attached entity with its location, by index.
    pub(crate) fn iter_attached(&self) -> impl Iterator<Item = (u32, EntityLocation)> + '_ {
        self.locations
            .iter()
            .enumerate()
            .filter_map(|(idx, location)| location.map(|location| (idx as u32, location)))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
