//! The [`World`] is the top-level container for the store. It owns the
//! component registry, the archetype pool and the entity location table.
//!
//! Every structural change (spawn, despawn, component add/remove) runs inside
//! one `&mut World` call and leaves the location table consistent with the
//! archetype backrefs before it returns, including the retargeting of any
//! entity relocated by a swap-remove.

use std::alloc::{self, Layout};
use std::fmt;
use std::mem::{ManuallyDrop, MaybeUninit};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::archetype::{Archetype, ArchetypeId};
use crate::component::{ComponentId, ComponentRegistry, ComponentVtable};
use crate::entity::{DroppedHandles, Entity, EntityId, EntityLocation, EntityTable, WorldId};
use crate::pool::ArchetypePool;
use crate::signature::Signature;
use crate::EcsError;

// ---------------------------------------------------------------------------
// WorldConfig
// ---------------------------------------------------------------------------

/// Tunables for archetype storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Multiplier applied to `capacity + 1` when an archetype grows.
    /// Must be greater than 1.0.
    pub growth_factor: f32,
    /// Rows reserved by every archetype when it is created.
    pub initial_capacity: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            growth_factor: 1.7,
            initial_capacity: 0,
        }
    }
}

impl WorldConfig {
    /// Check that the configuration can drive archetype growth.
    pub fn validate(&self) -> Result<(), EcsError> {
        if !self.growth_factor.is_finite() || self.growth_factor <= 1.0 {
            return Err(EcsError::InvalidConfig {
                details: format!(
                    "growth_factor must be a finite number above 1.0, got {}",
                    self.growth_factor
                ),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RawComponentBuf -- properly aligned component storage
// ---------------------------------------------------------------------------

/// A properly aligned heap buffer for storing a single component value.
///
/// Dropping the buffer only frees the allocation. The component destructor
/// is NOT run; whoever owns the value must move it out or drop it first.
pub(crate) struct RawComponentBuf {
    /// Heap allocation, or an aligned dangling pointer for ZSTs.
    ptr: *mut u8,
    layout: Layout,
}

impl RawComponentBuf {
    /// Allocate uninitialized storage for one value of `layout`.
    fn uninit(layout: Layout) -> Self {
        if layout.size() == 0 {
            return Self {
                ptr: layout.align() as *mut u8,
                layout,
            };
        }
        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Self { ptr, layout }
    }

    /// Move `value` into a fresh buffer.
    fn from_value<T>(value: T) -> Self {
        let buf = Self::uninit(Layout::new::<T>());
        unsafe { ptr::write(buf.ptr.cast::<T>(), value) };
        buf
    }

    #[inline]
    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for RawComponentBuf {
    fn drop(&mut self) {
        if self.layout.size() > 0 {
            unsafe { alloc::dealloc(self.ptr, self.layout) };
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentBundle
// ---------------------------------------------------------------------------

/// A set of component values to spawn an entity with.
///
/// A bundle is bound to the world of the first registry it is used with, and
/// only that world accepts it.
///
/// ```
/// use strata_ecs::prelude::*;
///
/// struct Position { x: f32, y: f32 }
/// struct Velocity { dx: f32, dy: f32 }
///
/// let mut world = World::new();
/// world.register_component::<Position>("position");
/// world.register_component::<Velocity>("velocity");
///
/// let mut bundle = ComponentBundle::new();
/// bundle.add(world.registry(), Position { x: 0.0, y: 0.0 })?;
/// bundle.add(world.registry(), Velocity { dx: 1.0, dy: 0.0 })?;
/// let entity = world.spawn(bundle)?;
/// assert_eq!(world.get::<Velocity>(&entity)?.dx, 1.0);
/// # Ok::<(), EcsError>(())
/// ```
pub struct ComponentBundle {
    /// (component, buffer holding an initialized value, vtable to drop it)
    entries: Vec<(ComponentId, RawComponentBuf, ComponentVtable)>,
    world: Option<WorldId>,
}

impl ComponentBundle {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            world: None,
        }
    }

    /// The world this bundle's component ids belong to, once it holds any.
    pub fn world_id(&self) -> Option<WorldId> {
        self.world
    }

    /// Number of components in the bundle.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_new(&self, registry: &ComponentRegistry, component: ComponentId) -> Result<(), EcsError> {
        let world = registry.world_id();
        if let Some(bundle) = self.world.filter(|&bound| bound != world) {
            return Err(EcsError::ForeignBundle { bundle, world });
        }
        if self.entries.iter().any(|(id, _, _)| *id == component) {
            return Err(EcsError::DuplicateInBundle { component });
        }
        Ok(())
    }

    /// Add a component value. Its type must already be registered.
    ///
    /// # Errors
    ///
    /// [`EcsError::UnknownComponent`] if `T` is not registered,
    /// [`EcsError::DuplicateInBundle`] if the bundle already holds a `T`,
    /// [`EcsError::ForeignBundle`] if it was started with another world's
    /// registry. The value is dropped in every case.
    pub fn add<T: 'static>(&mut self, registry: &ComponentRegistry, value: T) -> Result<(), EcsError> {
        let component = registry.require::<T>()?;
        self.check_new(registry, component)?;
        let vtable = registry.vtable(component)?;
        self.entries
            .push((component, RawComponentBuf::from_value(value), vtable));
        self.world = Some(registry.world_id());
        Ok(())
    }

    /// Builder form of [`add`](Self::add).
    pub fn with<T: 'static>(mut self, registry: &ComponentRegistry, value: T) -> Result<Self, EcsError> {
        self.add(registry, value)?;
        Ok(self)
    }

    /// Add a value of a (typically raw-registered) component by id.
    ///
    /// # Safety
    ///
    /// `src` must point to a valid, initialized value of `component`'s type.
    /// On `Ok` the value has been moved out of `src`, which must not be
    /// dropped again. On `Err` it is left untouched.
    pub unsafe fn add_raw(
        &mut self,
        registry: &ComponentRegistry,
        component: ComponentId,
        src: *mut u8,
    ) -> Result<(), EcsError> {
        let info = registry.info(component)?;
        self.check_new(registry, component)?;
        let mut buf = RawComponentBuf::uninit(info.layout);
        unsafe { (info.vtable.move_fn)(buf.as_mut_ptr(), src) };
        self.entries.push((component, buf, info.vtable));
        self.world = Some(registry.world_id());
        Ok(())
    }

    /// The signature an entity spawned from this bundle lands in.
    pub fn signature(&self) -> Signature {
        self.entries.iter().map(|(id, _, _)| *id).collect()
    }

    /// Pointers to every held value, for handing to an archetype.
    fn raw_ptrs(&mut self) -> Vec<(ComponentId, *mut u8)> {
        self.entries
            .iter_mut()
            .map(|(id, buf, _)| (*id, buf.as_mut_ptr()))
            .collect()
    }

    /// Free the buffers after their values have been moved out.
    fn release(mut self) {
        // RawComponentBuf::drop only deallocates.
        self.entries.clear();
    }
}

impl Default for ComponentBundle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ComponentBundle {
    fn drop(&mut self) {
        for (_, mut buf, vtable) in self.entries.drain(..) {
            unsafe { (vtable.drop_fn)(buf.as_mut_ptr()) };
        }
    }
}

impl fmt::Debug for ComponentBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentBundle")
            .field("world", &self.world)
            .field("signature", &self.signature())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The top-level store.
///
/// Owns the component registry, all archetype storage and the entity
/// location table. Dropping the world drops every component still stored.
///
/// Handles dropped without [`despawn`](Self::despawn) are hidden from every
/// read at once and their rows are removed at the start of the next `&mut`
/// operation, or explicitly through [`despawn_dropped`](Self::despawn_dropped).
pub struct World {
    config: WorldConfig,
    pub(crate) registry: ComponentRegistry,
    pub(crate) pool: ArchetypePool,
    entities: EntityTable,
    dropped: Arc<DroppedHandles>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("id", &self.id())
            .field("entity_count", &self.entity_count())
            .field("archetype_count", &self.archetype_count())
            .field("component_count", &self.registry.len())
            .finish()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Create an empty world with the default [`WorldConfig`].
    pub fn new() -> Self {
        let registry = ComponentRegistry::new();
        let dropped = Arc::new(DroppedHandles::new(registry.world_id()));
        Self {
            config: WorldConfig::default(),
            registry,
            pool: ArchetypePool::new(),
            entities: EntityTable::default(),
            dropped,
        }
    }

    /// Create an empty world with a custom configuration.
    pub fn with_config(config: WorldConfig) -> Result<Self, EcsError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new()
        })
    }

    /// This world's identity, shared by its registry, bundles and handles.
    #[inline]
    pub fn id(&self) -> WorldId {
        self.registry.world_id()
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Read-only access to the component registry.
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Read-only access to archetype storage.
    pub fn pool(&self) -> &ArchetypePool {
        &self.pool
    }

    /// Register a component type. Registering the same type again returns
    /// the id it already has.
    pub fn register_component<T>(&mut self, name: &str) -> ComponentId
    where
        T: Send + Sync + 'static,
    {
        self.registry.register::<T>(name)
    }

    /// Register a type-erased component.
    ///
    /// ```compile_fail
    /// # use strata_ecs::prelude::*;
    /// let mut world = World::new();
    /// let vtable = ComponentVtable::new::<u64>();
    /// world.register_component_raw("raw", std::alloc::Layout::new::<u64>(), vtable);
    /// ```
    ///
    /// # Safety
    ///
    /// As for [`ComponentRegistry::register_raw`].
    pub unsafe fn register_component_raw(
        &mut self,
        name: &str,
        layout: Layout,
        vtable: ComponentVtable,
    ) -> ComponentId {
        unsafe { self.registry.register_raw(name, layout, vtable) }
    }

    // -- archetype management -----------------------------------------------

    fn archetype_for(&mut self, signature: &Signature) -> Result<ArchetypeId, EcsError> {
        self.pool.get_or_create(
            signature,
            &self.registry,
            self.config.growth_factor,
            self.config.initial_capacity,
        )
    }

    /// Point the entity swapped into `vacated` at its new row.
    fn fix_swapped(&mut self, vacated: EntityLocation, swapped: Option<EntityId>) {
        if let Some(moved) = swapped {
            self.entities.set_row(moved, vacated.row);
        }
    }

    /// Move `entity`'s row from `from` into archetype `to`.
    ///
    /// # Safety
    ///
    /// See [`Archetype::migrate_row`].
    unsafe fn migrate(
        &mut self,
        entity: EntityId,
        from: EntityLocation,
        to: ArchetypeId,
        extra: &[(ComponentId, *mut u8)],
        taken: Option<(ComponentId, *mut u8)>,
    ) -> Result<(), EcsError> {
        let (src, dst) = self.pool.pair_mut(from.archetype, to);
        let outcome = unsafe { src.migrate_row(from.row, dst, extra, taken) }?;
        tracing::trace!(
            entity = %entity,
            from = from.archetype.0,
            to = to.0,
            row = outcome.dst_row,
            "migrated entity"
        );
        self.fix_swapped(from, outcome.swapped);
        self.entities.set_location(
            entity,
            Some(EntityLocation {
                archetype: to,
                row: outcome.dst_row,
            }),
        );
        Ok(())
    }

    // -- handle ownership ---------------------------------------------------

    /// The id behind a handle issued by this world.
    fn resolve(&self, entity: &Entity) -> Result<EntityId, EcsError> {
        if entity.world() != self.id() {
            return Err(EcsError::ForeignEntity(entity.id()));
        }
        Ok(entity.id())
    }

    /// Despawn every entity whose handle was dropped since the last call.
    /// Returns how many were removed.
    pub fn despawn_dropped(&mut self) -> usize {
        let ids = self.dropped.take();
        for &id in &ids {
            if let Err(err) = self.despawn_id(id) {
                tracing::warn!(entity = %id, error = %err, "dropped handle could not be despawned");
            }
        }
        if !ids.is_empty() {
            tracing::trace!(count = ids.len(), "despawned dropped handles");
        }
        ids.len()
    }

    /// Locations of rows whose handles are dropped but not yet despawned.
    /// Reads through `&self` skip these rows.
    pub(crate) fn hidden_rows(&self) -> Vec<EntityLocation> {
        self.dropped
            .pending()
            .into_iter()
            .filter_map(|id| self.entities.location(id).ok().flatten())
            .collect()
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Spawn an entity holding every component of `bundle`. An empty bundle
    /// spawns an unattached entity.
    ///
    /// # Errors
    ///
    /// [`EcsError::ForeignBundle`] if the bundle was built against another
    /// world's registry. The bundle's values are dropped.
    pub fn spawn(&mut self, mut bundle: ComponentBundle) -> Result<Entity, EcsError> {
        self.despawn_dropped();
        if bundle.is_empty() {
            return Ok(self.spawn_empty());
        }
        if let Some(foreign) = bundle.world_id().filter(|&world| world != self.id()) {
            return Err(EcsError::ForeignBundle {
                bundle: foreign,
                world: self.id(),
            });
        }
        let archetype = self.archetype_for(&bundle.signature())?;
        let id = self.entities.allocate();
        let components = bundle.raw_ptrs();
        let row = match unsafe { self.pool[archetype].push(id, &components) } {
            Ok(row) => row,
            Err(err) => {
                self.entities.free(id);
                return Err(err);
            }
        };
        bundle.release();
        self.entities
            .set_location(id, Some(EntityLocation { archetype, row }));
        Ok(Entity::new(id, self.dropped.clone()))
    }

    /// Spawn an entity with a single component.
    pub fn spawn_with<T: 'static>(&mut self, component: T) -> Result<Entity, EcsError> {
        let bundle = ComponentBundle::new().with(&self.registry, component)?;
        self.spawn(bundle)
    }

    /// Spawn an entity with no components. It occupies no archetype row
    /// until its first component is added.
    pub fn spawn_empty(&mut self) -> Entity {
        self.despawn_dropped();
        Entity::new(self.entities.allocate(), self.dropped.clone())
    }

    /// Despawn an entity now, dropping its components and recycling its id.
    ///
    /// # Errors
    ///
    /// [`EcsError::ForeignEntity`] if the handle came from another world.
    /// That handle is dropped, so its own world despawns it later.
    pub fn despawn(&mut self, entity: Entity) -> Result<(), EcsError> {
        self.despawn_dropped();
        self.resolve(&entity)?;
        let id = entity.disarm();
        self.despawn_id(id)
    }

    fn despawn_id(&mut self, id: EntityId) -> Result<(), EcsError> {
        if let Some(location) = self.entities.location(id)? {
            let swapped = self.pool[location.archetype].remove_row(location.row);
            self.fix_swapped(location, swapped);
        }
        self.entities.free(id);
        Ok(())
    }

    // -- structural changes -------------------------------------------------

    /// Add a component to an entity, migrating it to the archetype with the
    /// extended signature. An unattached entity becomes attached.
    ///
    /// # Errors
    ///
    /// [`EcsError::DuplicateComponent`] if the entity already has a `T`,
    /// [`EcsError::UnknownComponent`] if `T` is not registered. `value` is
    /// dropped on error.
    pub fn add_component<T: 'static>(&mut self, entity: &Entity, value: T) -> Result<(), EcsError> {
        self.despawn_dropped();
        let id = self.resolve(entity)?;
        let component = self.registry.require::<T>()?;
        let mut value = ManuallyDrop::new(value);
        let src = (&mut *value as *mut T).cast::<u8>();
        let result = unsafe { self.attach_component(id, component, src) };
        if result.is_err() {
            unsafe { ManuallyDrop::drop(&mut value) };
        }
        result
    }

    /// Add a component by id, moving the value out of `src`.
    ///
    /// # Safety
    ///
    /// `src` must point to a valid, initialized value of `component`'s type.
    /// On `Ok` the value has been moved and must not be dropped again; on
    /// `Err` it is left untouched.
    pub unsafe fn add_component_raw(
        &mut self,
        entity: &Entity,
        component: ComponentId,
        src: *mut u8,
    ) -> Result<(), EcsError> {
        self.despawn_dropped();
        let id = self.resolve(entity)?;
        self.registry.info(component)?;
        unsafe { self.attach_component(id, component, src) }
    }

    unsafe fn attach_component(
        &mut self,
        entity: EntityId,
        component: ComponentId,
        src: *mut u8,
    ) -> Result<(), EcsError> {
        match self.entities.location(entity)? {
            None => {
                let archetype = self.archetype_for(&Signature::from_ids([component]))?;
                let row = unsafe { self.pool[archetype].push(entity, &[(component, src)]) }?;
                self.entities
                    .set_location(entity, Some(EntityLocation { archetype, row }));
                Ok(())
            }
            Some(location) => {
                let current = self.pool[location.archetype].signature();
                if current.contains(component) {
                    return Err(EcsError::DuplicateComponent { entity, component });
                }
                let target = current.with(component);
                let to = self.archetype_for(&target)?;
                unsafe { self.migrate(entity, location, to, &[(component, src)], None) }
            }
        }
    }

    /// Remove and drop a component. Removing the last component leaves the
    /// entity alive but unattached.
    pub fn remove_component<T: 'static>(&mut self, entity: &Entity) -> Result<(), EcsError> {
        self.despawn_dropped();
        let id = self.resolve(entity)?;
        let component = self.registry.require::<T>()?;
        unsafe { self.detach_component(id, component, None) }
    }

    /// [`remove_component`](Self::remove_component) by id.
    pub fn remove_component_by_id(
        &mut self,
        entity: &Entity,
        component: ComponentId,
    ) -> Result<(), EcsError> {
        self.despawn_dropped();
        let id = self.resolve(entity)?;
        self.registry.info(component)?;
        unsafe { self.detach_component(id, component, None) }
    }

    /// Remove a component and hand its value back instead of dropping it.
    pub fn take_component<T: 'static>(&mut self, entity: &Entity) -> Result<T, EcsError> {
        self.despawn_dropped();
        let id = self.resolve(entity)?;
        let component = self.registry.require::<T>()?;
        let mut slot = MaybeUninit::<T>::uninit();
        unsafe {
            self.detach_component(id, component, Some(slot.as_mut_ptr().cast::<u8>()))?;
            Ok(slot.assume_init())
        }
    }

    /// # Safety
    ///
    /// `out`, if given, must be valid uninitialized storage for one value of
    /// `component`. On `Ok` it holds the removed value.
    unsafe fn detach_component(
        &mut self,
        entity: EntityId,
        component: ComponentId,
        out: Option<*mut u8>,
    ) -> Result<(), EcsError> {
        let missing = EcsError::MissingComponent { entity, component };
        let Some(location) = self.entities.location(entity)? else {
            return Err(missing);
        };
        let current = self.pool[location.archetype].signature();
        if !current.contains(component) {
            return Err(missing);
        }
        let target = current.without(component);
        let taken = out.map(|dst| (component, dst));

        if target.is_empty() {
            let swapped =
                unsafe { self.pool[location.archetype].remove_row_into(location.row, taken) };
            self.fix_swapped(location, swapped);
            self.entities.set_location(entity, None);
            return Ok(());
        }

        let to = self.archetype_for(&target)?;
        unsafe { self.migrate(entity, location, to, &[], taken) }
    }

    // -- component access ---------------------------------------------------

    fn attached(&self, entity: &Entity, component: ComponentId) -> Result<(EntityId, EntityLocation), EcsError> {
        let id = self.resolve(entity)?;
        let location = self
            .entities
            .location(id)?
            .ok_or(EcsError::MissingComponent {
                entity: id,
                component,
            })?;
        Ok((id, location))
    }

    /// Shared reference to an entity's `T`.
    pub fn get<T: 'static>(&self, entity: &Entity) -> Result<&T, EcsError> {
        let component = self.registry.require::<T>()?;
        let (id, location) = self.attached(entity, component)?;
        self.pool[location.archetype]
            .get_component::<T>(location.row, component)
            .ok_or(EcsError::MissingComponent {
                entity: id,
                component,
            })
    }

    /// Mutable reference to an entity's `T`.
    pub fn get_mut<T: 'static>(&mut self, entity: &Entity) -> Result<&mut T, EcsError> {
        self.despawn_dropped();
        let component = self.registry.require::<T>()?;
        let (id, location) = self.attached(entity, component)?;
        self.pool[location.archetype]
            .get_component_mut::<T>(location.row, component)
            .ok_or(EcsError::MissingComponent {
                entity: id,
                component,
            })
    }

    /// Pointer to an entity's value of `component`, for raw components.
    /// Valid until the next structural change.
    pub fn get_raw(&self, entity: &Entity, component: ComponentId) -> Result<NonNull<u8>, EcsError> {
        let (id, location) = self.attached(entity, component)?;
        self.pool[location.archetype]
            .get_component_raw(location.row, component)
            .ok_or(EcsError::MissingComponent {
                entity: id,
                component,
            })
    }

    /// Whether the entity currently holds a `T`.
    pub fn has_component<T: 'static>(&self, entity: &Entity) -> bool {
        self.registry
            .lookup::<T>()
            .is_some_and(|component| self.has_component_id(entity, component))
    }

    /// Whether the entity currently holds `component`.
    pub fn has_component_id(&self, entity: &Entity, component: ComponentId) -> bool {
        self.signature_of(entity)
            .is_some_and(|signature| signature.contains(component))
    }

    /// Where the entity's row lives, or `None` if it is unattached or the
    /// handle belongs to another world.
    pub fn location(&self, entity: &Entity) -> Option<EntityLocation> {
        let id = self.resolve(entity).ok()?;
        self.entities.location(id).ok().flatten()
    }

    /// The entity's component set, or `None` if it is unattached.
    pub fn signature_of(&self, entity: &Entity) -> Option<&Signature> {
        self.location(entity)
            .map(|location| self.pool[location.archetype].signature())
    }

    // -- inspection ---------------------------------------------------------

    /// Whether `id` names a live entity of this world whose handle has not
    /// been dropped.
    pub fn is_alive(&self, id: EntityId) -> bool {
        self.entities.is_alive(id) && !self.dropped.contains(id)
    }

    /// Number of live entities, attached or not, excluding dropped handles.
    pub fn entity_count(&self) -> usize {
        self.entities.alive_count() - self.dropped.len()
    }

    /// Number of archetypes ever created, including empty ones.
    pub fn archetype_count(&self) -> usize {
        self.pool.len()
    }

    pub fn archetype(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.pool.get(id)
    }

    /// Archetypes accepted by `predicate`, in creation order.
    pub fn archetypes_where(&self, predicate: impl FnMut(&Archetype) -> bool) -> Vec<ArchetypeId> {
        self.pool.filter(predicate)
    }

    /// Verify the cross-structure invariants of the store:
    ///
    /// - one archetype per signature, and the pool index agrees;
    /// - every archetype is densely packed;
    /// - every backref names a live entity located at that very row;
    /// - every attached entity is found at its recorded row.
    pub fn check_integrity(&self) -> Result<(), EcsError> {
        let violation = |details: String| Err(EcsError::IntegrityViolation { details });

        let mut rows = 0usize;
        for archetype in self.pool.iter() {
            let id = archetype.id();
            if self.pool.find(archetype.signature()) != Some(id) {
                return violation(format!(
                    "archetype {id:?} signature {:?} is not indexed to it",
                    archetype.signature()
                ));
            }
            if !archetype.is_dense() {
                return violation(format!("archetype {id:?} columns are not densely packed"));
            }
            for (row, &entity) in archetype.entities().iter().enumerate() {
                let expected = Some(EntityLocation { archetype: id, row });
                match self.entities.location(entity) {
                    Ok(found) if found == expected => {}
                    Ok(found) => {
                        return violation(format!(
                            "backref {entity} at {id:?} row {row} is recorded at {found:?}"
                        ))
                    }
                    Err(_) => {
                        return violation(format!("backref {entity} at {id:?} row {row} is dead"))
                    }
                }
            }
            rows += archetype.len();
        }

        let mut attached = 0usize;
        for (index, location) in self.entities.iter_attached() {
            let owner = self
                .pool
                .get(location.archetype)
                .and_then(|archetype| archetype.entities().get(location.row));
            match owner {
                Some(entity) if entity.index() == index => attached += 1,
                _ => {
                    return violation(format!(
                        "entity index {index} recorded at {location:?} is not there"
                    ))
                }
            }
        }
        if attached != rows {
            return violation(format!("{attached} attached entities but {rows} rows"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
