//! Component type registration and metadata.
//!
//! Every component type stored in a [`World`](crate::world::World) must be
//! registered in its [`ComponentRegistry`] first. Registration produces a
//! [`ComponentId`] that keys archetype columns and query matching, together
//! with a [`ComponentVtable`] holding the type-erased move and drop
//! operations the storage layer uses to relocate and finalize values.

use std::alloc::Layout;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::ptr;

use crate::entity::WorldId;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ComponentId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered component type.
///
/// Ids are assigned in registration order starting at zero and are never
/// reused by the registry that issued them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub(crate) u32);

impl ComponentId {
    /// Position of this id in its registry.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self.0)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentVtable -- type-erased operations for a component type
// ---------------------------------------------------------------------------

/// Function pointers for the type-erased move and drop of component values.
///
/// Created via [`ComponentVtable::new::<T>()`] for ordinary Rust types, or via
/// [`ComponentVtable::from_raw`] for components whose relocation needs custom
/// handling. Columns never copy element bytes directly; every relocation goes
/// through `move_fn`.
#[derive(Clone, Copy)]
pub struct ComponentVtable {
    /// Move one value from `src` into uninitialized storage at `dst`.
    /// Afterwards `src` is logically uninitialized.
    pub(crate) move_fn: unsafe fn(dst: *mut u8, src: *mut u8),
    /// Drop a single value in place.
    pub(crate) drop_fn: unsafe fn(*mut u8),
}

impl fmt::Debug for ComponentVtable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentVtable")
            .field("move_fn", &(self.move_fn as *const ()))
            .field("drop_fn", &(self.drop_fn as *const ()))
            .finish()
    }
}

impl ComponentVtable {
    /// Create a vtable for a concrete component type `T`.
    ///
    /// `T` must be thread-safe, like every registered component:
    ///
    /// ```compile_fail
    /// # use strata_ecs::prelude::*;
    /// let _ = ComponentVtable::new::<std::rc::Rc<u32>>();
    /// ```
    pub fn new<T: Send + Sync + 'static>() -> Self {
        unsafe fn move_fn_impl<T>(dst: *mut u8, src: *mut u8) {
            unsafe { ptr::write(dst.cast::<T>(), ptr::read(src.cast::<T>())) }
        }

        unsafe fn drop_fn_impl<T>(ptr: *mut u8) {
            unsafe { ptr::drop_in_place(ptr.cast::<T>()) }
        }

        Self {
            move_fn: move_fn_impl::<T>,
            drop_fn: drop_fn_impl::<T>,
        }
    }

    /// Build a vtable from hand-written move and drop functions.
    ///
    /// # Safety
    ///
    /// For the layout the vtable is registered with:
    /// - `move_fn(dst, src)` must fully relocate one initialized value from
    ///   `src` into uninitialized `dst`, after which `src` is never dropped.
    /// - `drop_fn(ptr)` must finalize one initialized value in place.
    /// - The described values must be safe to send and share across threads.
    pub unsafe fn from_raw(
        move_fn: unsafe fn(dst: *mut u8, src: *mut u8),
        drop_fn: unsafe fn(*mut u8),
    ) -> Self {
        Self { move_fn, drop_fn }
    }
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Metadata about a registered component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Unique ID assigned at registration time.
    pub id: ComponentId,
    /// Human-readable name (supplied by the caller).
    pub name: String,
    /// Size and alignment of one value.
    pub layout: Layout,
    /// Rust `TypeId` for typed access; `None` for raw registrations.
    pub type_id: Option<TypeId>,
    /// Type-erased move and drop.
    pub vtable: ComponentVtable,
}

impl ComponentInfo {
    /// Byte size of one value.
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping component types to [`ComponentId`]s and their metadata.
///
/// A Rust type can only be registered once; subsequent registrations of the
/// same `TypeId` return the existing [`ComponentId`]. Raw registrations are
/// never deduplicated. Entries are append-only.
#[derive(Debug)]
pub struct ComponentRegistry {
    /// TypeId -> ComponentId for dedup.
    by_type: HashMap<TypeId, ComponentId>,
    /// Name -> ComponentId.
    by_name: HashMap<String, ComponentId>,
    /// Indexed by ComponentId.0.
    infos: Vec<ComponentInfo>,
    /// Ids handed out here are only meaningful inside this world.
    world: WorldId,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            by_type: HashMap::new(),
            by_name: HashMap::new(),
            infos: Vec::new(),
            world: WorldId::fresh(),
        }
    }

    /// The world whose ids this registry hands out.
    #[inline]
    pub fn world_id(&self) -> WorldId {
        self.world
    }

    /// Register a component type under the given `name`.
    ///
    /// If the type has already been registered, the existing
    /// [`ComponentId`] is returned and `name` is ignored.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already taken by a different component.
    pub fn register<T>(&mut self, name: &str) -> ComponentId
    where
        T: Send + Sync + 'static,
    {
        let rust_type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type_id) {
            return existing;
        }

        let id = self.push_info(
            name,
            Layout::new::<T>(),
            Some(rust_type_id),
            ComponentVtable::new::<T>(),
        );
        self.by_type.insert(rust_type_id, id);
        id
    }

    /// Register a component described only by its layout and vtable.
    ///
    /// Every call allocates a fresh id, even for a layout/vtable pair seen
    /// before. Values of raw components are reachable through the id-based
    /// accessors only.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already taken by a different component.
    ///
    /// # Safety
    ///
    /// `layout` must be the size and alignment of the values `vtable` moves
    /// and drops, and those values must be safe to send and share across
    /// threads. Columns trust both without further checks.
    pub unsafe fn register_raw(
        &mut self,
        name: &str,
        layout: Layout,
        vtable: ComponentVtable,
    ) -> ComponentId {
        self.push_info(name, layout, None, vtable)
    }

    fn push_info(
        &mut self,
        name: &str,
        layout: Layout,
        type_id: Option<TypeId>,
        vtable: ComponentVtable,
    ) -> ComponentId {
        if self.by_name.contains_key(name) {
            panic!(
                "component name '{}' is already registered for a different type",
                name
            );
        }

        let id = ComponentId(self.infos.len() as u32);
        self.infos.push(ComponentInfo {
            id,
            name: name.to_owned(),
            layout,
            type_id,
            vtable,
        });
        self.by_name.insert(name.to_owned(), id);
        tracing::debug!(component = id.0, name, size = layout.size(), "component registered");
        id
    }

    /// Look up a component type by its Rust `TypeId`.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Like [`lookup`](Self::lookup), but reports an unregistered type as an error.
    pub fn require<T: 'static>(&self) -> Result<ComponentId, EcsError> {
        self.lookup::<T>().ok_or(EcsError::UnknownComponent {
            name: type_name::<T>(),
        })
    }

    /// Look up a component by its registered name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentId> {
        self.by_name.get(name).copied()
    }

    /// Get the [`ComponentInfo`] for a registered component id.
    pub fn info(&self, id: ComponentId) -> Result<&ComponentInfo, EcsError> {
        self.infos
            .get(id.index())
            .ok_or(EcsError::UnknownComponentId(id))
    }

    /// Byte size of the component's values.
    pub fn size_of(&self, id: ComponentId) -> Result<usize, EcsError> {
        self.info(id).map(ComponentInfo::size)
    }

    /// The component's move and drop operations.
    pub fn vtable(&self, id: ComponentId) -> Result<ComponentVtable, EcsError> {
        self.info(id).map(|info| info.vtable)
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any component types have been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Returns the names of all registered component types, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(Debug, Clone)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[allow(dead_code)]
    #[derive(Debug, Clone)]
    struct Vel {
        dx: f32,
        dy: f32,
    }

    unsafe fn move_u64(dst: *mut u8, src: *mut u8) {
        unsafe { ptr::copy_nonoverlapping(src, dst, std::mem::size_of::<u64>()) }
    }

    unsafe fn drop_nothing(_: *mut u8) {}

    #[test]
    fn register_and_lookup() {
        let mut reg = ComponentRegistry::new();
        let id = reg.register::<Pos>("position");
        assert_eq!(reg.lookup::<Pos>(), Some(id));
        assert_eq!(reg.lookup_by_name("position"), Some(id));
    }

    #[test]
    fn same_type_same_id() {
        let mut reg = ComponentRegistry::new();
        let id1 = reg.register::<Pos>("position");
        let id2 = reg.register::<Pos>("position_again");
        assert_eq!(id1, id2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn ids_are_monotonic() {
        let mut reg = ComponentRegistry::new();
        let p = reg.register::<Pos>("position");
        let v = reg.register::<Vel>("velocity");
        assert_eq!(p.index(), 0);
        assert_eq!(v.index(), 1);
    }

    #[test]
    fn raw_registrations_never_dedup() {
        let mut reg = ComponentRegistry::new();
        let vtable = unsafe { ComponentVtable::from_raw(move_u64, drop_nothing) };
        let a = unsafe { reg.register_raw("a", Layout::new::<u64>(), vtable) };
        let b = unsafe { reg.register_raw("b", Layout::new::<u64>(), vtable) };
        assert_ne!(a, b);
        assert_eq!(reg.size_of(b).unwrap(), 8);
        assert!(reg.info(a).unwrap().type_id.is_none());
    }

    #[test]
    fn info_correctness() {
        let mut reg = ComponentRegistry::new();
        let id = reg.register::<Pos>("position");
        let info = reg.info(id).unwrap();
        assert_eq!(info.name, "position");
        assert_eq!(info.size(), std::mem::size_of::<Pos>());
        assert_eq!(info.layout.align(), std::mem::align_of::<Pos>());
        assert_eq!(info.type_id, Some(TypeId::of::<Pos>()));
    }

    #[test]
    fn out_of_range_id_is_an_error() {
        let reg = ComponentRegistry::new();
        let err = reg.size_of(ComponentId(3)).unwrap_err();
        assert!(matches!(err, EcsError::UnknownComponentId(ComponentId(3))));
        assert!(reg.vtable(ComponentId(0)).is_err());
    }

    #[test]
    fn require_names_the_missing_type() {
        let reg = ComponentRegistry::new();
        let err = reg.require::<Vel>().unwrap_err();
        assert!(err.to_string().contains("Vel"));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn name_collision_panics() {
        let mut reg = ComponentRegistry::new();
        reg.register::<Pos>("thing");
        reg.register::<Vel>("thing");
    }

    #[test]
    fn vtable_moves_and_drops() {
        let vtable = ComponentVtable::new::<String>();
        let mut src = std::mem::ManuallyDrop::new(String::from("moved"));
        let mut dst = std::mem::MaybeUninit::<String>::uninit();
        unsafe {
            (vtable.move_fn)(
                dst.as_mut_ptr().cast::<u8>(),
                (&mut *src as *mut String).cast::<u8>(),
            );
            assert_eq!(dst.assume_init_ref(), "moved");
            (vtable.drop_fn)(dst.as_mut_ptr().cast::<u8>());
        }
    }

    #[test]
    fn each_registry_belongs_to_its_own_world() {
        let a = ComponentRegistry::new();
        let b = ComponentRegistry::new();
        assert_ne!(a.world_id(), b.world_id());
        assert_eq!(a.world_id(), a.world_id());
    }

    #[test]
    fn registered_names_sorted() {
        let mut reg = ComponentRegistry::new();
        reg.register::<Vel>("velocity");
        reg.register::<Pos>("position");
        assert_eq!(reg.registered_names(), vec!["position", "velocity"]);
    }
}
