//! Archetype storage.
//!
//! An [`Archetype`] stores all entities that share the exact same set of
//! component types. Within each archetype, components are laid out in a
//! Structure-of-Arrays (SoA) pattern: one [`Column`] per component type, plus
//! a parallel `Vec<EntityId>` of back-references mapping row index to the
//! owning entity.
//!
//! Rows stay densely packed: removal is a swap-remove, so the last row is
//! relocated into the vacated slot and exactly one foreign entity changes
//! row. Every mutating method reports that entity so the owner of the
//! location table can retarget it before anything else observes the store.
//!
//! # Safety
//!
//! [`Column`] stores values as type-erased bytes and relocates them only
//! through the registered [`ComponentVtable`]. The safety invariants are
//! maintained by [`Archetype`] and [`World`](crate::world::World), which
//! guarantee that every raw pointer handed to a column describes a value of
//! the column's component type.
// Note: unsafe_code is allowed on this module via #[allow(unsafe_code)] in lib.rs

use std::alloc::{self, Layout};
use std::any::TypeId;
use std::fmt;
use std::ptr::{self, NonNull};
use std::slice;

use crate::component::{ComponentId, ComponentInfo, ComponentRegistry, ComponentVtable};
use crate::entity::EntityId;
use crate::signature::Signature;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Identifies an archetype within its pool. Indices into the pool's storage,
/// so an id stays valid when the pool grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ---------------------------------------------------------------------------
// Column -- type-erased component storage
// ---------------------------------------------------------------------------

/// A type-erased, densely packed, growable array of component values of a
/// single type.
///
/// Internally this is a manually managed byte buffer whose layout matches the
/// stored component type. Elements are only ever relocated with the
/// component's `move_fn`, never by raw byte copy.
pub struct Column {
    component: ComponentId,
    /// Pointer to the heap allocation (null when nothing is allocated).
    data: *mut u8,
    /// Number of live elements.
    len: usize,
    /// Number of elements that fit in the current allocation.
    capacity: usize,
    item_layout: Layout,
    type_id: Option<TypeId>,
    vtable: ComponentVtable,
}

// Column only stores raw bytes; registration guarantees that the concrete
// component type is Send + Sync.
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

#[cold]
fn capacity_overflow() -> ! {
    panic!("column capacity overflow")
}

impl Column {
    /// Create a new, empty column for a component described by `info`.
    pub fn new(info: &ComponentInfo) -> Self {
        Self {
            component: info.id,
            data: ptr::null_mut(),
            len: 0,
            capacity: 0,
            item_layout: info.layout,
            type_id: info.type_id,
            vtable: info.vtable,
        }
    }

    /// The component this column stores.
    #[inline]
    pub fn component(&self) -> ComponentId {
        self.component
    }

    /// Number of stored elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the column is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of elements that fit without reallocating.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // -- internal helpers ---------------------------------------------------

    #[inline]
    fn item_size(&self) -> usize {
        self.item_layout.size()
    }

    fn array_layout(&self, capacity: usize) -> Layout {
        let size = self
            .item_size()
            .checked_mul(capacity)
            .unwrap_or_else(|| capacity_overflow());
        Layout::from_size_align(size, self.item_layout.align())
            .unwrap_or_else(|_| capacity_overflow())
    }

    /// Pointer to the first slot. Dangling but aligned for ZSTs and for
    /// columns that have not allocated yet.
    #[inline]
    pub(crate) fn base_ptr(&self) -> *mut u8 {
        if self.data.is_null() {
            // Aligned dangling pointer, as NonNull::dangling does for typed data.
            self.item_layout.align() as *mut u8
        } else {
            self.data
        }
    }

    /// Pointer to slot `row`. The slot may be uninitialized.
    #[inline]
    fn slot(&self, row: usize) -> *mut u8 {
        debug_assert!(row < self.capacity || self.item_size() == 0);
        if self.item_size() == 0 {
            return self.base_ptr();
        }
        unsafe { self.data.add(row * self.item_size()) }
    }

    /// Grow the allocation to hold exactly `new_capacity` elements.
    ///
    /// Live elements are relocated one by one with `move_fn` into the new
    /// buffer before the old one is freed. Never shrinks. Aborts via
    /// [`alloc::handle_alloc_error`] when the allocator fails.
    pub fn reserve_exact(&mut self, new_capacity: usize) {
        if new_capacity <= self.capacity {
            return;
        }
        if self.item_size() == 0 {
            // ZST: no actual allocation needed.
            self.capacity = new_capacity;
            return;
        }

        let new_layout = self.array_layout(new_capacity);
        let new_data = unsafe { alloc::alloc(new_layout) };
        if new_data.is_null() {
            alloc::handle_alloc_error(new_layout);
        }

        if !self.data.is_null() {
            let size = self.item_size();
            for row in 0..self.len {
                unsafe {
                    (self.vtable.move_fn)(new_data.add(row * size), self.data.add(row * size));
                }
            }
            unsafe { alloc::dealloc(self.data, self.array_layout(self.capacity)) };
        }

        self.data = new_data;
        self.capacity = new_capacity;
    }

    // -- mutation -------------------------------------------------------------

    /// Move a value onto the end of the column.
    ///
    /// # Safety
    ///
    /// `src` must point to a valid, initialised value of the column's
    /// component type. Ownership is *moved* into the column (the caller must
    /// not drop the source). `len < capacity` must hold unless the type is
    /// zero-sized.
    pub(crate) unsafe fn push(&mut self, src: *mut u8) {
        debug_assert!(self.len < self.capacity || self.item_size() == 0);
        unsafe { (self.vtable.move_fn)(self.slot(self.len), src) };
        self.len += 1;
    }

    /// Vacate `row` without touching the value there: if it is not the last
    /// row, the last element is relocated into it.
    ///
    /// The caller must already have dropped or moved out the value at `row`,
    /// otherwise it leaks.
    pub(crate) fn swap_remove_forget(&mut self, row: usize) {
        assert!(row < self.len, "row {row} out of bounds (len {})", self.len);
        let last = self.len - 1;
        if row != last {
            unsafe { (self.vtable.move_fn)(self.slot(row), self.slot(last)) };
        }
        self.len -= 1;
    }

    /// Drop the value at `row` and swap the last element into its place.
    pub(crate) fn swap_remove(&mut self, row: usize) {
        assert!(row < self.len, "row {row} out of bounds (len {})", self.len);
        unsafe { (self.vtable.drop_fn)(self.slot(row)) };
        self.swap_remove_forget(row);
    }

    /// Move the value at `row` out to `dst`, then swap the last element into
    /// its place.
    ///
    /// # Safety
    ///
    /// `dst` must be valid, aligned, uninitialized storage for one value of
    /// the column's component type.
    pub(crate) unsafe fn swap_remove_into(&mut self, row: usize, dst: *mut u8) {
        assert!(row < self.len, "row {row} out of bounds (len {})", self.len);
        unsafe { (self.vtable.move_fn)(dst, self.slot(row)) };
        self.swap_remove_forget(row);
    }

    // -- access ---------------------------------------------------------------

    /// Raw pointer to the element at `row`. Only debug builds check that
    /// `row < len`.
    #[inline]
    pub fn get_raw(&self, row: usize) -> *const u8 {
        debug_assert!(row < self.len, "row {row} out of bounds (len {})", self.len);
        self.slot(row)
    }

    /// Mutable variant of [`get_raw`](Self::get_raw).
    #[inline]
    pub fn get_raw_mut(&mut self, row: usize) -> *mut u8 {
        debug_assert!(row < self.len, "row {row} out of bounds (len {})", self.len);
        self.slot(row)
    }

    fn is_type<T: 'static>(&self) -> bool {
        self.type_id == Some(TypeId::of::<T>())
    }

    /// Typed reference to the element at `row`. `None` if `T` is not the
    /// stored type or `row` is out of range.
    pub fn get<T: 'static>(&self, row: usize) -> Option<&T> {
        if !self.is_type::<T>() || row >= self.len {
            return None;
        }
        Some(unsafe { &*self.slot(row).cast::<T>() })
    }

    /// Mutable variant of [`get`](Self::get).
    pub fn get_mut<T: 'static>(&mut self, row: usize) -> Option<&mut T> {
        if !self.is_type::<T>() || row >= self.len {
            return None;
        }
        Some(unsafe { &mut *self.slot(row).cast::<T>() })
    }

    /// All live elements as a typed slice, or `None` if `T` is not the
    /// stored type.
    pub fn as_slice<T: 'static>(&self) -> Option<&[T]> {
        if !self.is_type::<T>() {
            return None;
        }
        Some(unsafe { slice::from_raw_parts(self.base_ptr().cast::<T>(), self.len) })
    }

    /// Mutable variant of [`as_slice`](Self::as_slice).
    pub fn as_mut_slice<T: 'static>(&mut self) -> Option<&mut [T]> {
        if !self.is_type::<T>() {
            return None;
        }
        Some(unsafe { slice::from_raw_parts_mut(self.base_ptr().cast::<T>(), self.len) })
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        for row in 0..self.len {
            unsafe { (self.vtable.drop_fn)(self.slot(row)) };
        }
        self.len = 0;
        if !self.data.is_null() {
            unsafe { alloc::dealloc(self.data, self.array_layout(self.capacity)) };
            self.data = ptr::null_mut();
        }
    }
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("component", &self.component)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("item_size", &self.item_layout.size())
            .field("item_align", &self.item_layout.align())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// Result of moving a row between archetypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateOutcome {
    /// Row the entity now occupies in the destination.
    pub dst_row: usize,
    /// Entity that was swapped into the vacated source row, if any.
    pub swapped: Option<EntityId>,
}

/// An archetype stores all entities that share the exact same set of
/// component types. Components are laid out SoA-style: one [`Column`] per
/// type, plus a parallel entity ID vector.
///
/// Columns are stored in signature order (ascending `ComponentId`) for
/// deterministic iteration and binary-search lookups.
pub struct Archetype {
    /// Unique identifier of this archetype.
    id: ArchetypeId,
    signature: Signature,
    /// One column per component type.
    /// Invariant: `columns[i].component() == signature.ids()[i]` for all `i`.
    columns: Vec<Column>,
    /// Back-references to the owning entities (same indexing as columns).
    entities: Vec<EntityId>,
    /// Row capacity shared by every column and the backref vector.
    capacity: usize,
    growth_factor: f32,
}

impl Archetype {
    /// Create a new, empty archetype with one column per id in `signature`.
    pub fn new(
        id: ArchetypeId,
        signature: Signature,
        registry: &ComponentRegistry,
        growth_factor: f32,
    ) -> Result<Self, EcsError> {
        let columns = signature
            .iter()
            .map(|component| registry.info(component).map(Column::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id,
            signature,
            columns,
            entities: Vec::new(),
            capacity: 0,
            growth_factor,
        })
    }

    #[inline]
    fn column_index(&self, component: ComponentId) -> Option<usize> {
        self.signature.position(component)
    }

    /// The archetype's unique ID.
    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    /// The set of component ids that define this archetype.
    #[inline]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Whether this archetype contains the given component type.
    #[inline]
    pub fn has_component(&self, component: ComponentId) -> bool {
        self.column_index(component).is_some()
    }

    /// Number of entities stored in this archetype.
    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether this archetype is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Row capacity before the next growth.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The entity IDs stored in this archetype, by row.
    #[inline]
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// The column holding `component`.
    pub fn column(&self, component: ComponentId) -> Option<&Column> {
        self.column_index(component).map(|idx| &self.columns[idx])
    }

    /// All columns in signature order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub(crate) fn column_base_ptr(&self, component: ComponentId) -> Option<*mut u8> {
        self.column(component).map(Column::base_ptr)
    }

    // -- capacity -------------------------------------------------------------

    /// `ceil((capacity + 1) * growth_factor)`, at least one more slot than the
    /// push that triggered it needs.
    fn next_capacity(&self) -> usize {
        let grown = ((self.capacity + 1) as f64 * f64::from(self.growth_factor)).ceil();
        (grown as usize).max(self.capacity + 2)
    }

    /// Grow every column and the backref vector to `new_capacity` rows.
    pub fn reserve_exact(&mut self, new_capacity: usize) {
        if new_capacity <= self.capacity {
            return;
        }
        tracing::trace!(
            archetype = self.id.0,
            old_capacity = self.capacity,
            new_capacity,
            "growing archetype"
        );
        for column in &mut self.columns {
            column.reserve_exact(new_capacity);
        }
        self.entities
            .reserve_exact(new_capacity - self.entities.len());
        self.capacity = new_capacity;
    }

    fn reserve_for_push(&mut self) {
        if self.len() + 1 >= self.capacity {
            let new_capacity = self.next_capacity();
            self.reserve_exact(new_capacity);
        }
    }

    // -- rows -----------------------------------------------------------------

    /// Append a row for `entity`. The caller must provide exactly one value
    /// for every component type in this archetype, in any order.
    ///
    /// Returns the new row, or [`EcsError::SignatureMismatch`] without
    /// touching any value if the supplied ids differ from the signature.
    ///
    /// # Safety
    ///
    /// Each `(ComponentId, *mut u8)` pair must point to a valid, initialized
    /// value of that component's type. On `Ok`, ownership of each value is
    /// transferred into the archetype and the caller must not drop it.
    pub unsafe fn push(
        &mut self,
        entity: EntityId,
        components: &[(ComponentId, *mut u8)],
    ) -> Result<usize, EcsError> {
        let mut sorted = components.to_vec();
        sorted.sort_by_key(|(component, _)| *component);
        if !sorted
            .iter()
            .map(|(component, _)| *component)
            .eq(self.signature.iter())
        {
            return Err(EcsError::SignatureMismatch {
                expected: self.signature.clone(),
                found: sorted.iter().map(|(component, _)| *component).collect(),
            });
        }

        self.reserve_for_push();
        for (column, (_, src)) in self.columns.iter_mut().zip(sorted) {
            unsafe { column.push(src) };
        }
        let row = self.entities.len();
        self.entities.push(entity);
        debug_assert!(self.is_dense());
        Ok(row)
    }

    /// Remove the row at `row`, dropping its components, using swap-remove to
    /// keep storage dense.
    ///
    /// Returns the entity that was moved into `row` (the previous last entity)
    /// if any swap occurred, or `None` if the removed row was the last.
    pub fn remove_row(&mut self, row: usize) -> Option<EntityId> {
        unsafe { self.remove_row_into(row, None) }
    }

    /// [`remove_row`](Self::remove_row), except that the value of `taken.0`
    /// is moved to `taken.1` instead of being dropped.
    ///
    /// # Safety
    ///
    /// If `taken` is given, its pointer must be valid, aligned, uninitialized
    /// storage for one value of that component.
    pub(crate) unsafe fn remove_row_into(
        &mut self,
        row: usize,
        taken: Option<(ComponentId, *mut u8)>,
    ) -> Option<EntityId> {
        assert!(row < self.len(), "row {row} out of bounds (len {})", self.len());
        for column in &mut self.columns {
            match taken {
                Some((component, dst)) if component == column.component() => unsafe {
                    column.swap_remove_into(row, dst)
                },
                _ => column.swap_remove(row),
            }
        }
        self.entities.swap_remove(row);
        debug_assert!(self.is_dense());
        self.entities.get(row).copied()
    }

    /// Move the row at `row` into `dst`.
    ///
    /// `extra` holds the components `dst` has that `self` lacks; they are
    /// appended into `dst` first. Then each source component is moved over if
    /// `dst` holds it, or dropped in place otherwise (or moved to `taken.1` if
    /// it is `taken.0`). Finally the source row is swap-removed.
    ///
    /// Fails with [`EcsError::SignatureMismatch`], touching nothing, unless
    /// `dst.signature == (self.signature ∩ dst.signature) ∪ ids(extra)` with
    /// `extra` disjoint from `self.signature`.
    ///
    /// # Safety
    ///
    /// Same contract as [`push`](Self::push) for `extra`, and as
    /// [`remove_row_into`](Self::remove_row_into) for `taken`.
    pub unsafe fn migrate_row(
        &mut self,
        row: usize,
        dst: &mut Archetype,
        extra: &[(ComponentId, *mut u8)],
        taken: Option<(ComponentId, *mut u8)>,
    ) -> Result<MigrateOutcome, EcsError> {
        assert!(row < self.len(), "row {row} out of bounds (len {})", self.len());

        let mut found: Vec<ComponentId> = self.signature.intersection(&dst.signature).ids().to_vec();
        found.extend(extra.iter().map(|(component, _)| *component));
        found.sort_unstable();
        let taken_ok = taken.map_or(true, |(component, _)| {
            self.signature.contains(component) && !dst.signature.contains(component)
        });
        if found.as_slice() != dst.signature.ids() || !taken_ok {
            return Err(EcsError::SignatureMismatch {
                expected: dst.signature.clone(),
                found,
            });
        }

        dst.reserve_for_push();
        let dst_row = dst.len();

        for &(component, src) in extra {
            let idx = dst
                .column_index(component)
                .expect("validated component missing from destination");
            unsafe { dst.columns[idx].push(src) };
        }

        for column in &mut self.columns {
            let component = column.component();
            if let Some(idx) = dst.column_index(component) {
                let src = column.slot(row);
                unsafe { dst.columns[idx].push(src) };
                column.swap_remove_forget(row);
            } else {
                match taken {
                    Some((taken_component, out)) if taken_component == component => unsafe {
                        column.swap_remove_into(row, out)
                    },
                    _ => column.swap_remove(row),
                }
            }
        }

        let entity = self.entities.swap_remove(row);
        dst.entities.push(entity);

        debug_assert!(self.is_dense());
        debug_assert!(dst.is_dense());
        Ok(MigrateOutcome {
            dst_row,
            swapped: self.entities.get(row).copied(),
        })
    }

    // -- component access -----------------------------------------------------

    /// Get a reference to a component value.
    pub fn get_component<T: 'static>(&self, row: usize, component: ComponentId) -> Option<&T> {
        self.column(component)?.get::<T>(row)
    }

    /// Get a mutable reference to a component value.
    pub fn get_component_mut<T: 'static>(
        &mut self,
        row: usize,
        component: ComponentId,
    ) -> Option<&mut T> {
        let idx = self.column_index(component)?;
        self.columns[idx].get_mut::<T>(row)
    }

    /// Raw pointer to a component value at `row`.
    pub fn get_component_raw(&self, row: usize, component: ComponentId) -> Option<NonNull<u8>> {
        let column = self.column(component)?;
        if row >= column.len() {
            return None;
        }
        NonNull::new(column.get_raw(row).cast_mut())
    }

    /// The whole column for `component` as a typed slice, indexed by row.
    pub fn column_slice<T: 'static>(&self, component: ComponentId) -> Option<&[T]> {
        self.column(component)?.as_slice::<T>()
    }

    /// Mutable variant of [`column_slice`](Self::column_slice).
    pub fn column_slice_mut<T: 'static>(&mut self, component: ComponentId) -> Option<&mut [T]> {
        let idx = self.column_index(component)?;
        self.columns[idx].as_mut_slice::<T>()
    }

    /// Every column and the backref vector have the same length, within
    /// capacity.
    pub fn is_dense(&self) -> bool {
        let len = self.entities.len();
        len <= self.capacity && self.columns.iter().all(|column| column.len() == len)
    }
}

impl fmt::Debug for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archetype")
            .field("id", &self.id)
            .field("signature", &self.signature)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("columns", &self.columns)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
