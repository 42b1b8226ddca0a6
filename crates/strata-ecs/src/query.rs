//! Query system for iterating entities by component set.
//!
//! A query fetches a tuple of component references and may narrow the
//! matched archetypes with [`With`] and [`Without`] filters. It yields
//! `(EntityId, (&C1, &C2, ...))` for every row of every non-empty archetype
//! whose signature contains all fetched and `With` types and none of the
//! `Without` types. Archetypes are visited in creation order, rows in
//! ascending order.
//!
//! ## Soundness
//!
//! Read-only queries (`&T`) use [`World::query`] which takes `&self`.
//! Mutable queries (`&mut T`) use [`World::query_mut`] which takes `&mut self`,
//! guaranteeing exclusive access to the world and preventing aliasing UB.
//! A query that names the same component mutably twice, or both mutably and
//! immutably, is rejected before iteration starts.

use std::marker::PhantomData;
use std::vec;

use crate::archetype::{Archetype, ArchetypeId};
use crate::component::{ComponentId, ComponentRegistry};
use crate::entity::{EntityId, EntityLocation};
use crate::pool::ArchetypePool;
use crate::signature::Signature;
use crate::world::World;
use crate::EcsError;

// ---------------------------------------------------------------------------
// QueryItem trait -- describes one element in a query tuple
// ---------------------------------------------------------------------------

/// Trait for a single element of a query fetch: `&T` (read) or `&mut T` (write).
pub trait QueryItem {
    /// The output type yielded per-row.
    type Item<'w>;
    /// Whether this item borrows mutably.
    const MUTABLE: bool;
    /// The component this item reads, if its type is registered.
    fn component_id(registry: &ComponentRegistry) -> Option<ComponentId>;
    /// Produce the item for `row` of a column.
    ///
    /// # Safety
    ///
    /// `base` must be the base pointer of a column holding this item's
    /// component type, `row` must be below the column's length, and the
    /// caller must uphold Rust's aliasing rules for the produced reference
    /// over `'w`.
    unsafe fn fetch<'w>(base: *mut u8, row: usize) -> Self::Item<'w>;
}

impl<T: 'static> QueryItem for &T {
    type Item<'w> = &'w T;
    const MUTABLE: bool = false;

    fn component_id(registry: &ComponentRegistry) -> Option<ComponentId> {
        registry.lookup::<T>()
    }

    unsafe fn fetch<'w>(base: *mut u8, row: usize) -> Self::Item<'w> {
        unsafe { &*base.cast::<T>().add(row) }
    }
}

impl<T: 'static> QueryItem for &mut T {
    type Item<'w> = &'w mut T;
    const MUTABLE: bool = true;

    fn component_id(registry: &ComponentRegistry) -> Option<ComponentId> {
        registry.lookup::<T>()
    }

    unsafe fn fetch<'w>(base: *mut u8, row: usize) -> Self::Item<'w> {
        unsafe { &mut *base.cast::<T>().add(row) }
    }
}

// ---------------------------------------------------------------------------
// Query trait -- describes a tuple of QueryItems
// ---------------------------------------------------------------------------

/// Trait for a tuple of query items: `(&A,)`, `(&mut A, &B)`, etc.
pub trait Query {
    /// The per-row output type.
    type Item<'w>;
    /// Whether any item in this query borrows mutably.
    const HAS_MUTABLE: bool;
    /// `(mutable, component)` for each item, in tuple order.
    fn access(registry: &ComponentRegistry) -> Vec<(bool, Option<ComponentId>)>;
    /// Fetch one row. `columns[i]` is the base pointer of item `i`'s column.
    ///
    /// # Safety
    ///
    /// As for [`QueryItem::fetch`], for every item.
    unsafe fn fetch<'w>(columns: &[*mut u8], row: usize) -> Self::Item<'w>;
}

/// Validate that no component type has overlapping mutable and immutable access.
/// Panics if the same ComponentId appears as both `&mut T` and `&T`, or
/// as `&mut T` twice. This prevents aliasing UB in mutable queries.
fn validate_no_access_conflicts(items: &[(bool, Option<ComponentId>)]) {
    let mut mutable_ids: Vec<ComponentId> = Vec::new();
    let mut read_ids: Vec<ComponentId> = Vec::new();
    for &(is_mutable, component) in items {
        let Some(id) = component else { continue };
        if is_mutable {
            if mutable_ids.contains(&id) {
                panic!("query contains duplicate mutable access to the same component type");
            }
            if read_ids.contains(&id) {
                panic!(
                    "query contains overlapping read and mutable access to the same component type"
                );
            }
            mutable_ids.push(id);
        } else {
            if mutable_ids.contains(&id) {
                panic!(
                    "query contains overlapping read and mutable access to the same component type"
                );
            }
            read_ids.push(id);
        }
    }
}

macro_rules! impl_query_tuple {
    ($($item:ident : $idx:tt),+) => {
        impl<$($item: QueryItem),+> Query for ($($item,)+) {
            type Item<'w> = ($($item::Item<'w>,)+);
            const HAS_MUTABLE: bool = $($item::MUTABLE)||+;

            fn access(registry: &ComponentRegistry) -> Vec<(bool, Option<ComponentId>)> {
                vec![$(($item::MUTABLE, $item::component_id(registry))),+]
            }

            unsafe fn fetch<'w>(columns: &[*mut u8], row: usize) -> Self::Item<'w> {
                unsafe { ($($item::fetch(columns[$idx], row),)+) }
            }
        }
    };
}

impl_query_tuple!(A: 0);
impl_query_tuple!(A: 0, B: 1);
impl_query_tuple!(A: 0, B: 1, C: 2);
impl_query_tuple!(A: 0, B: 1, C: 2, D: 3);
impl_query_tuple!(A: 0, B: 1, C: 2, D: 3, E: 4);

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Require `T` without fetching it.
pub struct With<T>(PhantomData<fn() -> T>);

/// Skip archetypes that contain `T`.
pub struct Without<T>(PhantomData<fn() -> T>);

/// Archetype-level filter applied on top of a query's fetched types.
pub trait QueryFilter {
    /// Push the filter's component ids into `include` / `exclude`. Returns
    /// `false` if the filter can never match (a required type is not
    /// registered).
    fn collect(
        registry: &ComponentRegistry,
        include: &mut Vec<ComponentId>,
        exclude: &mut Vec<ComponentId>,
    ) -> bool;
}

impl QueryFilter for () {
    fn collect(_: &ComponentRegistry, _: &mut Vec<ComponentId>, _: &mut Vec<ComponentId>) -> bool {
        true
    }
}

impl<T: 'static> QueryFilter for With<T> {
    fn collect(
        registry: &ComponentRegistry,
        include: &mut Vec<ComponentId>,
        _exclude: &mut Vec<ComponentId>,
    ) -> bool {
        match registry.lookup::<T>() {
            Some(id) => {
                include.push(id);
                true
            }
            None => false,
        }
    }
}

impl<T: 'static> QueryFilter for Without<T> {
    fn collect(
        registry: &ComponentRegistry,
        _include: &mut Vec<ComponentId>,
        exclude: &mut Vec<ComponentId>,
    ) -> bool {
        // Nothing can contain an unregistered type.
        if let Some(id) = registry.lookup::<T>() {
            exclude.push(id);
        }
        true
    }
}

macro_rules! impl_filter_tuple {
    ($($filter:ident),+) => {
        impl<$($filter: QueryFilter),+> QueryFilter for ($($filter,)+) {
            fn collect(
                registry: &ComponentRegistry,
                include: &mut Vec<ComponentId>,
                exclude: &mut Vec<ComponentId>,
            ) -> bool {
                let mut satisfiable = true;
                $(satisfiable &= $filter::collect(registry, include, exclude);)+
                satisfiable
            }
        }
    };
}

impl_filter_tuple!(A);
impl_filter_tuple!(A, B);
impl_filter_tuple!(A, B, C);
impl_filter_tuple!(A, B, C, D);

// ---------------------------------------------------------------------------
// QueryDescriptor
// ---------------------------------------------------------------------------

/// Resolved include/exclude sets of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDescriptor {
    include: Signature,
    exclude: Signature,
    /// Some required type is unregistered, so no archetype can match.
    unsatisfiable: bool,
}

impl QueryDescriptor {
    /// Build a descriptor from explicit id sets.
    ///
    /// # Errors
    ///
    /// [`EcsError::ConflictingFilter`] if a component is both included and
    /// excluded.
    pub fn new(include: Signature, exclude: Signature) -> Result<Self, EcsError> {
        if let Some(component) = include.first_shared(&exclude) {
            return Err(EcsError::ConflictingFilter { component });
        }
        Ok(Self {
            include,
            exclude,
            unsatisfiable: false,
        })
    }

    /// Resolve the sets of a typed query against `registry`.
    pub fn of<Q: Query, F: QueryFilter>(registry: &ComponentRegistry) -> Result<Self, EcsError> {
        let access = Q::access(registry);
        let mut unsatisfiable = access.iter().any(|(_, component)| component.is_none());
        let mut include: Vec<ComponentId> = access.iter().filter_map(|(_, c)| *c).collect();
        let mut exclude = Vec::new();
        if !F::collect(registry, &mut include, &mut exclude) {
            unsatisfiable = true;
        }
        let mut descriptor = Self::new(Signature::from_ids(include), Signature::from_ids(exclude))?;
        descriptor.unsatisfiable = unsatisfiable;
        Ok(descriptor)
    }

    pub fn include(&self) -> &Signature {
        &self.include
    }

    pub fn exclude(&self) -> &Signature {
        &self.exclude
    }

    /// Whether an archetype with `signature` qualifies, ignoring emptiness.
    pub fn accepts(&self, signature: &Signature) -> bool {
        !self.unsatisfiable
            && signature.is_superset_of(&self.include)
            && signature.is_disjoint(&self.exclude)
    }

    /// Whether some required type is unregistered, so nothing can match.
    pub fn is_unsatisfiable(&self) -> bool {
        self.unsatisfiable
    }
}

// ---------------------------------------------------------------------------
// Row cursor shared by both iterators
// ---------------------------------------------------------------------------

struct Cursor<'w> {
    pool: &'w ArchetypePool,
    archetypes: vec::IntoIter<ArchetypeId>,
    /// Fetched components, in query tuple order.
    components: Vec<ComponentId>,
    /// Column base pointers of the current archetype, parallel to `components`.
    columns: Vec<*mut u8>,
    entities: &'w [EntityId],
    row: usize,
    current: Option<ArchetypeId>,
    /// Rows of dropped handles awaiting removal; never yielded.
    hidden: Vec<EntityLocation>,
}

impl<'w> Cursor<'w> {
    fn new(
        pool: &'w ArchetypePool,
        archetypes: Vec<ArchetypeId>,
        components: Vec<ComponentId>,
        hidden: Vec<EntityLocation>,
    ) -> Self {
        Self {
            pool,
            archetypes: archetypes.into_iter(),
            columns: Vec::with_capacity(components.len()),
            components,
            entities: &[],
            row: 0,
            current: None,
            hidden,
        }
    }

    fn is_hidden(&self, archetype: ArchetypeId, row: usize) -> bool {
        self.hidden
            .iter()
            .any(|location| location.archetype == archetype && location.row == row)
    }

    /// Step to the next row, loading column pointers when crossing into a
    /// new archetype.
    fn advance(&mut self) -> Option<(EntityId, usize)> {
        loop {
            if let Some(&entity) = self.entities.get(self.row) {
                let row = self.row;
                self.row += 1;
                if self.current.is_some_and(|archetype| self.is_hidden(archetype, row)) {
                    continue;
                }
                return Some((entity, row));
            }
            let pool: &'w ArchetypePool = self.pool;
            let id = self.archetypes.next()?;
            let archetype = &pool[id];
            self.current = Some(id);
            self.entities = archetype.entities();
            self.row = 0;
            self.columns.clear();
            self.columns.extend(self.components.iter().map(|&component| {
                archetype
                    .column_base_ptr(component)
                    .expect("matched archetype is missing a fetched column")
            }));
        }
    }

    fn remaining(&self) -> usize {
        let upcoming = self.archetypes.as_slice();
        let rest: usize = upcoming.iter().map(|&id| self.pool[id].len()).sum();
        let skipped = self
            .hidden
            .iter()
            .filter(|location| {
                upcoming.contains(&location.archetype)
                    || (Some(location.archetype) == self.current && location.row >= self.row)
            })
            .count();
        rest + self.entities.len().saturating_sub(self.row) - skipped
    }
}

// ---------------------------------------------------------------------------
// QueryIter (read-only)
// ---------------------------------------------------------------------------

/// Iterator that yields `(EntityId, Q::Item)` for all matching entities.
/// Used for read-only queries via `World::query`.
pub struct QueryIter<'w, Q: Query> {
    cursor: Cursor<'w>,
    _marker: PhantomData<Q>,
}

impl<'w, Q: Query> Iterator for QueryIter<'w, Q> {
    type Item = (EntityId, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        let (entity, row) = self.cursor.advance()?;
        // Q has no mutable items and the world is borrowed shared for 'w.
        let item = unsafe { Q::fetch(&self.cursor.columns, row) };
        Some((entity, item))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.cursor.remaining();
        (remaining, Some(remaining))
    }
}

impl<Q: Query> ExactSizeIterator for QueryIter<'_, Q> {}

// ---------------------------------------------------------------------------
// QueryIterMut (mutable)
// ---------------------------------------------------------------------------

/// Iterator that yields `(EntityId, Q::Item)` for all matching entities.
/// Used for mutable queries via `World::query_mut`.
///
/// The world stays exclusively borrowed for `'w`, and every row is yielded
/// once, so `&mut` items never alias.
pub struct QueryIterMut<'w, Q: Query> {
    cursor: Cursor<'w>,
    _marker: PhantomData<(Q, &'w mut World)>,
}

impl<'w, Q: Query> Iterator for QueryIterMut<'w, Q> {
    type Item = (EntityId, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        let (entity, row) = self.cursor.advance()?;
        let item = unsafe { Q::fetch(&self.cursor.columns, row) };
        Some((entity, item))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.cursor.remaining();
        (remaining, Some(remaining))
    }
}

impl<Q: Query> ExactSizeIterator for QueryIterMut<'_, Q> {}

// ---------------------------------------------------------------------------
// World query methods
// ---------------------------------------------------------------------------

impl World {
    /// Ids of the non-empty archetypes matched by `descriptor`, in creation
    /// order.
    pub fn matching_archetypes(&self, descriptor: &QueryDescriptor) -> Vec<ArchetypeId> {
        if descriptor.is_unsatisfiable() {
            return Vec::new();
        }
        self.pool.matching(descriptor.include(), descriptor.exclude())
    }

    /// Id-level view: every matched row as `(entity, archetype, row)`.
    ///
    /// This is the form to use with raw components, through
    /// [`Archetype::get_component_raw`].
    pub fn matching_rows<'w>(
        &'w self,
        descriptor: &QueryDescriptor,
    ) -> impl Iterator<Item = (EntityId, &'w Archetype, usize)> + 'w {
        let hidden = self.hidden_rows();
        self.matching_archetypes(descriptor)
            .into_iter()
            .flat_map(move |id| {
                let archetype = &self.pool[id];
                archetype
                    .entities()
                    .iter()
                    .enumerate()
                    .map(move |(row, &entity)| (entity, archetype, row))
            })
            .filter(move |(_, archetype, row)| {
                !hidden.contains(&EntityLocation {
                    archetype: archetype.id(),
                    row: *row,
                })
            })
    }

    fn cursor_for<Q: Query>(&self, descriptor: &QueryDescriptor) -> Cursor<'_> {
        let components = Q::access(&self.registry)
            .into_iter()
            .filter_map(|(_, component)| component)
            .collect();
        Cursor::new(
            &self.pool,
            self.matching_archetypes(descriptor),
            components,
            self.hidden_rows(),
        )
    }

    /// Run a read-only query over all matching entities.
    ///
    /// # Panics
    ///
    /// Panics if the query contains mutable items. Use `query_mut` instead.
    ///
    /// ```
    /// # use strata_ecs::prelude::*;
    /// # struct Pos(f32);
    /// # struct Vel(f32);
    /// let mut world = World::new();
    /// world.register_component::<Pos>("pos");
    /// world.register_component::<Vel>("vel");
    /// let moving = world.spawn(
    ///     ComponentBundle::new()
    ///         .with(world.registry(), Pos(0.0))?
    ///         .with(world.registry(), Vel(1.0))?,
    /// )?;
    /// let _still = world.spawn_with(Pos(5.0))?;
    ///
    /// let hits: Vec<_> = world.query::<(&Pos, &Vel)>().map(|(id, _)| id).collect();
    /// assert_eq!(hits, vec![moving.id()]);
    /// # Ok::<(), EcsError>(())
    /// ```
    pub fn query<Q: Query>(&self) -> QueryIter<'_, Q> {
        self.query_filtered::<Q, ()>()
    }

    /// [`query`](Self::query) narrowed by a [`QueryFilter`].
    ///
    /// # Panics
    ///
    /// Panics on mutable items, and with "conflicting query filter" if a
    /// component is both required and excluded.
    pub fn query_filtered<Q: Query, F: QueryFilter>(&self) -> QueryIter<'_, Q> {
        match self.try_query_filtered::<Q, F>() {
            Ok(iter) => iter,
            Err(err) => panic!("conflicting query filter: {err}"),
        }
    }

    /// Like [`query_filtered`](Self::query_filtered), but reports a
    /// conflicting filter as [`EcsError::ConflictingFilter`].
    pub fn try_query_filtered<Q: Query, F: QueryFilter>(&self) -> Result<QueryIter<'_, Q>, EcsError> {
        assert!(
            !Q::HAS_MUTABLE,
            "World::query() cannot be used with mutable query items (&mut T). \
             Use World::query_mut() instead, which requires &mut self."
        );
        let descriptor = QueryDescriptor::of::<Q, F>(&self.registry)?;
        Ok(QueryIter {
            cursor: self.cursor_for::<Q>(&descriptor),
            _marker: PhantomData,
        })
    }

    /// Run a mutable query over all matching entities.
    ///
    /// # Panics
    ///
    /// Panics if the same component type appears as `&mut T` more than once
    /// in the query tuple, or both as `&mut T` and `&T`.
    ///
    /// ```
    /// # use strata_ecs::prelude::*;
    /// # struct Pos(f32);
    /// # struct Vel(f32);
    /// # let mut world = World::new();
    /// # world.register_component::<Pos>("pos");
    /// # world.register_component::<Vel>("vel");
    /// # let e = world.spawn(ComponentBundle::new()
    /// #     .with(world.registry(), Pos(0.0))?
    /// #     .with(world.registry(), Vel(2.0))?)?;
    /// for (_entity, (pos, vel)) in world.query_mut::<(&mut Pos, &Vel)>() {
    ///     pos.0 += vel.0;
    /// }
    /// assert_eq!(world.get::<Pos>(&e)?.0, 2.0);
    /// # Ok::<(), EcsError>(())
    /// ```
    pub fn query_mut<Q: Query>(&mut self) -> QueryIterMut<'_, Q> {
        self.query_filtered_mut::<Q, ()>()
    }

    /// [`query_mut`](Self::query_mut) narrowed by a [`QueryFilter`].
    ///
    /// # Panics
    ///
    /// As [`query_mut`](Self::query_mut), and on a conflicting filter.
    pub fn query_filtered_mut<Q: Query, F: QueryFilter>(&mut self) -> QueryIterMut<'_, Q> {
        validate_no_access_conflicts(&Q::access(&self.registry));
        self.despawn_dropped();
        let descriptor = match QueryDescriptor::of::<Q, F>(&self.registry) {
            Ok(descriptor) => descriptor,
            Err(err) => panic!("conflicting query filter: {err}"),
        };
        QueryIterMut {
            cursor: self.cursor_for::<Q>(&descriptor),
            _marker: PhantomData,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
