//! Strata ECS -- an in-memory, archetype-based entity component store.
//!
//! Entities are stored in archetypes (one per unique set of component types)
//! using a Structure-of-Arrays (SoA) layout for cache-friendly iteration.
//! Component values are type-erased and relocated only through the move and
//! drop operations captured at registration, so any `Send + Sync + 'static`
//! type can be stored, with destructors always running exactly once.
//! Generational entity IDs enable immediate stale-reference detection.
//!
//! # Quick Start
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut world = World::new();
//! world.register_component::<Position>("position");
//! world.register_component::<Velocity>("velocity");
//!
//! let mut bundle = ComponentBundle::new();
//! bundle.add(world.registry(), Position { x: 0.0, y: 0.0 })?;
//! bundle.add(world.registry(), Velocity { dx: 1.0, dy: 0.0 })?;
//! let entity = world.spawn(bundle)?;
//!
//! for (_id, (pos, vel)) in world.query_mut::<(&mut Position, &Velocity)>() {
//!     pos.x += vel.dx;
//! }
//! assert_eq!(world.get::<Position>(&entity)?, &Position { x: 1.0, y: 0.0 });
//!
//! world.despawn(entity)?;
//! # Ok::<(), EcsError>(())
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod archetype;
#[allow(unsafe_code)]
pub mod component;
pub mod entity;
pub mod pool;
#[allow(unsafe_code)]
pub mod query;
pub mod signature;
#[allow(unsafe_code)]
pub mod world;

use component::ComponentId;
use entity::{EntityId, WorldId};
use signature::Signature;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// A Rust type was used as a component before being registered.
    #[error("component type '{name}' is not registered")]
    UnknownComponent { name: &'static str },

    /// A component id outside the registry's range.
    #[error("component id {0:?} is not registered")]
    UnknownComponentId(ComponentId),

    /// The entity does not exist (despawned, or never allocated here).
    #[error("entity {0:?} does not exist (stale or never allocated)")]
    StaleEntity(EntityId),

    /// The handle was issued by a different world.
    #[error("entity {0:?} belongs to a different world")]
    ForeignEntity(EntityId),

    /// A bundle was built against another world's registry.
    #[error("bundle built for {bundle} cannot be used with {world}")]
    ForeignBundle { bundle: WorldId, world: WorldId },

    /// The entity already holds the component being added.
    #[error("entity {entity:?} already has component {component:?}")]
    DuplicateComponent {
        entity: EntityId,
        component: ComponentId,
    },

    /// A bundle was given two values of the same component.
    #[error("component {component:?} added to a bundle twice")]
    DuplicateInBundle { component: ComponentId },

    /// The entity does not hold the component being accessed or removed.
    #[error("entity {entity:?} has no component {component:?}")]
    MissingComponent {
        entity: EntityId,
        component: ComponentId,
    },

    /// A row was built with a component set other than the archetype's.
    #[error("row components {found:?} do not match archetype signature {expected:?}")]
    SignatureMismatch {
        expected: Signature,
        found: Vec<ComponentId>,
    },

    /// An archetype with this signature already exists in the pool.
    #[error("an archetype with signature {0:?} already exists")]
    DuplicateSignature(Signature),

    /// A query both requires and excludes the same component.
    #[error("component {component:?} is both included and excluded")]
    ConflictingFilter { component: ComponentId },

    /// A [`WorldConfig`](world::WorldConfig) failed validation.
    #[error("invalid world config: {details}")]
    InvalidConfig { details: String },

    /// [`World::check_integrity`](world::World::check_integrity) found a
    /// broken invariant.
    #[error("store integrity violated: {details}")]
    IntegrityViolation { details: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeId, Column};
    pub use crate::component::{ComponentId, ComponentInfo, ComponentRegistry, ComponentVtable};
    pub use crate::entity::{Entity, EntityId, EntityLocation, WorldId};
    pub use crate::pool::ArchetypePool;
    pub use crate::query::{
        Query, QueryDescriptor, QueryFilter, QueryItem, QueryIter, QueryIterMut, With, Without,
    };
    pub use crate::signature::Signature;
    pub use crate::world::{ComponentBundle, World, WorldConfig};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    // -- test component types -----------------------------------------------

    #[derive(Debug, Clone, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);

    fn setup_world() -> World {
        let mut world = World::new();
        world.register_component::<Position>("position");
        world.register_component::<Velocity>("velocity");
        world.register_component::<Health>("health");
        world
    }

    fn spawn_pv(world: &mut World, x: f32) -> Entity {
        let mut b = ComponentBundle::new();
        b.add(world.registry(), Position { x, y: 0.0 }).unwrap();
        b.add(world.registry(), Velocity { dx: 1.0, dy: 0.0 }).unwrap();
        world.spawn(b).unwrap()
    }

    // -- spawn / despawn integration ----------------------------------------

    #[test]
    fn spawn_entities_with_components_and_query_back() {
        let mut world = setup_world();
        let e = spawn_pv(&mut world, 1.0);

        assert_eq!(
            world.get::<Position>(&e).unwrap(),
            &Position { x: 1.0, y: 0.0 }
        );
        assert_eq!(
            world.get::<Velocity>(&e).unwrap(),
            &Velocity { dx: 1.0, dy: 0.0 }
        );
    }

    #[test]
    fn despawn_entity_verify_gone() {
        let mut world = setup_world();
        let e = world.spawn_with(Position { x: 0.0, y: 0.0 }).unwrap();
        let id = e.id();
        world.despawn(e).unwrap();
        assert!(!world.is_alive(id));
        assert_eq!(world.entity_count(), 0);

        // The recycled index carries a new generation.
        let next = world.spawn_with(Health(1)).unwrap();
        assert_eq!(next.id().index(), id.index());
        assert_ne!(next.id(), id);
    }

    #[test]
    fn component_round_trip_restores_signature() {
        let mut world = setup_world();
        let e = spawn_pv(&mut world, 3.0);
        let before = world.signature_of(&e).unwrap().clone();

        world.add_component(&e, Health(7)).unwrap();
        assert_eq!(world.signature_of(&e).unwrap().len(), 3);
        world.remove_component::<Health>(&e).unwrap();

        assert_eq!(world.signature_of(&e), Some(&before));
        assert_eq!(world.get::<Position>(&e).unwrap().x, 3.0);
        assert_eq!(world.get::<Velocity>(&e).unwrap().dx, 1.0);
        world.check_integrity().unwrap();
    }

    #[test]
    fn migration_fixes_up_swapped_entity() {
        let mut world = setup_world();
        let a = spawn_pv(&mut world, 0.0);
        let b = spawn_pv(&mut world, 1.0);
        let c = spawn_pv(&mut world, 2.0);

        // a leaves row 0; c is swapped into it.
        world.add_component(&a, Health(1)).unwrap();

        assert_eq!(world.location(&c).unwrap().row, 0);
        assert_eq!(world.location(&b).unwrap().row, 1);
        assert_eq!(world.get::<Position>(&c).unwrap().x, 2.0);
        world.check_integrity().unwrap();
    }

    #[test]
    fn handles_moved_between_containers_stay_valid() {
        let mut world = setup_world();
        let mut handles: Vec<Entity> = (0..8)
            .map(|i| world.spawn_with(Health(i)).unwrap())
            .collect();

        // Reorder the handles; storage is unaffected.
        handles.reverse();
        let moved: Vec<Entity> = handles.drain(..).collect();

        for (i, handle) in moved.iter().enumerate() {
            assert_eq!(world.get::<Health>(handle).unwrap(), &Health(7 - i as u32));
        }
        for handle in moved {
            world.despawn(handle).unwrap();
        }
        assert_eq!(world.entity_count(), 0);
        world.check_integrity().unwrap();
    }

    #[test]
    fn query_after_structural_changes() {
        let mut world = setup_world();
        let a = spawn_pv(&mut world, 0.0);
        let b = spawn_pv(&mut world, 10.0);
        world.remove_component::<Velocity>(&b).unwrap();

        for (_, (pos, vel)) in world.query_mut::<(&mut Position, &Velocity)>() {
            pos.x += vel.dx;
        }

        assert_eq!(world.get::<Position>(&a).unwrap().x, 1.0);
        assert_eq!(world.get::<Position>(&b).unwrap().x, 10.0);
        assert_eq!(world.query::<(&Position,)>().count(), 2);
    }

    #[test]
    fn independent_worlds() {
        let mut first = setup_world();
        let mut second = World::new();
        second.register_component::<Health>("health");

        let _a = first.spawn_with(Health(1)).unwrap();
        let _b = second.spawn_with(Health(2)).unwrap();
        let _c = second.spawn_with(Health(3)).unwrap();

        assert_eq!(first.query::<(&Health,)>().count(), 1);
        assert_eq!(second.query::<(&Health,)>().count(), 2);
    }

    #[test]
    fn error_messages_are_descriptive() {
        let world = setup_world();
        let err = world.registry().require::<String>().unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("component type '"), "{message}");
        assert!(message.contains("String"), "{message}");
    }

    #[test]
    fn world_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<World>();
        assert_send_sync::<Entity>();
    }
}
