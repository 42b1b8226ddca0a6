//! The archetype pool: every archetype of a world, indexed by signature.
//!
//! Archetypes are never removed. An [`ArchetypeId`] is the archetype's
//! position in the pool, so it stays valid as the pool grows, and iteration
//! follows creation order.

use std::collections::HashMap;
use std::ops::{Index, IndexMut};

use crate::archetype::{Archetype, ArchetypeId};
use crate::component::ComponentRegistry;
use crate::signature::Signature;
use crate::EcsError;

/// Owns all archetypes of a world.
#[derive(Debug, Default)]
pub struct ArchetypePool {
    archetypes: Vec<Archetype>,
    index: HashMap<Signature, ArchetypeId>,
}

impl ArchetypePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of archetypes, including empty ones.
    #[inline]
    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }

    /// The id the next inserted archetype will receive.
    #[inline]
    pub fn next_id(&self) -> ArchetypeId {
        ArchetypeId(u32::try_from(self.archetypes.len()).expect("archetype id space exhausted"))
    }

    /// Archetypes in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter()
    }

    pub fn get(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id.index())
    }

    pub fn get_mut(&mut self, id: ArchetypeId) -> Option<&mut Archetype> {
        self.archetypes.get_mut(id.index())
    }

    /// Exact-match lookup.
    pub fn find(&self, signature: &Signature) -> Option<ArchetypeId> {
        self.index.get(signature).copied()
    }

    /// Add a freshly built archetype. Its id must be [`next_id`](Self::next_id).
    ///
    /// # Errors
    ///
    /// [`EcsError::DuplicateSignature`] if an archetype with the same
    /// signature already exists; the pool is left untouched.
    pub fn insert(&mut self, archetype: Archetype) -> Result<ArchetypeId, EcsError> {
        if self.index.contains_key(archetype.signature()) {
            return Err(EcsError::DuplicateSignature(archetype.signature().clone()));
        }
        let id = self.next_id();
        assert_eq!(archetype.id(), id, "archetype built with a foreign id");

        tracing::debug!(
            archetype = id.0,
            signature = ?archetype.signature(),
            components = archetype.signature().len(),
            "created archetype"
        );
        self.index.insert(archetype.signature().clone(), id);
        self.archetypes.push(archetype);
        Ok(id)
    }

    /// Return the archetype for `signature`, creating it on a miss.
    pub fn get_or_create(
        &mut self,
        signature: &Signature,
        registry: &ComponentRegistry,
        growth_factor: f32,
        initial_capacity: usize,
    ) -> Result<ArchetypeId, EcsError> {
        if let Some(id) = self.find(signature) {
            return Ok(id);
        }
        let mut archetype = Archetype::new(self.next_id(), signature.clone(), registry, growth_factor)?;
        archetype.reserve_exact(initial_capacity);
        self.insert(archetype)
    }

    /// Every archetype whose signature contains all of `required`, empty or
    /// not, in creation order.
    pub fn find_supersets(&self, required: &Signature) -> Vec<ArchetypeId> {
        self.filter(|archetype| archetype.signature().is_superset_of(required))
    }

    /// Non-empty archetypes containing all of `include` and none of `exclude`.
    pub fn matching(&self, include: &Signature, exclude: &Signature) -> Vec<ArchetypeId> {
        let mut found = self.find_supersets(include);
        found.retain(|&id| {
            let archetype = &self[id];
            !archetype.is_empty() && archetype.signature().is_disjoint(exclude)
        });
        found
    }

    /// Archetypes accepted by `predicate`, in creation order.
    pub fn filter(&self, mut predicate: impl FnMut(&Archetype) -> bool) -> Vec<ArchetypeId> {
        self.archetypes
            .iter()
            .filter(|archetype| predicate(archetype))
            .map(Archetype::id)
            .collect()
    }

    /// Borrow two distinct archetypes mutably at once.
    ///
    /// # Panics
    ///
    /// Panics if `a == b` or either id is out of range.
    pub fn pair_mut(&mut self, a: ArchetypeId, b: ArchetypeId) -> (&mut Archetype, &mut Archetype) {
        assert_ne!(a, b, "pair_mut needs two distinct archetypes");
        let (ai, bi) = (a.index(), b.index());
        if ai < bi {
            let (left, right) = self.archetypes.split_at_mut(bi);
            (&mut left[ai], &mut right[0])
        } else {
            let (left, right) = self.archetypes.split_at_mut(ai);
            (&mut right[0], &mut left[bi])
        }
    }
}

impl Index<ArchetypeId> for ArchetypePool {
    type Output = Archetype;

    fn index(&self, id: ArchetypeId) -> &Archetype {
        &self.archetypes[id.index()]
    }
}

impl IndexMut<ArchetypeId> for ArchetypePool {
    fn index_mut(&mut self, id: ArchetypeId) -> &mut Archetype {
        &mut self.archetypes[id.index()]
    }
}
