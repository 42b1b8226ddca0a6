//! Component-set signatures.
//!
//! A [`Signature`] is the exact set of component ids an archetype (and every
//! entity stored in it) carries. It is kept sorted and deduplicated so that
//! two signatures compare equal exactly when they describe the same set, and
//! so archetype columns can be laid out in ascending id order.

use std::cmp::Ordering;
use std::fmt;

use crate::component::ComponentId;

/// A sorted, duplicate-free set of [`ComponentId`]s.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(Vec<ComponentId>);

impl Signature {
    /// The empty signature.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a signature from ids in any order; duplicates collapse.
    pub fn from_ids(ids: impl IntoIterator<Item = ComponentId>) -> Self {
        let mut ids: Vec<ComponentId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self(ids)
    }

    /// The ids in ascending order.
    #[inline]
    pub fn ids(&self) -> &[ComponentId] {
        &self.0
    }

    /// Iterate ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = ComponentId> + '_ {
        self.0.iter().copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Column position of `id`, if present.
    #[inline]
    pub fn position(&self, id: ComponentId) -> Option<usize> {
        self.0.binary_search(&id).ok()
    }

    #[inline]
    pub fn contains(&self, id: ComponentId) -> bool {
        self.position(id).is_some()
    }

    /// `self ∪ {id}`.
    pub fn with(&self, id: ComponentId) -> Self {
        let mut ids = self.0.clone();
        if let Err(at) = ids.binary_search(&id) {
            ids.insert(at, id);
        }
        Self(ids)
    }

    /// `self \ {id}`.
    pub fn without(&self, id: ComponentId) -> Self {
        let mut ids = self.0.clone();
        if let Ok(at) = ids.binary_search(&id) {
            ids.remove(at);
        }
        Self(ids)
    }

    /// Ids present in both signatures.
    pub fn intersection(&self, other: &Signature) -> Self {
        Self(self.iter().filter(|id| other.contains(*id)).collect())
    }

    /// True if every id of `other` is also in `self`.
    pub fn is_superset_of(&self, other: &Signature) -> bool {
        if other.len() > self.len() {
            return false;
        }
        let mut mine = self.0.iter();
        'required: for id in &other.0 {
            for candidate in mine.by_ref() {
                match candidate.cmp(id) {
                    Ordering::Less => continue,
                    Ordering::Equal => continue 'required,
                    Ordering::Greater => return false,
                }
            }
            return false;
        }
        true
    }

    /// True if the two signatures share no id.
    pub fn is_disjoint(&self, other: &Signature) -> bool {
        self.first_shared(other).is_none()
    }

    /// Smallest id present in both signatures.
    pub fn first_shared(&self, other: &Signature) -> Option<ComponentId> {
        let (mut a, mut b) = (0, 0);
        while a < self.0.len() && b < other.0.len() {
            match self.0[a].cmp(&other.0[b]) {
                Ordering::Less => a += 1,
                Ordering::Greater => b += 1,
                Ordering::Equal => return Some(self.0[a]),
            }
        }
        None
    }
}

impl FromIterator<ComponentId> for Signature {
    fn from_iter<I: IntoIterator<Item = ComponentId>>(iter: I) -> Self {
        Self::from_ids(iter)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.iter().map(|id| id.0)).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(ids: &[u32]) -> Signature {
        Signature::from_ids(ids.iter().map(|&i| ComponentId(i)))
    }

    #[test]
    fn order_and_duplicates_do_not_matter() {
        assert_eq!(sig(&[3, 1, 2]), sig(&[1, 2, 3, 2]));
        assert_eq!(sig(&[3, 1]).ids(), &[ComponentId(1), ComponentId(3)]);
    }

    #[test]
    fn with_and_without() {
        let s = sig(&[1, 4]);
        assert_eq!(s.with(ComponentId(2)), sig(&[1, 2, 4]));
        assert_eq!(s.with(ComponentId(4)), s);
        assert_eq!(s.without(ComponentId(1)), sig(&[4]));
        assert_eq!(s.without(ComponentId(9)), s);
    }

    #[test]
    fn superset() {
        assert!(sig(&[1, 2, 5]).is_superset_of(&sig(&[1, 5])));
        assert!(sig(&[1, 2, 5]).is_superset_of(&Signature::new()));
        assert!(!sig(&[1, 2, 5]).is_superset_of(&sig(&[3])));
        assert!(!sig(&[1]).is_superset_of(&sig(&[1, 2])));
        assert!(!sig(&[2, 3]).is_superset_of(&sig(&[1, 3])));
    }

    #[test]
    fn disjoint() {
        assert!(sig(&[1, 3]).is_disjoint(&sig(&[2, 4])));
        assert_eq!(sig(&[1, 3, 7]).first_shared(&sig(&[0, 7])), Some(ComponentId(7)));
        assert!(Signature::new().is_disjoint(&sig(&[1])));
    }

    #[test]
    fn intersection_keeps_order() {
        assert_eq!(sig(&[5, 1, 3]).intersection(&sig(&[3, 5, 9])), sig(&[3, 5]));
    }

    #[test]
    fn debug_prints_as_set() {
        assert_eq!(format!("{:?}", sig(&[2, 0])), "{0, 2}");
    }
}
