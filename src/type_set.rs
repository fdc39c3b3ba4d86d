//! Order-independent sets of types with a stable content hash.
//!
//! A projection declares the event types it handles as a [`TypeSet`]. The
//! set's hash identifies the projection's event interest: two projections
//! declaring the same events (in any order) share one hash, which the store
//! uses to name the projection's stream.

use std::any::TypeId;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use crate::types::TypeKey;

/// Content hash of a [`TypeSet`] (XXH3-128 of the sorted member names).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeSetHash(u128);

impl TypeSetHash {
    /// Returns the raw 128-bit value.
    pub fn as_raw(&self) -> u128 {
        self.0
    }
}

impl fmt::Display for TypeSetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// An immutable, deduplicated collection of [`TypeKey`]s.
///
/// # Invariants
///
/// - No duplicate `TypeId`s (the first occurrence wins)
/// - Iteration follows insertion order of the deduplicated members
/// - `hash()` depends only on the members, never on their order
/// - Equality is hash equality
pub struct TypeSet {
    types: Vec<TypeKey>,
    index: HashSet<TypeId>,
    hash: OnceLock<TypeSetHash>,
}

impl TypeSet {
    /// Creates a set from any iterator of type keys, dropping duplicates.
    pub fn new(types: impl IntoIterator<Item = TypeKey>) -> Self {
        let mut index = HashSet::new();
        let types = types
            .into_iter()
            .filter(|key| index.insert(key.id()))
            .collect();

        Self {
            types,
            index,
            hash: OnceLock::new(),
        }
    }

    /// Creates an empty set.
    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }

    /// Returns true if `key` is a member.
    pub fn contains(&self, key: &TypeKey) -> bool {
        self.index.contains(&key.id())
    }

    /// Returns true if `T` is a member.
    pub fn contains_type<T: ?Sized + 'static>(&self) -> bool {
        self.index.contains(&TypeId::of::<T>())
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns true if the set has no members.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Returns the member at `index` in insertion order.
    pub fn get(&self, index: usize) -> Option<&TypeKey> {
        self.types.get(index)
    }

    /// Iterates over the members in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &TypeKey> {
        self.types.iter()
    }

    /// Returns the content hash, computing it on first use.
    ///
    /// Names are sorted before hashing and separated by a NUL byte, so
    /// `{"AB", "C"}` and `{"A", "BC"}` hash differently.
    pub fn hash(&self) -> TypeSetHash {
        *self.hash.get_or_init(|| {
            let mut names: Vec<&str> = self.types.iter().map(|key| key.name()).collect();
            names.sort_unstable();

            let mut buf = Vec::with_capacity(names.iter().map(|n| n.len() + 1).sum());
            for name in names {
                buf.extend_from_slice(name.as_bytes());
                buf.push(0);
            }

            TypeSetHash(xxhash_rust::xxh3::xxh3_128(&buf))
        })
    }
}

impl Clone for TypeSet {
    fn clone(&self) -> Self {
        let hash = OnceLock::new();
        if let Some(computed) = self.hash.get() {
            let _ = hash.set(*computed);
        }

        Self {
            types: self.types.clone(),
            index: self.index.clone(),
            hash,
        }
    }
}

impl PartialEq for TypeSet {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for TypeSet {}

impl Hash for TypeSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        TypeSet::hash(self).hash(state);
    }
}

impl fmt::Debug for TypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.types.iter().map(|key| key.name())).finish()
    }
}

impl FromIterator<TypeKey> for TypeSet {
    fn from_iter<I: IntoIterator<Item = TypeKey>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl<'a> IntoIterator for &'a TypeSet {
    type Item = &'a TypeKey;
    type IntoIter = std::slice::Iter<'a, TypeKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.types.iter()
    }
}
