//! Map and set types used by `dagon`, seeded with a faster hasher
//! than the standard library default.

use std::collections::hash_map::RandomState as StdRandomState;
use std::hash::BuildHasherDefault;

use twox_hash::XxHash64;

/// Hasher builder used by the collections in this module.
pub type RandomState = BuildHasherDefault<XxHash64>;

/// A hash map.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

/// A hash set.
pub type HashSet<T> = std::collections::HashSet<T, RandomState>;

/// A hash map that maintains insertion order, used where eviction
/// needs to walk entries oldest first.
pub type OrderedMap<K, V> = linked_hash_map::LinkedHashMap<K, V, StdRandomState>;

/// Creates a new `HashMap`.
pub fn hash_map<K, V>() -> HashMap<K, V> {
    HashMap::default()
}

/// Creates a new `HashMap` with the given capacity.
pub fn hash_map_capacity<K, V>(cap: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(cap, RandomState::default())
}

/// Creates a new `HashSet`.
pub fn hash_set<T>() -> HashSet<T> {
    HashSet::default()
}

/// Creates a new `OrderedMap`.
pub fn ordered_map<K, V>() -> OrderedMap<K, V>
where
    K: std::hash::Hash + Eq,
{
    OrderedMap::with_hasher(StdRandomState::new())
}
