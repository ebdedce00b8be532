use super::index_trait::IndexRef;
use std::{marker::PhantomData, ops};

/// An append-only arena keyed by a typed index. An index returned by
/// [IndexedMap::push] stays valid for the lifetime of the map.
#[derive(Debug, Clone)]
pub struct IndexedMap<K, D>
where
    K: IndexRef,
{
    data: Vec<D>,
    phantom: PhantomData<K>,
}

impl<K, D> IndexedMap<K, D>
where
    K: IndexRef,
{
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            phantom: PhantomData,
        }
    }

    pub fn push(&mut self, item: D) -> K {
        let key = K::new(self.data.len());
        self.data.push(item);
        key
    }

    pub fn get(&self, key: K) -> Option<&D> {
        self.data.get(key.index())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &D)> + Clone {
        self.data.iter().enumerate().map(|(i, v)| (K::new(i), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &D> {
        self.data.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + use<K, D> {
        (0..self.data.len()).map(K::new)
    }
}

impl<K, D> ops::Index<K> for IndexedMap<K, D>
where
    K: IndexRef,
{
    type Output = D;

    fn index(&self, key: K) -> &D {
        &self.data[key.index()]
    }
}

impl<K, D> ops::IndexMut<K> for IndexedMap<K, D>
where
    K: IndexRef,
{
    fn index_mut(&mut self, key: K) -> &mut D {
        &mut self.data[key.index()]
    }
}

impl<K, D> Default for IndexedMap<K, D>
where
    K: IndexRef,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::{IndexRef, impl_index, maps::IndexedMap};
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Slot(u32);
    impl_index!(Slot, "s");

    #[test]
    fn pushed_entries_are_addressable() {
        let mut map: IndexedMap<Slot, &str> = IndexedMap::new();
        let a = map.push("a");
        let b = map.push("b");
        map[a] = "c";
        assert_eq!((map[a], map[b]), ("c", "b"));
        assert_eq!(map.get(Slot::from(2)), None);
        assert_eq!(b.to_string(), "s1");
    }

    proptest! {
        #[test]
        fn keys_follow_insertion_order(items in prop::collection::vec(any::<u16>(), 0..500)) {
            let mut map = IndexedMap::<Slot, u16>::default();
            let keys: Vec<Slot> = items.iter().map(|i| map.push(*i)).collect();
            prop_assert_eq!(map.len(), items.len());
            prop_assert_eq!(map.keys().collect::<Vec<_>>(), keys);
            for (k, v) in map.iter() {
                prop_assert_eq!(*v, items[k.index()]);
            }
        }
    }
}
