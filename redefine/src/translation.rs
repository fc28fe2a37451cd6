use std::collections::{HashMap, HashSet};

use redefine_base::PoolIndex;

/// Where entries of a candidate class's pool ended up in the merged pool.
/// Only entries that moved are present, so an absent index is unchanged.
/// Bootstrap specifiers have their own index space and their own map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslationMap {
    indices: HashMap<PoolIndex, PoolIndex>,
    operands: HashMap<u16, u16>,
}
impl TranslationMap {
    #[must_use]
    pub fn new() -> TranslationMap {
        TranslationMap::default()
    }

    /// Record that `old` now lives at `new`. Mapping an index to itself records nothing.
    pub fn map_index(&mut self, old: PoolIndex, new: PoolIndex) {
        if old != new {
            tracing::trace!("mapped old #{} to merged #{}", old, new);
            self.indices.insert(old, new);
        }
    }

    pub fn map_operand(&mut self, old: u16, new: u16) {
        if old != new {
            tracing::trace!("mapped old operand {} to merged operand {}", old, new);
            self.operands.insert(old, new);
        }
    }

    /// The merged index of `old`
    #[must_use]
    pub fn find_new_index(&self, old: PoolIndex) -> PoolIndex {
        self.indices.get(&old).copied().unwrap_or(old)
    }

    #[must_use]
    pub fn find_new_operand(&self, old: u16) -> u16 {
        self.operands.get(&old).copied().unwrap_or(old)
    }

    #[must_use]
    pub fn get(&self, old: PoolIndex) -> Option<PoolIndex> {
        self.indices.get(&old).copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty() && self.operands.is_empty()
    }

    /// The number of moved entries, not counting operands
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Every moved index, in ascending order of the old index
    #[must_use]
    pub fn sorted_indices(&self) -> Vec<(PoolIndex, PoolIndex)> {
        let mut indices: Vec<_> = self.indices.iter().map(|(&k, &v)| (k, v)).collect();
        indices.sort_unstable();
        indices
    }

    #[must_use]
    pub fn sorted_operands(&self) -> Vec<(u16, u16)> {
        let mut operands: Vec<_> = self.operands.iter().map(|(&k, &v)| (k, v)).collect();
        operands.sort_unstable();
        operands
    }

    /// The map that undoes this one.
    /// If two old indices were merged into one entry the lower old index wins.
    #[must_use]
    pub fn inverse(&self) -> TranslationMap {
        let mut inverse = TranslationMap::new();
        for (old, new) in self.sorted_indices().into_iter().rev() {
            inverse.indices.insert(new, old);
        }
        for (old, new) in self.sorted_operands().into_iter().rev() {
            inverse.operands.insert(new, old);
        }
        inverse
    }

    /// Whether [`TranslationMap::inverse`] exactly undoes this map for a pool of `count` entries
    /// with `operand_count` bootstrap specifiers.
    /// Two indices mapped to one place, or an index mapped onto one left where it was, can't be
    /// told apart afterwards.
    #[must_use]
    pub fn is_invertible(&self, count: u16, operand_count: u16) -> bool {
        fn check(map: &HashMap<u16, u16>, count: u16) -> bool {
            let mut seen = HashSet::new();
            map.values()
                .all(|&new| seen.insert(new) && (new >= count || map.contains_key(&new)))
        }
        check(&self.indices, count) && check(&self.operands, operand_count)
    }
}

#[cfg(test)]
mod tests {
    use super::TranslationMap;

    #[test]
    fn test_sparse_map() {
        let mut map = TranslationMap::new();
        map.map_index(4, 4);
        assert!(map.is_empty());

        map.map_index(1, 300);
        map.map_operand(0, 2);
        assert_eq!(map.find_new_index(1), 300);
        assert_eq!(map.find_new_index(2), 2);
        assert_eq!(map.find_new_operand(0), 2);
        assert_eq!(map.len(), 1);

        let inverse = map.inverse();
        assert_eq!(inverse.find_new_index(300), 1);
        assert_eq!(inverse.find_new_operand(2), 0);
    }

    #[test]
    fn test_is_invertible() {
        let mut map = TranslationMap::new();
        map.map_index(1, 300);
        map.map_index(2, 1);
        assert!(map.is_invertible(10, 0));

        // Index 3 is left alone, so a rewritten #3 could have been either
        map.map_index(4, 3);
        assert!(!map.is_invertible(10, 0));

        let mut merged = TranslationMap::new();
        merged.map_index(5, 20);
        merged.map_index(6, 20);
        assert!(!merged.is_invertible(10, 0));
    }
}
