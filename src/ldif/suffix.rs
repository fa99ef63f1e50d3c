//! Ordered map keyed by reversed-DN bytes.
//!
//! Reversing the canonical DN turns "ends with suffix" into "starts with
//! prefix", so a whole-subtree walk under a base DN becomes one ordered
//! range scan.

use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct SuffixTree<V> {
    map: BTreeMap<Vec<u8>, V>,
}

fn reversed(key: &str) -> Vec<u8> {
    key.as_bytes().iter().rev().copied().collect()
}

impl<V> SuffixTree<V> {
    pub fn new() -> Self {
        SuffixTree {
            map: BTreeMap::new(),
        }
    }

    /// Insert under a canonical DN. Returns the previous value if the DN was
    /// already present.
    pub fn insert(&mut self, dn: &str, value: V) -> Option<V> {
        self.map.insert(reversed(dn), value)
    }

    pub fn get(&self, dn: &str) -> Option<&V> {
        self.map.get(&reversed(dn))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All values whose DN ends in `suffix`, in stable (reversed-key) order.
    /// An empty suffix yields every entry.
    pub fn walk_suffix<'a>(&'a self, suffix: &str) -> impl Iterator<Item = &'a V> {
        let prefix = reversed(suffix);
        self.map
            .range(prefix.clone()..)
            .take_while(move |(key, _)| key.starts_with(&prefix))
            .map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> SuffixTree<&'static str> {
        let mut t = SuffixTree::new();
        t.insert("o=base", "base");
        t.insert("ou=sub,o=base", "sub");
        t.insert("uid=alice,ou=sub,o=base", "alice");
        t.insert("uid=bob,ou=other,o=base", "bob");
        t.insert("o=elsewhere", "elsewhere");
        t
    }

    #[test]
    fn exact_get() {
        let t = tree();
        assert_eq!(t.get("uid=alice,ou=sub,o=base"), Some(&"alice"));
        assert_eq!(t.get("uid=carol,ou=sub,o=base"), None);
    }

    #[test]
    fn duplicate_insert_returns_previous() {
        let mut t = tree();
        assert_eq!(t.insert("o=base", "other"), Some("base"));
    }

    #[test]
    fn walk_returns_subtree() {
        let t = tree();
        let mut under_base: Vec<_> = t.walk_suffix("o=base").copied().collect();
        under_base.sort_unstable();
        assert_eq!(under_base, vec!["alice", "base", "bob", "sub"]);

        let under_sub: Vec<_> = t.walk_suffix("ou=sub,o=base").copied().collect();
        assert_eq!(under_sub.len(), 2);
        assert!(under_sub.contains(&&"sub"));
        assert!(under_sub.contains(&&"alice"));
    }

    #[test]
    fn walk_with_empty_suffix_returns_everything() {
        assert_eq!(tree().walk_suffix("").count(), 5);
    }
}
