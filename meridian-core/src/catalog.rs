//! The catalog: collection names to collections.
//!
//! Collections are created lazily by the first write and dropped when the
//! last item is removed or on explicit DROP. The catalog exclusively owns
//! its collections.

use crate::collection::Collection;
use crate::glob;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct Catalog {
    collections: BTreeMap<String, Collection>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Collection> {
        self.collections.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Collection> {
        self.collections.get_mut(key)
    }

    pub fn get_or_create(&mut self, key: &str) -> &mut Collection {
        self.collections.entry(key.to_string()).or_default()
    }

    /// Drop a collection outright. Returns whether it existed.
    pub fn drop_collection(&mut self, key: &str) -> bool {
        self.collections.remove(key).is_some()
    }

    /// Remove the collection if its last item is gone.
    pub fn drop_if_empty(&mut self, key: &str) {
        if self.collections.get(key).is_some_and(Collection::is_empty) {
            self.collections.remove(key);
        }
    }

    /// Collection names matching a glob pattern, in name order.
    pub fn keys(&self, pattern: &str) -> Vec<&str> {
        self.collections
            .keys()
            .filter(|k| glob::matches(pattern, k))
            .map(String::as_str)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Collection)> {
        self.collections.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Collection)> {
        self.collections.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Sum of collection weights, compared against the max-memory cap.
    pub fn total_weight(&self) -> usize {
        self.collections.values().map(Collection::weight).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Geometry, Object};

    #[test]
    fn lazily_created_and_dropped_when_empty() {
        let mut cat = Catalog::new();
        assert!(cat.get("fleet").is_none());
        cat.get_or_create("fleet").set(
            "bus1",
            Object::Geo(Geometry::Point {
                lon: -115.5,
                lat: 33.5,
                z: None,
            }),
            vec![],
            None,
        );
        assert_eq!(cat.len(), 1);

        cat.get_mut("fleet").unwrap().del("bus1");
        cat.drop_if_empty("fleet");
        assert!(cat.get("fleet").is_none());
    }

    #[test]
    fn keys_filters_by_pattern() {
        let mut cat = Catalog::new();
        for name in ["fleet", "fleet:eu", "geo"] {
            cat.get_or_create(name);
        }
        assert_eq!(cat.keys("*"), vec!["fleet", "fleet:eu", "geo"]);
        assert_eq!(cat.keys("fleet*"), vec!["fleet", "fleet:eu"]);
        assert_eq!(cat.keys("g?o"), vec!["geo"]);
    }
}
