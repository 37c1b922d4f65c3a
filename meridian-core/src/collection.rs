//! A named collection of items with spatial indexing, numeric fields,
//! and TTL tracking.
//!
//! Items live in an ordered map (id order drives SCAN and cursor
//! pagination); spatial items are additionally keyed into the R-tree by
//! their bounding box. Field values are f64 slots addressed through the
//! collection's insertion-ordered field schema, so items store a flat
//! `Vec<f64>` instead of per-item maps. An unset slot reads as 0 and is
//! omitted from output.
//!
//! Readers treat an item whose TTL has lapsed exactly like a deleted item;
//! physical removal is the expiry scanner's job.

use crate::geometry::{intersects, within, BBox, Geometry, Object};
use crate::rtree::{Entry, RTree};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// An entry in a collection.
#[derive(Debug, Clone)]
pub struct Item {
    pub object: Object,
    pub fields: Vec<f64>,
    pub expires_at: Option<Instant>,
}

impl Item {
    pub fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Comparison operator for WHERE filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Ne,
}

impl CmpOp {
    pub fn parse(s: &str) -> Option<CmpOp> {
        Some(match s {
            "<" => CmpOp::Lt,
            "<=" => CmpOp::Lte,
            ">" => CmpOp::Gt,
            ">=" => CmpOp::Gte,
            "==" => CmpOp::Eq,
            "!=" => CmpOp::Ne,
            _ => return None,
        })
    }

    fn eval(self, a: f64, b: f64) -> bool {
        match self {
            CmpOp::Lt => a < b,
            CmpOp::Lte => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Gte => a >= b,
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
        }
    }
}

/// A `WHERE field op value` filter, applied after index pruning.
#[derive(Debug, Clone)]
pub struct WhereFilter {
    pub field: String,
    pub op: CmpOp,
    pub value: f64,
}

/// Pagination and filtering options shared by the query operations.
#[derive(Debug, Clone, Default)]
pub struct QueryOpts {
    pub cursor: usize,
    pub limit: usize,
    pub wheres: Vec<WhereFilter>,
}

impl QueryOpts {
    fn limit(&self) -> usize {
        if self.limit == 0 {
            usize::MAX
        } else {
            self.limit
        }
    }
}

/// Spatial predicate selector for region queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Within,
    Intersects,
}

/// A page of query results: matched ids with their items, plus the cursor
/// for the next page (0 when the scan is known to be exhausted).
pub struct Page<'a> {
    pub hits: Vec<Hit<'a>>,
    pub cursor: usize,
}

pub struct Hit<'a> {
    pub id: Arc<str>,
    pub item: &'a Item,
    /// Haversine meters from the query origin; only set by `nearby`.
    pub distance: Option<f64>,
}

/// Aggregate counters reported by STATS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionStats {
    pub num_objects: usize,
    pub num_points: usize,
    pub num_strings: usize,
    pub in_memory_size: usize,
}

#[derive(Debug, Default)]
pub struct Collection {
    items: BTreeMap<Arc<str>, Item>,
    index: RTree,
    field_names: Vec<Arc<str>>,
    field_slots: FxHashMap<Arc<str>, usize>,
    expires: FxHashMap<Arc<str>, Instant>,
    string_count: usize,
    point_count: usize,
    weight: usize,
}

fn item_weight(id: &str, object: &Object, field_slots: usize) -> usize {
    id.len() + object.weight() + 8 * field_slots
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn weight(&self) -> usize {
        self.weight
    }

    pub fn stats(&self) -> CollectionStats {
        CollectionStats {
            num_objects: self.items.len(),
            num_points: self.point_count,
            num_strings: self.string_count,
            in_memory_size: self.weight,
        }
    }

    pub fn bounds(&self) -> Option<BBox> {
        self.index.bounds()
    }

    pub fn field_names(&self) -> &[Arc<str>] {
        &self.field_names
    }

    /// Byte-cost delta a `set` with these arguments would cause. Used by the
    /// max-memory check before the mutation is committed.
    pub fn projected_set_delta(
        &self,
        id: &str,
        object: &Object,
        new_fields: &[(String, f64)],
    ) -> isize {
        let old = self.items.get(id);
        let old_weight = old
            .map(|it| item_weight(id, &it.object, it.fields.len()))
            .unwrap_or(0);
        let old_slots = old.map(|it| it.fields.len()).unwrap_or(0);
        let mut slots = old_slots;
        for (name, _) in new_fields {
            match self.field_slots.get(name.as_str()) {
                Some(&slot) => slots = slots.max(slot + 1),
                None => slots += 1,
            }
        }
        item_weight(id, object, slots) as isize - old_weight as isize
    }

    fn slot_for(&mut self, name: &str) -> usize {
        if let Some(&slot) = self.field_slots.get(name) {
            return slot;
        }
        let slot = self.field_names.len();
        let name: Arc<str> = Arc::from(name);
        self.field_names.push(name.clone());
        self.field_slots.insert(name, slot);
        slot
    }

    fn index_remove(&mut self, id: &Arc<str>, object: &Object) {
        if let Some(geo) = object.geometry() {
            self.index.remove(&geo.bbox(), id);
            if geo.is_point() {
                self.point_count -= 1;
            }
        } else {
            self.string_count -= 1;
        }
    }

    fn index_insert(&mut self, id: &Arc<str>, object: &Object) {
        if let Some(geo) = object.geometry() {
            self.index.insert(geo.bbox(), id.clone());
            if geo.is_point() {
                self.point_count += 1;
            }
        } else {
            self.string_count += 1;
        }
    }

    /// Insert or replace an item. Existing field values are retained unless
    /// overwritten by `fields`. Returns the replaced item, if any.
    pub fn set(
        &mut self,
        id: &str,
        object: Object,
        fields: Vec<(String, f64)>,
        expires_at: Option<Instant>,
    ) -> Option<Item> {
        let (key, prev) = match self.items.remove_entry(id) {
            Some((key, prev)) => {
                self.weight -= item_weight(id, &prev.object, prev.fields.len());
                self.index_remove(&key, &prev.object);
                self.expires.remove(&key);
                (key, Some(prev))
            }
            None => (Arc::from(id), None),
        };

        let mut slots: Vec<f64> = prev.as_ref().map(|p| p.fields.clone()).unwrap_or_default();
        for (name, value) in &fields {
            let slot = self.slot_for(name);
            if slots.len() <= slot {
                slots.resize(slot + 1, 0.0);
            }
            slots[slot] = *value;
        }

        self.weight += item_weight(id, &object, slots.len());
        self.index_insert(&key, &object);
        if let Some(at) = expires_at {
            self.expires.insert(key.clone(), at);
        }
        let item = Item {
            object,
            fields: slots,
            expires_at,
        };
        self.items.insert(key, item);
        prev
    }

    /// Remove an item. Returns it if it existed (expired items removable).
    pub fn del(&mut self, id: &str) -> Option<Item> {
        let (key, item) = self.items.remove_entry(id)?;
        self.weight -= item_weight(id, &item.object, item.fields.len());
        self.index_remove(&key, &item.object);
        self.expires.remove(&key);
        Some(item)
    }

    /// Fetch a live item.
    pub fn get(&self, id: &str, now: Instant) -> Option<&Item> {
        self.items.get(id).filter(|it| !it.expired(now))
    }

    /// Fetch an item whether or not its TTL has lapsed. Internal plumbing
    /// (expiry reaping, mutation bookkeeping) only; readers use `get`.
    pub fn peek(&self, id: &str) -> Option<&Item> {
        self.items.get(id)
    }

    /// Set a single field. Returns the number of fields changed (0 when the
    /// value was already current), or `None` when the id is absent.
    pub fn fset(&mut self, id: &str, field: &str, value: f64, now: Instant) -> Option<usize> {
        if !self.items.get(id).is_some_and(|it| !it.expired(now)) {
            return None;
        }
        let slot = self.slot_for(field);
        let item = self.items.get_mut(id).expect("checked above");
        if item.fields.len() <= slot {
            self.weight += 8 * (slot + 1 - item.fields.len());
            item.fields.resize(slot + 1, 0.0);
        }
        if item.fields[slot] == value {
            return Some(0);
        }
        item.fields[slot] = value;
        Some(1)
    }

    /// Set an item's TTL. Returns false when the id is absent or expired.
    pub fn expire(&mut self, id: &str, at: Instant, now: Instant) -> bool {
        let key = self
            .items
            .get_key_value(id)
            .and_then(|(k, item)| (!item.expired(now)).then(|| k.clone()));
        let Some(key) = key else {
            return false;
        };
        if let Some(item) = self.items.get_mut(&key) {
            item.expires_at = Some(at);
        }
        self.expires.insert(key, at);
        true
    }

    /// Clear an item's TTL. Returns true when a TTL was present.
    pub fn persist(&mut self, id: &str, now: Instant) -> bool {
        match self.items.get_mut(id) {
            Some(item) if !item.expired(now) => {
                let had = item.expires_at.take().is_some();
                if had {
                    self.expires.remove(id);
                }
                had
            }
            _ => false,
        }
    }

    /// Remaining TTL: `None` when absent, `Some(None)` when no TTL.
    pub fn ttl(&self, id: &str, now: Instant) -> Option<Option<Duration>> {
        let item = self.get(id, now)?;
        Some(item.expires_at.map(|at| at.saturating_duration_since(now)))
    }

    /// Ids currently holding a TTL (expired or not). Sampling source for the
    /// expiry scanner.
    pub fn ttl_ids(&self) -> impl Iterator<Item = &Arc<str>> {
        self.expires.keys()
    }

    pub fn is_expired(&self, id: &str, now: Instant) -> bool {
        self.items.get(id).is_some_and(|it| it.expired(now))
    }

    /// All stored items in id order, expired included. Shrink and stats use
    /// this; readers go through the query paths.
    pub fn iter_all(&self) -> impl Iterator<Item = (&Arc<str>, &Item)> {
        self.items.iter()
    }

    /// Rebuild the spatial index with a bulk STR packing. Called after AOF
    /// replay, when the full item set is known.
    pub fn rebuild_index(&mut self) {
        let entries: Vec<Entry> = self
            .items
            .iter()
            .filter_map(|(id, item)| {
                item.object.geometry().map(|g| Entry {
                    bbox: g.bbox(),
                    id: id.clone(),
                })
            })
            .collect();
        self.index.bulk_load(entries);
    }

    fn field_value(&self, item: &Item, name: &str) -> f64 {
        self.field_slots
            .get(name)
            .and_then(|&slot| item.fields.get(slot))
            .copied()
            .unwrap_or(0.0)
    }

    fn matches_filters(&self, item: &Item, wheres: &[WhereFilter]) -> bool {
        wheres
            .iter()
            .all(|w| w.op.eval(self.field_value(item, &w.field), w.value))
    }

    /// Named non-zero field values of an item, in schema order.
    pub fn item_fields(&self, item: &Item) -> Vec<(Arc<str>, f64)> {
        self.field_names
            .iter()
            .enumerate()
            .filter_map(|(slot, name)| {
                let v = item.fields.get(slot).copied().unwrap_or(0.0);
                (v != 0.0).then(|| (name.clone(), v))
            })
            .collect()
    }

    /// Id-ordered scan.
    pub fn scan(&self, now: Instant, opts: &QueryOpts) -> Page<'_> {
        let limit = opts.limit();
        let mut hits = Vec::new();
        let mut qualified = 0usize;
        for (id, item) in &self.items {
            if item.expired(now) || !self.matches_filters(item, &opts.wheres) {
                continue;
            }
            qualified += 1;
            if qualified <= opts.cursor {
                continue;
            }
            hits.push(Hit {
                id: id.clone(),
                item,
                distance: None,
            });
            if hits.len() >= limit {
                break;
            }
        }
        let cursor = if hits.len() >= limit {
            opts.cursor + hits.len()
        } else {
            0
        };
        Page { hits, cursor }
    }

    /// Region query. Candidates are pruned through the R-tree, ordered by
    /// id for stable pagination, then refined with the exact predicate.
    pub fn search(
        &self,
        region: &Geometry,
        kind: SearchKind,
        now: Instant,
        opts: &QueryOpts,
    ) -> Page<'_> {
        let limit = opts.limit();
        let mut candidates = self.index.search_ids(&region.bbox());
        candidates.sort();
        let mut hits = Vec::new();
        let mut qualified = 0usize;
        for id in candidates {
            let Some(item) = self.get(&id, now) else {
                continue;
            };
            if !self.matches_filters(item, &opts.wheres) {
                continue;
            }
            let geo = item.object.geometry().expect("indexed items are spatial");
            let matched = match kind {
                SearchKind::Within => within(geo, region),
                SearchKind::Intersects => intersects(geo, region),
            };
            if !matched {
                continue;
            }
            qualified += 1;
            if qualified <= opts.cursor {
                continue;
            }
            hits.push(Hit {
                id,
                item,
                distance: None,
            });
            if hits.len() >= limit {
                break;
            }
        }
        let cursor = if hits.len() >= limit {
            opts.cursor + hits.len()
        } else {
            0
        };
        Page { hits, cursor }
    }

    /// Nearest-neighbor stream around a point, optionally clipped to a
    /// radius in meters. Results arrive in non-decreasing distance order.
    pub fn nearby(
        &self,
        lon: f64,
        lat: f64,
        radius: Option<f64>,
        now: Instant,
        opts: &QueryOpts,
    ) -> Page<'_> {
        let limit = opts.limit();
        let mut hits = Vec::new();
        let mut qualified = 0usize;
        for (entry, dist) in self.index.nearby(lon, lat) {
            if let Some(r) = radius {
                if dist > r {
                    break;
                }
            }
            let Some(item) = self.get(&entry.id, now) else {
                continue;
            };
            if !self.matches_filters(item, &opts.wheres) {
                continue;
            }
            qualified += 1;
            if qualified <= opts.cursor {
                continue;
            }
            hits.push(Hit {
                id: entry.id.clone(),
                item,
                distance: Some(dist),
            });
            if hits.len() >= limit {
                break;
            }
        }
        let cursor = if hits.len() >= limit {
            opts.cursor + hits.len()
        } else {
            0
        };
        Page { hits, cursor }
    }
}
