//! Per-collection spatial index.
//!
//! An R-tree over item bounding boxes storing item ids. Incremental inserts
//! use Guttman's least-enlargement descent with quadratic splits; bulk
//! construction (AOF replay) packs leaves with sort-tile-recursive. All
//! heuristics break ties by id or input order, so identical insert sequences
//! build identical trees and paginated query results are stable.
//!
//! Nearest-neighbor scans run best-first over a priority queue keyed by the
//! minimum haversine distance from the query point to a node rectangle, with
//! equal distances ordered lexicographically by id.

use crate::geometry::{point_bbox_distance, BBox};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

const MAX_ENTRIES: usize = 32;
const MIN_ENTRIES: usize = 13; // 40% fill

#[derive(Debug, Clone)]
pub struct Entry {
    pub bbox: BBox,
    pub id: Arc<str>,
}

#[derive(Debug)]
enum Node {
    Leaf(Vec<Entry>),
    Branch(Vec<Child>),
}

#[derive(Debug)]
struct Child {
    bbox: BBox,
    node: Box<Node>,
}

impl Node {
    fn compute_bbox(&self) -> BBox {
        match self {
            Node::Leaf(entries) => fold_bbox(entries.iter().map(|e| &e.bbox)),
            Node::Branch(children) => fold_bbox(children.iter().map(|c| &c.bbox)),
        }
    }

    fn len(&self) -> usize {
        match self {
            Node::Leaf(entries) => entries.len(),
            Node::Branch(children) => children.len(),
        }
    }
}

fn fold_bbox<'a>(mut boxes: impl Iterator<Item = &'a BBox>) -> BBox {
    let first = *boxes.next().expect("bbox of empty node");
    boxes.fold(first, |acc, b| acc.union(b))
}

/// Spatial index over item bounding boxes.
#[derive(Debug, Default)]
pub struct RTree {
    root: Option<Child>,
    len: usize,
}

impl RTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The rectangle covering every indexed entry.
    pub fn bounds(&self) -> Option<BBox> {
        self.root.as_ref().map(|r| r.bbox)
    }

    pub fn insert(&mut self, bbox: BBox, id: Arc<str>) {
        let entry = Entry { bbox, id };
        self.len += 1;
        match self.root.take() {
            None => {
                self.root = Some(Child {
                    bbox,
                    node: Box::new(Node::Leaf(vec![entry])),
                });
            }
            Some(mut root) => {
                if let Some(sibling) = insert_rec(&mut root, entry) {
                    let bbox = root.bbox.union(&sibling.bbox);
                    self.root = Some(Child {
                        bbox,
                        node: Box::new(Node::Branch(vec![root, sibling])),
                    });
                } else {
                    self.root = Some(root);
                }
            }
        }
    }

    /// Remove the entry for `id` under `bbox`. Returns whether it was found.
    /// Underfull nodes are dissolved and their entries reinserted.
    pub fn remove(&mut self, bbox: &BBox, id: &str) -> bool {
        let Some(mut root) = self.root.take() else {
            return false;
        };
        let mut orphans = Vec::new();
        let found = remove_rec(&mut root, bbox, id, &mut orphans);
        if !found {
            self.root = Some(root);
            return false;
        }
        self.len -= 1;
        // Collapse a root branch with a single child; drop an empty root.
        loop {
            match *root.node {
                Node::Leaf(ref entries) if entries.is_empty() => {
                    self.root = None;
                    break;
                }
                Node::Branch(ref mut children) if children.len() == 1 => {
                    let only = children.pop().expect("single child");
                    root = only;
                }
                _ => {
                    self.root = Some(root);
                    break;
                }
            }
        }
        self.len -= orphans.len();
        for e in orphans {
            self.insert(e.bbox, e.id);
        }
        true
    }

    /// Visit every entry whose bbox intersects `query`. Traversal order is
    /// deterministic for a given tree shape. Return `false` to stop early.
    pub fn search(&self, query: &BBox, f: &mut impl FnMut(&Entry) -> bool) {
        if let Some(root) = &self.root {
            search_rec(root, query, f);
        }
    }

    /// Collect intersecting ids.
    pub fn search_ids(&self, query: &BBox) -> Vec<Arc<str>> {
        let mut out = Vec::new();
        self.search(query, &mut |e| {
            out.push(e.id.clone());
            true
        });
        out
    }

    /// Best-first nearest scan from a lon/lat origin, yielding
    /// `(id, meters)` in non-decreasing distance, ties in id order.
    pub fn nearby(&self, lon: f64, lat: f64) -> Nearby<'_> {
        let mut heap = BinaryHeap::new();
        if let Some(root) = &self.root {
            heap.push(Candidate {
                dist: point_bbox_distance(lon, lat, &root.bbox),
                kind: CandidateKind::Node(&root.node),
            });
        }
        Nearby { origin: (lon, lat), heap }
    }

    /// Replace the tree contents with a sort-tile-recursive packing of
    /// `entries`. Used when the full entry set is known up front (replay).
    pub fn bulk_load(&mut self, mut entries: Vec<Entry>) {
        self.len = entries.len();
        if entries.is_empty() {
            self.root = None;
            return;
        }
        entries.sort_by(|a, b| {
            cmp_f64(a.bbox.center().0, b.bbox.center().0)
                .then_with(|| cmp_f64(a.bbox.center().1, b.bbox.center().1))
                .then_with(|| a.id.cmp(&b.id))
        });

        // Tile into vertical slices, then pack each slice into leaves by
        // latitude order.
        let leaf_count = entries.len().div_ceil(MAX_ENTRIES);
        let slice_count = (leaf_count as f64).sqrt().ceil() as usize;
        let per_slice = entries.len().div_ceil(slice_count);

        let mut children: Vec<Child> = Vec::with_capacity(leaf_count);
        for slice in entries.chunks_mut(per_slice) {
            slice.sort_by(|a, b| {
                cmp_f64(a.bbox.center().1, b.bbox.center().1).then_with(|| a.id.cmp(&b.id))
            });
            for leaf in slice.chunks(MAX_ENTRIES) {
                let node = Node::Leaf(leaf.to_vec());
                children.push(Child {
                    bbox: node.compute_bbox(),
                    node: Box::new(node),
                });
            }
        }

        // Pack upward until a single root remains. Children are already in
        // tile order, so sequential grouping preserves locality.
        while children.len() > 1 {
            let mut parents = Vec::with_capacity(children.len().div_ceil(MAX_ENTRIES));
            let mut iter = children.into_iter().peekable();
            while iter.peek().is_some() {
                let group: Vec<Child> = iter.by_ref().take(MAX_ENTRIES).collect();
                let node = Node::Branch(group);
                parents.push(Child {
                    bbox: node.compute_bbox(),
                    node: Box::new(node),
                });
            }
            children = parents;
        }
        self.root = children.pop();
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.total_cmp(&b)
}

fn search_rec(child: &Child, query: &BBox, f: &mut impl FnMut(&Entry) -> bool) -> bool {
    if !child.bbox.intersects(query) {
        return true;
    }
    match child.node.as_ref() {
        Node::Leaf(entries) => {
            for e in entries {
                if e.bbox.intersects(query) && !f(e) {
                    return false;
                }
            }
        }
        Node::Branch(children) => {
            for c in children {
                if !search_rec(c, query, f) {
                    return false;
                }
            }
        }
    }
    true
}

/// Pick the child needing the least enlargement; ties by smaller area, then
/// position.
fn choose_subtree(children: &[Child], bbox: &BBox) -> usize {
    let mut best = 0;
    let mut best_enlargement = f64::INFINITY;
    let mut best_area = f64::INFINITY;
    for (i, c) in children.iter().enumerate() {
        let enlargement = c.bbox.enlargement(bbox);
        let area = c.bbox.area();
        if enlargement < best_enlargement
            || (enlargement == best_enlargement && area < best_area)
        {
            best = i;
            best_enlargement = enlargement;
            best_area = area;
        }
    }
    best
}

fn insert_rec(child: &mut Child, entry: Entry) -> Option<Child> {
    child.bbox = child.bbox.union(&entry.bbox);
    match child.node.as_mut() {
        Node::Leaf(entries) => {
            entries.push(entry);
            if entries.len() <= MAX_ENTRIES {
                return None;
            }
            let (left, right) = split_entries(std::mem::take(entries));
            let right_node = Node::Leaf(right);
            let sibling = Child {
                bbox: right_node.compute_bbox(),
                node: Box::new(right_node),
            };
            child.bbox = fold_bbox(left.iter().map(|e| &e.bbox));
            *entries = left;
            Some(sibling)
        }
        Node::Branch(children) => {
            let i = choose_subtree(children, &entry.bbox);
            let split = insert_rec(&mut children[i], entry);
            if let Some(sibling) = split {
                children.push(sibling);
                if children.len() > MAX_ENTRIES {
                    let (left, right) = split_children(std::mem::take(children));
                    let right_node = Node::Branch(right);
                    let sibling = Child {
                        bbox: right_node.compute_bbox(),
                        node: Box::new(right_node),
                    };
                    child.bbox = fold_bbox(left.iter().map(|c| &c.bbox));
                    *children = left;
                    return Some(sibling);
                }
            }
            child.bbox = fold_bbox(children.iter().map(|c| &c.bbox));
            None
        }
    }
}

/// Guttman quadratic split over generic boxed members.
fn quadratic_split<T>(items: Vec<T>, bbox_of: impl Fn(&T) -> BBox) -> (Vec<T>, Vec<T>) {
    // Seeds: the pair wasting the most area when grouped.
    let mut seed_a = 0;
    let mut seed_b = 1;
    let mut worst = f64::NEG_INFINITY;
    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            let bi = bbox_of(&items[i]);
            let bj = bbox_of(&items[j]);
            let waste = bi.union(&bj).area() - bi.area() - bj.area();
            if waste > worst {
                worst = waste;
                seed_a = i;
                seed_b = j;
            }
        }
    }

    let mut left: Vec<T> = Vec::with_capacity(items.len() / 2 + 1);
    let mut right: Vec<T> = Vec::with_capacity(items.len() / 2 + 1);
    let mut left_bbox = bbox_of(&items[seed_a]);
    let mut right_bbox = bbox_of(&items[seed_b]);
    let mut rest: Vec<T> = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        if i == seed_a {
            left.push(item);
        } else if i == seed_b {
            right.push(item);
        } else {
            rest.push(item);
        }
    }

    let min_fill = MIN_ENTRIES;
    let total = rest.len();
    for (k, item) in rest.into_iter().enumerate() {
        let b = bbox_of(&item);
        let remaining = total - k;
        // Force-assign when a side needs every remaining item to reach the
        // minimum fill.
        if left.len() + remaining <= min_fill {
            left_bbox = left_bbox.union(&b);
            left.push(item);
            continue;
        }
        if right.len() + remaining <= min_fill {
            right_bbox = right_bbox.union(&b);
            right.push(item);
            continue;
        }
        let dl = left_bbox.enlargement(&b);
        let dr = right_bbox.enlargement(&b);
        let go_left = match dl.total_cmp(&dr) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => match left_bbox.area().total_cmp(&right_bbox.area()) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => left.len() <= right.len(),
            },
        };
        if go_left {
            left_bbox = left_bbox.union(&b);
            left.push(item);
        } else {
            right_bbox = right_bbox.union(&b);
            right.push(item);
        }
    }
    (left, right)
}

fn split_entries(entries: Vec<Entry>) -> (Vec<Entry>, Vec<Entry>) {
    quadratic_split(entries, |e| e.bbox)
}

fn split_children(children: Vec<Child>) -> (Vec<Child>, Vec<Child>) {
    quadratic_split(children, |c| c.bbox)
}

fn remove_rec(child: &mut Child, bbox: &BBox, id: &str, orphans: &mut Vec<Entry>) -> bool {
    if !child.bbox.intersects(bbox) {
        return false;
    }
    match child.node.as_mut() {
        Node::Leaf(entries) => {
            let Some(pos) = entries
                .iter()
                .position(|e| e.id.as_ref() == id && e.bbox == *bbox)
            else {
                return false;
            };
            entries.remove(pos);
            if !entries.is_empty() {
                child.bbox = fold_bbox(entries.iter().map(|e| &e.bbox));
            }
            true
        }
        Node::Branch(children) => {
            let mut removed_at = None;
            for (i, c) in children.iter_mut().enumerate() {
                if remove_rec(c, bbox, id, orphans) {
                    removed_at = Some(i);
                    break;
                }
            }
            let Some(i) = removed_at else {
                return false;
            };
            let dissolve = children[i].node.len() < MIN_ENTRIES;
            if dissolve {
                let dead = children.remove(i);
                collect_entries(*dead.node, orphans);
            }
            if !children.is_empty() {
                child.bbox = fold_bbox(children.iter().map(|c| &c.bbox));
            }
            true
        }
    }
}

fn collect_entries(node: Node, out: &mut Vec<Entry>) {
    match node {
        Node::Leaf(entries) => out.extend(entries),
        Node::Branch(children) => {
            for c in children {
                collect_entries(*c.node, out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Nearest-neighbor scan
// ---------------------------------------------------------------------------

enum CandidateKind<'a> {
    Node(&'a Node),
    Item(&'a Entry),
}

struct Candidate<'a> {
    dist: f64,
    kind: CandidateKind<'a>,
}

impl Candidate<'_> {
    /// Nodes expand before items at equal distance so that every item tied
    /// at that distance is in the heap before the first one is yielded.
    fn rank(&self) -> (f64, u8, &str) {
        match &self.kind {
            CandidateKind::Node(_) => (self.dist, 0, ""),
            CandidateKind::Item(e) => (self.dist, 1, e.id.as_ref()),
        }
    }
}

impl PartialEq for Candidate<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Candidate<'_> {}
impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap and we pop smallest first.
        let (ad, ak, ai) = self.rank();
        let (bd, bk, bi) = other.rank();
        bd.total_cmp(&ad)
            .then_with(|| bk.cmp(&ak))
            .then_with(|| bi.cmp(ai))
    }
}

/// Iterator over `(id, meters)` pairs in non-decreasing distance order.
pub struct Nearby<'a> {
    origin: (f64, f64),
    heap: BinaryHeap<Candidate<'a>>,
}

impl<'a> Iterator for Nearby<'a> {
    type Item = (&'a Entry, f64);

    fn next(&mut self) -> Option<Self::Item> {
        let (lon, lat) = self.origin;
        while let Some(cand) = self.heap.pop() {
            match cand.kind {
                CandidateKind::Item(entry) => return Some((entry, cand.dist)),
                CandidateKind::Node(node) => match node {
                    Node::Leaf(entries) => {
                        for e in entries {
                            self.heap.push(Candidate {
                                dist: point_bbox_distance(lon, lat, &e.bbox),
                                kind: CandidateKind::Item(e),
                            });
                        }
                    }
                    Node::Branch(children) => {
                        for c in children {
                            self.heap.push(Candidate {
                                dist: point_bbox_distance(lon, lat, &c.bbox),
                                kind: CandidateKind::Node(&c.node),
                            });
                        }
                    }
                },
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    fn grid_tree(n: usize) -> RTree {
        let mut tree = RTree::new();
        for i in 0..n {
            let lon = (i % 10) as f64;
            let lat = (i / 10) as f64;
            tree.insert(BBox::point(lon, lat), id(&format!("item{i:04}")));
        }
        tree
    }

    #[test]
    fn insert_search_remove() {
        let mut tree = grid_tree(100);
        assert_eq!(tree.len(), 100);

        let hits = tree.search_ids(&BBox::new(-0.5, -0.5, 1.5, 1.5));
        // (0,0) (1,0) (0,1) (1,1)
        assert_eq!(hits.len(), 4);

        assert!(tree.remove(&BBox::point(0.0, 0.0), "item0000"));
        assert!(!tree.remove(&BBox::point(0.0, 0.0), "item0000"));
        assert_eq!(tree.len(), 99);
        let hits = tree.search_ids(&BBox::new(-0.5, -0.5, 1.5, 1.5));
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn remove_everything_empties_tree() {
        let mut tree = grid_tree(200);
        for i in 0..200 {
            let lon = (i % 10) as f64;
            let lat = (i / 10) as f64;
            assert!(tree.remove(&BBox::point(lon, lat), &format!("item{i:04}")), "{i}");
        }
        assert!(tree.is_empty());
        assert!(tree.bounds().is_none());
    }

    #[test]
    fn world_search_returns_all() {
        let tree = grid_tree(150);
        assert_eq!(tree.search_ids(&BBox::world()).len(), 150);
    }

    #[test]
    fn nearby_orders_by_distance_then_id() {
        let mut tree = RTree::new();
        tree.insert(BBox::point(0.0, 0.0), id("b"));
        tree.insert(BBox::point(0.0, 0.0), id("a"));
        tree.insert(BBox::point(0.0, 1.0), id("far"));
        tree.insert(BBox::point(0.0, 0.1), id("near"));

        let got: Vec<String> = tree
            .nearby(0.0, 0.0)
            .map(|(e, _)| e.id.to_string())
            .collect();
        assert_eq!(got, vec!["a", "b", "near", "far"]);

        let dists: Vec<f64> = tree.nearby(0.0, 0.0).map(|(_, d)| d).collect();
        for pair in dists.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn bulk_load_matches_incremental_contents() {
        let incremental = grid_tree(137);
        let mut bulk = RTree::new();
        let entries: Vec<Entry> = (0..137)
            .map(|i| Entry {
                bbox: BBox::point((i % 10) as f64, (i / 10) as f64),
                id: id(&format!("item{i:04}")),
            })
            .collect();
        bulk.bulk_load(entries);

        assert_eq!(bulk.len(), incremental.len());
        let mut a = incremental.search_ids(&BBox::world());
        let mut b = bulk.search_ids(&BBox::world());
        a.sort();
        b.sort();
        assert_eq!(a, b);

        // Same nearest order regardless of construction path.
        let na: Vec<String> = incremental
            .nearby(4.5, 4.5)
            .take(10)
            .map(|(e, _)| e.id.to_string())
            .collect();
        let nb: Vec<String> = bulk
            .nearby(4.5, 4.5)
            .take(10)
            .map(|(e, _)| e.id.to_string())
            .collect();
        assert_eq!(na, nb);
    }

    #[test]
    fn bounds_shrink_after_remove() {
        let mut tree = RTree::new();
        tree.insert(BBox::point(0.0, 0.0), id("a"));
        tree.insert(BBox::point(50.0, 50.0), id("b"));
        let b = tree.bounds().unwrap();
        assert_eq!(b.max_lon, 50.0);
        tree.remove(&BBox::point(50.0, 50.0), "b");
        let b = tree.bounds().unwrap();
        assert_eq!(b.max_lon, 0.0);
    }
}
