//! Meridian collection engine.
//!
//! The in-memory data model of the Meridian geospatial database: the
//! geometry algebra, the per-collection R-tree index, collections of items
//! with numeric fields and TTLs, and the catalog that owns them.
//!
//! This crate is purely synchronous and has no knowledge of the wire
//! protocol, persistence, or fencing; those layers sit on top.

pub mod catalog;
pub mod collection;
pub mod error;
pub mod geometry;
pub mod glob;
pub mod rtree;

pub use catalog::Catalog;
pub use collection::{
    CmpOp, Collection, CollectionStats, Hit, Item, Page, QueryOpts, SearchKind, WhereFilter,
};
pub use error::{CoreError, Result};
pub use geometry::{
    haversine, intersects, parse_geojson, point_bbox_distance, to_geohash, to_geojson, within,
    BBox, Geometry, Object,
};
pub use rtree::RTree;
