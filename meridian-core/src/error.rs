//! Error types for the collection engine.

use thiserror::Error;

/// Errors produced by geometry parsing and collection operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed or unsupported geometry input.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// GeoJSON that parsed but cannot be represented as an object.
    #[error("unsupported GeoJSON member: {0}")]
    UnsupportedGeoJson(String),

    /// Geohash encoding failure (out-of-range coordinates).
    #[error("geohash error: {0}")]
    Geohash(String),

    /// The referenced item does not exist in the collection.
    #[error("id not found")]
    IdNotFound,

    /// The referenced item has no geometry (string payload).
    #[error("object is not a geometry")]
    NotAGeometry,
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
