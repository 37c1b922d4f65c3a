//! Axis-aligned bounding boxes in raw lat/lon degrees.
//!
//! All rectangle math is done on unwrapped degrees. Geometries spanning the
//! antimeridian or touching the poles are a documented limitation.

use serde::{Deserialize, Serialize};

/// Approximate meters per degree of latitude.
pub(crate) const METERS_PER_DEGREE_LAT: f64 = 111_132.0;

/// Approximate meters per degree of longitude at the equator.
pub(crate) const METERS_PER_DEGREE_LON: f64 = 111_320.0;

/// Axis-aligned bounding box. `lon` is the x axis, `lat` the y axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    /// Degenerate box covering a single position.
    pub fn point(lon: f64, lat: f64) -> Self {
        Self::new(lon, lat, lon, lat)
    }

    /// The box covering the whole coordinate space.
    pub fn world() -> Self {
        Self::new(-180.0, -90.0, 180.0, 90.0)
    }

    pub fn intersects(&self, other: &BBox) -> bool {
        self.min_lon <= other.max_lon
            && self.max_lon >= other.min_lon
            && self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
    }

    pub fn contains_point(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }

    /// Whether `other` lies entirely inside this box (boundary inclusive).
    pub fn contains(&self, other: &BBox) -> bool {
        self.min_lon <= other.min_lon
            && self.max_lon >= other.max_lon
            && self.min_lat <= other.min_lat
            && self.max_lat >= other.max_lat
    }

    pub fn union(&self, other: &BBox) -> BBox {
        BBox {
            min_lon: self.min_lon.min(other.min_lon),
            min_lat: self.min_lat.min(other.min_lat),
            max_lon: self.max_lon.max(other.max_lon),
            max_lat: self.max_lat.max(other.max_lat),
        }
    }

    /// Area in square degrees. Used only for index heuristics.
    pub fn area(&self) -> f64 {
        let w = self.max_lon - self.min_lon;
        let h = self.max_lat - self.min_lat;
        if w < 0.0 || h < 0.0 {
            return 0.0;
        }
        w * h
    }

    /// Growth in area required to also cover `other`.
    pub fn enlargement(&self, other: &BBox) -> f64 {
        self.union(other).area() - self.area()
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lon + self.max_lon) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
    }

    /// Inflate by a meter margin, converted to degrees at the box's latitude
    /// centroid. The longitude conversion degrades toward the poles; callers
    /// accept the approximation.
    pub fn expand(&self, meters: f64) -> BBox {
        let dlat = meters / METERS_PER_DEGREE_LAT;
        let mid_lat = (self.min_lat + self.max_lat) / 2.0;
        let cos = mid_lat.to_radians().cos().abs().max(0.0001);
        let dlon = meters / (METERS_PER_DEGREE_LON * cos);
        BBox {
            min_lon: self.min_lon - dlon,
            min_lat: (self.min_lat - dlat).max(-90.0),
            max_lon: self.max_lon + dlon,
            max_lat: (self.max_lat + dlat).min(90.0),
        }
    }

    /// The position inside the box nearest to `(lon, lat)`.
    pub fn clamp(&self, lon: f64, lat: f64) -> (f64, f64) {
        (
            lon.clamp(self.min_lon, self.max_lon),
            lat.clamp(self.min_lat, self.max_lat),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_and_contains() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 5.0, 15.0, 15.0);
        let u = a.union(&b);
        assert!(u.contains(&a));
        assert!(u.contains(&b));
        assert!(a.intersects(&b));
        assert!(!a.contains(&b));
    }

    #[test]
    fn expand_grows_symmetrically() {
        let b = BBox::point(-115.5, 33.5).expand(1000.0);
        assert!(b.min_lat < 33.5 && b.max_lat > 33.5);
        assert!(b.min_lon < -115.5 && b.max_lon > -115.5);
        // Latitude margin of 1 km is roughly 0.009 degrees.
        assert!((b.max_lat - 33.5) > 0.0085 && (b.max_lat - 33.5) < 0.0095);
    }

    #[test]
    fn clamp_snaps_to_edge() {
        let b = BBox::new(0.0, 0.0, 1.0, 1.0);
        assert_eq!(b.clamp(2.0, 0.5), (1.0, 0.5));
        assert_eq!(b.clamp(0.5, 0.5), (0.5, 0.5));
    }
}
