//! Geometry model and spatial predicates.
//!
//! Meridian stores six geometry shapes (point, bounds, polyline, polygon,
//! multi, circle) plus raw string payloads. Predicates use rectangle and
//! point fast paths where exact, and fall back to the `geo` crate's
//! segment-test algebra for the polygon cases. Distances are great-circle
//! meters (haversine).

mod bbox;

pub use bbox::BBox;

use crate::error::{CoreError, Result};
use geo::{Contains, Destination, Distance, Haversine, Intersects};
use geo_types::{Coord, Geometry as GeoGeometry, GeometryCollection, LineString, Polygon, Rect};

/// Number of segments used when a circle must be approximated by a polygon.
const CIRCLE_SEGMENTS: usize = 64;

/// A spatial object shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    /// Single position with optional altitude.
    Point { lon: f64, lat: f64, z: Option<f64> },
    /// Axis-aligned rectangle.
    Bounds(BBox),
    /// Open path of two or more positions.
    Polyline(LineString<f64>),
    /// Closed ring with optional holes.
    Polygon(Polygon<f64>),
    /// Heterogeneous collection of geometries.
    Multi(Vec<Geometry>),
    /// Great-circle radius around a center, in meters. Used for query and
    /// fence regions; never stored as an item object.
    Circle { lon: f64, lat: f64, meters: f64 },
}

/// The value stored under an item id: a geometry or a raw string payload.
/// String payloads are not spatially indexed.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Geo(Geometry),
    String(String),
}

impl Object {
    pub fn geometry(&self) -> Option<&Geometry> {
        match self {
            Object::Geo(g) => Some(g),
            Object::String(_) => None,
        }
    }

    /// Approximate in-memory byte cost, used for the max-memory cap.
    pub fn weight(&self) -> usize {
        match self {
            Object::Geo(g) => g.weight(),
            Object::String(s) => s.len(),
        }
    }
}

impl Geometry {
    /// Smallest axis-aligned rectangle enclosing the geometry.
    pub fn bbox(&self) -> BBox {
        match self {
            Geometry::Point { lon, lat, .. } => BBox::point(*lon, *lat),
            Geometry::Bounds(b) => *b,
            Geometry::Polyline(line) => coords_bbox(line.coords()),
            Geometry::Polygon(poly) => coords_bbox(poly.exterior().coords()),
            Geometry::Multi(parts) => {
                let mut it = parts.iter().map(Geometry::bbox);
                let first = it.next().unwrap_or_else(|| BBox::point(0.0, 0.0));
                it.fold(first, |acc, b| acc.union(&b))
            }
            Geometry::Circle { lon, lat, meters } => BBox::point(*lon, *lat).expand(*meters),
        }
    }

    /// Centroid of the bounding box. Good enough for roam distance checks.
    pub fn center(&self) -> (f64, f64) {
        self.bbox().center()
    }

    pub fn is_point(&self) -> bool {
        matches!(self, Geometry::Point { .. })
    }

    pub fn weight(&self) -> usize {
        match self {
            Geometry::Point { z, .. } => 16 + if z.is_some() { 8 } else { 0 },
            Geometry::Bounds(_) => 32,
            Geometry::Polyline(line) => 16 * line.0.len(),
            Geometry::Polygon(poly) => {
                let holes: usize = poly.interiors().iter().map(|r| 16 * r.0.len()).sum();
                16 * poly.exterior().0.len() + holes
            }
            Geometry::Multi(parts) => parts.iter().map(Geometry::weight).sum(),
            Geometry::Circle { .. } => 24,
        }
    }

    /// Convert to the `geo` algebra for exact predicate evaluation.
    /// Circles become 64-gon polygons; altitude is dropped.
    fn to_geo(&self) -> GeoGeometry<f64> {
        match self {
            Geometry::Point { lon, lat, .. } => {
                GeoGeometry::Point(geo_types::Point::new(*lon, *lat))
            }
            Geometry::Bounds(b) => GeoGeometry::Rect(Rect::new(
                Coord {
                    x: b.min_lon,
                    y: b.min_lat,
                },
                Coord {
                    x: b.max_lon,
                    y: b.max_lat,
                },
            )),
            Geometry::Polyline(line) => GeoGeometry::LineString(line.clone()),
            Geometry::Polygon(poly) => GeoGeometry::Polygon(poly.clone()),
            Geometry::Multi(parts) => GeoGeometry::GeometryCollection(GeometryCollection(
                parts.iter().map(Geometry::to_geo).collect(),
            )),
            Geometry::Circle { lon, lat, meters } => {
                GeoGeometry::Polygon(circle_polygon(*lon, *lat, *meters))
            }
        }
    }

    /// Every vertex position of the geometry.
    fn each_position(&self, f: &mut impl FnMut(f64, f64)) {
        match self {
            Geometry::Point { lon, lat, .. } => f(*lon, *lat),
            Geometry::Bounds(b) => {
                f(b.min_lon, b.min_lat);
                f(b.max_lon, b.min_lat);
                f(b.max_lon, b.max_lat);
                f(b.min_lon, b.max_lat);
            }
            Geometry::Polyline(line) => {
                for c in line.coords() {
                    f(c.x, c.y);
                }
            }
            Geometry::Polygon(poly) => {
                for c in poly.exterior().coords() {
                    f(c.x, c.y);
                }
            }
            Geometry::Multi(parts) => {
                for p in parts {
                    p.each_position(f);
                }
            }
            Geometry::Circle { lon, lat, .. } => f(*lon, *lat),
        }
    }
}

fn coords_bbox<'a>(coords: impl Iterator<Item = &'a Coord<f64>>) -> BBox {
    let mut bbox: Option<BBox> = None;
    for c in coords {
        let p = BBox::point(c.x, c.y);
        bbox = Some(match bbox {
            Some(b) => b.union(&p),
            None => p,
        });
    }
    bbox.unwrap_or_else(|| BBox::point(0.0, 0.0))
}

/// Great-circle distance in meters between two lon/lat positions.
pub fn haversine(a: (f64, f64), b: (f64, f64)) -> f64 {
    Haversine::distance(
        geo_types::Point::new(a.0, a.1),
        geo_types::Point::new(b.0, b.1),
    )
}

/// Haversine meters from a position to the nearest point of a rectangle.
/// Zero when the position is inside.
pub fn point_bbox_distance(lon: f64, lat: f64, bbox: &BBox) -> f64 {
    let (clon, clat) = bbox.clamp(lon, lat);
    haversine((lon, lat), (clon, clat))
}

fn circle_polygon(lon: f64, lat: f64, meters: f64) -> Polygon<f64> {
    let center = geo_types::Point::new(lon, lat);
    let mut ring: Vec<Coord<f64>> = Vec::with_capacity(CIRCLE_SEGMENTS + 1);
    for i in 0..CIRCLE_SEGMENTS {
        let bearing = 360.0 * i as f64 / CIRCLE_SEGMENTS as f64;
        let p = Haversine::destination(center, bearing, meters);
        ring.push(Coord { x: p.x(), y: p.y() });
    }
    ring.push(ring[0]);
    Polygon::new(LineString(ring), vec![])
}

/// Whether `inner` lies entirely inside `outer`.
pub fn within(inner: &Geometry, outer: &Geometry) -> bool {
    match (inner, outer) {
        // A rectangle contains a geometry iff it contains its bbox.
        (_, Geometry::Bounds(b)) => b.contains(&inner.bbox()),
        // A circle is convex: containment of every vertex is containment of
        // the whole shape.
        (_, Geometry::Circle { lon, lat, meters }) => {
            let mut ok = true;
            inner.each_position(&mut |plon, plat| {
                if ok && haversine((*lon, *lat), (plon, plat)) > *meters {
                    ok = false;
                }
            });
            ok
        }
        (_, Geometry::Multi(parts)) => parts.iter().any(|p| within(inner, p)),
        (Geometry::Point { lon, lat, .. }, _) => outer
            .to_geo()
            .contains(&geo_types::Point::new(*lon, *lat)),
        (Geometry::Multi(parts), _) => parts.iter().all(|p| within(p, outer)),
        _ => {
            if !outer.bbox().intersects(&inner.bbox()) {
                return false;
            }
            outer.to_geo().contains(&inner.to_geo())
        }
    }
}

/// Whether `a` and `b` share any point.
pub fn intersects(a: &Geometry, b: &Geometry) -> bool {
    if !a.bbox().intersects(&b.bbox()) {
        return false;
    }
    match (a, b) {
        (Geometry::Bounds(ba), Geometry::Bounds(bb)) => ba.intersects(bb),
        (Geometry::Point { lon, lat, .. }, Geometry::Circle { lon: clon, lat: clat, meters })
        | (Geometry::Circle { lon: clon, lat: clat, meters }, Geometry::Point { lon, lat, .. }) => {
            haversine((*clon, *clat), (*lon, *lat)) <= *meters
        }
        (Geometry::Multi(parts), _) => parts.iter().any(|p| intersects(p, b)),
        (_, Geometry::Multi(parts)) => parts.iter().any(|p| intersects(a, p)),
        _ => a.to_geo().intersects(&b.to_geo()),
    }
}

// ---------------------------------------------------------------------------
// GeoJSON wire format
// ---------------------------------------------------------------------------

/// Parse a GeoJSON document (Geometry, Feature, or FeatureCollection) into a
/// geometry. Features contribute their geometry member; collections become
/// `Multi`.
pub fn parse_geojson(input: &str) -> Result<Geometry> {
    let gj: geojson::GeoJson = input
        .parse()
        .map_err(|e| CoreError::InvalidGeometry(format!("{e}")))?;
    match gj {
        geojson::GeoJson::Geometry(g) => convert_geojson(g.value),
        geojson::GeoJson::Feature(f) => {
            let g = f
                .geometry
                .ok_or_else(|| CoreError::UnsupportedGeoJson("feature without geometry".into()))?;
            convert_geojson(g.value)
        }
        geojson::GeoJson::FeatureCollection(fc) => {
            let mut parts = Vec::with_capacity(fc.features.len());
            for f in fc.features {
                if let Some(g) = f.geometry {
                    parts.push(convert_geojson(g.value)?);
                }
            }
            if parts.is_empty() {
                return Err(CoreError::UnsupportedGeoJson(
                    "feature collection without geometries".into(),
                ));
            }
            Ok(Geometry::Multi(parts))
        }
    }
}

fn position(p: &[f64]) -> Result<(f64, f64, Option<f64>)> {
    if p.len() < 2 {
        return Err(CoreError::InvalidGeometry("position needs lon and lat".into()));
    }
    Ok((p[0], p[1], p.get(2).copied()))
}

fn line_string(positions: &[Vec<f64>], min: usize) -> Result<LineString<f64>> {
    if positions.len() < min {
        return Err(CoreError::InvalidGeometry(format!(
            "expected at least {min} positions, got {}",
            positions.len()
        )));
    }
    let mut coords = Vec::with_capacity(positions.len());
    for p in positions {
        let (lon, lat, _) = position(p)?;
        coords.push(Coord { x: lon, y: lat });
    }
    Ok(LineString(coords))
}

fn polygon(rings: &[Vec<Vec<f64>>]) -> Result<Polygon<f64>> {
    if rings.is_empty() {
        return Err(CoreError::InvalidGeometry("polygon without rings".into()));
    }
    let exterior = line_string(&rings[0], 4)?;
    let mut holes = Vec::with_capacity(rings.len() - 1);
    for ring in &rings[1..] {
        holes.push(line_string(ring, 4)?);
    }
    Ok(Polygon::new(exterior, holes))
}

fn convert_geojson(value: geojson::Value) -> Result<Geometry> {
    match value {
        geojson::Value::Point(p) => {
            let (lon, lat, z) = position(&p)?;
            Ok(Geometry::Point { lon, lat, z })
        }
        geojson::Value::MultiPoint(ps) => {
            let mut parts = Vec::with_capacity(ps.len());
            for p in &ps {
                let (lon, lat, z) = position(p)?;
                parts.push(Geometry::Point { lon, lat, z });
            }
            Ok(Geometry::Multi(parts))
        }
        geojson::Value::LineString(ps) => Ok(Geometry::Polyline(line_string(&ps, 2)?)),
        geojson::Value::MultiLineString(lines) => Ok(Geometry::Multi(
            lines
                .iter()
                .map(|ps| line_string(ps, 2).map(Geometry::Polyline))
                .collect::<Result<_>>()?,
        )),
        geojson::Value::Polygon(rings) => Ok(Geometry::Polygon(polygon(&rings)?)),
        geojson::Value::MultiPolygon(polys) => Ok(Geometry::Multi(
            polys
                .iter()
                .map(|rings| polygon(rings).map(Geometry::Polygon))
                .collect::<Result<_>>()?,
        )),
        geojson::Value::GeometryCollection(geoms) => Ok(Geometry::Multi(
            geoms
                .into_iter()
                .map(|g| convert_geojson(g.value))
                .collect::<Result<_>>()?,
        )),
    }
}

fn ring_positions(line: &LineString<f64>) -> Vec<Vec<f64>> {
    line.coords().map(|c| vec![c.x, c.y]).collect()
}

fn geojson_value(g: &Geometry) -> geojson::Value {
    match g {
        Geometry::Point { lon, lat, z } => {
            let mut pos = vec![*lon, *lat];
            if let Some(z) = z {
                pos.push(*z);
            }
            geojson::Value::Point(pos)
        }
        Geometry::Bounds(b) => geojson::Value::Polygon(vec![vec![
            vec![b.min_lon, b.min_lat],
            vec![b.max_lon, b.min_lat],
            vec![b.max_lon, b.max_lat],
            vec![b.min_lon, b.max_lat],
            vec![b.min_lon, b.min_lat],
        ]]),
        Geometry::Polyline(line) => geojson::Value::LineString(ring_positions(line)),
        Geometry::Polygon(poly) => {
            let mut rings = vec![ring_positions(poly.exterior())];
            rings.extend(poly.interiors().iter().map(ring_positions));
            geojson::Value::Polygon(rings)
        }
        Geometry::Multi(parts) => geojson::Value::GeometryCollection(
            parts
                .iter()
                .map(|p| geojson::Geometry::new(geojson_value(p)))
                .collect(),
        ),
        Geometry::Circle { lon, lat, meters } => {
            let poly = circle_polygon(*lon, *lat, *meters);
            geojson_value(&Geometry::Polygon(poly))
        }
    }
}

/// Encode a geometry as a GeoJSON `serde_json` value.
pub fn to_geojson(g: &Geometry) -> serde_json::Value {
    serde_json::to_value(geojson::Geometry::new(geojson_value(g)))
        .unwrap_or(serde_json::Value::Null)
}

/// Geohash of the geometry's bbox center at the given precision.
pub fn to_geohash(g: &Geometry, precision: usize) -> Result<String> {
    let (lon, lat) = g.center();
    geohash::encode(Coord { x: lon, y: lat }, precision)
        .map_err(|e| CoreError::Geohash(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(lon: f64, lat: f64) -> Geometry {
        Geometry::Point { lon, lat, z: None }
    }

    fn square(min_lon: f64, min_lat: f64, side: f64) -> Geometry {
        Geometry::Polygon(Polygon::new(
            LineString(vec![
                Coord { x: min_lon, y: min_lat },
                Coord { x: min_lon + side, y: min_lat },
                Coord { x: min_lon + side, y: min_lat + side },
                Coord { x: min_lon, y: min_lat + side },
                Coord { x: min_lon, y: min_lat },
            ]),
            vec![],
        ))
    }

    #[test]
    fn haversine_zero_and_known_distance() {
        assert_eq!(haversine((-115.5, 33.5), (-115.5, 33.5)), 0.0);
        // One degree of latitude is about 111 km.
        let d = haversine((0.0, 0.0), (0.0, 1.0));
        assert!((d - 111_195.0).abs() < 500.0, "got {d}");
    }

    #[test]
    fn point_in_polygon() {
        let sq = square(0.0, 0.0, 10.0);
        assert!(within(&point(5.0, 5.0), &sq));
        assert!(!within(&point(15.0, 5.0), &sq));
    }

    #[test]
    fn point_in_circle() {
        let c = Geometry::Circle { lon: -115.5, lat: 33.5, meters: 1000.0 };
        assert!(within(&point(-115.5, 33.5), &c));
        assert!(!within(&point(-115.0, 33.5), &c));
    }

    #[test]
    fn bounds_containment_uses_bbox() {
        let b = Geometry::Bounds(BBox::new(0.0, 0.0, 10.0, 10.0));
        assert!(within(&square(2.0, 2.0, 3.0), &b));
        assert!(!within(&square(8.0, 8.0, 5.0), &b));
    }

    #[test]
    fn polyline_crosses_polygon() {
        let sq = square(0.0, 0.0, 10.0);
        let line = Geometry::Polyline(LineString(vec![
            Coord { x: -5.0, y: 5.0 },
            Coord { x: 15.0, y: 5.0 },
        ]));
        assert!(intersects(&line, &sq));
        assert!(!within(&line, &sq));
    }

    #[test]
    fn geojson_roundtrip_point() {
        let g = parse_geojson(r#"{"type":"Point","coordinates":[-115.5,33.5]}"#).unwrap();
        assert_eq!(g, point(-115.5, 33.5));
        let v = to_geojson(&g);
        assert_eq!(v["type"], "Point");
        assert_eq!(v["coordinates"][0], -115.5);
    }

    #[test]
    fn geojson_feature_unwraps() {
        let g = parse_geojson(
            r#"{"type":"Feature","properties":{},"geometry":{"type":"Point","coordinates":[1.0,2.0]}}"#,
        )
        .unwrap();
        assert!(g.is_point());
    }

    #[test]
    fn geojson_rejects_short_ring() {
        let err = parse_geojson(r#"{"type":"Polygon","coordinates":[[[0,0],[1,1],[0,0]]]}"#);
        assert!(err.is_err());
    }

    #[test]
    fn circle_bbox_covers_radius() {
        let c = Geometry::Circle { lon: 0.0, lat: 0.0, meters: 1000.0 };
        let b = c.bbox();
        assert!(b.contains_point(0.0, 0.008));
        assert!(!b.contains_point(0.0, 0.02));
    }

    #[test]
    fn point_bbox_distance_inside_is_zero() {
        let b = BBox::new(0.0, 0.0, 1.0, 1.0);
        assert_eq!(point_bbox_distance(0.5, 0.5, &b), 0.0);
        assert!(point_bbox_distance(2.0, 0.5, &b) > 100_000.0);
    }
}
