//! Reply rendering for items, pages and objects in both dialects.

use crate::error::Result;
use meridian_core::{to_geohash, to_geojson, BBox, Collection, CoreError, Geometry, Item, Object, Page};
use meridian_protocol::{Dialect, GetFormat, QueryOutput, Reply};
use serde_json::{json, Value};

fn num(v: f64) -> String {
    format!("{v}")
}

/// The wire text of an object: GeoJSON for geometries, the raw payload for
/// strings.
pub fn object_string(obj: &Object) -> String {
    match obj {
        Object::Geo(g) => to_geojson(g).to_string(),
        Object::String(s) => s.clone(),
    }
}

pub fn object_value(obj: &Object) -> Value {
    match obj {
        Object::Geo(g) => to_geojson(g),
        Object::String(s) => Value::String(s.clone()),
    }
}

fn fields_value(fields: &[(std::sync::Arc<str>, f64)]) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(name, v)| (name.to_string(), json!(v)))
            .collect(),
    )
}

/// Render a query result page.
pub fn page_reply(
    dialect: Dialect,
    collection: &Collection,
    page: &Page<'_>,
    output: QueryOutput,
) -> Reply {
    match (output, dialect) {
        (QueryOutput::Count, Dialect::Resp) => Reply::Integer(page.hits.len() as i64),
        (QueryOutput::Count, Dialect::Json) => Reply::Json(json!({
            "count": page.hits.len(),
            "cursor": page.cursor,
        })),
        (QueryOutput::Ids, Dialect::Resp) => Reply::Array(vec![
            Reply::Integer(page.cursor as i64),
            Reply::Array(page.hits.iter().map(|h| Reply::bulk(h.id.as_ref())).collect()),
        ]),
        (QueryOutput::Ids, Dialect::Json) => Reply::Json(json!({
            "ids": page.hits.iter().map(|h| h.id.to_string()).collect::<Vec<_>>(),
            "count": page.hits.len(),
            "cursor": page.cursor,
        })),
        (QueryOutput::Objects, Dialect::Resp) => {
            let elems = page
                .hits
                .iter()
                .map(|hit| {
                    let mut elem = vec![
                        Reply::bulk(hit.id.as_ref()),
                        Reply::bulk(object_string(&hit.item.object)),
                    ];
                    let fields = collection.item_fields(hit.item);
                    if !fields.is_empty() {
                        elem.push(Reply::Array(
                            fields
                                .iter()
                                .flat_map(|(name, v)| {
                                    [Reply::bulk(name.as_ref()), Reply::bulk(num(*v))]
                                })
                                .collect(),
                        ));
                    }
                    if let Some(d) = hit.distance {
                        elem.push(Reply::bulk(num(d)));
                    }
                    Reply::Array(elem)
                })
                .collect();
            Reply::Array(vec![Reply::Integer(page.cursor as i64), Reply::Array(elems)])
        }
        (QueryOutput::Objects, Dialect::Json) => {
            let objects: Vec<Value> = page
                .hits
                .iter()
                .map(|hit| {
                    let mut o = json!({
                        "id": hit.id.as_ref(),
                        "object": object_value(&hit.item.object),
                    });
                    let fields = collection.item_fields(hit.item);
                    if !fields.is_empty() {
                        o["fields"] = fields_value(&fields);
                    }
                    if let Some(d) = hit.distance {
                        o["distance"] = json!(d);
                    }
                    o
                })
                .collect();
            Reply::Json(json!({
                "objects": objects,
                "count": objects.len(),
                "cursor": page.cursor,
            }))
        }
    }
}

fn point_of(geo: &Geometry) -> (f64, f64, Option<f64>) {
    match geo {
        Geometry::Point { lon, lat, z } => (*lon, *lat, *z),
        other => {
            let (lon, lat) = other.center();
            (lon, lat, None)
        }
    }
}

/// Render a GET result in the requested format.
pub fn get_reply(dialect: Dialect, item: &Item, format: GetFormat) -> Result<Reply> {
    match format {
        GetFormat::Object => Ok(match dialect {
            Dialect::Resp => Reply::Bulk(object_string(&item.object)),
            Dialect::Json => Reply::Json(json!({ "object": object_value(&item.object) })),
        }),
        GetFormat::Point => {
            let geo = item.object.geometry().ok_or(CoreError::NotAGeometry)?;
            let (lon, lat, z) = point_of(geo);
            Ok(match dialect {
                Dialect::Resp => {
                    let mut elems = vec![Reply::bulk(num(lat)), Reply::bulk(num(lon))];
                    if let Some(z) = z {
                        elems.push(Reply::bulk(num(z)));
                    }
                    Reply::Array(elems)
                }
                Dialect::Json => {
                    let mut point = json!({ "lat": lat, "lon": lon });
                    if let Some(z) = z {
                        point["z"] = json!(z);
                    }
                    Reply::Json(json!({ "point": point }))
                }
            })
        }
        GetFormat::Bounds => {
            let geo = item.object.geometry().ok_or(CoreError::NotAGeometry)?;
            Ok(bounds_reply(dialect, &geo.bbox()))
        }
        GetFormat::Hash(precision) => {
            let geo = item.object.geometry().ok_or(CoreError::NotAGeometry)?;
            let hash = to_geohash(geo, precision)?;
            Ok(match dialect {
                Dialect::Resp => Reply::Bulk(hash),
                Dialect::Json => Reply::Json(json!({ "hash": hash })),
            })
        }
    }
}

/// Render a bbox as `[minlat minlon maxlat maxlon]` / sw-ne corners.
pub fn bounds_reply(dialect: Dialect, bbox: &BBox) -> Reply {
    match dialect {
        Dialect::Resp => Reply::Array(vec![
            Reply::bulk(num(bbox.min_lat)),
            Reply::bulk(num(bbox.min_lon)),
            Reply::bulk(num(bbox.max_lat)),
            Reply::bulk(num(bbox.max_lon)),
        ]),
        Dialect::Json => Reply::Json(json!({
            "bounds": {
                "sw": { "lat": bbox.min_lat, "lon": bbox.min_lon },
                "ne": { "lat": bbox.max_lat, "lon": bbox.max_lon },
            }
        })),
    }
}
