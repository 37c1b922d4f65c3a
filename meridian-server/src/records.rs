//! Canonical AOF records for shrink.
//!
//! A shrunken log contains the minimal command set reproducing in-memory
//! state: one SET per live item, one SETHOOK per hook. Records are built
//! in catalog order so shrink output is deterministic.

use crate::state::Store;
use meridian_core::{to_geojson, Geometry, Item, Object};
use meridian_fence::{FenceRegion, Hook, Trigger};
use meridian_protocol::encode_array;
use std::time::Instant;

fn push_num(args: &mut Vec<Vec<u8>>, v: f64) {
    args.push(format!("{v}").into_bytes());
}

fn push_str(args: &mut Vec<Vec<u8>>, s: &str) {
    args.push(s.as_bytes().to_vec());
}

fn push_geometry_value(args: &mut Vec<Vec<u8>>, geo: &Geometry) {
    match geo {
        Geometry::Point { lon, lat, z } => {
            push_str(args, "POINT");
            push_num(args, *lat);
            push_num(args, *lon);
            if let Some(z) = z {
                push_num(args, *z);
            }
        }
        Geometry::Bounds(b) => {
            push_str(args, "BOUNDS");
            push_num(args, b.min_lat);
            push_num(args, b.min_lon);
            push_num(args, b.max_lat);
            push_num(args, b.max_lon);
        }
        other => {
            push_str(args, "OBJECT");
            push_str(args, &to_geojson(other).to_string());
        }
    }
}

/// `SET key id [FIELD…] [EX remaining] <value>` reproducing one item.
fn set_record(key: &str, id: &str, item: &Item, fields: &[(std::sync::Arc<str>, f64)], now: Instant) -> Vec<u8> {
    let mut args: Vec<Vec<u8>> = Vec::new();
    push_str(&mut args, "SET");
    push_str(&mut args, key);
    push_str(&mut args, id);
    for (name, value) in fields {
        push_str(&mut args, "FIELD");
        push_str(&mut args, name);
        push_num(&mut args, *value);
    }
    if let Some(at) = item.expires_at {
        let remaining = at.saturating_duration_since(now).as_secs_f64();
        push_str(&mut args, "EX");
        push_str(&mut args, &format!("{remaining:.3}"));
    }
    match &item.object {
        Object::Geo(geo) => push_geometry_value(&mut args, geo),
        Object::String(s) => {
            push_str(&mut args, "STRING");
            push_str(&mut args, s);
        }
    }
    encode_array(&args)
}

/// `SETHOOK name endpoint [META…] <trigger> …` reproducing one hook.
fn sethook_record(hook: &Hook) -> Vec<u8> {
    let mut args: Vec<Vec<u8>> = Vec::new();
    push_str(&mut args, "SETHOOK");
    push_str(&mut args, &hook.name);
    push_str(&mut args, &hook.endpoint);
    for (k, v) in &hook.meta {
        push_str(&mut args, "META");
        push_str(&mut args, k);
        push_str(&mut args, v);
    }
    match (&hook.region, hook.trigger) {
        (FenceRegion::Roam { pattern, meters }, _) => {
            push_str(&mut args, "ROAM");
            push_str(&mut args, &hook.key);
            push_str(&mut args, pattern);
            push_num(&mut args, *meters);
        }
        (FenceRegion::Area(region), trigger) => {
            push_str(&mut args, &trigger.name().to_ascii_uppercase());
            push_str(&mut args, &hook.key);
            let detect = hook.detect.names();
            if detect.len() < 5 {
                push_str(&mut args, "DETECT");
                push_str(&mut args, &detect.join(","));
            }
            push_str(&mut args, "FENCE");
            match (trigger, region) {
                (Trigger::Nearby, Geometry::Circle { lon, lat, meters }) => {
                    push_str(&mut args, "POINT");
                    push_num(&mut args, *lat);
                    push_num(&mut args, *lon);
                    push_num(&mut args, *meters);
                }
                (_, Geometry::Bounds(b)) => {
                    push_str(&mut args, "BOUNDS");
                    push_num(&mut args, b.min_lat);
                    push_num(&mut args, b.min_lon);
                    push_num(&mut args, b.max_lat);
                    push_num(&mut args, b.max_lon);
                }
                (_, other) => {
                    push_str(&mut args, "OBJECT");
                    push_str(&mut args, &to_geojson(other).to_string());
                }
            }
        }
    }
    encode_array(&args)
}

/// Every record needed to rebuild the store from empty: live items first,
/// then hooks. Expired-but-unreaped items are skipped.
pub fn snapshot_records(store: &Store, now: Instant) -> Vec<Vec<u8>> {
    let mut records = Vec::new();
    for (key, collection) in store.catalog.iter() {
        for (id, item) in collection.iter_all() {
            if item.expired(now) {
                continue;
            }
            let fields = collection.item_fields(item);
            records.push(set_record(key, id, item, &fields, now));
        }
    }
    for hook in store.hooks.iter() {
        records.push(sethook_record(hook));
    }
    records
}
