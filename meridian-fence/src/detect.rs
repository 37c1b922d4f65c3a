//! Fence evaluation: mutations in, detection events out.
//!
//! The engine consumes an ordered stream of mutation notices (AOF order)
//! and evaluates each against the hooks watching the mutated collection.
//! Events are appended to the durable outbound queue before the delivery
//! worker is woken, so a crash between the two loses nothing.
//!
//! Roaming fences need to see the collection's *current* neighbors, which
//! lives on the other side of the store lock; that lookup comes in through
//! the narrow [`RoamView`] callback to keep this crate free of server
//! dependencies.

use crate::delivery::DeliveryHub;
use crate::hook::{Detect, FenceRegion, Hook, Trigger};
use crate::queue::OutboundQueue;
use chrono::{DateTime, SecondsFormat, Utc};
use meridian_core::{intersects, to_geojson, within, Geometry};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

/// Neighbor lookup for roaming fences.
pub trait RoamView: Send + Sync {
    /// Ids in `key` matching `pattern` within `meters` of `origin`,
    /// excluding the mutated item itself.
    fn roam_nearby(
        &self,
        key: &str,
        pattern: &str,
        meters: f64,
        origin: (f64, f64),
        exclude_id: &str,
    ) -> Vec<String>;
}

/// One committed mutation, as observed by the fence engine.
#[derive(Debug)]
pub struct MutationNotice {
    pub key: String,
    pub id: String,
    /// Geometry before the mutation; `None` when the item did not exist or
    /// was a string payload.
    pub prev: Option<Geometry>,
    /// Geometry after the mutation; `None` on delete.
    pub cur: Option<Geometry>,
    pub fields: Vec<(String, f64)>,
    /// Hooks watching the collection, captured under the store lock at
    /// commit time.
    pub hooks: Vec<Arc<Hook>>,
    pub time: DateTime<Utc>,
}

/// Spawn the single evaluation task. Per-hook FIFO order falls out of the
/// channel being drained by one consumer in send order.
pub fn spawn_engine(
    mut rx: mpsc::UnboundedReceiver<MutationNotice>,
    queue: Arc<Mutex<OutboundQueue>>,
    hub: Arc<DeliveryHub>,
    roam: Arc<dyn RoamView>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notice) = rx.recv().await {
            evaluate(&notice, &queue, &hub, roam.as_ref());
        }
    })
}

fn region_match(hook: &Hook, geom: &Geometry, roam: &dyn RoamView, key: &str, id: &str) -> bool {
    match &hook.region {
        FenceRegion::Area(region) => match hook.trigger {
            Trigger::Within => within(geom, region),
            _ => intersects(geom, region),
        },
        FenceRegion::Roam { pattern, meters } => !roam
            .roam_nearby(key, pattern, *meters, geom.center(), id)
            .is_empty(),
    }
}

/// The detection matrix for one mutation against one hook.
fn detections(hook: &Hook, notice: &MutationNotice, roam: &dyn RoamView) -> Vec<Detect> {
    let prev_match = notice
        .prev
        .as_ref()
        .map(|g| region_match(hook, g, roam, &notice.key, &notice.id))
        .unwrap_or(false);
    let cur_match = notice
        .cur
        .as_ref()
        .map(|g| region_match(hook, g, roam, &notice.key, &notice.id))
        .unwrap_or(false);

    let mut out = Vec::with_capacity(3);
    if prev_match && !cur_match {
        out.push(Detect::Exit);
    }
    if !prev_match && cur_match {
        out.push(Detect::Enter);
    }
    if let (Some(cur @ Geometry::Polyline(_)), FenceRegion::Area(region)) =
        (&notice.cur, &hook.region)
    {
        // A polyline that touches the region without being contained by it
        // crosses the boundary.
        if intersects(cur, region) && !within(cur, region) {
            out.push(Detect::Cross);
        }
    }
    if cur_match {
        out.push(Detect::Inside);
    }
    if !cur_match && hook.trigger == Trigger::Roam {
        out.push(Detect::Outside);
    }
    out
}

fn event_payload(hook: &Hook, notice: &MutationNotice, detect: Detect) -> String {
    let command = if notice.cur.is_some() { "set" } else { "del" };
    let object = notice
        .cur
        .as_ref()
        .or(notice.prev.as_ref())
        .map(to_geojson)
        .unwrap_or(serde_json::Value::Null);
    let mut body = serde_json::json!({
        "command": command,
        "hook": hook.name,
        "key": notice.key,
        "id": notice.id,
        "time": notice.time.to_rfc3339_opts(SecondsFormat::Micros, true),
        "detect": detect.name(),
        "object": object,
    });
    if !notice.fields.is_empty() {
        let map: serde_json::Map<String, serde_json::Value> = notice
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::json!(v)))
            .collect();
        body["fields"] = serde_json::Value::Object(map);
    }
    if !hook.meta.is_empty() {
        let map: serde_json::Map<String, serde_json::Value> = hook
            .meta
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        body["meta"] = serde_json::Value::Object(map);
    }
    body.to_string()
}

fn evaluate(
    notice: &MutationNotice,
    queue: &Mutex<OutboundQueue>,
    hub: &DeliveryHub,
    roam: &dyn RoamView,
) {
    for hook in &notice.hooks {
        let mut queued = false;
        for detect in detections(hook, notice, roam) {
            if !hook.detect.allows(detect) {
                continue;
            }
            let payload = event_payload(hook, notice, detect);
            if let Err(e) = queue.lock().push(&hook.name, &payload) {
                error!(hook = %hook.name, error = %e, "failed to enqueue detection event");
                continue;
            }
            queued = true;
        }
        if queued {
            hub.notify(&hook.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::DetectMask;
    use meridian_core::BBox;

    struct NoRoam;
    impl RoamView for NoRoam {
        fn roam_nearby(&self, _: &str, _: &str, _: f64, _: (f64, f64), _: &str) -> Vec<String> {
            Vec::new()
        }
    }

    fn circle_hook() -> Hook {
        Hook {
            name: "h".into(),
            endpoint: "http://sink/".into(),
            key: "fleet".into(),
            trigger: Trigger::Nearby,
            region: FenceRegion::Area(Geometry::Circle {
                lon: -115.5,
                lat: 33.5,
                meters: 1000.0,
            }),
            detect: DetectMask::all(),
            meta: vec![],
        }
    }

    fn point(lon: f64, lat: f64) -> Geometry {
        Geometry::Point { lon, lat, z: None }
    }

    fn notice(prev: Option<Geometry>, cur: Option<Geometry>) -> MutationNotice {
        MutationNotice {
            key: "fleet".into(),
            id: "bus1".into(),
            prev,
            cur,
            fields: vec![],
            hooks: vec![],
            time: Utc::now(),
        }
    }

    #[test]
    fn enter_then_inside_on_first_appearance() {
        let hook = circle_hook();
        let n = notice(None, Some(point(-115.5, 33.5)));
        let got = detections(&hook, &n, &NoRoam);
        assert_eq!(got, vec![Detect::Enter, Detect::Inside]);
    }

    #[test]
    fn inside_fires_on_every_mutation_while_inside() {
        let hook = circle_hook();
        let n = notice(Some(point(-115.5001, 33.5)), Some(point(-115.5, 33.5)));
        let got = detections(&hook, &n, &NoRoam);
        assert_eq!(got, vec![Detect::Inside]);
    }

    #[test]
    fn exit_on_leaving_and_on_delete() {
        let hook = circle_hook();
        let n = notice(Some(point(-115.5, 33.5)), Some(point(-114.0, 33.5)));
        assert_eq!(detections(&hook, &n, &NoRoam), vec![Detect::Exit]);

        let n = notice(Some(point(-115.5, 33.5)), None);
        assert_eq!(detections(&hook, &n, &NoRoam), vec![Detect::Exit]);
    }

    #[test]
    fn no_events_when_always_outside() {
        let hook = circle_hook();
        let n = notice(Some(point(-110.0, 30.0)), Some(point(-111.0, 30.0)));
        assert!(detections(&hook, &n, &NoRoam).is_empty());
    }

    #[test]
    fn polyline_cross() {
        let mut hook = circle_hook();
        hook.trigger = Trigger::Intersects;
        hook.region = FenceRegion::Area(Geometry::Bounds(BBox::new(0.0, 0.0, 10.0, 10.0)));
        let line = Geometry::Polyline(geo_types::LineString(vec![
            geo_types::Coord { x: -5.0, y: 5.0 },
            geo_types::Coord { x: 15.0, y: 5.0 },
        ]));
        let n = notice(None, Some(line));
        let got = detections(&hook, &n, &NoRoam);
        assert_eq!(got, vec![Detect::Enter, Detect::Cross, Detect::Inside]);
    }

    #[test]
    fn roam_fires_outside_when_alone() {
        let mut hook = circle_hook();
        hook.trigger = Trigger::Roam;
        hook.region = FenceRegion::Roam {
            pattern: "truck*".into(),
            meters: 500.0,
        };
        let n = notice(None, Some(point(0.0, 0.0)));
        assert_eq!(detections(&hook, &n, &NoRoam), vec![Detect::Outside]);

        struct OneNearby;
        impl RoamView for OneNearby {
            fn roam_nearby(
                &self,
                _: &str,
                _: &str,
                _: f64,
                _: (f64, f64),
                _: &str,
            ) -> Vec<String> {
                vec!["truck7".into()]
            }
        }
        let got = detections(&hook, &n, &OneNearby);
        assert_eq!(got, vec![Detect::Enter, Detect::Inside]);
    }

    #[test]
    fn payload_shape() {
        let hook = circle_hook();
        let n = notice(None, Some(point(-115.5, 33.5)));
        let payload = event_payload(&hook, &n, Detect::Enter);
        let v: serde_json::Value = payload.parse().unwrap();
        assert_eq!(v["command"], "set");
        assert_eq!(v["detect"], "enter");
        assert_eq!(v["hook"], "h");
        assert_eq!(v["id"], "bus1");
        assert_eq!(v["object"]["type"], "Point");
    }
}
