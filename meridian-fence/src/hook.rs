//! Hooks: persistent bindings of a fence predicate to a delivery endpoint.

use crate::error::{FenceError, Result};
use meridian_core::{glob, Geometry};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Detection kinds a fence can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detect {
    Inside,
    Outside,
    Enter,
    Exit,
    Cross,
}

impl Detect {
    pub fn name(self) -> &'static str {
        match self {
            Detect::Inside => "inside",
            Detect::Outside => "outside",
            Detect::Enter => "enter",
            Detect::Exit => "exit",
            Detect::Cross => "cross",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Detect::Inside => 1 << 0,
            Detect::Outside => 1 << 1,
            Detect::Enter => 1 << 2,
            Detect::Exit => 1 << 3,
            Detect::Cross => 1 << 4,
        }
    }

    pub fn parse(s: &str) -> Option<Detect> {
        Some(match s {
            "inside" => Detect::Inside,
            "outside" => Detect::Outside,
            "enter" => Detect::Enter,
            "exit" => Detect::Exit,
            "cross" => Detect::Cross,
            _ => return None,
        })
    }
}

/// Which detection kinds a hook delivers. Empty DETECT clause means all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectMask(u8);

impl DetectMask {
    pub fn all() -> DetectMask {
        DetectMask(0x1f)
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> DetectMask {
        if names.is_empty() {
            return DetectMask::all();
        }
        let mut mask = 0u8;
        for name in names {
            if let Some(d) = Detect::parse(name.as_ref()) {
                mask |= d.bit();
            }
        }
        DetectMask(mask)
    }

    pub fn allows(self, d: Detect) -> bool {
        self.0 & d.bit() != 0
    }

    pub fn names(self) -> Vec<&'static str> {
        [
            Detect::Inside,
            Detect::Outside,
            Detect::Enter,
            Detect::Exit,
            Detect::Cross,
        ]
        .into_iter()
        .filter(|d| self.allows(*d))
        .map(Detect::name)
        .collect()
    }
}

/// Fence predicate kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Nearby,
    Within,
    Intersects,
    Roam,
}

impl Trigger {
    pub fn name(self) -> &'static str {
        match self {
            Trigger::Nearby => "nearby",
            Trigger::Within => "within",
            Trigger::Intersects => "intersects",
            Trigger::Roam => "roam",
        }
    }
}

/// The region a fence tests against: a fixed area, or for roaming fences a
/// target-id pattern plus a proximity radius.
#[derive(Debug, Clone)]
pub enum FenceRegion {
    Area(Geometry),
    Roam { pattern: String, meters: f64 },
}

/// A registered geofence hook.
#[derive(Debug, Clone)]
pub struct Hook {
    pub name: String,
    pub endpoint: String,
    pub key: String,
    pub trigger: Trigger,
    pub region: FenceRegion,
    pub detect: DetectMask,
    pub meta: Vec<(String, String)>,
}

impl Hook {
    /// Endpoints are delivered over HTTP; anything else is rejected at
    /// registration time.
    pub fn validate_endpoint(endpoint: &str) -> Result<()> {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            Ok(())
        } else {
            Err(FenceError::InvalidEndpoint(endpoint.to_string()))
        }
    }
}

/// Global hook registry: name-ordered for HOOKS, with a per-collection
/// index for fence evaluation.
#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: BTreeMap<String, Arc<Hook>>,
    by_key: FxHashMap<String, Vec<Arc<Hook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Hook>> {
        self.hooks.get(name)
    }

    /// Insert or replace a hook. Returns the previous hook with this name.
    pub fn insert(&mut self, hook: Hook) -> Option<Arc<Hook>> {
        let hook = Arc::new(hook);
        let prev = self.hooks.insert(hook.name.clone(), hook.clone());
        if let Some(prev) = &prev {
            self.unindex(prev);
        }
        self.by_key
            .entry(hook.key.clone())
            .or_default()
            .push(hook);
        prev
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<Hook>> {
        let hook = self.hooks.remove(name)?;
        self.unindex(&hook);
        Some(hook)
    }

    fn unindex(&mut self, hook: &Arc<Hook>) {
        if let Some(list) = self.by_key.get_mut(&hook.key) {
            list.retain(|h| h.name != hook.name);
            if list.is_empty() {
                self.by_key.remove(&hook.key);
            }
        }
    }

    /// Hooks watching a collection, in registration order.
    pub fn hooks_for(&self, key: &str) -> Vec<Arc<Hook>> {
        self.by_key.get(key).cloned().unwrap_or_default()
    }

    /// Name-ordered hooks matching a glob pattern.
    pub fn matching(&self, pattern: &str) -> Vec<Arc<Hook>> {
        self.hooks
            .values()
            .filter(|h| glob::matches(pattern, &h.name))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Hook>> {
        self.hooks.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::BBox;

    fn hook(name: &str, key: &str) -> Hook {
        Hook {
            name: name.into(),
            endpoint: "http://sink:9000/".into(),
            key: key.into(),
            trigger: Trigger::Within,
            region: FenceRegion::Area(Geometry::Bounds(BBox::world())),
            detect: DetectMask::all(),
            meta: vec![],
        }
    }

    #[test]
    fn registry_indexes_by_key() {
        let mut reg = HookRegistry::new();
        reg.insert(hook("a", "fleet"));
        reg.insert(hook("b", "fleet"));
        reg.insert(hook("c", "other"));
        assert_eq!(reg.hooks_for("fleet").len(), 2);
        assert_eq!(reg.hooks_for("other").len(), 1);

        // Replacing a hook re-targets the key index.
        reg.insert(hook("b", "other"));
        assert_eq!(reg.hooks_for("fleet").len(), 1);
        assert_eq!(reg.hooks_for("other").len(), 2);

        reg.remove("a");
        assert!(reg.hooks_for("fleet").is_empty());
    }

    #[test]
    fn detect_mask_defaults_to_all() {
        let mask = DetectMask::from_names::<&str>(&[]);
        assert!(mask.allows(Detect::Enter));
        assert!(mask.allows(Detect::Cross));

        let mask = DetectMask::from_names(&["enter", "exit"]);
        assert!(mask.allows(Detect::Enter));
        assert!(!mask.allows(Detect::Inside));
        assert_eq!(mask.names(), vec!["enter", "exit"]);
    }

    #[test]
    fn endpoint_validation() {
        assert!(Hook::validate_endpoint("http://sink:9000/geo").is_ok());
        assert!(Hook::validate_endpoint("https://sink/geo").is_ok());
        assert!(Hook::validate_endpoint("grpc://sink:9000").is_err());
    }
}
