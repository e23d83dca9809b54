use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::props::{PropValue, PID_TIMESCALE};
use crate::util::FourCC;

/// A property identifier: either a registered 4CC code or a free-form
/// name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropKey {
    Code(FourCC),
    Name(String),
}

impl From<FourCC> for PropKey {
    fn from(code: FourCC) -> PropKey {
        PropKey::Code(code)
    }
}

impl From<&str> for PropKey {
    fn from(name: &str) -> PropKey {
        PropKey::Name(name.to_string())
    }
}

/// One snapshot of a pid's properties.
///
/// Maps are shared through `Arc`; the strong count is the reference
/// count, and dropping the last reference deletes the map. A map is only
/// written to while no dispatched packet references it: the owning pid
/// tracks this with its `request_property_map` flag and allocates a fresh
/// map once the current one has been seen by a consumer.
#[derive(Debug, Default)]
pub struct PropertyMap {
    entries: Mutex<FxHashMap<PropKey, PropValue>>,
    timescale: AtomicU32,
}

impl PropertyMap {
    pub fn new() -> PropertyMap {
        PropertyMap::default()
    }

    pub fn set(&self, key: PropKey, value: PropValue) {
        if key == PropKey::Code(PID_TIMESCALE) {
            if let Some(ts) = value.as_uint() {
                self.timescale.store(ts, Ordering::Relaxed);
            }
        }
        self.entries.lock().unwrap().insert(key, value);
    }

    pub fn get(&self, key: &PropKey) -> Option<PropValue> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn get_code(&self, code: FourCC) -> Option<PropValue> {
        self.get(&PropKey::Code(code))
    }

    pub fn get_str(&self, name: &str) -> Option<PropValue> {
        self.get(&PropKey::Name(name.to_string()))
    }

    /// Copies every entry of `other` into this map, overwriting existing
    /// keys.
    pub fn merge_from(&self, other: &PropertyMap) {
        let src = other.entries.lock().unwrap().clone();
        let mut dst = self.entries.lock().unwrap();
        for (k, v) in src {
            dst.insert(k, v);
        }
        let ts = other.timescale.load(Ordering::Relaxed);
        if ts != 0 {
            self.timescale.store(ts, Ordering::Relaxed);
        }
    }

    pub fn reset(&self) {
        self.entries.lock().unwrap().clear();
        self.timescale.store(0, Ordering::Relaxed);
    }

    pub fn timescale(&self) -> u32 {
        self.timescale.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries, for enumeration.
    pub fn snapshot(&self) -> Vec<(PropKey, PropValue)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::PID_STREAM_TYPE;

    #[test]
    fn set_get_merge() {
        let a = PropertyMap::new();
        a.set(PID_STREAM_TYPE.into(), PropValue::Uint(3));
        a.set("custom".into(), PropValue::String("x".into()));
        assert_eq!(a.get_code(PID_STREAM_TYPE), Some(PropValue::Uint(3)));
        assert_eq!(a.get_str("custom"), Some(PropValue::String("x".into())));

        let b = PropertyMap::new();
        b.set(PID_STREAM_TYPE.into(), PropValue::Uint(2));
        b.merge_from(&a);
        assert_eq!(b.get_code(PID_STREAM_TYPE), Some(PropValue::Uint(3)));
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn timescale_tracked() {
        let m = PropertyMap::new();
        m.set(PID_TIMESCALE.into(), PropValue::Uint(90_000));
        assert_eq!(m.timescale(), 90_000);
    }
}
