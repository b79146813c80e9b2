use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use crate::types::DeviceKind;

/// Process-wide mapping from keys to factory values.
///
/// Registration fails hard on duplicate keys: two components claiming the
/// same name is a programming error we refuse to paper over. Lookup is
/// cheap and may run concurrently.
pub struct Registry<K, V> {
    label: &'static str,
    map: Mutex<HashMap<K, V>>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, key: K, value: V) {
        let mut map = self.map.lock().expect("registry lock poisoned");
        if map.contains_key(&key) {
            panic!("{} registry: key {:?} registered twice", self.label, key);
        }
        map.insert(key, value);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.map
            .lock()
            .expect("registry lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn has(&self, key: &K) -> bool {
        self.map
            .lock()
            .expect("registry lock poisoned")
            .contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.map
            .lock()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// Kernel lookup key: the same op name resolves to a different kernel per
/// device family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub name: String,
    pub device: DeviceKind,
}

impl KernelKey {
    pub fn new(name: impl Into<String>, device: DeviceKind) -> Self {
        Self {
            name: name.into(),
            device,
        }
    }
}
