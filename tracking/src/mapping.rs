//! Lookup table keyed by dotted event names.
//!
//! Keys ending with a `.` are prefix patterns: `edx.video.` matches every name starting
//! with it. Exact keys always win, and among matching prefixes the longest one wins, so a
//! more specific handler can be registered next to a general one without caring about
//! insertion order.
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct DottedPathMapping<V> {
    exact: HashMap<String, V>,
    prefix: HashMap<String, V>,
}

impl<V> Default for DottedPathMapping<V> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            prefix: HashMap::new(),
        }
    }
}

fn is_prefix_key(key: &str) -> bool {
    key.ends_with('.')
}

impl<V> DottedPathMapping<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the one previously stored under the same key.
    pub fn set(&mut self, key: impl Into<String>, value: V) -> Option<V> {
        let key = key.into();
        if is_prefix_key(&key) {
            self.prefix.insert(key, value)
        } else {
            self.exact.insert(key, value)
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        if let Some(value) = self.exact.get(key) {
            return Some(value);
        }

        self.prefix
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove a key from the table its trailing dot routes to. This never removes the
    /// prefix entry that a plain key happens to match.
    pub fn delete(&mut self, key: &str) -> Option<V> {
        if is_prefix_key(key) {
            self.prefix.remove(key)
        } else {
            self.exact.remove(key)
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.exact
            .keys()
            .chain(self.prefix.keys())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.prefix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefix.is_empty()
    }
}

impl<K: Into<String>, V> FromIterator<(K, V)> for DottedPathMapping<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut mapping = Self::new();
        for (key, value) in iter {
            mapping.set(key, value);
        }
        mapping
    }
}
