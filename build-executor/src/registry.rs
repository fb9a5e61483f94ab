// Container Registries
// Concurrent stores of step/service records and logs keyed by container id

use dashmap::DashMap;

/// Concurrent map keyed by container id.
///
/// Entries are written only by the lifecycle phase that currently owns the
/// container; later phases of the same container read them back.
#[derive(Debug)]
pub struct Registry<T> {
    entries: DashMap<String, T>,
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Copy of the entry stored for the id
    pub fn load(&self, id: &str) -> Option<T> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    /// Store an entry, replacing any previous one for the id
    pub fn store(&self, id: impl Into<String>, value: T) {
        self.entries.insert(id.into(), value);
    }

    /// Mutate the entry in place, returning false when nothing is stored
    pub fn update(&self, id: &str, f: impl FnOnce(&mut T)) -> bool {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    #[test]
    fn test_store_overwrites() {
        let registry = Registry::new();
        registry.store("step_1", 1);
        registry.store("step_1", 2);

        assert_eq!(registry.load("step_1"), Some(2));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.load("missing"), None);
    }

    #[test]
    fn test_update_in_place() {
        let registry = Registry::new();
        registry.store("svc", String::from("running"));

        assert!(registry.update("svc", |s| s.push_str("!")));
        assert!(!registry.update("other", |s| s.clear()));
        assert_eq!(registry.load("svc").as_deref(), Some("running!"));
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_distinct_ids() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();

        for i in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.store(format!("step_{}", i), i);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.len(), 16);
        assert_eq!(registry.load("step_9"), Some(9));
    }
}
