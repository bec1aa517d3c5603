use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::persist::DiffAwareFile;

/// Memoized content → intent mapping, persisted as sorted-key JSON.
pub struct IntentCache {
    entries: RwLock<HashMap<String, String>>,
    file: DiffAwareFile,
}

impl IntentCache {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            file: DiffAwareFile::new(path),
        }
    }

    pub fn get(&self, content: &str) -> Option<String> {
        self.entries.read().unwrap().get(content).cloned()
    }

    pub fn insert(&self, content: String, intent: String) {
        self.entries.write().unwrap().insert(content, intent);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    pub fn load(&self) {
        match self.file.load() {
            Ok(Some(bytes)) => match serde_json::from_slice::<HashMap<String, String>>(&bytes) {
                Ok(map) => {
                    let count = map.len();
                    *self.entries.write().unwrap() = map;
                    tracing::info!(count, "loaded intent cache");
                }
                Err(e) => tracing::error!("failed to decode intent cache: {e}"),
            },
            Ok(None) => tracing::info!("intent cache file not found, starting empty"),
            Err(e) => tracing::error!("failed to read intent cache: {e}"),
        }
    }

    /// Write the cache when it changed since the last flush.
    pub fn flush(&self) {
        let sorted: BTreeMap<String, String> = self
            .entries
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let bytes = match serde_json::to_vec_pretty(&sorted) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("failed to encode intent cache: {e}");
                return;
            }
        };
        match self.file.store(&bytes) {
            Ok(true) => tracing::debug!(count = sorted.len(), "intent cache flushed"),
            Ok(false) => {}
            Err(e) => tracing::error!("failed to write intent cache: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intentMatchCache.json");

        let cache = IntentCache::new(&path);
        cache.insert("查看状态".into(), "checkStatus".into());
        cache.flush();

        let restored = IntentCache::new(&path);
        restored.load();
        assert_eq!(restored.get("查看状态").as_deref(), Some("checkStatus"));
    }

    #[test]
    fn unchanged_flush_leaves_mtime_content_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = IntentCache::new(&path);
        cache.insert("a".into(), "x".into());
        cache.flush();
        let first = std::fs::read(&path).unwrap();
        cache.flush();
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }
}
