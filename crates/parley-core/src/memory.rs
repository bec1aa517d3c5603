use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::Mutex;

use crate::persist::DiffAwareFile;

/// One dialog's scratch map plus its digest-gated file target.
struct DialogMemory {
    entries: BTreeMap<String, Value>,
    file: DiffAwareFile,
}

impl DialogMemory {
    fn persist(&self) -> std::io::Result<bool> {
        let bytes = serde_json::to_vec_pretty(&self.entries)?;
        self.file.store(&bytes)
    }
}

/// Per-dialog key/value scratch space workers reach over HTTP.
///
/// Each dialog maps to `<kv_root>/<dialog_id>.json`, loaded lazily on
/// first touch. Saves persist immediately when the content changed;
/// a periodic flush catches anything that slipped through.
pub struct MemoryStore {
    root: PathBuf,
    dialogs: RwLock<HashMap<String, Arc<Mutex<DialogMemory>>>>,
}

impl MemoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dialogs: RwLock::new(HashMap::new()),
        }
    }

    /// Upsert `(dialog_id, key) → value` and persist on change.
    pub async fn save(&self, dialog_id: &str, key: &str, value: Value) {
        let memory = self.dialog_memory(dialog_id);
        let mut memory = memory.lock().await;
        memory.entries.insert(key.to_string(), value);
        if let Err(e) = memory.persist() {
            tracing::error!(dialog = dialog_id, "failed to persist tool memory: {e}");
        }
    }

    /// Stored value for `(dialog_id, key)`, `None` when absent.
    pub async fn query(&self, dialog_id: &str, key: &str) -> Option<Value> {
        let memory = self.dialog_memory(dialog_id);
        let memory = memory.lock().await;
        memory.entries.get(key).cloned()
    }

    /// Flush every loaded dialog whose content changed.
    pub async fn flush(&self) {
        let loaded: Vec<Arc<Mutex<DialogMemory>>> =
            self.dialogs.read().unwrap().values().cloned().collect();
        for memory in loaded {
            let memory = memory.lock().await;
            if let Err(e) = memory.persist() {
                tracing::error!("tool memory flush failed: {e}");
            }
        }
    }

    pub async fn run_flush_loop(self: Arc<Self>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.flush().await;
        }
    }

    fn dialog_memory(&self, dialog_id: &str) -> Arc<Mutex<DialogMemory>> {
        if let Some(memory) = self.dialogs.read().unwrap().get(dialog_id) {
            return memory.clone();
        }
        let mut dialogs = self.dialogs.write().unwrap();
        dialogs
            .entry(dialog_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(self.load_dialog(dialog_id))))
            .clone()
    }

    fn load_dialog(&self, dialog_id: &str) -> DialogMemory {
        let file = DiffAwareFile::new(self.root.join(format!("{dialog_id}.json")));
        let entries = match file.load() {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    tracing::error!(dialog = dialog_id, "corrupt tool memory file, starting empty: {e}");
                    BTreeMap::new()
                }
            },
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                tracing::error!(dialog = dialog_id, "cannot read tool memory file: {e}");
                BTreeMap::new()
            }
        };
        DialogMemory { entries, file }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn save_then_query_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.save("d1", "k", json!(42)).await;
        assert_eq!(store.query("d1", "k").await, Some(json!(42)));
        assert_eq!(store.query("d1", "other").await, None);
        assert_eq!(store.query("d2", "k").await, None);
    }

    #[tokio::test]
    async fn values_survive_a_new_store() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = MemoryStore::new(dir.path());
            store.save("d1", "k", json!({"nested": [1, 2]})).await;
        }
        let reopened = MemoryStore::new(dir.path());
        assert_eq!(
            reopened.query("d1", "k").await,
            Some(json!({"nested": [1, 2]}))
        );
    }

    #[tokio::test]
    async fn save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.save("d1", "k", json!("first")).await;
        store.save("d1", "k", json!("second")).await;
        assert_eq!(store.query("d1", "k").await, Some(json!("second")));
    }

    #[tokio::test]
    async fn dialogs_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.save("d1", "k", json!(1)).await;
        store.save("d2", "k", json!(2)).await;
        assert_eq!(store.query("d1", "k").await, Some(json!(1)));
        assert_eq!(store.query("d2", "k").await, Some(json!(2)));
        assert!(dir.path().join("d1.json").is_file());
        assert!(dir.path().join("d2.json").is_file());
    }
}
