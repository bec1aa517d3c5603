use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::persist::DiffAwareFile;

/// Mutable per-dialog routing state.
///
/// `bound_handler` is the intent name of the currently sticky worker,
/// empty when no handler owns the dialog. At most one of
/// `bound_handler != ""` and `in_clarification` owns a turn; the
/// coordinator consults them in that order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogState {
    pub user_id: String,
    pub dialog_id: String,
    #[serde(default)]
    pub bound_handler: String,
    #[serde(default)]
    pub in_clarification: bool,
    #[serde(default)]
    pub first_clarification_turn: bool,
    #[serde(default)]
    pub chat_history: Vec<String>,
    /// Rejections consumed in the current turn; not persisted.
    #[serde(skip)]
    pub rejects_this_turn: u8,
}

impl DialogState {
    pub fn new(dialog_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            dialog_id: dialog_id.into(),
            bound_handler: String::new(),
            in_clarification: false,
            first_clarification_turn: false,
            chat_history: Vec::new(),
            rejects_this_turn: 0,
        }
    }

    /// Append a rendered user turn, dropping from the head past `limit`.
    /// A turn byte-identical to the latest entry is skipped, which keeps
    /// a handler-rejection re-queue from duplicating the user line.
    pub fn push_history(&mut self, entry: String, limit: usize) {
        if self.chat_history.last() == Some(&entry) {
            return;
        }
        self.append_history(entry, limit);
    }

    /// Append a rendered reply turn unconditionally, capped at `limit`.
    pub fn append_history(&mut self, entry: String, limit: usize) {
        self.chat_history.push(entry);
        if self.chat_history.len() > limit {
            let excess = self.chat_history.len() - limit;
            self.chat_history.drain(..excess);
        }
    }
}

/// Replacement persistence hooks; when set, the file-backed path is
/// bypassed entirely.
pub type SaveDialogsFn = Box<dyn Fn(&HashMap<String, DialogState>) + Send + Sync>;
pub type LoadDialogsFn = Box<dyn Fn() -> HashMap<String, DialogState> + Send + Sync>;

/// Registry owning every [`DialogState`], keyed by `dialog_id`.
///
/// Lookups take the outer read lock; creation always goes through the
/// write lock. Each state sits behind its own async mutex, held by the
/// coordinator for the duration of a routing step.
pub struct DialogRegistry {
    dialogs: RwLock<HashMap<String, Arc<Mutex<DialogState>>>>,
    file: DiffAwareFile,
    save_hook: Option<SaveDialogsFn>,
    load_hook: Option<LoadDialogsFn>,
}

impl DialogRegistry {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            dialogs: RwLock::new(HashMap::new()),
            file: DiffAwareFile::new(path),
            save_hook: None,
            load_hook: None,
        }
    }

    pub fn with_hooks(mut self, save: SaveDialogsFn, load: LoadDialogsFn) -> Self {
        self.save_hook = Some(save);
        self.load_hook = Some(load);
        self
    }

    /// Fetch an existing dialog, `None` when the id is unknown.
    pub fn get(&self, dialog_id: &str) -> Option<Arc<Mutex<DialogState>>> {
        self.dialogs.read().unwrap().get(dialog_id).cloned()
    }

    /// Fetch or lazily create the dialog for an inbound user message.
    pub fn get_or_create(&self, dialog_id: &str, user_id: &str) -> Arc<Mutex<DialogState>> {
        if let Some(state) = self.get(dialog_id) {
            return state;
        }
        let mut dialogs = self.dialogs.write().unwrap();
        dialogs
            .entry(dialog_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(%dialog_id, "creating dialog state");
                Arc::new(Mutex::new(DialogState::new(dialog_id, user_id)))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.dialogs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.read().unwrap().is_empty()
    }

    /// Load the persisted map, once, at startup.
    pub fn load(&self) {
        let loaded: HashMap<String, DialogState> = if let Some(hook) = &self.load_hook {
            hook()
        } else {
            match self.file.load() {
                Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                    Ok(map) => map,
                    Err(e) => {
                        tracing::error!("failed to decode dialog file: {e}");
                        return;
                    }
                },
                Ok(None) => {
                    tracing::info!("dialog file not found, starting empty");
                    return;
                }
                Err(e) => {
                    tracing::error!("failed to read dialog file: {e}");
                    return;
                }
            }
        };

        let mut dialogs = self.dialogs.write().unwrap();
        let count = loaded.len();
        for (id, state) in loaded {
            dialogs.insert(id, Arc::new(Mutex::new(state)));
        }
        tracing::info!(count, "loaded dialog states");
    }

    /// Snapshot every dialog and flush when the content changed.
    pub async fn flush(&self) {
        let handles: Vec<Arc<Mutex<DialogState>>> =
            self.dialogs.read().unwrap().values().cloned().collect();

        let mut snapshot = BTreeMap::new();
        for handle in handles {
            let state = handle.lock().await.clone();
            snapshot.insert(state.dialog_id.clone(), state);
        }

        if let Some(hook) = &self.save_hook {
            hook(&snapshot.clone().into_iter().collect());
            return;
        }

        let bytes = match serde_json::to_vec_pretty(&snapshot) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("failed to encode dialog states: {e}");
                return;
            }
        };
        match self.file.store(&bytes) {
            Ok(true) => tracing::debug!(count = snapshot.len(), "dialog states flushed"),
            Ok(false) => {}
            Err(e) => tracing::error!("failed to write dialog file: {e}"),
        }
    }

    /// Periodic flush loop; runs until the task is dropped.
    pub async fn run_flush_loop(self: Arc<Self>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_capped_from_the_head() {
        let mut state = DialogState::new("d", "u");
        for i in 0..25 {
            state.push_history(format!("User: {i}"), 20);
        }
        assert_eq!(state.chat_history.len(), 20);
        assert_eq!(state.chat_history[0], "User: 5");
        assert_eq!(state.chat_history.last().unwrap(), "User: 24");
    }

    #[test]
    fn identical_consecutive_entries_are_deduped() {
        let mut state = DialogState::new("d", "u");
        state.push_history("User: again".into(), 20);
        state.push_history("User: again".into(), 20);
        assert_eq!(state.chat_history.len(), 1);

        state.push_history("Program: ok".into(), 20);
        state.push_history("User: again".into(), 20);
        assert_eq!(state.chat_history.len(), 3);
    }

    #[tokio::test]
    async fn flush_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dialoginfo.json");

        let registry = DialogRegistry::new(&path);
        {
            let handle = registry.get_or_create("d1", "u1");
            let mut state = handle.lock().await;
            state.bound_handler = "checkStatus".into();
            state.chat_history.push("User: hi".into());
        }
        registry.flush().await;

        let restored = DialogRegistry::new(&path);
        restored.load();
        let handle = restored.get("d1").expect("dialog persisted");
        let state = handle.lock().await;
        assert_eq!(state.bound_handler, "checkStatus");
        assert_eq!(state.chat_history, vec!["User: hi".to_string()]);
        assert_eq!(state.rejects_this_turn, 0);
    }

    #[tokio::test]
    async fn get_or_create_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DialogRegistry::new(dir.path().join("dialoginfo.json"));
        let a = registry.get_or_create("d1", "u1");
        let b = registry.get_or_create("d1", "other");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(a.lock().await.user_id, "u1");
    }

    #[test]
    fn unknown_dialog_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DialogRegistry::new(dir.path().join("dialoginfo.json"));
        assert!(registry.get("missing").is_none());
    }
}
