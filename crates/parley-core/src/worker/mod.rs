mod session;

pub use session::{connect_as_worker, WorkerSession};

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use parley_protocol::{Envelope, EventType};

use crate::config::RouterConfig;
use crate::error::RouterError;

/// Egress seam the coordinator uses to reach workers. The live
/// implementation is [`WorkerManager`]; tests substitute a stub.
#[async_trait]
pub trait WorkerRoute: Send + Sync {
    /// Deliver an envelope to the worker bound to its dialog, spawning a
    /// session on demand. Failures never surface here; they come back as
    /// synthesized events on the coordinator's worker mailbox.
    async fn dispatch(&self, env: Envelope);

    /// Tear down the session for a dialog, if any. Idempotent.
    async fn close_session(&self, dialog_id: &str);
}

/// Owns every [`WorkerSession`], keyed by dialog id.
pub struct WorkerManager {
    cfg: Arc<RouterConfig>,
    sessions: Arc<StdMutex<HashMap<String, Arc<WorkerSession>>>>,
    to_router: mpsc::Sender<Envelope>,
}

impl WorkerManager {
    /// `to_router` is the coordinator's from-worker mailbox; every frame
    /// a worker produces and every synthesized lifecycle event lands there.
    pub fn new(cfg: Arc<RouterConfig>, to_router: mpsc::Sender<Envelope>) -> std::io::Result<Self> {
        std::fs::create_dir_all(&cfg.socket_dir)?;
        Ok(Self {
            cfg,
            sessions: Arc::new(StdMutex::new(HashMap::new())),
            to_router,
        })
    }

    pub fn session(&self, dialog_id: &str) -> Option<Arc<WorkerSession>> {
        self.sessions.lock().unwrap().get(dialog_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Names of workers installed under the worker root: directories
    /// containing `<dir>/<dir>.<ext>`.
    pub fn installed_workers(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.cfg.worker_root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(root = %self.cfg.worker_root.display(), "cannot read worker root: {e}");
                return Vec::new();
            }
        };
        let mut names = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.join(format!("{name}.{}", self.cfg.worker_ext)).is_file() {
                names.push(name.to_string());
            }
        }
        names.sort();
        names
    }

    /// Tear down every session; used on shutdown.
    pub fn close_all(&self) {
        let sessions: Vec<Arc<WorkerSession>> =
            self.sessions.lock().unwrap().values().cloned().collect();
        for session in sessions {
            session.close();
        }
    }

    fn get_or_spawn(&self, env: &Envelope) -> Result<Arc<WorkerSession>, RouterError> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get(&env.dialog_id) {
            return Ok(session.clone());
        }
        let session = WorkerSession::spawn(
            self.cfg.clone(),
            &env.dialog_id,
            &env.user_id,
            &env.intention,
            self.to_router.clone(),
            Arc::downgrade(&self.sessions),
        )?;
        sessions.insert(env.dialog_id.clone(), session.clone());
        Ok(session)
    }
}

#[async_trait]
impl WorkerRoute for WorkerManager {
    async fn dispatch(&self, env: Envelope) {
        if env.event_type == EventType::UserTerminate {
            if let Some(session) = self.session(&env.dialog_id) {
                if let Err(e) = session.send(&env).await {
                    tracing::warn!(dialog = %env.dialog_id, "terminate not delivered: {e}");
                }
                session.close();
            }
            return;
        }

        let session = match self.get_or_spawn(&env) {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(dialog = %env.dialog_id, intent = %env.intention, "worker spawn failed: {e}");
                // Bounce the turn back so re-routing runs.
                let mut reject = env;
                reject.event_type = EventType::HandlerReject;
                if self.to_router.send(reject).await.is_err() {
                    tracing::warn!("router mailbox closed, dropping spawn rejection");
                }
                return;
            }
        };

        match session.send(&env).await {
            Ok(()) => {}
            Err(RouterError::WorkerPeerAbsent(_)) => {
                tracing::error!(dialog = %env.dialog_id, "worker never connected, closing session");
                session.finish(EventType::HandlerDone).await;
            }
            Err(e) => {
                tracing::error!(dialog = %env.dialog_id, "worker send failed: {e}");
            }
        }
    }

    async fn close_session(&self, dialog_id: &str) {
        if let Some(session) = self.session(dialog_id) {
            session.close();
        }
    }
}
