use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use parley_protocol::{build_frame, Envelope, EventType, FrameHeader, HEADER_LEN};

use crate::config::RouterConfig;
use crate::error::RouterError;

/// One live worker subprocess bound to a dialog, reachable through a
/// private framed byte stream over a unix socket the session owns.
///
/// The session exclusively owns its listener, subprocess, peer
/// connection and idle timer; the coordinator only ever holds an opaque
/// handle used to send.
pub struct WorkerSession {
    pub dialog_id: String,
    pub user_id: String,
    pub intent: String,
    socket_path: PathBuf,
    cfg: Arc<RouterConfig>,
    to_router: mpsc::Sender<Envelope>,
    registry: Weak<StdMutex<HashMap<String, Arc<WorkerSession>>>>,
    /// Write half of the active peer connection; also the send lock
    /// serializing header+body writes.
    peer: Mutex<Option<OwnedWriteHalf>>,
    idle_deadline: StdMutex<Instant>,
    closed: AtomicBool,
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl WorkerSession {
    /// Resolve the worker entry file, bind the session socket, start the
    /// subprocess and the accept/waiter/idle tasks.
    pub fn spawn(
        cfg: Arc<RouterConfig>,
        dialog_id: &str,
        user_id: &str,
        intent: &str,
        to_router: mpsc::Sender<Envelope>,
        registry: Weak<StdMutex<HashMap<String, Arc<WorkerSession>>>>,
    ) -> Result<Arc<Self>, RouterError> {
        let entry = cfg
            .worker_root
            .join(intent)
            .join(format!("{intent}.{}", cfg.worker_ext));
        if !entry.is_file() {
            return Err(RouterError::WorkerSpawnFailed {
                intent: intent.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no worker entry at {}", entry.display()),
                ),
            });
        }

        let socket_path = cfg.socket_dir.join(format!("{dialog_id}.sock"));
        if let Err(e) = std::fs::remove_file(&socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %socket_path.display(), "cannot remove stale socket: {e}");
            }
        }

        let listener = UnixListener::bind(&socket_path).map_err(|source| {
            RouterError::WorkerSpawnFailed {
                intent: intent.to_string(),
                source,
            }
        })?;

        let child = Command::new(&cfg.worker_launcher)
            .arg(&entry)
            .arg(format!("--socket={}", socket_path.display()))
            .arg(format!("--port={}", cfg.http_bind.port()))
            .spawn()
            .map_err(|source| {
                let _ = std::fs::remove_file(&socket_path);
                RouterError::WorkerSpawnFailed {
                    intent: intent.to_string(),
                    source,
                }
            })?;

        let (kill_tx, kill_rx) = oneshot::channel();
        let session = Arc::new(Self {
            dialog_id: dialog_id.to_string(),
            user_id: user_id.to_string(),
            intent: intent.to_string(),
            socket_path,
            idle_deadline: StdMutex::new(Instant::now() + cfg.worker_idle_timeout),
            cfg,
            to_router,
            registry,
            peer: Mutex::new(None),
            closed: AtomicBool::new(false),
            kill_tx: StdMutex::new(Some(kill_tx)),
            tasks: StdMutex::new(Vec::new()),
        });

        {
            let mut tasks = session.tasks.lock().unwrap();
            tasks.push(tokio::spawn(session.clone().accept_loop(listener)));
            tasks.push(tokio::spawn(session.clone().idle_loop()));
        }
        // The waiter stays un-tracked: teardown reaches it through the
        // kill signal, and aborting it would orphan the subprocess.
        tokio::spawn(session.clone().wait_process(child, kill_rx));

        tracing::info!(dialog = %session.dialog_id, intent = %session.intent, "worker session started");
        Ok(session)
    }

    /// Frame the envelope and write it to the peer, waiting a short
    /// grace window for a freshly spawned worker to connect.
    pub async fn send(&self, env: &Envelope) -> Result<(), RouterError> {
        let frame = build_frame(env)?;

        let mut tries = 0;
        loop {
            let mut peer = self.peer.lock().await;
            match peer.as_mut() {
                Some(writer) => {
                    writer.write_all(&frame).await.map_err(|e| {
                        tracing::warn!(dialog = %self.dialog_id, "worker write failed: {e}");
                        RouterError::WorkerPeerAbsent(self.dialog_id.clone())
                    })?;
                    self.touch_idle();
                    return Ok(());
                }
                None => {
                    drop(peer);
                    if tries >= self.cfg.peer_wait_tries {
                        return Err(RouterError::WorkerPeerAbsent(self.dialog_id.clone()));
                    }
                    tries += 1;
                    tokio::time::sleep(self.cfg.peer_wait_step).await;
                }
            }
        }
    }

    /// Tear the session down without synthesizing an event. Idempotent.
    pub fn close(&self) {
        self.teardown();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear down and, when this call was the one that closed the
    /// session, synthesize `event` toward the coordinator.
    pub(crate) async fn finish(&self, event: EventType) {
        if !self.teardown() {
            return;
        }
        let mut env = Envelope::new(event, self.dialog_id.clone(), self.user_id.clone());
        env.intention = self.intent.clone();
        if self.to_router.send(env).await.is_err() {
            tracing::warn!(dialog = %self.dialog_id, "router mailbox closed, dropping synthesized event");
        }
    }

    /// First-time cleanup; returns false when another path already ran it.
    fn teardown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(kill) = self.kill_tx.lock().unwrap().take() {
            let _ = kill.send(());
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Ok(mut peer) = self.peer.try_lock() {
            *peer = None;
        }
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.socket_path.display(), "cannot remove socket: {e}");
            }
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().unwrap().remove(&self.dialog_id);
        }
        tracing::info!(dialog = %self.dialog_id, "worker session closed");
        true
    }

    fn touch_idle(&self) {
        *self.idle_deadline.lock().unwrap() = Instant::now() + self.cfg.worker_idle_timeout;
    }

    async fn accept_loop(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tracing::debug!(dialog = %self.dialog_id, "worker connected");
                    let (read_half, write_half) = stream.into_split();
                    // A reconnect replaces the previous peer.
                    *self.peer.lock().await = Some(write_half);
                    let session = self.clone();
                    let task = tokio::spawn(session.read_loop(read_half));
                    self.tasks.lock().unwrap().push(task);
                }
                Err(e) => {
                    tracing::debug!(dialog = %self.dialog_id, "accept loop ended: {e}");
                    return;
                }
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: tokio::net::unix::OwnedReadHalf) {
        loop {
            let mut header = [0u8; HEADER_LEN];
            // A clean EOF at a frame boundary is a plain disconnect; an
            // EOF inside a header or body is a short read and aborts the
            // session.
            match reader.read(&mut header).await {
                Ok(0) => {
                    tracing::debug!(dialog = %self.dialog_id, "worker disconnected");
                    return;
                }
                Ok(n) if n < HEADER_LEN => {
                    if let Err(e) = reader.read_exact(&mut header[n..]).await {
                        tracing::error!(dialog = %self.dialog_id, "short header read: {e}");
                        self.finish(EventType::HandlerDone).await;
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(dialog = %self.dialog_id, "worker read error: {e}");
                    return;
                }
            }

            let parsed = match FrameHeader::parse(&header) {
                Ok(h) => h,
                Err(e) => {
                    tracing::error!(dialog = %self.dialog_id, "corrupt frame header: {e}");
                    self.finish(EventType::HandlerDone).await;
                    return;
                }
            };

            let mut body = vec![0u8; parsed.body_len as usize];
            if let Err(e) = reader.read_exact(&mut body).await {
                tracing::error!(dialog = %self.dialog_id, "short body read: {e}");
                self.finish(EventType::HandlerDone).await;
                return;
            }

            self.touch_idle();

            let env = match Envelope::from_json_bytes(&body) {
                Ok(env) => env,
                Err(e) => {
                    tracing::error!(dialog = %self.dialog_id, "undecodable worker frame body: {e}");
                    continue;
                }
            };

            tracing::debug!(dialog = %self.dialog_id, event = ?env.event_type, "frame from worker");
            match env.event_type {
                EventType::Reply => {
                    if self.to_router.send(env).await.is_err() {
                        return;
                    }
                }
                EventType::HandlerDone | EventType::HandlerReject => {
                    let _ = self.to_router.send(env).await;
                    self.close();
                    return;
                }
                other => {
                    tracing::warn!(dialog = %self.dialog_id, ?other, "unexpected event from worker, forwarding");
                    let _ = self.to_router.send(env).await;
                }
            }
        }
    }

    async fn wait_process(self: Arc<Self>, mut child: Child, mut kill_rx: oneshot::Receiver<()>) {
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = &mut kill_rx => None,
        };
        match exited {
            Some(status) => {
                match status {
                    Ok(s) if s.success() => {
                        tracing::info!(dialog = %self.dialog_id, "worker exited gracefully");
                    }
                    Ok(s) => {
                        tracing::warn!(dialog = %self.dialog_id, ?s, "worker exited abnormally");
                    }
                    Err(e) => {
                        tracing::warn!(dialog = %self.dialog_id, "worker wait failed: {e}");
                    }
                }
                self.finish(EventType::HandlerDone).await;
            }
            None => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }

    async fn idle_loop(self: Arc<Self>) {
        loop {
            let deadline = *self.idle_deadline.lock().unwrap();
            tokio::time::sleep_until(deadline).await;
            if self.is_closed() {
                return;
            }
            let deadline = *self.idle_deadline.lock().unwrap();
            if Instant::now() >= deadline {
                tracing::info!(dialog = %self.dialog_id, "worker session idle timeout");
                self.finish(EventType::HandlerDone).await;
                return;
            }
        }
    }
}

/// Connect to a session socket the way a worker process would. Test and
/// tooling helper; production workers connect from their own process.
pub async fn connect_as_worker(path: &std::path::Path) -> std::io::Result<UnixStream> {
    UnixStream::connect(path).await
}
