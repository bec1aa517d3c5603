use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;

use parley_protocol::{Envelope, EventType};

use crate::clarify::ClarifierRoute;
use crate::config::RouterConfig;
use crate::dialog::{DialogRegistry, DialogState};
use crate::error::RouterError;
use crate::intent::IntentMatcher;
use crate::worker::WorkerRoute;

/// Reply sent to the user when a turn arrives while the clarifier is
/// still working on the previous one.
const STILL_THINKING: &str = "I'm still thinking about your last message, one moment please.";

/// Control messages for the coordinator itself.
#[derive(Debug)]
pub enum Control {
    /// Stop draining the ingress mailboxes.
    Shutdown,
}

/// Receiving ends of the coordinator's ingress mailboxes.
pub struct Mailboxes {
    client_rx: mpsc::Receiver<Envelope>,
    worker_rx: mpsc::Receiver<Envelope>,
    clarifier_rx: mpsc::Receiver<Envelope>,
    control_rx: mpsc::Receiver<Control>,
}

/// Cloneable sending side of the ingress mailboxes.
///
/// The client transport feeds [`ingest_client`](Self::ingest_client);
/// the worker manager and clarifier are wired with
/// [`worker_sender`](Self::worker_sender) /
/// [`clarifier_sender`](Self::clarifier_sender) at construction. All
/// queues are bounded; a full queue blocks the sender.
#[derive(Clone)]
pub struct CoordinatorHandle {
    client_tx: mpsc::Sender<Envelope>,
    worker_tx: mpsc::Sender<Envelope>,
    clarifier_tx: mpsc::Sender<Envelope>,
    control_tx: mpsc::Sender<Control>,
}

impl CoordinatorHandle {
    pub fn channels(capacity: usize) -> (Self, Mailboxes) {
        let (client_tx, client_rx) = mpsc::channel(capacity);
        let (worker_tx, worker_rx) = mpsc::channel(capacity);
        let (clarifier_tx, clarifier_rx) = mpsc::channel(capacity);
        let (control_tx, control_rx) = mpsc::channel(capacity);
        (
            Self {
                client_tx,
                worker_tx,
                clarifier_tx,
                control_tx,
            },
            Mailboxes {
                client_rx,
                worker_rx,
                clarifier_rx,
                control_rx,
            },
        )
    }

    /// Ask the coordinator to stop draining its mailboxes.
    pub async fn shutdown(&self) {
        let _ = self.control_tx.send(Control::Shutdown).await;
    }

    /// Enqueue a typed envelope from the client transport.
    pub async fn ingest_client(&self, env: Envelope) {
        if self.client_tx.send(env).await.is_err() {
            tracing::warn!("coordinator stopped, dropping client message");
        }
    }

    /// Decode a JSON text blob defensively, then enqueue. Undecodable
    /// input is logged and dropped; the sender is not notified.
    pub async fn ingest_client_json(&self, text: &str) {
        match Envelope::from_json_str(text) {
            Ok(env) => self.ingest_client(env).await,
            Err(e) => tracing::error!("invalid client envelope: {e}"),
        }
    }

    pub fn worker_sender(&self) -> mpsc::Sender<Envelope> {
        self.worker_tx.clone()
    }

    pub fn clarifier_sender(&self) -> mpsc::Sender<Envelope> {
        self.clarifier_tx.clone()
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Client,
    Worker,
    Clarifier,
}

/// Per-dialog routing state machine.
///
/// Every inbound message is forwarded to a per-dialog actor task, so
/// messages for one `dialog_id` are handled in arrival order while
/// distinct dialogs proceed in parallel. Each handling step holds the
/// dialog's exclusive lock for the whole routing decision.
pub struct Coordinator {
    cfg: Arc<RouterConfig>,
    dialogs: Arc<DialogRegistry>,
    matcher: Arc<IntentMatcher>,
    workers: Arc<dyn WorkerRoute>,
    clarifier: Arc<dyn ClarifierRoute>,
    to_client: mpsc::Sender<Envelope>,
    actors: StdMutex<HashMap<String, mpsc::UnboundedSender<(Source, Envelope)>>>,
}

impl Coordinator {
    pub fn new(
        cfg: Arc<RouterConfig>,
        dialogs: Arc<DialogRegistry>,
        matcher: Arc<IntentMatcher>,
        workers: Arc<dyn WorkerRoute>,
        clarifier: Arc<dyn ClarifierRoute>,
        to_client: mpsc::Sender<Envelope>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            dialogs,
            matcher,
            workers,
            clarifier,
            to_client,
            actors: StdMutex::new(HashMap::new()),
        })
    }

    /// Drain the ingress mailboxes until every sender is gone.
    pub async fn run(self: Arc<Self>, mut mailboxes: Mailboxes) {
        loop {
            tokio::select! {
                message = mailboxes.client_rx.recv() => match message {
                    Some(env) => self.enqueue(Source::Client, env),
                    None => break,
                },
                message = mailboxes.worker_rx.recv() => match message {
                    Some(env) => self.enqueue(Source::Worker, env),
                    None => break,
                },
                message = mailboxes.clarifier_rx.recv() => match message {
                    Some(env) => self.enqueue(Source::Clarifier, env),
                    None => break,
                },
                message = mailboxes.control_rx.recv() => match message {
                    Some(Control::Shutdown) | None => break,
                },
            }
        }
        tracing::info!("coordinator stopped");
    }

    fn enqueue(self: &Arc<Self>, source: Source, env: Envelope) {
        if env.dialog_id.is_empty() {
            tracing::error!(?source, "envelope without dialog_id dropped");
            return;
        }
        // Only client traffic may create dialog state.
        if !matches!(source, Source::Client) && self.dialogs.get(&env.dialog_id).is_none() {
            tracing::warn!(
                dialog = %env.dialog_id,
                "{}",
                RouterError::DialogNotFound(env.dialog_id.clone())
            );
            return;
        }

        let sender = {
            let mut actors = self.actors.lock().unwrap();
            actors
                .entry(env.dialog_id.clone())
                .or_insert_with(|| self.spawn_actor())
                .clone()
        };
        if sender.send((source, env)).is_err() {
            tracing::error!("dialog actor gone, dropping message");
        }
    }

    fn spawn_actor(self: &Arc<Self>) -> mpsc::UnboundedSender<(Source, Envelope)> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some((source, env)) = rx.recv().await {
                match source {
                    Source::Client => coordinator.on_client(env).await,
                    Source::Worker => coordinator.on_worker(env).await,
                    Source::Clarifier => coordinator.on_clarifier(env).await,
                }
            }
        });
        tx
    }

    async fn on_client(&self, env: Envelope) {
        match env.event_type {
            EventType::UserIn => {
                tracing::info!(dialog = %env.dialog_id, "user: {}", env.messages.content);
                let state = self.dialogs.get_or_create(&env.dialog_id, &env.user_id);
                let mut state = state.lock().await;
                state.rejects_this_turn = 0;
                self.route_user_turn(&mut state, env).await;
            }
            EventType::UserTerminate => {
                let Some(state) = self.dialogs.get(&env.dialog_id) else {
                    return;
                };
                let mut state = state.lock().await;
                if state.bound_handler.is_empty() {
                    return;
                }
                tracing::info!(dialog = %env.dialog_id, handler = %state.bound_handler, "terminate");
                self.workers.dispatch(env).await;
                state.bound_handler.clear();
            }
            other => {
                tracing::warn!(dialog = %env.dialog_id, "{}", RouterError::UnknownEvent(other.into()));
            }
        }
    }

    /// The routing decision for a user-shaped turn: the sticky handler
    /// first, then the matcher, then the clarifier. Also the re-entry
    /// point for handler rejections and clarifier-refined turns.
    async fn route_user_turn(&self, state: &mut DialogState, mut env: Envelope) {
        let content = env.messages.content.clone();
        state.push_history(format!("User: {content}"), self.cfg.history_limit);

        // The clarifier concluded an intent on the dialog's behalf.
        if !env.intention.is_empty() && state.bound_handler.is_empty() {
            tracing::info!(dialog = %env.dialog_id, intent = %env.intention, "clarifier resolved intent");
            state.bound_handler = env.intention.clone();
            state.in_clarification = false;
            if state.first_clarification_turn {
                self.matcher.cache_content_intent(&content, &env.intention);
            }
            state.first_clarification_turn = false;
            self.workers.dispatch(env).await;
            return;
        }

        // Sticky handler owns the turn; no matcher run.
        if !state.bound_handler.is_empty() {
            tracing::debug!(dialog = %env.dialog_id, handler = %state.bound_handler, "sticky dispatch");
            state.first_clarification_turn = false;
            env.intention = state.bound_handler.clone();
            self.workers.dispatch(env).await;
            return;
        }

        let (best, candidates) = self
            .matcher
            .find_best(&content, &env.messages.attachments, !state.in_clarification)
            .await;

        let clarify = if state.in_clarification {
            // Stay in clarification unless a strong match may steal the turn.
            best.is_empty() || !self.cfg.command_first
        } else {
            best.is_empty()
        };

        if clarify {
            tracing::debug!(dialog = %env.dialog_id, "turn goes to the clarifier");
            state.first_clarification_turn = !state.in_clarification;
            state.in_clarification = true;
            env.possible_intentions = candidates;
            env.messages.history = state.chat_history.clone();
            match self.clarifier.dispatch(env) {
                Ok(()) => {}
                Err(RouterError::ClarifierBusy(dialog_id)) => {
                    tracing::warn!(dialog = %dialog_id, "clarifier busy");
                    let mut reply =
                        Envelope::new(EventType::Reply, dialog_id, state.user_id.clone());
                    reply.message_id = uuid::Uuid::new_v4().to_string();
                    reply.messages.content = STILL_THINKING.into();
                    self.forward_to_client(reply).await;
                }
                Err(e) => tracing::error!("clarifier dispatch failed: {e}"),
            }
        } else {
            tracing::info!(dialog = %env.dialog_id, intent = %best, "matched handler");
            state.bound_handler = best.clone();
            state.in_clarification = false;
            state.first_clarification_turn = false;
            env.intention = best;
            self.workers.dispatch(env).await;
        }
    }

    async fn on_worker(&self, env: Envelope) {
        let Some(state) = self.dialogs.get(&env.dialog_id) else {
            tracing::warn!("{}", RouterError::DialogNotFound(env.dialog_id));
            return;
        };
        let mut state = state.lock().await;

        match env.event_type {
            EventType::Reply => {
                tracing::info!(dialog = %env.dialog_id, "worker reply: {}", env.messages.content);
                state.append_history(
                    format!("Program: {}", env.messages.content),
                    self.cfg.history_limit,
                );
                self.forward_to_client(env).await;
            }
            EventType::HandlerDone => {
                state.bound_handler.clear();
                let dialog_id = env.dialog_id.clone();
                self.forward_to_client(env).await;
                let workers = self.workers.clone();
                tokio::spawn(async move {
                    workers.close_session(&dialog_id).await;
                });
            }
            EventType::HandlerReject => {
                state.bound_handler.clear();
                if state.rejects_this_turn >= 1 {
                    tracing::warn!(dialog = %env.dialog_id, "reject budget exhausted, dropping turn");
                    return;
                }
                state.rejects_this_turn += 1;
                tracing::info!(dialog = %env.dialog_id, "handler rejected, re-routing");
                let mut env = env;
                env.event_type = EventType::UserIn;
                env.intention.clear();
                self.route_user_turn(&mut state, env).await;
            }
            other => {
                tracing::warn!(dialog = %env.dialog_id, "{}", RouterError::UnknownEvent(other.into()));
            }
        }
    }

    async fn on_clarifier(&self, env: Envelope) {
        let Some(state) = self.dialogs.get(&env.dialog_id) else {
            tracing::warn!("{}", RouterError::DialogNotFound(env.dialog_id));
            return;
        };
        let mut state = state.lock().await;

        match env.event_type {
            EventType::UserIn => {
                state.in_clarification = false;
                self.route_user_turn(&mut state, env).await;
            }
            EventType::Reply => {
                tracing::info!(dialog = %env.dialog_id, "clarifier reply: {}", env.messages.content);
                state.append_history(
                    format!("Chat: {}", env.messages.content),
                    self.cfg.history_limit,
                );
                self.forward_to_client(env).await;
            }
            other => {
                tracing::warn!(dialog = %env.dialog_id, "{}", RouterError::UnknownEvent(other.into()));
            }
        }
    }

    async fn forward_to_client(&self, env: Envelope) {
        if self.to_client.send(env).await.is_err() {
            tracing::warn!("client channel closed, dropping outbound message");
        }
    }
}
