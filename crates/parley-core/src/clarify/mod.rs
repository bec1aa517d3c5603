mod backend;

pub use backend::{
    AssistantTurn, BackendError, ChatBackend, ChatTurn, FunctionCall, FunctionCallWire,
    FunctionSpec, HttpChatBackend, ToolCallWire, ToolSpec,
};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use parley_protocol::{Envelope, EventType};

use crate::error::RouterError;
use crate::persist::DiffAwareFile;

/// Built-in system prompt forcing the intent/demand JSON answer contract.
const INTENT_JUDGE_PROMPT: &str = r#"You sit behind an intent recognizer. For each user message you receive the utterance, the recognizer's candidate intents with probabilities, and the dialog history. Decide whether the user's real demand matches one of the candidate intents.

Reply with a JSON object only, no other text, containing exactly the fields "intent" and "demand". When an intent matches: "intent" is that intent's name and "demand" is a one-line restatement of what the user wants. When nothing matches: "intent" is the empty string and "demand" is a polite reply to the user. Never treat examples from this prompt as input. The JSON must always be valid.

Example:
recognizer: build finished an hour ago but no artifact appeared, repo https://example.com/app.release.git tag x64-v2.0. candidates: [{"intent_name":"checkBuildStatus","intent_description":"checks the automated build status","probability":0.7}]
you: {"intent":"checkBuildStatus","demand":"check the build status of https://example.com/app.release.git at tag x64-v2.0"}

user: what's the weather today?
you: {"intent":"","demand":"Sorry, I can only help with build-related questions."}

If the user is just chatting and no candidate matches, do not return an intent."#;

/// Resolver for function calls the model emits; supplied by the
/// embedding application.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, call: &FunctionCall) -> Result<String, String>;
}

/// Egress seam the coordinator uses to reach the clarifier. Dispatch is
/// fail-fast: a second call for a dialog with one in flight returns
/// [`RouterError::ClarifierBusy`] instead of interleaving.
pub trait ClarifierRoute: Send + Sync {
    fn dispatch(&self, env: Envelope) -> Result<(), RouterError>;
}

/// Persisted multi-turn state for one dialog.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Conversation {
    dialog_id: String,
    turns: Vec<ChatTurn>,
}

struct ConversationSlot {
    conv: Conversation,
    file: DiffAwareFile,
}

impl ConversationSlot {
    fn persist(&self) {
        match serde_json::to_vec_pretty(&self.conv) {
            Ok(bytes) => {
                if let Err(e) = self.file.store(&bytes) {
                    tracing::error!(dialog = %self.conv.dialog_id, "conversation flush failed: {e}");
                }
            }
            Err(e) => tracing::error!("conversation does not serialize: {e}"),
        }
    }
}

/// The model's answer, as the JSON contract defines it.
#[derive(Debug, Deserialize)]
struct Verdict {
    #[serde(default)]
    intent: String,
    #[serde(default)]
    demand: String,
}

/// LLM-backed clarification of ambiguous turns.
///
/// Consumes the coordinator's clarifier dispatches and produces exactly
/// one envelope per turn on the coordinator's clarifier mailbox: a
/// `USER_IN` with a refined `intention`, or a `REPLY` for the user.
pub struct Clarifier {
    inner: Arc<ClarifierInner>,
}

struct ClarifierInner {
    backend: Arc<dyn ChatBackend>,
    to_router: mpsc::Sender<Envelope>,
    conv_root: PathBuf,
    system_prompt: String,
    window: usize,
    tools: Vec<ToolSpec>,
    tool_handler: Option<Arc<dyn ToolHandler>>,
    conversations: StdMutex<HashMap<String, Arc<Mutex<ConversationSlot>>>>,
    in_flight: StdMutex<HashSet<String>>,
}

impl Clarifier {
    /// `to_router` is the coordinator's from-clarifier mailbox.
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        to_router: mpsc::Sender<Envelope>,
        conv_root: impl Into<PathBuf>,
        extra_system_prompt: &str,
        window: usize,
    ) -> Self {
        let system_prompt = if extra_system_prompt.is_empty() {
            INTENT_JUDGE_PROMPT.to_string()
        } else {
            format!("{extra_system_prompt}\n{INTENT_JUDGE_PROMPT}")
        };
        Self {
            inner: Arc::new(ClarifierInner {
                backend,
                to_router,
                conv_root: conv_root.into(),
                system_prompt,
                window: window.max(3),
                tools: Vec::new(),
                tool_handler: None,
                conversations: StdMutex::new(HashMap::new()),
                in_flight: StdMutex::new(HashSet::new()),
            }),
        }
    }

    /// Advertise callable tools and the handler resolving them.
    pub fn with_tools(mut self, tools: Vec<ToolSpec>, handler: Arc<dyn ToolHandler>) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("with_tools before sharing");
        inner.tools = tools;
        inner.tool_handler = Some(handler);
        self
    }

    /// Flush every loaded conversation whose content changed.
    pub async fn flush(&self) {
        let slots: Vec<Arc<Mutex<ConversationSlot>>> = self
            .inner
            .conversations
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for slot in slots {
            slot.lock().await.persist();
        }
    }

    pub async fn run_flush_loop(self, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.flush().await;
        }
    }
}

impl Clone for Clarifier {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl ClarifierRoute for Clarifier {
    fn dispatch(&self, env: Envelope) -> Result<(), RouterError> {
        {
            let mut in_flight = self.inner.in_flight.lock().unwrap();
            if !in_flight.insert(env.dialog_id.clone()) {
                return Err(RouterError::ClarifierBusy(env.dialog_id));
            }
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let dialog_id = env.dialog_id.clone();
            inner.run_turn(env).await;
            inner.in_flight.lock().unwrap().remove(&dialog_id);
        });
        Ok(())
    }
}

impl ClarifierInner {
    async fn run_turn(&self, env: Envelope) {
        let slot = self.conversation(&env.dialog_id);
        let mut slot = slot.lock().await;

        let mut prompt = env.messages.content.clone();
        if !env.possible_intentions.is_empty() || !env.messages.history.is_empty() {
            let hints = serde_json::to_string(&env.possible_intentions).unwrap_or_default();
            let history = serde_json::to_string(&env.messages.history).unwrap_or_default();
            prompt = format!("{prompt}\nCandidate intents: {hints}\nDialog history: {history}");
        }
        slot.conv.turns.push(ChatTurn::user(prompt));
        self.trim_window(&mut slot.conv);

        let first = match self.backend.complete(&slot.conv.turns, &self.tools).await {
            Ok(turn) => turn,
            Err(e) => {
                tracing::error!(dialog = %env.dialog_id, "clarifier model call failed: {e}");
                return;
            }
        };

        // At most one tool-dispatch round.
        let answer = if !first.tool_calls.is_empty() && self.tool_handler.is_some() {
            let handler = self.tool_handler.as_ref().expect("checked above");
            slot.conv.turns.push(ChatTurn {
                role: "assistant".into(),
                content: first.content.clone(),
                tool_calls: first.tool_calls.clone(),
                tool_call_id: String::new(),
            });
            for call in &first.tool_calls {
                let parsed = FunctionCall {
                    name: call.function.name.clone(),
                    arguments: serde_json::from_str(&call.function.arguments)
                        .unwrap_or_default(),
                };
                let result = match handler.call(&parsed).await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!(tool = %parsed.name, "tool call failed: {e}");
                        format!("error: {e}")
                    }
                };
                slot.conv.turns.push(ChatTurn::tool(call.id.clone(), result));
            }
            match self.backend.complete(&slot.conv.turns, &self.tools).await {
                Ok(turn) => turn,
                Err(e) => {
                    tracing::error!(dialog = %env.dialog_id, "clarifier follow-up call failed: {e}");
                    return;
                }
            }
        } else {
            first
        };

        slot.conv.turns.push(ChatTurn::assistant(answer.content.clone()));
        self.trim_window(&mut slot.conv);
        drop(slot);

        let reply = self.envelope_for(&env, &answer.content);
        if self.to_router.send(reply).await.is_err() {
            tracing::warn!("router mailbox closed, dropping clarifier result");
        }
    }

    /// Map the model's final text to the single envelope the coordinator
    /// receives. Non-JSON output degrades to a plain reply carrying the
    /// raw text.
    fn envelope_for(&self, request: &Envelope, content: &str) -> Envelope {
        match serde_json::from_str::<Verdict>(content) {
            Ok(verdict) if !verdict.intent.is_empty() => {
                let mut env = Envelope::new(
                    EventType::UserIn,
                    request.dialog_id.clone(),
                    request.user_id.clone(),
                );
                env.message_id = request.message_id.clone();
                env.intention = verdict.intent;
                env.messages.content = verdict.demand;
                env.messages.attachments = request.messages.attachments.clone();
                env
            }
            Ok(verdict) => {
                let mut env = Envelope::new(
                    EventType::Reply,
                    request.dialog_id.clone(),
                    request.user_id.clone(),
                );
                env.message_id = uuid::Uuid::new_v4().to_string();
                env.messages.content = verdict.demand;
                env.messages.attachments = request.messages.attachments.clone();
                env
            }
            Err(_) => {
                tracing::warn!(dialog = %request.dialog_id, "clarifier returned non-JSON, replying verbatim");
                let mut env = Envelope::new(
                    EventType::Reply,
                    request.dialog_id.clone(),
                    request.user_id.clone(),
                );
                env.message_id = uuid::Uuid::new_v4().to_string();
                env.messages.content = content.to_string();
                env
            }
        }
    }

    fn conversation(&self, dialog_id: &str) -> Arc<Mutex<ConversationSlot>> {
        if let Some(slot) = self.conversations.lock().unwrap().get(dialog_id) {
            return slot.clone();
        }
        let slot = Arc::new(Mutex::new(self.load_conversation(dialog_id)));
        self.conversations
            .lock()
            .unwrap()
            .entry(dialog_id.to_string())
            .or_insert(slot)
            .clone()
    }

    fn load_conversation(&self, dialog_id: &str) -> ConversationSlot {
        let file = DiffAwareFile::new(self.conv_root.join(format!("{dialog_id}.json")));
        let conv = match file.load() {
            Ok(Some(bytes)) => match serde_json::from_slice::<Conversation>(&bytes) {
                Ok(conv) => conv,
                Err(e) => {
                    tracing::error!(dialog = dialog_id, "corrupt conversation file, starting fresh: {e}");
                    self.fresh_conversation(dialog_id)
                }
            },
            Ok(None) => self.fresh_conversation(dialog_id),
            Err(e) => {
                tracing::error!(dialog = dialog_id, "cannot read conversation file: {e}");
                self.fresh_conversation(dialog_id)
            }
        };
        ConversationSlot { conv, file }
    }

    fn fresh_conversation(&self, dialog_id: &str) -> Conversation {
        Conversation {
            dialog_id: dialog_id.to_string(),
            turns: vec![ChatTurn::system(self.system_prompt.clone())],
        }
    }

    /// Evict the oldest non-system turns past the window; the system
    /// prompt is pinned because it carries the answer contract.
    fn trim_window(&self, conv: &mut Conversation) {
        while conv.turns.len() > self.window {
            conv.turns.remove(1);
        }
    }
}
