use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Router configuration.
///
/// Paths group into four roots: `data_root` (dialog map + intent cache
/// under `user/`), `neural_root` (on-disk classifiers), `conv_root`
/// (clarifier conversations) and `kv_root` (per-dialog tool memory).
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Root for dialog state and the intent cache.
    pub data_root: PathBuf,
    /// Root directory scanned for neural classifiers.
    pub neural_root: PathBuf,
    /// Root for persisted clarifier conversations.
    pub conv_root: PathBuf,
    /// Root for per-dialog tool-memory files.
    pub kv_root: PathBuf,
    /// Root holding one directory per installed worker.
    pub worker_root: PathBuf,
    /// Directory for per-dialog worker sockets.
    pub socket_dir: PathBuf,
    /// Command used to launch worker entry files (e.g. "node").
    pub worker_launcher: String,
    /// Worker entry-file extension (e.g. "js").
    pub worker_ext: String,
    /// Bind address for the tool-memory / registration HTTP surface.
    pub http_bind: SocketAddr,

    /// Max rendered turns kept per dialog history.
    pub history_limit: usize,
    /// Minimum classifier score counted as a match.
    pub valid_min_score: f64,
    /// A strong match steals the turn back from an active clarification.
    pub command_first: bool,
    /// Capacity of each coordinator ingress mailbox.
    pub mailbox_capacity: usize,

    /// Interval between diff-aware flushes of all persisters.
    pub save_interval: Duration,
    /// Close a worker session after this long without a frame.
    pub worker_idle_timeout: Duration,
    /// Poll step while waiting for a freshly spawned worker to connect.
    pub peer_wait_step: Duration,
    /// Number of poll steps before a send fails with peer-absent.
    pub peer_wait_tries: u32,

    /// OpenAI-compatible chat completions endpoint.
    pub llm_url: String,
    /// Model name sent with every clarifier request.
    pub llm_model: String,
    /// Optional bearer token for the LLM endpoint.
    pub llm_api_key: Option<String>,
    /// Per-call LLM timeout.
    pub llm_timeout: Duration,
    /// Extra system-prompt text prepended to the built-in clarifier prompt.
    pub llm_system_prompt: String,
    /// Sliding-window length of a clarifier conversation.
    pub conversation_limit: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            neural_root: PathBuf::from("data/intents"),
            conv_root: PathBuf::from("data/conversations"),
            kv_root: PathBuf::from("data/memory"),
            worker_root: PathBuf::from("workers"),
            socket_dir: std::env::temp_dir().join("program_sockets"),
            worker_launcher: "node".into(),
            worker_ext: "js".into(),
            http_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8083),

            history_limit: 20,
            valid_min_score: 0.9,
            command_first: false,
            mailbox_capacity: 1000,

            save_interval: Duration::from_secs(600),
            worker_idle_timeout: Duration::from_secs(2 * 60 * 60),
            peer_wait_step: Duration::from_millis(100),
            peer_wait_tries: 10,

            llm_url: String::new(),
            llm_model: String::new(),
            llm_api_key: None,
            llm_timeout: Duration::from_secs(30),
            llm_system_prompt: String::new(),
            conversation_limit: 30,
        }
    }
}

impl RouterConfig {
    /// Path of the persisted dialog map.
    pub fn dialog_file(&self) -> PathBuf {
        self.data_root.join("user").join("dialoginfo.json")
    }

    /// Path of the persisted intent cache.
    pub fn intent_cache_file(&self) -> PathBuf {
        self.data_root.join("user").join("intentMatchCache.json")
    }
}
