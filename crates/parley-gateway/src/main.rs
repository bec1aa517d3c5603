use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;

use parley_core::clarify::HttpChatBackend;
use parley_core::intent::neural::NeuralIndex;
use parley_core::{
    build_router, Clarifier, ClarifierRoute, Coordinator, CoordinatorHandle, DialogRegistry,
    IntentMatcher, MemoryStore, RouterConfig, WorkerManager, WorkerRoute,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let defaults = RouterConfig::default();
    let config = RouterConfig {
        data_root: parse_path("PARLEY_DATA_ROOT", defaults.data_root),
        neural_root: parse_path("PARLEY_NEURAL_ROOT", defaults.neural_root),
        conv_root: parse_path("PARLEY_CONV_ROOT", defaults.conv_root),
        kv_root: parse_path("PARLEY_KV_ROOT", defaults.kv_root),
        worker_root: parse_path("PARLEY_WORKER_ROOT", defaults.worker_root),
        socket_dir: parse_path("PARLEY_SOCKET_DIR", defaults.socket_dir),
        worker_launcher: parse_string("PARLEY_WORKER_LAUNCHER", defaults.worker_launcher),
        worker_ext: parse_string("PARLEY_WORKER_EXT", defaults.worker_ext),
        http_bind: parse_socket("PARLEY_HTTP_BIND", defaults.http_bind),
        history_limit: parse_usize("PARLEY_HISTORY_LIMIT", defaults.history_limit),
        valid_min_score: parse_f64("PARLEY_MIN_SCORE", defaults.valid_min_score),
        command_first: parse_bool("PARLEY_COMMAND_FIRST", defaults.command_first),
        mailbox_capacity: defaults.mailbox_capacity,
        save_interval: parse_duration("PARLEY_SAVE_INTERVAL_SECS", defaults.save_interval),
        worker_idle_timeout: parse_duration("PARLEY_WORKER_IDLE_SECS", defaults.worker_idle_timeout),
        peer_wait_step: defaults.peer_wait_step,
        peer_wait_tries: defaults.peer_wait_tries,
        llm_url: parse_string("PARLEY_LLM_URL", defaults.llm_url),
        llm_model: parse_string("PARLEY_LLM_MODEL", defaults.llm_model),
        llm_api_key: env::var("PARLEY_LLM_API_KEY").ok(),
        llm_timeout: parse_duration("PARLEY_LLM_TIMEOUT_SECS", defaults.llm_timeout),
        llm_system_prompt: parse_string("PARLEY_LLM_SYSTEM_PROMPT", defaults.llm_system_prompt),
        conversation_limit: parse_usize("PARLEY_CONVERSATION_LIMIT", defaults.conversation_limit),
    };
    let config = Arc::new(config);

    if config.llm_url.is_empty() || config.llm_model.is_empty() {
        panic!("PARLEY_LLM_URL and PARLEY_LLM_MODEL must be set before starting the router");
    }
    for dir in [
        &config.data_root.join("user"),
        &config.neural_root,
        &config.conv_root,
        &config.kv_root,
        &config.socket_dir,
    ] {
        std::fs::create_dir_all(dir)
            .unwrap_or_else(|e| panic!("cannot create {}: {e}", dir.display()));
    }

    let (handle, mailboxes) = CoordinatorHandle::channels(config.mailbox_capacity);

    let dialogs = Arc::new(DialogRegistry::new(config.dialog_file()));
    dialogs.load();

    let matcher = Arc::new(IntentMatcher::new(
        config.intent_cache_file(),
        config.valid_min_score,
    ));
    matcher.cache().load();

    let neural = Arc::new(NeuralIndex::new(&config.neural_root));
    neural.discover(&matcher);

    let workers: Arc<WorkerManager> = Arc::new(
        WorkerManager::new(config.clone(), handle.worker_sender())
            .unwrap_or_else(|e| panic!("cannot create worker socket dir: {e}")),
    );
    tracing::info!(workers = ?workers.installed_workers(), "installed workers");

    let backend = Arc::new(HttpChatBackend::new(
        &config.llm_url,
        &config.llm_model,
        config.llm_api_key.clone(),
        config.llm_timeout,
    ));
    let clarifier = Clarifier::new(
        backend,
        handle.clarifier_sender(),
        &config.conv_root,
        &config.llm_system_prompt,
        config.conversation_limit,
    );

    let memory = Arc::new(MemoryStore::new(&config.kv_root));

    let (to_client_tx, mut to_client_rx) = mpsc::channel(config.mailbox_capacity);
    let coordinator = Coordinator::new(
        config.clone(),
        dialogs.clone(),
        matcher.clone(),
        workers.clone() as Arc<dyn WorkerRoute>,
        Arc::new(clarifier.clone()) as Arc<dyn ClarifierRoute>,
        to_client_tx,
    );
    tokio::spawn(coordinator.run(mailboxes));

    // The user-facing transport plugs in here: feed inbound text to
    // `handle.ingest_client_json` and drain this channel outbound. Until
    // one is attached, outbound traffic is logged.
    let _ingress = handle.clone();
    tokio::spawn(async move {
        while let Some(env) = to_client_rx.recv().await {
            match env.to_json() {
                Ok(text) => tracing::info!(dialog = %env.dialog_id, "to client: {text}"),
                Err(e) => tracing::error!("outbound envelope does not serialize: {e}"),
            }
        }
    });

    tokio::spawn(dialogs.clone().run_flush_loop(config.save_interval));
    tokio::spawn(memory.clone().run_flush_loop(config.save_interval));
    tokio::spawn(clarifier.clone().run_flush_loop(config.save_interval));
    {
        let matcher = matcher.clone();
        let interval = config.save_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                matcher.cache().flush();
            }
        });
    }

    let app = build_router(memory.clone(), neural, matcher.clone());
    let listener = TcpListener::bind(config.http_bind)
        .await
        .unwrap_or_else(|e| panic!("cannot bind {}: {e}", config.http_bind));
    tracing::info!(addr = %config.http_bind, "memory endpoint listening");

    tokio::select! {
        served = axum::serve(listener, app) => {
            served?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    // Final flush; partial state on disk stays valid because every
    // flush is an all-or-nothing write.
    handle.shutdown().await;
    workers.close_all();
    dialogs.flush().await;
    memory.flush().await;
    clarifier.flush().await;
    matcher.cache().flush();

    Ok(())
}

fn parse_path(key: &str, default: PathBuf) -> PathBuf {
    env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn parse_string(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn parse_socket(key: &str, default: SocketAddr) -> SocketAddr {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => default,
    }
}

fn parse_duration(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map(Duration::from_secs).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(v) => v.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_f64(key: &str, default: f64) -> f64 {
    match env::var(key) {
        Ok(v) => v.parse::<f64>().unwrap_or(default),
        Err(_) => default,
    }
}
