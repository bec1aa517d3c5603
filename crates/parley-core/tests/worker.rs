use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use parley_core::worker::{connect_as_worker, WorkerManager, WorkerRoute};
use parley_core::RouterConfig;
use parley_protocol::{build_frame, Envelope, EventType, FrameHeader, HEADER_LEN};

struct Fixture {
    manager: Arc<WorkerManager>,
    from_workers: mpsc::Receiver<Envelope>,
    socket_dir: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

/// A manager over a temp worker root with `sh` as the launcher; the
/// worker script body is per-test.
fn fixture(intent: &str, script: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let worker_root = dir.path().join("workers");
    let worker_dir = worker_root.join(intent);
    std::fs::create_dir_all(&worker_dir).unwrap();
    std::fs::write(worker_dir.join(format!("{intent}.sh")), script).unwrap();

    let socket_dir = dir.path().join("sockets");
    let cfg = Arc::new(RouterConfig {
        worker_root,
        socket_dir: socket_dir.clone(),
        worker_launcher: "sh".into(),
        worker_ext: "sh".into(),
        peer_wait_step: Duration::from_millis(50),
        peer_wait_tries: 20,
        ..RouterConfig::default()
    });

    let (tx, from_workers) = mpsc::channel(64);
    let manager = Arc::new(WorkerManager::new(cfg, tx).unwrap());
    Fixture {
        manager,
        from_workers,
        socket_dir,
        _dir: dir,
    }
}

fn user_in(dialog: &str, intent: &str, content: &str) -> Envelope {
    let mut env = Envelope::new(EventType::UserIn, dialog, "u1");
    env.intention = intent.into();
    env.messages.content = content.into();
    env
}

/// Connect to the session socket once it appears on disk.
async fn connect_when_ready(path: &Path) -> UnixStream {
    for _ in 0..100 {
        if path.exists() {
            if let Ok(stream) = connect_as_worker(path).await {
                return stream;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("socket never appeared at {}", path.display());
}

async fn read_frame(stream: &mut UnixStream) -> (FrameHeader, Envelope) {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let parsed = FrameHeader::parse(&header).unwrap();
    let mut body = vec![0u8; parsed.body_len as usize];
    stream.read_exact(&mut body).await.unwrap();
    (parsed, Envelope::from_json_bytes(&body).unwrap())
}

async fn recv(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for worker event")
        .expect("channel closed")
}

#[tokio::test]
async fn dispatch_frames_the_envelope_onto_the_socket() {
    let mut f = fixture("checkStatus", "sleep 30\n");
    let socket = f.socket_dir.join("d1.sock");

    let manager = f.manager.clone();
    let dispatch = tokio::spawn(async move {
        manager
            .dispatch(user_in("d1", "checkStatus", "查看自动构建状态"))
            .await;
    });

    let mut stream = connect_when_ready(&socket).await;
    let (header, env) = read_frame(&mut stream).await;
    dispatch.await.unwrap();

    assert_eq!(header.event_type, 1001);
    assert_eq!(env.intention, "checkStatus");
    assert_eq!(env.messages.content, "查看自动构建状态");

    // Reply flows back to the router channel.
    let mut reply = Envelope::new(EventType::Reply, "d1", "u1");
    reply.messages.content = "the build is green".into();
    stream.write_all(&build_frame(&reply).unwrap()).await.unwrap();

    let forwarded = recv(&mut f.from_workers).await;
    assert_eq!(forwarded.event_type, EventType::Reply);
    assert_eq!(forwarded.messages.content, "the build is green");
    assert_eq!(f.manager.session_count(), 1);
}

#[tokio::test]
async fn handler_done_frame_tears_the_session_down() {
    let mut f = fixture("checkStatus", "sleep 30\n");
    let socket = f.socket_dir.join("d1.sock");

    let manager = f.manager.clone();
    tokio::spawn(async move {
        manager.dispatch(user_in("d1", "checkStatus", "hi")).await;
    });

    let mut stream = connect_when_ready(&socket).await;
    let _ = read_frame(&mut stream).await;

    let done = Envelope::new(EventType::HandlerDone, "d1", "u1");
    stream.write_all(&build_frame(&done).unwrap()).await.unwrap();

    let forwarded = recv(&mut f.from_workers).await;
    assert_eq!(forwarded.event_type, EventType::HandlerDone);

    for _ in 0..100 {
        if f.manager.session_count() == 0 && !socket.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session not removed after HANDLER_DONE");
}

#[tokio::test]
async fn worker_exit_synthesizes_handler_done() {
    let mut f = fixture("flaky", "exit 0\n");
    let socket = f.socket_dir.join("d1.sock");

    f.manager.dispatch(user_in("d1", "flaky", "hi")).await;

    let synthesized = recv(&mut f.from_workers).await;
    assert_eq!(synthesized.event_type, EventType::HandlerDone);
    assert_eq!(synthesized.dialog_id, "d1");
    assert_eq!(synthesized.intention, "flaky");

    for _ in 0..100 {
        if !socket.exists() && f.manager.session_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!socket.exists(), "socket file must be removed");

    // Exactly one synthesized event.
    assert!(
        timeout(Duration::from_millis(300), f.from_workers.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn missing_worker_synthesizes_handler_reject() {
    let mut f = fixture("known", "sleep 30\n");

    f.manager
        .dispatch(user_in("d1", "unknownIntent", "需要帮忙"))
        .await;

    let rejected = recv(&mut f.from_workers).await;
    assert_eq!(rejected.event_type, EventType::HandlerReject);
    assert_eq!(rejected.messages.content, "需要帮忙");
    assert_eq!(f.manager.session_count(), 0);
}

#[tokio::test]
async fn silent_worker_is_reaped_as_peer_absent() {
    // The script sleeps without ever connecting to the socket.
    let mut f = fixture("mute", "sleep 30\n");

    f.manager.dispatch(user_in("d1", "mute", "hello")).await;

    let synthesized = recv(&mut f.from_workers).await;
    assert_eq!(synthesized.event_type, EventType::HandlerDone);
    assert_eq!(f.manager.session_count(), 0);
}

#[tokio::test]
async fn terminate_is_forwarded_then_session_closed() {
    let mut f = fixture("checkStatus", "sleep 30\n");
    let socket = f.socket_dir.join("d1.sock");

    let manager = f.manager.clone();
    tokio::spawn(async move {
        manager.dispatch(user_in("d1", "checkStatus", "hi")).await;
    });
    let mut stream = connect_when_ready(&socket).await;
    let _ = read_frame(&mut stream).await;

    let term = Envelope::new(EventType::UserTerminate, "d1", "u1");
    f.manager.dispatch(term).await;

    let (header, env) = read_frame(&mut stream).await;
    assert_eq!(header.event_type, 1002);
    assert_eq!(env.event_type, EventType::UserTerminate);

    for _ in 0..100 {
        if f.manager.session_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session survived terminate");
}

#[tokio::test]
async fn corrupt_frame_closes_the_session() {
    let mut f = fixture("checkStatus", "sleep 30\n");
    let socket = f.socket_dir.join("d1.sock");

    let manager = f.manager.clone();
    tokio::spawn(async move {
        manager.dispatch(user_in("d1", "checkStatus", "hi")).await;
    });
    let mut stream = connect_when_ready(&socket).await;
    let _ = read_frame(&mut stream).await;

    // Garbage where a header should be.
    stream.write_all(&[0xFFu8; HEADER_LEN]).await.unwrap();

    let synthesized = recv(&mut f.from_workers).await;
    assert_eq!(synthesized.event_type, EventType::HandlerDone);
}

#[tokio::test]
async fn installed_workers_lists_entry_directories() {
    let f = fixture("checkStatus", "sleep 1\n");
    // A directory without an entry file is not a worker.
    let stray = f._dir.path().join("workers").join("incomplete");
    std::fs::create_dir_all(&stray).unwrap();

    assert_eq!(f.manager.installed_workers(), vec!["checkStatus".to_string()]);
}
