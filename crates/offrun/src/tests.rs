//! Tests for the channel and lane plumbing against scripted workers.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::args::CallArgs;
use crate::context::ContextState;
use crate::error::DispatchError;
use crate::error::Error;
use crate::frame::Command;
use crate::frame::Fault;
use crate::frame::Inbound;
use crate::frame::Payload;
use crate::frame::Reply;
use crate::frame::Request;
use crate::frame::Response;
use crate::handles::LaneId;
use crate::process::Process;
use crate::request::Outcome;
use crate::transport;
use crate::transport::Launcher;
use crate::transport::Transport;
use crate::transport::WorkerConfig;

/// What a scripted worker does with one request.
enum Answer {
    Reply(Response),
    /// Never answer.
    Silent,
    /// Drop the connection.
    Hangup,
}

type Script = dyn Fn(&Request) -> Answer + Send + Sync;

/// Transport whose worker side is a plain function of the request.
struct ScriptedTransport {
    script: Arc<Script>,
    sent: Arc<Mutex<Vec<Command>>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: Request) -> transport::Result<()> {
        self.sent.lock().unwrap().push(request.command.clone());

        let mut tx = self.tx.lock().unwrap();
        match (self.script)(&request) {
            Answer::Reply(status) => {
                if let Some(tx) = tx.as_ref() {
                    let _ = tx.send(Inbound::Reply(Reply { seq: request.seq, status }));
                }
            }
            Answer::Silent => {}
            Answer::Hangup => {
                tx.take();
            }
        }
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Inbound>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}

struct ScriptedLauncher {
    script: Arc<Script>,
    sent: Arc<Mutex<Vec<Command>>>,
}

impl ScriptedLauncher {
    fn new(script: impl Fn(&Request) -> Answer + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn sent(&self) -> Vec<Command> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(&self, _config: &WorkerConfig) -> transport::Result<Box<dyn Transport>> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(ScriptedTransport {
            script: self.script.clone(),
            sent: self.sent.clone(),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }))
    }
}

fn config() -> WorkerConfig {
    WorkerConfig::new("/tmp/os0.sock", "/dev/veslot0", "/opt/worker")
}

/// Handshakes, then hands every other request to `rest`.
fn worker(rest: impl Fn(&Request) -> Answer + Send + Sync + 'static) -> ScriptedLauncher {
    ScriptedLauncher::new(move |request| match request.command {
        Command::Hello => Answer::Reply(Ok(Payload::Lane(LaneId(1)))),
        Command::Exit | Command::CloseLane => Answer::Reply(Ok(Payload::Unit)),
        _ => rest(request),
    })
}

#[tokio::test]
async fn test_handshake_with_wrong_payload_fails_creation() {
    let launcher = ScriptedLauncher::new(|_| Answer::Reply(Ok(Payload::Unit)));

    match Process::create(&launcher, &config()).await {
        Err(Error::ProcessCreation { code, .. }) => assert_eq!(code, libc::EPROTO),
        Err(e) => panic!("expected ProcessCreation, got {}", e),
        Ok(_) => panic!("expected ProcessCreation, got a process"),
    }
}

#[tokio::test]
async fn test_handshake_fault_is_reported() {
    let launcher = ScriptedLauncher::new(|_| Answer::Reply(Err(Fault::new(libc::EACCES, "device busy"))));

    match Process::create(&launcher, &config()).await {
        Err(Error::ProcessCreation { code, reason }) => {
            assert_eq!(code, libc::EACCES);
            assert!(reason.contains("device busy"));
        }
        Err(e) => panic!("expected ProcessCreation, got {}", e),
        Ok(_) => panic!("expected ProcessCreation, got a process"),
    }
}

#[tokio::test]
async fn test_call_reply_reaches_the_right_request() {
    let launcher = worker(|request| match &request.command {
        Command::Call { addr, .. } => Answer::Reply(Ok(Payload::Completed(Outcome::Ready(*addr * 2)))),
        _ => Answer::Reply(Err(Fault::new(libc::ENOSYS, "unexpected"))),
    });
    let process = Process::create(&launcher, &config()).await.unwrap();
    let ctx = process.main_context();

    let args = CallArgs::new();
    let a = ctx.call_async(0x100, &args).unwrap();
    let b = ctx.call_async(0x200, &args).unwrap();

    assert_eq!(ctx.wait_result(b).await.unwrap(), Outcome::Ready(0x400));
    assert_eq!(ctx.wait_result(a).await.unwrap(), Outcome::Ready(0x200));
}

#[tokio::test]
async fn test_malformed_call_reply_is_an_error_outcome() {
    let launcher = worker(|_| Answer::Reply(Ok(Payload::Bytes(vec![1, 2, 3]))));
    let process = Process::create(&launcher, &config()).await.unwrap();
    let ctx = process.main_context();

    let id = ctx.call_async(0x100, &CallArgs::new()).unwrap();
    assert_eq!(ctx.wait_result(id).await.unwrap(), Outcome::Error);
    assert_eq!(ctx.state(), ContextState::Running);
}

#[tokio::test]
async fn test_worker_fault_on_call_is_an_error_outcome() {
    let launcher = worker(|_| Answer::Reply(Err(Fault::new(libc::EFAULT, "bad call"))));
    let process = Process::create(&launcher, &config()).await.unwrap();
    let ctx = process.main_context();

    let id = ctx.call_async(0x100, &CallArgs::new()).unwrap();
    assert_eq!(ctx.wait_result(id).await.unwrap(), Outcome::Error);
}

#[tokio::test]
async fn test_hangup_mid_call_exits_the_lane() {
    let launcher = worker(|request| match request.command {
        Command::Call { .. } => Answer::Hangup,
        _ => Answer::Silent,
    });
    let process = Process::create(&launcher, &config()).await.unwrap();
    let ctx = process.main_context();

    let id = ctx.call_async(0x100, &CallArgs::new()).unwrap();
    match ctx.wait_result(id).await {
        Err(Error::InvalidRequest(got)) => assert_eq!(got, id),
        other => panic!("expected InvalidRequest, got {:?}", other),
    }
    assert_eq!(ctx.state(), ContextState::Exited);

    match ctx.call_async(0x100, &CallArgs::new()) {
        Err(Error::Dispatch(DispatchError::Exited)) => {}
        other => panic!("expected Dispatch(Exited), got {:?}", other),
    }
    assert!(process.allocate(64).await.is_err());
}

#[tokio::test]
async fn test_hangup_exits_idle_contexts_too() {
    let launcher = worker(|request| match request.command {
        Command::OpenLane => Answer::Reply(Ok(Payload::Lane(LaneId(2)))),
        Command::Call { .. } => Answer::Hangup,
        _ => Answer::Silent,
    });
    let process = Process::create(&launcher, &config()).await.unwrap();
    let main = process.main_context();
    let idle = process.open_context().await.unwrap();

    let id = main.call_async(0x100, &CallArgs::new()).unwrap();
    assert!(matches!(main.wait_result(id).await, Err(Error::InvalidRequest(_))));
    assert!(!process.is_alive());

    let settled = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while idle.state() != ContextState::Exited {
            tokio::task::yield_now().await;
        }
    })
    .await;
    assert!(settled.is_ok(), "idle context still {:?}", idle.state());

    match idle.call_async(0x100, &CallArgs::new()) {
        Err(Error::Dispatch(DispatchError::Exited)) => {}
        other => panic!("expected Dispatch(Exited), got {:?}", other),
    }
    assert!(matches!(process.open_context().await, Err(Error::ProcessNotAvailable)));
    assert!(matches!(process.load_library("/lib/x.so").await, Err(Error::ProcessNotAvailable)));

    process.terminate().await.unwrap();
}

#[tokio::test]
async fn test_peek_never_blocks_on_a_silent_worker() {
    let launcher = worker(|_| Answer::Silent);
    let process = Process::create(&launcher, &config()).await.unwrap();
    let ctx = process.main_context();

    let id = ctx.call_async(0x100, &CallArgs::new()).unwrap();
    for _ in 0..10 {
        assert_eq!(ctx.peek_result(id).unwrap(), None);
        tokio::task::yield_now().await;
    }
    assert_eq!(ctx.pending(), 1);

    process.terminate().await.unwrap();
    assert!(matches!(ctx.peek_result(id), Err(Error::InvalidRequest(_))));
}

#[tokio::test]
async fn test_terminate_sends_exit_once() {
    let launcher = worker(|_| Answer::Silent);
    let process = Process::create(&launcher, &config()).await.unwrap();

    process.terminate().await.unwrap();
    process.terminate().await.unwrap();

    let exits = launcher.sent().iter().filter(|c| **c == Command::Exit).count();
    assert_eq!(exits, 1);
    assert!(!process.is_alive());
}

#[tokio::test]
async fn test_close_sends_close_lane_after_draining() {
    let launcher = ScriptedLauncher::new(|request| match request.command {
        Command::Hello => Answer::Reply(Ok(Payload::Lane(LaneId(1)))),
        Command::OpenLane => Answer::Reply(Ok(Payload::Lane(LaneId(2)))),
        Command::Call { .. } => Answer::Reply(Ok(Payload::Completed(Outcome::Ready(1)))),
        _ => Answer::Reply(Ok(Payload::Unit)),
    });
    let process = Process::create(&launcher, &config()).await.unwrap();
    let ctx = process.open_context().await.unwrap();
    assert_eq!(ctx.lane(), LaneId(2));

    let id = ctx.call_async(0x100, &CallArgs::new()).unwrap();
    ctx.close().await.unwrap();

    let sent = launcher.sent();
    let call = sent.iter().position(|c| matches!(c, Command::Call { .. })).unwrap();
    let close = sent.iter().position(|c| *c == Command::CloseLane).unwrap();
    assert!(call < close);

    assert_eq!(ctx.peek_result(id).unwrap(), Some(Outcome::Ready(1)));
}

#[tokio::test]
async fn test_state_query_updates_snapshot() {
    let launcher = worker(|request| match request.command {
        Command::QueryState => Answer::Reply(Ok(Payload::State(ContextState::Blocked))),
        _ => Answer::Silent,
    });
    let process = Process::create(&launcher, &config()).await.unwrap();
    let ctx = process.main_context();

    assert_eq!(ctx.state(), ContextState::Running);
    assert_eq!(ctx.refresh_state().await.unwrap(), ContextState::Blocked);
    assert_eq!(ctx.state(), ContextState::Blocked);
}
