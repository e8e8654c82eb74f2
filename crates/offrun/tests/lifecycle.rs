//! Process and context lifecycle against the mock device.

use offrun::CallArgs;
use offrun::CloseError;
use offrun::ContextId;
use offrun::ContextState;
use offrun::DispatchError;
use offrun::Error;
use offrun::LibraryHandle;
use offrun::Outcome;
use offrun::Process;
use offrun::RequestId;
use offrun::WorkerConfig;
use offrun::mock_device::MockDevice;
use offrun::mock_device::MockLibrary;

fn config() -> WorkerConfig {
    WorkerConfig::new("/var/opt/offrun/os0.sock", "/dev/veslot0", "/opt/offrun/libexec/offrun-worker")
}

fn device() -> MockDevice {
    MockDevice::new().with_library(
        MockLibrary::new("/lib/libdemo.so")
            .function("answer", |_call| async { Outcome::Ready(42) })
            .function("add", |call| async move { Outcome::Ready(call.arg(0) + call.arg(1)) }),
    )
}

#[tokio::test]
async fn test_create_and_terminate() -> anyhow::Result<()> {
    let device = device();
    let process = Process::create(&device, &config()).await?;

    assert!(process.is_alive());
    assert_eq!(device.launches(), 1);
    assert_eq!(process.config().device.to_str(), Some("/dev/veslot0"));

    let main = process.main_context();
    assert!(main.is_main());
    assert_eq!(main.id(), ContextId(1));
    assert_eq!(main.state(), ContextState::Running);

    process.terminate().await?;
    assert!(!process.is_alive());
    assert_eq!(device.exits(), 1);
    assert_eq!(main.state(), ContextState::Exited);

    // a second terminate is a no-op
    process.terminate().await?;
    assert_eq!(device.exits(), 1);
    Ok(())
}

#[tokio::test]
async fn test_everything_fails_after_terminate() -> anyhow::Result<()> {
    let process = Process::create(&device(), &config()).await?;
    let lib = process.load_library("/lib/libdemo.so").await?;
    let main = process.main_context();
    process.terminate().await?;

    assert!(matches!(process.load_library("/lib/libdemo.so").await, Err(Error::ProcessNotAvailable)));
    assert!(matches!(process.resolve_symbol(lib, "answer").await, Err(Error::ProcessNotAvailable)));
    assert!(matches!(process.allocate(64).await, Err(Error::ProcessNotAvailable)));
    assert!(matches!(process.free(0x6000_0000).await, Err(Error::ProcessNotAvailable)));
    assert!(matches!(process.write_mem(0x6000_0000, &[1]).await, Err(Error::ProcessNotAvailable)));
    assert!(matches!(process.open_context().await, Err(Error::ProcessNotAvailable)));
    assert!(matches!(
        main.call_async(0x4000_0100, &CallArgs::new()),
        Err(Error::Dispatch(DispatchError::Exited))
    ));
    assert!(process.contexts().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_rejected_launch() {
    let device = device();
    device.reject_launches(true);

    match Process::create(&device, &config()).await {
        Err(Error::ProcessCreation { code, reason }) => {
            assert_eq!(code, libc::ENOENT);
            assert!(reason.contains("offrun-worker"));
        }
        Err(e) => panic!("expected ProcessCreation, got {}", e),
        Ok(_) => panic!("launch should have been rejected"),
    }
    assert_eq!(device.launches(), 0);

    device.reject_launches(false);
    let process = Process::create(&device, &config()).await.unwrap();
    process.terminate().await.unwrap();
}

#[tokio::test]
async fn test_main_context_cannot_be_closed() -> anyhow::Result<()> {
    let process = Process::create(&device(), &config()).await?;
    let lib = process.load_library("/lib/libdemo.so").await?;
    let answer = process.resolve_symbol(lib, "answer").await?;
    let main = process.main_context();

    match main.close().await {
        Err(Error::Close(CloseError::MainContext)) => {}
        other => panic!("expected Close(MainContext), got {:?}", other),
    }
    assert_eq!(main.state(), ContextState::Running);

    let id = main.call_async(answer, &CallArgs::new())?;
    assert_eq!(main.wait_result(id).await?, Outcome::Ready(42));

    process.terminate().await?;
    Ok(())
}

#[tokio::test]
async fn test_close_idle_context() -> anyhow::Result<()> {
    let process = Process::create(&device(), &config()).await?;
    let ctx = process.open_context().await?;
    assert!(!ctx.is_main());
    assert_eq!(process.contexts().len(), 2);

    ctx.close().await?;
    assert_eq!(ctx.state(), ContextState::Exited);
    assert_eq!(process.contexts().len(), 1);

    match ctx.call_async(0x4000_0100, &CallArgs::new()) {
        Err(Error::Dispatch(DispatchError::Exited)) => {}
        other => panic!("expected Dispatch(Exited), got {:?}", other),
    }
    // no record is created for a refused dispatch
    assert_eq!(ctx.pending(), 0);
    assert!(matches!(ctx.peek_result(RequestId(1)), Err(Error::InvalidRequest(_))));

    // closing twice is harmless
    ctx.close().await?;

    process.terminate().await?;
    Ok(())
}

#[tokio::test]
async fn test_context_creation_failure() -> anyhow::Result<()> {
    let process = Process::create(&device().with_lane_limit(2), &config()).await?;

    let first = process.open_context().await?;
    match process.open_context().await {
        Err(Error::ContextCreation { code, .. }) => assert_eq!(code, libc::EAGAIN),
        Err(e) => panic!("expected ContextCreation, got {}", e),
        Ok(_) => panic!("lane limit not enforced"),
    }

    // closing frees the lane on the worker
    first.close().await?;
    let second = process.open_context().await?;
    assert_ne!(first.id(), second.id());

    process.terminate().await?;
    Ok(())
}

#[tokio::test]
async fn test_contexts_are_listed_in_order() -> anyhow::Result<()> {
    let process = Process::create(&device(), &config()).await?;
    let a = process.open_context().await?;
    let b = process.open_context().await?;

    let ids: Vec<ContextId> = process.contexts().iter().map(|c| c.id()).collect();
    assert_eq!(ids, vec![ContextId(1), a.id(), b.id()]);
    assert_eq!(process.contexts().iter().filter(|c| c.is_main()).count(), 1);
    assert_ne!(a.lane(), b.lane());

    process.terminate().await?;
    assert_eq!(a.state(), ContextState::Exited);
    assert_eq!(b.state(), ContextState::Exited);
    Ok(())
}

#[tokio::test]
async fn test_library_table() -> anyhow::Result<()> {
    let process = Process::create(&device(), &config()).await?;

    let lib = process.load_library("/lib/libdemo.so").await?;
    assert_eq!(process.load_library("/lib/libdemo.so").await?, lib);
    assert_eq!(process.library_path(lib).await.as_deref(), Some("/lib/libdemo.so"));

    match process.load_library("/lib/missing.so").await {
        Err(Error::LibraryLoad { path, code, .. }) => {
            assert_eq!(path, "/lib/missing.so");
            assert_eq!(code, libc::ENOENT);
        }
        other => panic!("expected LibraryLoad, got {:?}", other),
    }

    let add = process.resolve_symbol(lib, "add").await?;
    assert_ne!(add, 0);
    assert_eq!(process.resolve_symbol(lib, "add").await?, add);
    assert_ne!(process.resolve_symbol(lib, "answer").await?, add);

    match process.resolve_symbol(lib, "nope").await {
        Err(Error::SymbolNotFound { library, name }) => {
            assert_eq!(library, lib);
            assert_eq!(name, "nope");
        }
        other => panic!("expected SymbolNotFound, got {:?}", other),
    }
    assert!(matches!(
        process.resolve_symbol(LibraryHandle(99), "add").await,
        Err(Error::UnknownLibrary(LibraryHandle(99)))
    ));

    process.terminate().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_process_is_shared_across_tasks() -> anyhow::Result<()> {
    let process = Process::create(&device(), &config()).await?;
    let lib = process.load_library("/lib/libdemo.so").await?;

    let mut tasks = Vec::new();
    for i in 0..8u64 {
        let process = process.clone();
        tasks.push(tokio::spawn(async move {
            let ctx = process.open_context().await?;
            let mut args = CallArgs::new();
            args.set(0, i)?;
            args.set(1, 100u64)?;
            let id = ctx.call_async_by_name(lib, "add", &args).await?;
            let outcome = ctx.wait_result(id).await?;
            ctx.close().await?;
            anyhow::Ok(outcome)
        }));
    }

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await??, Outcome::Ready(i as u64 + 100));
    }
    assert_eq!(process.contexts().len(), 1);

    process.terminate().await?;
    Ok(())
}
