//! Tests of the gRPC bridge, both as a plain service and over a loopback
//! transport with the real client.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::TcpListenerStream;
use tokio::time::timeout;
use tonic::transport::Endpoint;
use tonic::Request;

use rust_scope::agent::Agent;
use rust_scope::config::Settings;
use rust_scope::error::ScopeError;
use rust_scope::hardware::agent::MicroscopeAgent;
use rust_scope::hardware::demo::DemoBackend;
use rust_scope::hardware::MicroscopeHardware;
use rust_scope::net::client::RemoteMicroscope;
use rust_scope::net::proto::pb;
use rust_scope::net::proto::pb::microscope_control_server::MicroscopeControl;
use rust_scope::net::server::RemoteMicroscopeServer;
use rust_scope::signals::{AcquireStack, MicroscopeSignal, ServerState, Vector3};

const WAIT: Duration = Duration::from_secs(5);

struct LocalRig {
    agent: Agent,
    relay: Agent,
    hardware: Arc<dyn MicroscopeHardware>,
    server: RemoteMicroscopeServer,
}

/// Agent plus bridge around a demo backend, ready once the hardware is idle.
async fn rig() -> LocalRig {
    let settings = Settings::default();
    let (worker, handle, signals) = MicroscopeAgent::new(DemoBackend::new(&settings), &settings);
    let agent = Agent::spawn(worker);
    let hardware: Arc<dyn MicroscopeHardware> = Arc::new(handle);
    let (server, relay) = RemoteMicroscopeServer::new(Arc::clone(&hardware), signals, &settings);

    // wait out the startup transition so subscribers see a settled snapshot
    timeout(WAIT, async {
        while hardware.status().state != ServerState::Manual {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("hardware never became idle");

    LocalRig {
        agent,
        relay,
        hardware,
        server,
    }
}

async fn next_signal(rx: &mut mpsc::Receiver<MicroscopeSignal>) -> MicroscopeSignal {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for signal")
        .expect("signal channel closed")
}

#[tokio::test]
async fn malformed_commands_get_an_error_reply_not_a_teardown() {
    let rig = rig().await;

    let reply = rig
        .server
        .send_command(Request::new(pb::CommandRequest { command: None }))
        .await
        .unwrap()
        .into_inner();
    assert!(!reply.success);
    assert!(!reply.hardware_closed);

    // the service is still alive afterwards
    let reply = rig
        .server
        .send_command(Request::new(pb::CommandRequest::from(
            rust_scope::signals::MicroscopeCommand::Stop,
        )))
        .await
        .unwrap()
        .into_inner();
    assert!(reply.success);

    rig.hardware.shutdown().await.unwrap();
    rig.agent.join().await.unwrap();
    rig.relay.stop().await.unwrap();
}

#[tokio::test]
async fn subscribers_get_the_latest_relayed_state_without_replay() {
    let rig = rig().await;

    let target = Vector3::new(5.0, 0.0, 0.0);
    rig.hardware.move_stage(target).await.unwrap();
    timeout(WAIT, async {
        while rig.hardware.status().stage_position != target {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("move never settled");
    // give the relay a moment to republish the settled status
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut stream = rig
        .server
        .subscribe(Request::new(pb::SubscribeRequest {}))
        .await
        .unwrap()
        .into_inner();

    let first = timeout(WAIT, stream.next()).await.unwrap().unwrap().unwrap();
    assert!(matches!(
        MicroscopeSignal::try_from(first).unwrap(),
        MicroscopeSignal::Dimensions(_)
    ));
    let second = timeout(WAIT, stream.next()).await.unwrap().unwrap().unwrap();
    match MicroscopeSignal::try_from(second).unwrap() {
        MicroscopeSignal::Status(status) => {
            // the snapshot already reflects the settled move
            assert_eq!(status.stage_position, target);
            assert!(!status.busy);
        }
        other => panic!("expected status second, got {other:?}"),
    }

    // no older signal trails the snapshot
    assert!(
        timeout(Duration::from_millis(300), stream.next()).await.is_err(),
        "stale signal replayed after the snapshot"
    );

    rig.hardware.shutdown().await.unwrap();
    rig.agent.join().await.unwrap();
    rig.relay.stop().await.unwrap();
}

#[tokio::test]
async fn remote_microscope_mirrors_the_local_one() {
    let rig = rig().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = rig.server.clone().into_service();
    let transport = tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );

    let channel = Endpoint::try_from(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let settings = Settings::default();
    let (remote, mut signals, mirror) =
        RemoteMicroscope::from_channel(channel, &settings).await.unwrap();

    // snapshot first: dimensions, then a settled status
    match next_signal(&mut signals).await {
        MicroscopeSignal::Dimensions(dims) => {
            assert_eq!(dims, rig.hardware.hardware_dimensions());
        }
        other => panic!("expected dimensions first, got {other:?}"),
    }
    match next_signal(&mut signals).await {
        MicroscopeSignal::Status(status) => assert_eq!(status.state, ServerState::Manual),
        other => panic!("expected status second, got {other:?}"),
    }
    assert_eq!(remote.status().state, ServerState::Manual);

    // a remote move shows up in the signal stream, clamped
    remote
        .move_stage(Vector3::new(-400.0, 0.0, 0.0))
        .await
        .unwrap();
    loop {
        if let MicroscopeSignal::Status(status) = next_signal(&mut signals).await {
            if !status.busy && status.stage_position == Vector3::new(-100.0, 0.0, 0.0) {
                break;
            }
        }
    }

    // a remote stack arrives as descriptor plus tagged slices
    remote
        .acquire_stack(AcquireStack {
            start_position: Vector3::new(0.0, 0.0, 0.0),
            end_position: Vector3::new(0.0, 0.0, 6.0),
            step_size: 2.0,
        })
        .await
        .unwrap();
    let gate = remote.sync().await.unwrap();

    let mut stack_id = None;
    let mut slices = 0;
    loop {
        match next_signal(&mut signals).await {
            MicroscopeSignal::Stack(stack) => stack_id = Some(stack.id),
            MicroscopeSignal::Slice(slice) => {
                let (id, step) = slice.stack.expect("stack slice without tag");
                assert_eq!(Some(id), stack_id);
                assert_eq!(step, slices);
                slices += 1;
            }
            MicroscopeSignal::Status(status)
                if status.state == ServerState::Manual && !status.busy && slices > 0 =>
            {
                break;
            }
            _ => {}
        }
    }
    assert_eq!(slices, 3);
    timeout(WAIT, gate).await.unwrap().unwrap().unwrap();

    // shutdown travels through and closes the contract on both sides
    remote.shutdown().await.unwrap();
    loop {
        if let MicroscopeSignal::Status(status) = next_signal(&mut signals).await {
            if status.state == ServerState::Shutdown {
                break;
            }
        }
    }
    rig.agent.join().await.unwrap();
    assert!(matches!(
        remote.move_stage(Vector3::default()).await,
        Err(ScopeError::HardwareClosed)
    ));
    // idempotent shutdown via the remote side too
    remote.shutdown().await.unwrap();

    rig.relay.stop().await.unwrap();
    mirror.request_stop();
    transport.abort();
}
