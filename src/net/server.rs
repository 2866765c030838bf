//! gRPC server side of the signaling bridge.
//!
//! Two pieces: [`SignalRelay`] drains the hardware agent's signal stream into
//! a broadcast channel (one fan-out point for any number of subscribers), and
//! [`RemoteMicroscopeServer`] implements the `MicroscopeControl` service on
//! top of that channel plus a local [`MicroscopeHardware`].
//!
//! Subscribers that fall behind the broadcast capacity lose the skipped
//! signals with a warning; the subscription itself stays up. Each new
//! subscriber is first sent the current hardware dimensions and status so it
//! can render state immediately. The relay updates that snapshot and
//! broadcasts under one lock, and subscriptions are created under the same
//! lock, so the replayed snapshot and the live stream partition the signal
//! history cleanly: nothing is duplicated and nothing arrives older than what
//! the snapshot already showed.

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::agent::{Agent, LoopFlow, Worker};
use crate::config::Settings;
use crate::error::{AppResult, ScopeError};
use crate::hardware::MicroscopeHardware;
use crate::net::proto::pb;
use crate::net::proto::pb::microscope_control_server::{
    MicroscopeControl, MicroscopeControlServer,
};
use crate::signals::{MicroscopeCommand, MicroscopeSignal};

/// Latest relayed dimensions and status, replayed to new subscribers.
struct FanoutSnapshot {
    dims: pb::MicroscopeSignal,
    status: pb::MicroscopeSignal,
}

fn lock_snapshot(snapshot: &Mutex<FanoutSnapshot>) -> MutexGuard<'_, FanoutSnapshot> {
    snapshot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Worker copying agent signals into the subscriber broadcast channel.
struct SignalRelay {
    signals: mpsc::Receiver<MicroscopeSignal>,
    fanout: broadcast::Sender<pb::MicroscopeSignal>,
    snapshot: Arc<Mutex<FanoutSnapshot>>,
}

#[async_trait]
impl Worker for SignalRelay {
    fn name(&self) -> &str {
        "signal-relay"
    }

    async fn on_loop(&mut self) -> AppResult<LoopFlow> {
        let Some(signal) = self.signals.recv().await else {
            return Ok(LoopFlow::Break);
        };
        let wire: pb::MicroscopeSignal = signal.into();
        {
            // snapshot update and broadcast happen under one lock so a
            // subscription created under the same lock sees exactly the
            // signals that postdate its snapshot
            let mut snap = lock_snapshot(&self.snapshot);
            match &wire.signal {
                Some(pb::microscope_signal::Signal::Status(_)) => snap.status = wire.clone(),
                Some(pb::microscope_signal::Signal::Dimensions(_)) => snap.dims = wire.clone(),
                _ => {}
            }
            // no subscribers is fine, the signal is simply not observed remotely
            let _ = self.fanout.send(wire);
        }
        Ok(LoopFlow::Continue)
    }
}

/// `MicroscopeControl` service over a local hardware instance.
#[derive(Clone)]
pub struct RemoteMicroscopeServer {
    hardware: Arc<dyn MicroscopeHardware>,
    fanout: broadcast::Sender<pb::MicroscopeSignal>,
    snapshot: Arc<Mutex<FanoutSnapshot>>,
}

impl RemoteMicroscopeServer {
    /// Wires the bridge around `hardware` and its signal stream. The returned
    /// [`Agent`] owns the relay task feeding subscribers.
    pub fn new(
        hardware: Arc<dyn MicroscopeHardware>,
        signals: mpsc::Receiver<MicroscopeSignal>,
        settings: &Settings,
    ) -> (Self, Agent) {
        let (fanout, _) = broadcast::channel(settings.channels.signal_capacity);
        let snapshot = Arc::new(Mutex::new(FanoutSnapshot {
            dims: MicroscopeSignal::Dimensions(hardware.hardware_dimensions()).into(),
            status: MicroscopeSignal::Status(hardware.status()).into(),
        }));
        let relay = Agent::spawn(SignalRelay {
            signals,
            fanout: fanout.clone(),
            snapshot: snapshot.clone(),
        });
        (
            Self {
                hardware,
                fanout,
                snapshot,
            },
            relay,
        )
    }

    /// Wraps this bridge into a tonic service for custom server assembly.
    pub fn into_service(self) -> MicroscopeControlServer<Self> {
        MicroscopeControlServer::new(self)
    }

    /// Serves the bridge on `addr` until the transport shuts down.
    pub async fn serve(self, addr: SocketAddr) -> AppResult<()> {
        info!(%addr, "microscope bridge listening");
        tonic::transport::Server::builder()
            .add_service(self.into_service())
            .serve(addr)
            .await?;
        Ok(())
    }

    async fn apply(&self, command: MicroscopeCommand) -> AppResult<()> {
        match command {
            MicroscopeCommand::MoveStage(target) => self.hardware.move_stage(target).await,
            MicroscopeCommand::GoLive => self.hardware.go_live().await,
            MicroscopeCommand::Stop => self.hardware.stop().await,
            MicroscopeCommand::SnapSlice => self.hardware.snap_slice().await,
            MicroscopeCommand::AcquireStack(request) => {
                self.hardware.acquire_stack(request).await
            }
            MicroscopeCommand::AblatePoints(points) => {
                self.hardware.ablate_points(points).await
            }
            MicroscopeCommand::DeviceSpecific(data) => {
                self.hardware.device_specific(data).await
            }
            MicroscopeCommand::Shutdown => self.hardware.shutdown().await,
            MicroscopeCommand::Sync => {
                let gate = self.hardware.sync().await?;
                match gate.await {
                    Ok(result) => result,
                    Err(_) => Err(ScopeError::HardwareClosed),
                }
            }
        }
    }
}

fn reply_ok() -> pb::CommandReply {
    pb::CommandReply {
        success: true,
        error_message: String::new(),
        hardware_closed: false,
    }
}

fn reply_err(err: &ScopeError) -> pb::CommandReply {
    pb::CommandReply {
        success: false,
        error_message: err.to_string(),
        hardware_closed: matches!(err, ScopeError::HardwareClosed),
    }
}

#[tonic::async_trait]
impl MicroscopeControl for RemoteMicroscopeServer {
    type SubscribeStream =
        Pin<Box<dyn Stream<Item = Result<pb::MicroscopeSignal, Status>> + Send>>;

    async fn subscribe(
        &self,
        _request: Request<pb::SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        // subscribe and snapshot under the relay's lock so the replay and
        // the live stream neither overlap nor leave a gap
        let (receiver, snapshot) = {
            let snap = lock_snapshot(&self.snapshot);
            let receiver = self.fanout.subscribe();
            let snapshot: Vec<Result<pb::MicroscopeSignal, Status>> =
                vec![Ok(snap.dims.clone()), Ok(snap.status.clone())];
            (receiver, snapshot)
        };
        let live = BroadcastStream::new(receiver);

        let live = live.filter_map(|item| async move {
            match item {
                Ok(signal) => Some(Ok(signal)),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!(missed, "subscriber lagging behind, skipping signals");
                    None
                }
            }
        });

        let stream = stream::iter(snapshot).chain(live);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn send_command(
        &self,
        request: Request<pb::CommandRequest>,
    ) -> Result<Response<pb::CommandReply>, Status> {
        let command = match MicroscopeCommand::try_from(request.into_inner()) {
            Ok(command) => command,
            Err(err) => {
                warn!(%err, "dropping malformed command");
                return Ok(Response::new(reply_err(&err)));
            }
        };

        match self.apply(command).await {
            Ok(()) => Ok(Response::new(reply_ok())),
            Err(err) => {
                warn!(%err, "command failed");
                Ok(Response::new(reply_err(&err)))
            }
        }
    }
}
