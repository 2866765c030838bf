//! gRPC client side of the signaling bridge.
//!
//! [`RemoteMicroscope`] implements the full [`MicroscopeHardware`] contract
//! over a `MicroscopeControl` channel, so code written against a local
//! microscope drives a remote one unchanged. A [`MirrorRelay`] worker keeps
//! local watch mirrors of the remote status and dimensions current and
//! forwards every received signal onto a bounded local stream with the same
//! backpressure semantics as the in-process agent.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tonic::transport::{Channel, Endpoint};
use tonic::Streaming;
use tracing::{debug, info, warn};

use crate::agent::{Agent, LoopFlow, Worker};
use crate::config::Settings;
use crate::error::{AppResult, ScopeError};
use crate::hardware::{MicroscopeHardware, SyncGate};
use crate::net::proto::pb;
use crate::net::proto::pb::microscope_control_client::MicroscopeControlClient;
use crate::signals::{
    AblationPoint, AcquireStack, HardwareDimensions, MicroscopeCommand, MicroscopeSignal,
    MicroscopeStatus, Vector3,
};

/// Worker mirroring the remote signal stream into local channels.
struct MirrorRelay {
    stream: Streaming<pb::MicroscopeSignal>,
    status_tx: watch::Sender<MicroscopeStatus>,
    dims_tx: watch::Sender<HardwareDimensions>,
    output: mpsc::Sender<MicroscopeSignal>,
}

#[async_trait]
impl Worker for MirrorRelay {
    fn name(&self) -> &str {
        "mirror-relay"
    }

    async fn on_loop(&mut self) -> AppResult<LoopFlow> {
        let wire = match self.stream.message().await {
            Ok(Some(wire)) => wire,
            Ok(None) => {
                info!("remote signal stream ended");
                return Ok(LoopFlow::Break);
            }
            Err(status) => {
                warn!(%status, "remote signal stream failed");
                return Ok(LoopFlow::Break);
            }
        };

        let signal = match MicroscopeSignal::try_from(wire) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(%err, "dropping malformed signal");
                return Ok(LoopFlow::Continue);
            }
        };

        match &signal {
            MicroscopeSignal::Status(status) => {
                let _ = self.status_tx.send(status.clone());
            }
            MicroscopeSignal::Dimensions(dims) => {
                let _ = self.dims_tx.send(dims.clone());
            }
            _ => {}
        }

        // the mirrors stay useful even when nobody consumes the stream
        if self.output.send(signal).await.is_err() {
            debug!("local signal consumer is gone, dropping signal");
        }
        Ok(LoopFlow::Continue)
    }
}

/// Hardware contract implementation speaking to a remote bridge.
#[derive(Clone)]
pub struct RemoteMicroscope {
    client: MicroscopeControlClient<Channel>,
    status_rx: watch::Receiver<MicroscopeStatus>,
    dims_rx: watch::Receiver<HardwareDimensions>,
}

impl RemoteMicroscope {
    /// Connects to the bridge endpoint named in `settings`.
    pub async fn connect(
        settings: &Settings,
    ) -> AppResult<(Self, mpsc::Receiver<MicroscopeSignal>, Agent)> {
        let uri = format!(
            "http://{}:{}",
            settings.network.host, settings.network.port
        );
        let channel = Endpoint::try_from(uri)?.connect().await?;
        Self::from_channel(channel, settings).await
    }

    /// Builds a remote microscope over an already-established channel.
    ///
    /// Subscribes to the signal stream and waits for the initial dimensions
    /// and status snapshot before returning, so observed state is valid from
    /// the first call.
    pub async fn from_channel(
        channel: Channel,
        settings: &Settings,
    ) -> AppResult<(Self, mpsc::Receiver<MicroscopeSignal>, Agent)> {
        let mut client = MicroscopeControlClient::new(channel);
        let mut stream = client
            .subscribe(pb::SubscribeRequest {})
            .await?
            .into_inner();

        let dims = match next_signal(&mut stream).await? {
            MicroscopeSignal::Dimensions(dims) => dims,
            other => {
                return Err(ScopeError::Remote(format!(
                    "expected dimensions snapshot, got {other:?}"
                )))
            }
        };
        let status = match next_signal(&mut stream).await? {
            MicroscopeSignal::Status(status) => status,
            other => {
                return Err(ScopeError::Remote(format!(
                    "expected status snapshot, got {other:?}"
                )))
            }
        };

        let (status_tx, status_rx) = watch::channel(status.clone());
        let (dims_tx, dims_rx) = watch::channel(dims.clone());
        let (output, signal_rx) = mpsc::channel(settings.channels.signal_capacity);

        // replay the snapshot so the local stream mirrors a fresh subscription
        let _ = output.send(MicroscopeSignal::Dimensions(dims)).await;
        let _ = output.send(MicroscopeSignal::Status(status)).await;

        let relay = Agent::spawn(MirrorRelay {
            stream,
            status_tx,
            dims_tx,
            output,
        });

        let remote = Self {
            client,
            status_rx,
            dims_rx,
        };
        Ok((remote, signal_rx, relay))
    }

    async fn send(&self, command: MicroscopeCommand) -> AppResult<()> {
        let mut client = self.client.clone();
        let reply = client.send_command(pb::CommandRequest::from(command)).await?;
        reply_to_result(reply.into_inner())
    }
}

async fn next_signal(
    stream: &mut Streaming<pb::MicroscopeSignal>,
) -> AppResult<MicroscopeSignal> {
    match stream.message().await? {
        Some(wire) => MicroscopeSignal::try_from(wire),
        None => Err(ScopeError::Remote(
            "signal stream closed before snapshot".to_string(),
        )),
    }
}

fn reply_to_result(reply: pb::CommandReply) -> AppResult<()> {
    if reply.success {
        Ok(())
    } else if reply.hardware_closed {
        Err(ScopeError::HardwareClosed)
    } else {
        Err(ScopeError::Remote(reply.error_message))
    }
}

#[async_trait]
impl MicroscopeHardware for RemoteMicroscope {
    fn status(&self) -> MicroscopeStatus {
        self.status_rx.borrow().clone()
    }

    fn hardware_dimensions(&self) -> HardwareDimensions {
        self.dims_rx.borrow().clone()
    }

    async fn move_stage(&self, target: Vector3) -> AppResult<()> {
        self.send(MicroscopeCommand::MoveStage(target)).await
    }

    async fn go_live(&self) -> AppResult<()> {
        self.send(MicroscopeCommand::GoLive).await
    }

    async fn stop(&self) -> AppResult<()> {
        match self.send(MicroscopeCommand::Stop).await {
            Ok(()) | Err(ScopeError::HardwareClosed) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn snap_slice(&self) -> AppResult<()> {
        self.send(MicroscopeCommand::SnapSlice).await
    }

    async fn acquire_stack(&self, request: AcquireStack) -> AppResult<()> {
        self.send(MicroscopeCommand::AcquireStack(request)).await
    }

    async fn ablate_points(&self, points: Vec<AblationPoint>) -> AppResult<()> {
        self.send(MicroscopeCommand::AblatePoints(points)).await
    }

    async fn device_specific(&self, data: Vec<u8>) -> AppResult<()> {
        self.send(MicroscopeCommand::DeviceSpecific(data)).await
    }

    async fn sync(&self) -> AppResult<SyncGate> {
        let mut client = self.client.clone();
        let (gate_tx, gate_rx) = oneshot::channel();
        tokio::spawn(async move {
            let request = pb::CommandRequest::from(MicroscopeCommand::Sync);
            let result = match client.send_command(request).await {
                Ok(reply) => reply_to_result(reply.into_inner()),
                Err(status) => Err(ScopeError::from(status)),
            };
            let _ = gate_tx.send(result);
        });
        Ok(gate_rx)
    }

    async fn shutdown(&self) -> AppResult<()> {
        match self.send(MicroscopeCommand::Shutdown).await {
            Ok(()) | Err(ScopeError::HardwareClosed) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
